//! The metered ledger.
//!
//! `preflight` reserves the projected cost of a call as a balance hold
//! before the provider is called. `record_invocation` turns the completed
//! call into exactly one `transactions` row and exactly one debit, and drops
//! the hold, in a single database transaction. Rows are locked in a fixed
//! order (pools, usage, user) so concurrent reservations and debits
//! serialize instead of deadlocking.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::split::{CostSplit, split_cost, to_money};
use super::{BillingError, spend_pool};
use crate::auth::queries;
use crate::models::billing::{SpendPool, Transaction, TransactionStatus};
use crate::uuid::uuidv7;

const TRANSACTION_COLUMNS: &str = "id, user_id, echo_app_id, api_key_id, spend_pool_id, \
     provider_transaction_id, total_cost, app_profit, markup_profit, referral_profit, \
     raw_transaction_cost, status, is_archived, created_at";

/// How long an unreleased hold keeps counting against a balance. Outlives
/// the upstream request timeout.
pub const HOLD_TTL_SECS: i64 = 15 * 60;

/// A provider call that finished and reported its usage.
#[derive(Debug, Clone)]
pub struct CompletedInvocation {
    /// Unique per app; the idempotency key of the ledger entry.
    pub invocation_id: String,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub api_key_id: Option<Uuid>,
    /// Pre-flight hold to drop once the call is billed.
    pub hold_id: Option<Uuid>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_cost: Decimal,
    pub raw_cost: Decimal,
}

/// Which balance pays for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingSource {
    SpendPool(Uuid),
    Personal,
}

/// Projected cost reserved against a balance while a call is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceHold {
    pub id: Uuid,
    pub funding: FundingSource,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    Recorded(Transaction),
    /// The invocation id was already billed; nothing was debited.
    Duplicate(Transaction),
}

impl RecordOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Recorded(t) | Self::Duplicate(t) => t,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Reserve `estimated_raw_cost` plus the app's markup before a call reaches
/// the provider.
///
/// The paying balance is locked while the check runs, and the reservation is
/// counted against it until released. Concurrent calls therefore cannot
/// together admit more than the balance covers.
pub async fn preflight(
    pool: &PgPool,
    user_id: Uuid,
    echo_app_id: Uuid,
    estimated_raw_cost: Decimal,
    minimum_balance: Decimal,
) -> Result<BalanceHold, BillingError> {
    if estimated_raw_cost < Decimal::ZERO {
        return Err(BillingError::Validation("estimate must not be negative".into()));
    }

    let mut tx = pool.begin().await?;
    let app = queries::find_active_app(&mut *tx, echo_app_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("App {echo_app_id}")))?;
    let projected = split_cost(estimated_raw_cost, app.markup_rate, None).total_cost;

    let funding = match select_pool(&mut tx, echo_app_id, user_id, projected, true).await? {
        Some(pool_id) => FundingSource::SpendPool(pool_id),
        None => {
            let (paid, spent) = lock_user_balance(&mut tx, user_id).await?;
            let available = paid - spent - personal_holds(&mut *tx, user_id).await?;
            let required = projected.max(minimum_balance);
            if available < required || available <= Decimal::ZERO {
                return Err(BillingError::InsufficientBalance { required, available });
            }
            FundingSource::Personal
        }
    };

    let hold = insert_hold(&mut tx, user_id, echo_app_id, funding, projected).await?;
    tx.commit().await?;

    debug!(hold_id = %hold.id, %user_id, amount = %projected, ?funding, "balance reserved");
    Ok(hold)
}

/// Drop a pre-flight hold. Releasing an already released hold is a no-op.
pub async fn release_hold<'e>(
    exec: impl PgExecutor<'e>,
    hold_id: Uuid,
) -> Result<bool, BillingError> {
    let deleted = sqlx::query("DELETE FROM balance_holds WHERE id = $1")
        .bind(hold_id)
        .execute(exec)
        .await?;
    Ok(deleted.rows_affected() == 1)
}

/// Bill a completed invocation.
pub async fn record_invocation(
    pool: &PgPool,
    inv: &CompletedInvocation,
) -> Result<RecordOutcome, BillingError> {
    if inv.raw_cost < Decimal::ZERO || inv.input_tokens < 0 || inv.output_tokens < 0 {
        return Err(BillingError::Validation("usage must not be negative".into()));
    }

    let mut tx = pool.begin().await?;

    if let Some(existing) = find_transaction(&mut *tx, inv.echo_app_id, &inv.invocation_id).await? {
        if let Some(hold_id) = inv.hold_id {
            release_hold(&mut *tx, hold_id).await?;
            tx.commit().await?;
        }
        return Ok(RecordOutcome::Duplicate(existing));
    }

    let app = queries::find_app(&mut *tx, inv.echo_app_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("App {}", inv.echo_app_id)))?;
    let referred = is_referred(&mut *tx, inv.user_id, inv.echo_app_id).await?;
    let split = split_cost(inv.raw_cost, app.markup_rate, referred.then_some(app.referral_rate));

    let spend_pool_id = debit(&mut tx, inv.user_id, inv.echo_app_id, split.total_cost).await?;

    let Some(transaction) = insert_transaction(&mut tx, inv, &split, spend_pool_id).await? else {
        // A concurrent call with the same id committed first. Dropping `tx`
        // rolls back our debit.
        drop(tx);
        if let Some(hold_id) = inv.hold_id {
            release_hold(pool, hold_id).await?;
        }
        let existing = find_transaction(pool, inv.echo_app_id, &inv.invocation_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(inv.invocation_id.clone()))?;
        warn!(invocation_id = %inv.invocation_id, "invocation billed concurrently; skipped");
        return Ok(RecordOutcome::Duplicate(existing));
    };

    sqlx::query(
        "INSERT INTO transaction_metadata \
         (transaction_id, provider, model, input_tokens, output_tokens, total_tokens, tool_cost) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(transaction.id)
    .bind(&inv.provider)
    .bind(&inv.model)
    .bind(inv.input_tokens)
    .bind(inv.output_tokens)
    .bind(inv.input_tokens + inv.output_tokens)
    .bind(to_money(inv.tool_cost))
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "UPDATE app_memberships SET total_spent = total_spent + $3 \
         WHERE user_id = $1 AND echo_app_id = $2",
    )
    .bind(inv.user_id)
    .bind(inv.echo_app_id)
    .bind(split.total_cost)
    .execute(&mut *tx)
    .await?;

    if let Some(hold_id) = inv.hold_id {
        release_hold(&mut *tx, hold_id).await?;
    }

    tx.commit().await?;

    info!(
        transaction_id = %transaction.id,
        user_id = %inv.user_id,
        echo_app_id = %inv.echo_app_id,
        total_cost = %split.total_cost,
        spend_pool_id = ?spend_pool_id,
        "invocation billed"
    );
    Ok(RecordOutcome::Recorded(transaction))
}

/// Park usage the provider reported but the ledger could not record, for
/// later reconciliation.
pub async fn record_unbilled_usage<'e>(
    exec: impl PgExecutor<'e>,
    inv: &CompletedInvocation,
    reason: &str,
) -> Result<(), BillingError> {
    sqlx::query(
        "INSERT INTO unbilled_usage \
         (id, user_id, echo_app_id, provider_transaction_id, provider, model, \
          input_tokens, output_tokens, raw_cost, reason) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(uuidv7())
    .bind(inv.user_id)
    .bind(inv.echo_app_id)
    .bind(&inv.invocation_id)
    .bind(&inv.provider)
    .bind(&inv.model)
    .bind(inv.input_tokens)
    .bind(inv.output_tokens)
    .bind(to_money(inv.raw_cost))
    .bind(reason)
    .execute(exec)
    .await?;

    error!(
        invocation_id = %inv.invocation_id,
        user_id = %inv.user_id,
        raw_cost = %inv.raw_cost,
        reason,
        "usage parked as unbilled"
    );
    Ok(())
}

/// Bill an invocation, parking the usage instead if billing fails.
///
/// The call already happened upstream, so the usage must end up somewhere.
pub async fn settle_invocation(
    pool: &PgPool,
    inv: &CompletedInvocation,
) -> Result<RecordOutcome, BillingError> {
    match record_invocation(pool, inv).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            if let Err(park_err) = record_unbilled_usage(pool, inv, &e.to_string()).await {
                error!(invocation_id = %inv.invocation_id, error = %park_err, "failed to park unbilled usage");
            }
            if let Some(hold_id) = inv.hold_id
                && let Err(release_err) = release_hold(pool, hold_id).await
            {
                error!(%hold_id, error = %release_err, "failed to release balance hold");
            }
            Err(e)
        }
    }
}

/// Record a call paid on the spot through X402. No user balance is touched.
pub async fn record_x402_settlement<'e>(
    exec: impl PgExecutor<'e>,
    payment_reference: &str,
    network: &str,
    inv: &CompletedInvocation,
    settled_amount: Decimal,
) -> Result<bool, BillingError> {
    let inserted = sqlx::query(
        "INSERT INTO x402_settlements \
         (id, payment_reference, network, provider, model, input_tokens, output_tokens, \
          raw_cost, settled_amount) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (payment_reference) DO NOTHING",
    )
    .bind(uuidv7())
    .bind(payment_reference)
    .bind(network)
    .bind(&inv.provider)
    .bind(&inv.model)
    .bind(inv.input_tokens)
    .bind(inv.output_tokens)
    .bind(to_money(inv.raw_cost))
    .bind(to_money(settled_amount))
    .execute(exec)
    .await?;
    Ok(inserted.rows_affected() == 1)
}

pub async fn find_transaction<'e>(
    exec: impl PgExecutor<'e>,
    echo_app_id: Uuid,
    invocation_id: &str,
) -> Result<Option<Transaction>, BillingError> {
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions \
         WHERE echo_app_id = $1 AND provider_transaction_id = $2"
    );
    Ok(sqlx::query_as::<_, Transaction>(&sql)
        .bind(echo_app_id)
        .bind(invocation_id)
        .fetch_optional(exec)
        .await?)
}

/// Most recent transactions of a user within an app.
pub async fn list_transactions<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    echo_app_id: Uuid,
    limit: i64,
) -> Result<Vec<Transaction>, BillingError> {
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions \
         WHERE user_id = $1 AND echo_app_id = $2 AND NOT is_archived \
         ORDER BY created_at DESC LIMIT $3"
    );
    Ok(sqlx::query_as::<_, Transaction>(&sql)
        .bind(user_id)
        .bind(echo_app_id)
        .bind(limit)
        .fetch_all(exec)
        .await?)
}

async fn is_referred<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    echo_app_id: Uuid,
) -> Result<bool, BillingError> {
    Ok(sqlx::query_scalar::<_, bool>(
        "SELECT EXISTS (SELECT 1 FROM app_referrals WHERE user_id = $1 AND echo_app_id = $2)",
    )
    .bind(user_id)
    .bind(echo_app_id)
    .fetch_one(exec)
    .await?)
}

/// First active pool of the app that can cover `amount` for this user.
///
/// Candidate pool and usage rows stay locked until the caller's transaction
/// ends. With `count_holds` set, live holds on a pool reduce what it can
/// cover.
async fn select_pool(
    conn: &mut PgConnection,
    echo_app_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
    count_holds: bool,
) -> Result<Option<Uuid>, BillingError> {
    let pools = spend_pool::list_active_pools(&mut *conn, echo_app_id).await?;
    for candidate in pools.into_iter().filter(|p| p.balance() >= amount) {
        let Some(sp) = spend_pool::lock_pool(conn, candidate.id).await? else {
            continue;
        };
        let user_spent = spend_pool::lock_usage(conn, user_id, sp.id).await?;
        let (pool_held, user_held) = if count_holds {
            pool_holds(&mut *conn, sp.id, user_id).await?
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };
        let effective = SpendPool {
            total_spent: sp.total_spent + pool_held,
            ..sp
        };
        if !effective.is_archived && effective.can_cover(user_spent + user_held, amount) {
            return Ok(Some(effective.id));
        }
    }
    Ok(None)
}

/// Lock the user row and return `(total_paid, total_spent)`.
async fn lock_user_balance(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<(Decimal, Decimal), BillingError> {
    let balance: Option<(Decimal, Decimal)> = sqlx::query_as(
        "SELECT total_paid, total_spent FROM users WHERE id = $1 FOR UPDATE",
    )
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    balance.ok_or_else(|| BillingError::NotFound(format!("User {user_id}")))
}

/// Live holds against the user's personal balance.
async fn personal_holds<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Decimal, BillingError> {
    Ok(sqlx::query_scalar::<_, Decimal>(
        "SELECT COALESCE(SUM(amount), 0) FROM balance_holds \
         WHERE user_id = $1 AND spend_pool_id IS NULL AND expires_at > now()",
    )
    .bind(user_id)
    .fetch_one(exec)
    .await?)
}

/// Live holds against a pool: `(all users, this user)`.
async fn pool_holds<'e>(
    exec: impl PgExecutor<'e>,
    pool_id: Uuid,
    user_id: Uuid,
) -> Result<(Decimal, Decimal), BillingError> {
    Ok(sqlx::query_as::<_, (Decimal, Decimal)>(
        "SELECT COALESCE(SUM(amount), 0), \
                COALESCE(SUM(amount) FILTER (WHERE user_id = $2), 0) \
         FROM balance_holds WHERE spend_pool_id = $1 AND expires_at > now()",
    )
    .bind(pool_id)
    .bind(user_id)
    .fetch_one(exec)
    .await?)
}

async fn insert_hold(
    conn: &mut PgConnection,
    user_id: Uuid,
    echo_app_id: Uuid,
    funding: FundingSource,
    amount: Decimal,
) -> Result<BalanceHold, BillingError> {
    // Expired holds no longer count.
    sqlx::query("DELETE FROM balance_holds WHERE user_id = $1 AND expires_at <= now()")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;

    let id = uuidv7();
    let spend_pool_id = match funding {
        FundingSource::SpendPool(pool_id) => Some(pool_id),
        FundingSource::Personal => None,
    };
    sqlx::query(
        "INSERT INTO balance_holds (id, user_id, echo_app_id, spend_pool_id, amount, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(user_id)
    .bind(echo_app_id)
    .bind(spend_pool_id)
    .bind(amount)
    .bind(Utc::now() + Duration::seconds(HOLD_TTL_SECS))
    .execute(&mut *conn)
    .await?;

    Ok(BalanceHold { id, funding, amount })
}

/// Debit `amount` from a pool if one can cover it, else from the user's
/// personal balance. Returns the pool used, if any.
///
/// Holds gate admission only; a completed call is charged against the
/// settled balance.
async fn debit(
    conn: &mut PgConnection,
    user_id: Uuid,
    echo_app_id: Uuid,
    amount: Decimal,
) -> Result<Option<Uuid>, BillingError> {
    if let Some(pool_id) = select_pool(conn, echo_app_id, user_id, amount, false).await? {
        spend_pool::debit_locked(conn, pool_id, user_id, amount).await?;
        return Ok(Some(pool_id));
    }

    let (paid, spent) = lock_user_balance(conn, user_id).await?;
    let available = paid - spent;
    if available < amount {
        return Err(BillingError::InsufficientBalance {
            required: amount,
            available,
        });
    }

    sqlx::query("UPDATE users SET total_spent = total_spent + $2 WHERE id = $1")
        .bind(user_id)
        .bind(amount)
        .execute(&mut *conn)
        .await?;
    Ok(None)
}

async fn insert_transaction(
    conn: &mut PgConnection,
    inv: &CompletedInvocation,
    split: &CostSplit,
    spend_pool_id: Option<Uuid>,
) -> Result<Option<Transaction>, BillingError> {
    let sql = format!(
        "INSERT INTO transactions \
         (id, user_id, echo_app_id, api_key_id, spend_pool_id, provider_transaction_id, \
          total_cost, app_profit, markup_profit, referral_profit, raw_transaction_cost, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (echo_app_id, provider_transaction_id) DO NOTHING \
         RETURNING {TRANSACTION_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Transaction>(&sql)
        .bind(uuidv7())
        .bind(inv.user_id)
        .bind(inv.echo_app_id)
        .bind(inv.api_key_id)
        .bind(spend_pool_id)
        .bind(&inv.invocation_id)
        .bind(split.total_cost)
        .bind(split.app_profit)
        .bind(split.markup_profit)
        .bind(split.referral_profit)
        .bind(split.raw_transaction_cost)
        .bind(TransactionStatus::Completed)
        .fetch_optional(&mut *conn)
        .await?)
}
