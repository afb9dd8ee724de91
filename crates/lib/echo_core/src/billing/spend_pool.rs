//! Spend pools: app-funded credit shared by the app's users.
//!
//! Pool balance and per-user usage are only mutated with both rows locked in
//! the caller's transaction. Funding is crate-private and reachable only from
//! payment completion.

use rust_decimal::Decimal;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tracing::info;
use uuid::Uuid;

use super::BillingError;
use crate::models::billing::SpendPool;
use crate::uuid::uuidv7;

/// Name of the pool every app gets on first request.
pub const DEFAULT_POOL_NAME: &str = "default";

const POOL_COLUMNS: &str =
    "id, echo_app_id, name, total_paid, total_spent, per_user_spend_limit, is_archived";

/// Return the app's default pool, creating it if absent.
pub async fn ensure_default_pool(
    conn: &mut PgConnection,
    echo_app_id: Uuid,
    per_user_spend_limit: Option<Decimal>,
) -> Result<SpendPool, BillingError> {
    sqlx::query(
        "INSERT INTO spend_pools (id, echo_app_id, name, per_user_spend_limit) \
         VALUES ($1, $2, $3, $4) ON CONFLICT (echo_app_id, name) DO NOTHING",
    )
    .bind(uuidv7())
    .bind(echo_app_id)
    .bind(DEFAULT_POOL_NAME)
    .bind(per_user_spend_limit)
    .execute(&mut *conn)
    .await?;

    let sql = format!("SELECT {POOL_COLUMNS} FROM spend_pools WHERE echo_app_id = $1 AND name = $2");
    let pool = sqlx::query_as::<_, SpendPool>(&sql)
        .bind(echo_app_id)
        .bind(DEFAULT_POOL_NAME)
        .fetch_one(&mut *conn)
        .await?;
    Ok(pool)
}

/// Create an additional named pool. Names are unique per app.
pub async fn create_named_pool<'e>(
    exec: impl PgExecutor<'e>,
    echo_app_id: Uuid,
    name: &str,
    per_user_spend_limit: Option<Decimal>,
) -> Result<SpendPool, BillingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(BillingError::Validation("Pool name must not be empty".into()));
    }
    if per_user_spend_limit.is_some_and(|l| l < Decimal::ZERO) {
        return Err(BillingError::Validation("per_user_spend_limit must not be negative".into()));
    }

    let sql = format!(
        "INSERT INTO spend_pools (id, echo_app_id, name, per_user_spend_limit) \
         VALUES ($1, $2, $3, $4) ON CONFLICT (echo_app_id, name) DO NOTHING \
         RETURNING {POOL_COLUMNS}"
    );
    sqlx::query_as::<_, SpendPool>(&sql)
        .bind(uuidv7())
        .bind(echo_app_id)
        .bind(name)
        .bind(per_user_spend_limit)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| BillingError::Validation(format!("Spend pool '{name}' already exists")))
}

pub async fn find_pool<'e>(
    exec: impl PgExecutor<'e>,
    pool_id: Uuid,
) -> Result<Option<SpendPool>, BillingError> {
    let sql = format!("SELECT {POOL_COLUMNS} FROM spend_pools WHERE id = $1");
    Ok(sqlx::query_as::<_, SpendPool>(&sql)
        .bind(pool_id)
        .fetch_optional(exec)
        .await?)
}

/// Active pools of an app in creation order.
pub async fn list_active_pools<'e>(
    exec: impl PgExecutor<'e>,
    echo_app_id: Uuid,
) -> Result<Vec<SpendPool>, BillingError> {
    let sql = format!(
        "SELECT {POOL_COLUMNS} FROM spend_pools \
         WHERE echo_app_id = $1 AND NOT is_archived ORDER BY created_at, id"
    );
    Ok(sqlx::query_as::<_, SpendPool>(&sql)
        .bind(echo_app_id)
        .fetch_all(exec)
        .await?)
}

/// How much `user_id` has drawn from `pool_id` so far.
pub async fn user_usage<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    pool_id: Uuid,
) -> Result<Decimal, BillingError> {
    let spent: Option<Decimal> = sqlx::query_scalar(
        "SELECT total_spent FROM user_spend_pool_usage WHERE user_id = $1 AND spend_pool_id = $2",
    )
    .bind(user_id)
    .bind(pool_id)
    .fetch_optional(exec)
    .await?;
    Ok(spent.unwrap_or(Decimal::ZERO))
}

/// Credit a pool. Only called after a verified payment completion.
pub(crate) async fn fund<'e>(
    exec: impl PgExecutor<'e>,
    pool_id: Uuid,
    amount: Decimal,
) -> Result<(), BillingError> {
    let updated = sqlx::query("UPDATE spend_pools SET total_paid = total_paid + $2 WHERE id = $1")
        .bind(pool_id)
        .bind(amount)
        .execute(exec)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(BillingError::NotFound(format!("Spend pool {pool_id}")));
    }
    Ok(())
}

/// Lock a pool row for the rest of the transaction.
pub(crate) async fn lock_pool(
    conn: &mut PgConnection,
    pool_id: Uuid,
) -> Result<Option<SpendPool>, BillingError> {
    let sql = format!("SELECT {POOL_COLUMNS} FROM spend_pools WHERE id = $1 FOR UPDATE");
    Ok(sqlx::query_as::<_, SpendPool>(&sql)
        .bind(pool_id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Lock (creating if needed) the user's usage row for a pool and return its total.
pub(crate) async fn lock_usage(
    conn: &mut PgConnection,
    user_id: Uuid,
    pool_id: Uuid,
) -> Result<Decimal, BillingError> {
    sqlx::query(
        "INSERT INTO user_spend_pool_usage (user_id, spend_pool_id) VALUES ($1, $2) \
         ON CONFLICT (user_id, spend_pool_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(pool_id)
    .execute(&mut *conn)
    .await?;

    let spent: Decimal = sqlx::query_scalar(
        "SELECT total_spent FROM user_spend_pool_usage \
         WHERE user_id = $1 AND spend_pool_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(pool_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(spent)
}

/// Debit a pool and the user's usage row. Both rows must already be locked.
pub(crate) async fn debit_locked(
    conn: &mut PgConnection,
    pool_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
) -> Result<(), BillingError> {
    sqlx::query("UPDATE spend_pools SET total_spent = total_spent + $2 WHERE id = $1")
        .bind(pool_id)
        .bind(amount)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "UPDATE user_spend_pool_usage SET total_spent = total_spent + $3 \
         WHERE user_id = $1 AND spend_pool_id = $2",
    )
    .bind(user_id)
    .bind(pool_id)
    .bind(amount)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Draw `amount` from a pool on behalf of a user in its own transaction.
///
/// Fails with `InsufficientBalance` if either the pool balance or the user's
/// remaining allowance is short; nothing is written in that case.
pub async fn spend(
    pool: &PgPool,
    pool_id: Uuid,
    user_id: Uuid,
    amount: Decimal,
) -> Result<SpendPool, BillingError> {
    if amount < Decimal::ZERO {
        return Err(BillingError::Validation("amount must not be negative".into()));
    }

    let mut tx = pool.begin().await?;
    let sp = lock_pool(&mut tx, pool_id)
        .await?
        .filter(|p| !p.is_archived)
        .ok_or_else(|| BillingError::NotFound(format!("Spend pool {pool_id}")))?;
    let user_spent = lock_usage(&mut tx, user_id, pool_id).await?;

    if !sp.can_cover(user_spent, amount) {
        let available = sp
            .per_user_remaining(user_spent)
            .map_or(sp.balance(), |r| r.min(sp.balance()));
        return Err(BillingError::InsufficientBalance {
            required: amount,
            available,
        });
    }

    debit_locked(&mut tx, pool_id, user_id, amount).await?;
    tx.commit().await?;

    info!(spend_pool_id = %pool_id, %user_id, %amount, "spend pool debited");

    Ok(SpendPool {
        total_spent: sp.total_spent + amount,
        ..sp
    })
}
