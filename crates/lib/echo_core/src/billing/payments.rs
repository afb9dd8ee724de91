//! Payment completion.
//!
//! `payment_id` is the provider's idempotency key. The upsert only returns a
//! row when it moves a payment into `completed`, and crediting happens only
//! then, so webhook redeliveries are harmless.

use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::{BillingError, spend_pool};
use crate::models::billing::{Payment, PaymentStatus};
use crate::uuid::uuidv7;

const PAYMENT_COLUMNS: &str =
    "id, payment_id, user_id, amount, currency, status, spend_pool_id, echo_app_id, created_at";

/// A verified payment-success event from the payment provider.
#[derive(Debug, Clone)]
pub struct PaymentSuccess {
    pub user_id: Uuid,
    /// Minor units (cents).
    pub amount_cents: i64,
    pub currency: String,
    pub payment_id: String,
    pub metadata: Value,
    pub echo_app_id: Option<Uuid>,
    /// When set, the payment funds this pool instead of the user's balance.
    pub spend_pool_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Credited(Payment),
    AlreadyProcessed(Payment),
}

impl PaymentOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            Self::Credited(p) | Self::AlreadyProcessed(p) => p,
        }
    }
}

/// Convert minor units to the ledger's dollar amounts.
pub fn cents_to_dollars(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

/// Mark a payment completed and credit it exactly once.
pub async fn handle_payment_success(
    pool: &PgPool,
    event: &PaymentSuccess,
) -> Result<PaymentOutcome, BillingError> {
    if event.amount_cents <= 0 {
        return Err(BillingError::Validation("amount must be positive".into()));
    }
    if event.payment_id.trim().is_empty() {
        return Err(BillingError::Validation("payment_id is required".into()));
    }

    let mut tx = pool.begin().await?;

    if let Some(pool_id) = event.spend_pool_id {
        let sp = spend_pool::find_pool(&mut *tx, pool_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Spend pool {pool_id}")))?;
        if event.echo_app_id.is_some_and(|app| app != sp.echo_app_id) {
            return Err(BillingError::Validation(
                "spend pool does not belong to echo_app_id".into(),
            ));
        }
    }

    let sql = format!(
        "INSERT INTO payments \
         (id, payment_id, user_id, amount, currency, status, spend_pool_id, echo_app_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (payment_id) DO UPDATE SET status = EXCLUDED.status, updated_at = now() \
         WHERE payments.status <> EXCLUDED.status \
         RETURNING {PAYMENT_COLUMNS}"
    );
    let newly_completed = sqlx::query_as::<_, Payment>(&sql)
        .bind(uuidv7())
        .bind(&event.payment_id)
        .bind(event.user_id)
        .bind(event.amount_cents)
        .bind(&event.currency)
        .bind(PaymentStatus::Completed)
        .bind(event.spend_pool_id)
        .bind(event.echo_app_id)
        .bind(&event.metadata)
        .fetch_optional(&mut *tx)
        .await?;

    let Some(payment) = newly_completed else {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_id = $1");
        let existing = sqlx::query_as::<_, Payment>(&sql)
            .bind(&event.payment_id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(payment_id = %event.payment_id, "payment already processed");
        return Ok(PaymentOutcome::AlreadyProcessed(existing));
    };

    // Credit what the stored row says, which for a pending row may predate this event.
    let amount = cents_to_dollars(payment.amount);
    match payment.spend_pool_id {
        Some(pool_id) => spend_pool::fund(&mut *tx, pool_id, amount).await?,
        None => {
            sqlx::query("UPDATE users SET total_paid = total_paid + $2 WHERE id = $1")
                .bind(payment.user_id)
                .bind(amount)
                .execute(&mut *tx)
                .await?;
        }
    }

    tx.commit().await?;

    info!(
        payment_id = %payment.payment_id,
        user_id = %payment.user_id,
        %amount,
        spend_pool_id = ?payment.spend_pool_id,
        "payment credited"
    );
    Ok(PaymentOutcome::Credited(payment))
}

/// Record a checkout that has not completed yet.
pub async fn record_pending_payment(
    pool: &PgPool,
    event: &PaymentSuccess,
) -> Result<Payment, BillingError> {
    let sql = format!(
        "INSERT INTO payments \
         (id, payment_id, user_id, amount, currency, status, spend_pool_id, echo_app_id, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (payment_id) DO UPDATE SET updated_at = now() \
         RETURNING {PAYMENT_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Payment>(&sql)
        .bind(uuidv7())
        .bind(&event.payment_id)
        .bind(event.user_id)
        .bind(event.amount_cents)
        .bind(&event.currency)
        .bind(PaymentStatus::Pending)
        .bind(event.spend_pool_id)
        .bind(event.echo_app_id)
        .bind(&event.metadata)
        .fetch_one(pool)
        .await?)
}
