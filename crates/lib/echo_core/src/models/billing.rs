//! Ledger domain models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Completed,
    Refunded,
}

/// One metered LLM call. Immutable once written, apart from `is_archived`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub spend_pool_id: Option<Uuid>,
    pub provider_transaction_id: String,
    pub total_cost: Decimal,
    pub app_profit: Decimal,
    pub markup_profit: Decimal,
    pub referral_profit: Decimal,
    pub raw_transaction_cost: Decimal,
    pub status: TransactionStatus,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TransactionMetadata {
    pub transaction_id: Uuid,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub tool_cost: Decimal,
}

/// Shared free-tier credit funded by an app owner.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SpendPool {
    pub id: Uuid,
    pub echo_app_id: Uuid,
    pub name: String,
    pub total_paid: Decimal,
    pub total_spent: Decimal,
    pub per_user_spend_limit: Option<Decimal>,
    pub is_archived: bool,
}

impl SpendPool {
    pub fn balance(&self) -> Decimal {
        self.total_paid - self.total_spent
    }

    /// What `user_spent` may still draw from this pool, ignoring the pool balance.
    pub fn per_user_remaining(&self, user_spent: Decimal) -> Option<Decimal> {
        self.per_user_spend_limit.map(|limit| limit - user_spent)
    }

    /// Whether `amount` fits both the pool balance and the per-user cap.
    pub fn can_cover(&self, user_spent: Decimal, amount: Decimal) -> bool {
        self.balance() >= amount
            && self
                .per_user_remaining(user_spent)
                .is_none_or(|remaining| remaining >= amount)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserSpendPoolUsage {
    pub user_id: Uuid,
    pub spend_pool_id: Uuid,
    pub total_spent: Decimal,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: Uuid,
    /// External idempotency key supplied by the payment provider.
    pub payment_id: String,
    pub user_id: Uuid,
    /// Amount in minor units (cents).
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub spend_pool_id: Option<Uuid>,
    pub echo_app_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn pool(paid: Decimal, spent: Decimal, limit: Option<Decimal>) -> SpendPool {
        SpendPool {
            id: Uuid::nil(),
            echo_app_id: Uuid::nil(),
            name: "default".into(),
            total_paid: paid,
            total_spent: spent,
            per_user_spend_limit: limit,
            is_archived: false,
        }
    }

    #[test]
    fn can_cover_respects_pool_balance() {
        let p = pool(dec("10"), dec("9.5"), None);
        assert!(p.can_cover(Decimal::ZERO, dec("0.5")));
        assert!(!p.can_cover(Decimal::ZERO, dec("0.51")));
    }

    #[test]
    fn can_cover_respects_per_user_limit() {
        let p = pool(dec("100"), Decimal::ZERO, Some(dec("1")));
        assert!(p.can_cover(dec("0.4"), dec("0.6")));
        assert!(!p.can_cover(dec("0.5"), dec("0.6")));
    }
}
