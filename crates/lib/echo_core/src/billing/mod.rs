//! Metered billing: cost splits, the transaction ledger, spend pools, and
//! payment crediting.
//!
//! Balances are never cached; every debit re-reads and locks the rows it
//! touches inside the transaction that writes the ledger entry.

pub mod ledger;
pub mod payments;
pub mod pricing;
pub mod spend_pool;
pub mod split;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::auth::AuthError;

/// Billing errors.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Insufficient balance: {required} required, {available} available")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<AuthError> for BillingError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::DbError(e) => Self::Db(e),
            other => Self::Validation(other.to_string()),
        }
    }
}
