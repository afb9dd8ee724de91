//! Credentials: JWT codec, secret resolution, API keys, and the credential store.
//!
//! Everything in here is policy-free persistence and cryptography; the OAuth
//! flow in `crate::oauth` decides *when* these are called.

pub mod api_keys;
pub mod queries;
pub mod secret;
pub mod token;

use thiserror::Error;

/// Errors raised by the token codec.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    ExpiredToken,

    #[error("Token signing failed: {0}")]
    Signing(String),
}

/// Authentication errors for bearer credentials and credential-store lookups.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),
}
