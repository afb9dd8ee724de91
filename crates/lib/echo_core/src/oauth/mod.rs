//! OAuth 2.0 authorization-code flow with mandatory PKCE.
//!
//! `authorize` mints stateless JWT codes; `token_service` exchanges them for
//! a refresh-token chain plus JWT access tokens and rotates that chain.

pub mod authorize;
pub mod pkce;
pub mod redirect;
pub mod token_service;

use thiserror::Error;

use crate::auth::{AuthError, TokenError};

/// OAuth errors, one variant per RFC 6749 error code we emit.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("{0}")]
    AccessDenied(String),

    #[error("{0}")]
    UnsupportedGrantType(String),

    #[error("{0}")]
    UnsupportedResponseType(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OAuthError {
    /// RFC 6749 `error` code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidClient(_) => "invalid_client",
            Self::AccessDenied(_) => "access_denied",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::Db(_) | Self::Internal(_) => "server_error",
        }
    }
}

impl From<AuthError> for OAuthError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::DbError(e) => Self::Db(e),
            AuthError::Token(e) => e.into(),
            AuthError::Unauthorized(msg) => Self::AccessDenied(msg),
            AuthError::ValidationError(msg) => Self::Internal(msg),
        }
    }
}

impl From<TokenError> for OAuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::ExpiredToken => Self::InvalidGrant("Authorization code expired".into()),
            TokenError::InvalidToken(_) => Self::InvalidGrant("Invalid authorization code".into()),
            TokenError::Signing(msg) => Self::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_rfc_6749() {
        assert_eq!(OAuthError::InvalidGrant("x".into()).code(), "invalid_grant");
        assert_eq!(OAuthError::InvalidClient("x".into()).code(), "invalid_client");
        assert_eq!(OAuthError::Internal("x".into()).code(), "server_error");
    }

    #[test]
    fn expired_code_maps_to_invalid_grant() {
        let e: OAuthError = TokenError::ExpiredToken.into();
        assert!(matches!(e, OAuthError::InvalidGrant(_)));
    }
}
