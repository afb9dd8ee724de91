//! Application error types.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use echo_core::auth::{AuthError, TokenError};
use echo_core::billing::BillingError;
use echo_core::oauth::OAuthError;
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::OAuth(e) => {
                let status = match e {
                    OAuthError::InvalidClient(_) => StatusCode::UNAUTHORIZED,
                    OAuthError::AccessDenied(_) => StatusCode::FORBIDDEN,
                    OAuthError::Db(_) | OAuthError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    _ => StatusCode::BAD_REQUEST,
                };
                let description = if status == StatusCode::INTERNAL_SERVER_ERROR {
                    "Internal server error".to_string()
                } else {
                    e.to_string()
                };
                (status, e.code(), description)
            }
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, "invalid_request", m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, "unauthorized", m.clone()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, "forbidden", m.clone()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m.clone()),
            AppError::PaymentRequired(m) => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_balance", m.clone())
            }
            AppError::Upstream(m) => (StatusCode::BAD_GATEWAY, "upstream_error", m.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, description) = self.parts();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, detail = ?self, "request failed");
        }
        let body = Json(ErrorResponse {
            error: error.to_string(),
            error_description: description,
        });
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".into()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized(msg) => AppError::Unauthorized(msg),
            AuthError::Token(TokenError::ExpiredToken) => {
                AppError::Unauthorized("Access token expired".into())
            }
            AuthError::Token(TokenError::InvalidToken(_)) => {
                AppError::Unauthorized("Invalid access token".into())
            }
            AuthError::Token(TokenError::Signing(msg)) => AppError::Internal(msg),
            AuthError::ValidationError(msg) => AppError::Validation(msg),
            AuthError::DbError(e) => AppError::from(e),
        }
    }
}

impl From<BillingError> for AppError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InsufficientBalance { required, available } => AppError::PaymentRequired(
                format!("Insufficient balance: {required} required, {available} available"),
            ),
            BillingError::NotFound(msg) => AppError::NotFound(msg),
            BillingError::Validation(msg) => AppError::Validation(msg),
            BillingError::UnsupportedModel(model) => {
                AppError::Validation(format!("Unsupported model: {model}"))
            }
            BillingError::Db(e) => AppError::from(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn oauth_errors_keep_rfc_codes() {
        let (status, code, _) = AppError::from(OAuthError::InvalidGrant("x".into())).parts();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(code, "invalid_grant");

        let (status, code, _) = AppError::from(OAuthError::InvalidClient("x".into())).parts();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(code, "invalid_client");
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let (status, code, description) =
            AppError::from(OAuthError::Internal("pool exhausted at 10.0.0.5".into())).parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "server_error");
        assert!(!description.contains("10.0.0.5"));

        let (_, _, description) = AppError::Internal("secret detail".into()).parts();
        assert!(!description.contains("secret"));
    }

    #[test]
    fn insufficient_balance_is_402() {
        let e = AppError::from(BillingError::InsufficientBalance {
            required: Decimal::ONE,
            available: Decimal::ZERO,
        });
        assert_eq!(e.parts().0, StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn expired_access_token_is_401() {
        let e = AppError::from(AuthError::Token(TokenError::ExpiredToken));
        assert_eq!(e.parts().0, StatusCode::UNAUTHORIZED);
    }
}
