//! Credential detection and verification.
//!
//! The credential kind is decided once, here: an `x-payment` header is X402,
//! an `x-api-key` header is an API key, and a Bearer value with exactly two
//! dots is a JWT access token while anything else is an API key.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use echo_core::auth::api_keys::validate_api_key;
use echo_core::auth::queries;
use echo_core::models::auth::MembershipStatus;
use echo_core::uuid::parse_id;
use uuid::Uuid;

use crate::AppState;
use crate::error::AppError;
use crate::services::x402::PAYMENT_HEADER;

/// A presented credential, before verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    AccessToken(String),
    ApiKey(String),
    X402(String),
}

impl Credential {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        if let Some(payment) = header_value(headers, PAYMENT_HEADER) {
            return Some(Self::X402(payment.to_string()));
        }
        if let Some(key) = header_value(headers, "x-api-key") {
            return Some(Self::ApiKey(key.to_string()));
        }
        let token = header_value(headers, AUTHORIZATION.as_str())?
            .strip_prefix("Bearer ")?
            .trim();
        if token.is_empty() {
            return None;
        }
        Some(Self::from_bearer(token))
    }

    fn from_bearer(token: &str) -> Self {
        if token.matches('.').count() == 2 {
            Self::AccessToken(token.to_string())
        } else {
            Self::ApiKey(token.to_string())
        }
    }
}

/// Verified account identity, stored in request extensions.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
}

/// Verify an account credential. X402 payments are not account credentials.
pub async fn authenticate(state: &AppState, credential: &Credential) -> Result<Principal, AppError> {
    let principal = match credential {
        Credential::AccessToken(token) => {
            let claims = state
                .codec
                .verify_access_token(token)
                .map_err(echo_core::auth::AuthError::from)?;
            Principal {
                user_id: claim_id(&claims.user_id)?,
                echo_app_id: claim_id(&claims.app_id)?,
                api_key_id: None,
                session_id: claims.sid.as_deref().map(claim_id).transpose()?,
            }
        }
        Credential::ApiKey(key) => {
            let found = validate_api_key(&state.pool, &state.config.api_key_salt, key)
                .await?
                .ok_or_else(|| AppError::Unauthorized("Invalid API key".into()))?;
            Principal {
                user_id: found.user_id,
                echo_app_id: found.echo_app_id,
                api_key_id: Some(found.api_key_id),
                session_id: None,
            }
        }
        Credential::X402(_) => {
            return Err(AppError::Unauthorized(
                "X402 payments are only accepted on proxy endpoints".into(),
            ));
        }
    };

    if let Some(membership) =
        queries::find_membership(&state.pool, principal.user_id, principal.echo_app_id).await?
        && membership.status == MembershipStatus::Revoked
    {
        return Err(AppError::Forbidden("Access to this app was revoked".into()));
    }

    Ok(principal)
}

/// Axum middleware: resolve a Bearer access token or API key into a
/// `Principal` request extension.
pub async fn require_bearer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let credential = Credential::from_headers(request.headers())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer credential".into()))?;
    let principal = authenticate(&state, &credential).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn claim_id(value: &str) -> Result<Uuid, AppError> {
    parse_id(value).ok_or_else(|| AppError::Unauthorized("Malformed access token".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(v));
        }
        h
    }

    #[test]
    fn two_dots_means_jwt() {
        assert_eq!(
            Credential::from_headers(&headers(&[("authorization", "Bearer a.b.c")])),
            Some(Credential::AccessToken("a.b.c".into()))
        );
        assert_eq!(
            Credential::from_headers(&headers(&[("authorization", "Bearer echo_abc")])),
            Some(Credential::ApiKey("echo_abc".into()))
        );
        assert_eq!(
            Credential::from_headers(&headers(&[("authorization", "Bearer a.b")])),
            Some(Credential::ApiKey("a.b".into()))
        );
    }

    #[test]
    fn payment_header_wins() {
        let h = headers(&[("authorization", "Bearer a.b.c"), ("x-payment", "eyJ9")]);
        assert_eq!(Credential::from_headers(&h), Some(Credential::X402("eyJ9".into())));
    }

    #[test]
    fn x_api_key_header_is_an_api_key() {
        let h = headers(&[("x-api-key", "echo_k")]);
        assert_eq!(Credential::from_headers(&h), Some(Credential::ApiKey("echo_k".into())));
    }

    #[test]
    fn missing_or_foreign_scheme_is_none() {
        assert_eq!(Credential::from_headers(&HeaderMap::new()), None);
        assert_eq!(
            Credential::from_headers(&headers(&[("authorization", "Basic dXNlcg==")])),
            None
        );
        assert_eq!(Credential::from_headers(&headers(&[("authorization", "Bearer ")])), None);
    }

    #[test]
    fn malformed_claim_ids_are_unauthorized() {
        assert!(matches!(claim_id("not-a-uuid"), Err(AppError::Unauthorized(_))));
        let id = Uuid::now_v7();
        assert_eq!(claim_id(&id.to_string()).ok(), Some(id));
    }
}
