//! Dashboard session bridge.
//!
//! The dashboard owns sign-in. It hands the gateway an HS256 session token,
//! either as the `echo_session` cookie or as a Bearer token, and
//! `/oauth/authorize` trusts whoever that token names.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum_extra::extract::cookie::CookieJar;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use echo_core::uuid::parse_id;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Cookie carrying the dashboard session token.
pub const SESSION_COOKIE: &str = "echo_session";

/// Claims of a dashboard session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardClaims {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
}

/// Signed-in dashboard user.
#[derive(Debug, Clone)]
pub struct DashboardSession {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

/// Mint a session token the way the dashboard does.
pub fn issue_session_token(
    secret: &[u8],
    user_id: Uuid,
    email: &str,
    name: Option<&str>,
    ttl: Duration,
) -> Result<String, AppError> {
    let claims = DashboardClaims {
        sub: user_id.to_string(),
        email: email.to_string(),
        name: name.map(str::to_string),
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
        .map_err(|e| AppError::Internal(format!("Session signing failed: {e}")))
}

/// Verify a session token.
pub fn verify_session_token(token: &str, secret: &[u8]) -> Option<DashboardSession> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    let data = decode::<DashboardClaims>(token, &DecodingKey::from_secret(secret), &validation).ok()?;
    let user_id = parse_id(&data.claims.sub)?;
    Some(DashboardSession {
        user_id,
        email: data.claims.email,
        name: data.claims.name,
    })
}

/// Identify the dashboard user behind a request, cookie first.
pub fn session_from_request(
    jar: &CookieJar,
    headers: &HeaderMap,
    secret: &[u8],
) -> Result<DashboardSession, AppError> {
    let token = jar
        .get(SESSION_COOKIE)
        .map(|c| c.value().to_string())
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .ok_or_else(|| AppError::Unauthorized("Sign in to the dashboard first".into()))?;

    verify_session_token(&token, secret)
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired dashboard session".into()))
}
