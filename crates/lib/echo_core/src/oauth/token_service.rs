//! `/oauth/token`: code exchange, refresh-token rotation, and revocation.
//!
//! Each session owns one refresh-token chain. Rotation archives the presented
//! token and appends a new one to the same session inside one transaction;
//! the row lock taken by `lock_redeemable_refresh_token` linearizes rotations
//! of the same token.
//!
//! An archived token stays redeemable for `refresh_grace_period` after its
//! first archival. Two clients racing with the same pre-rotation token both
//! succeed and walk away with divergent chains on the same session. That is
//! an accepted relaxation for retry robustness; once the window closes the
//! old token is dead.

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sqlx::{PgConnection, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use super::OAuthError;
use super::pkce;
use super::redirect::is_authorized_redirect;
use crate::auth::queries::{self, NewRefreshToken, hash_refresh_token};
use crate::auth::token::TokenCodec;
use crate::models::auth::{DeviceInfo, EchoApp, MembershipStatus, User};
use crate::uuid::parse_id;

/// Length of an opaque refresh token.
const REFRESH_TOKEN_LEN: usize = 64;

/// `authorization_code` grant parameters.
#[derive(Debug, Clone)]
pub struct CodeExchange {
    pub code: String,
    pub code_verifier: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub device: DeviceInfo,
}

/// Successful token-endpoint response, shared by both grants.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_token_expires_in: i64,
    pub scope: String,
    pub session_id: Uuid,
    pub user: User,
    pub echo_app: EchoApp,
}

/// Generate a cryptographically random refresh token (64 alphanumeric chars).
fn generate_refresh_token() -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(REFRESH_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Exchange an authorization code + PKCE verifier for a token pair.
pub async fn exchange_authorization_code(
    pool: &PgPool,
    codec: &TokenCodec,
    req: &CodeExchange,
) -> Result<TokenPair, OAuthError> {
    // Shape check first: a malformed verifier never reaches the database.
    pkce::validate_code_verifier(&req.code_verifier)?;

    let grant = codec.verify_authorization_code(&req.code)?;

    if grant.client_id != req.client_id {
        return Err(OAuthError::InvalidGrant("client_id does not match the code".into()));
    }
    if grant.redirect_uri != req.redirect_uri {
        return Err(OAuthError::InvalidGrant("redirect_uri does not match the code".into()));
    }

    pkce::verify_pkce(
        &req.code_verifier,
        &grant.code_challenge,
        &grant.code_challenge_method,
    )?;

    let user_id = parse_claim_id(&grant.user_id)?;
    let app_id = parse_claim_id(&grant.client_id)?;

    let user = queries::find_user(pool, user_id)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("User not found".into()))?;
    let app = queries::find_active_app(pool, app_id)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("App not found or archived".into()))?;

    if !is_authorized_redirect(&req.redirect_uri, &app.authorized_callback_urls) {
        return Err(OAuthError::InvalidGrant("redirect_uri is not authorized".into()));
    }

    let mut tx = pool.begin().await?;

    let membership = queries::ensure_customer_membership(&mut tx, user.id, app.id).await?;
    if membership.status == MembershipStatus::Revoked {
        return Err(OAuthError::AccessDenied("Access to this app was revoked".into()));
    }

    let session = queries::create_session(&mut *tx, user.id, app.id, &req.device).await?;
    let now = Utc::now();
    let (refresh_token, refresh_expires_at) =
        issue_refresh_token(&mut tx, codec, &user, &app, session.id, &grant.scope, now).await?;
    let access_token = codec.issue_access_token(user.id, app.id, &grant.scope, Some(session.id))?;

    tx.commit().await?;

    info!(user_id = %user.id, echo_app_id = %app.id, session_id = %session.id, "issued token pair");

    Ok(TokenPair {
        access_token,
        expires_in: codec.settings().access_token_ttl_secs,
        refresh_token,
        refresh_token_expires_in: (refresh_expires_at - now).num_seconds(),
        scope: grant.scope,
        session_id: session.id,
        user,
        echo_app: app,
    })
}

/// Rotate a refresh token and mint a fresh access token on the same session.
pub async fn refresh(
    pool: &PgPool,
    codec: &TokenCodec,
    refresh_token: &str,
    device: &DeviceInfo,
) -> Result<TokenPair, OAuthError> {
    let token_hash = hash_refresh_token(refresh_token);
    let now = Utc::now();
    let grace_cutoff = now - codec.settings().refresh_grace_period();

    let mut tx = pool.begin().await?;

    let record = queries::lock_redeemable_refresh_token(&mut tx, &token_hash, grace_cutoff, now)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("Invalid refresh token".into()))?;

    if record.expires_at <= now {
        queries::archive_refresh_token(&mut *tx, record.id, now).await?;
        tx.commit().await?;
        return Err(OAuthError::InvalidGrant("Refresh token expired".into()));
    }

    if record.is_archived {
        warn!(
            session_id = %record.session_id,
            archived_at = ?record.archived_at,
            "refresh token replayed within grace window"
        );
    }

    let session = queries::find_session(&mut *tx, record.session_id)
        .await?
        .filter(|s| s.revoked_at.is_none())
        .ok_or_else(|| OAuthError::InvalidGrant("Session has been revoked".into()))?;
    let app = queries::find_active_app(&mut *tx, record.echo_app_id)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("App not found or archived".into()))?;
    let user = queries::find_user(&mut *tx, record.user_id)
        .await?
        .ok_or_else(|| OAuthError::InvalidGrant("User not found".into()))?;

    queries::archive_refresh_token(&mut *tx, record.id, now).await?;
    let (new_refresh, refresh_expires_at) =
        issue_refresh_token(&mut tx, codec, &user, &app, session.id, &record.scope, now).await?;
    queries::touch_session(&mut *tx, session.id, device).await?;
    let access_token = codec.issue_access_token(user.id, app.id, &record.scope, Some(session.id))?;

    tx.commit().await?;

    Ok(TokenPair {
        access_token,
        expires_in: codec.settings().access_token_ttl_secs,
        refresh_token: new_refresh,
        refresh_token_expires_in: (refresh_expires_at - now).num_seconds(),
        scope: record.scope,
        session_id: session.id,
        user,
        echo_app: app,
    })
}

/// Sign out: revoke the session behind `refresh_token` and archive its chain.
///
/// Unknown tokens are accepted silently (RFC 7009 §2.2).
pub async fn revoke(pool: &PgPool, refresh_token: &str) -> Result<(), OAuthError> {
    let token_hash = hash_refresh_token(refresh_token);
    let Some(record) = queries::find_refresh_token(pool, &token_hash).await? else {
        return Ok(());
    };

    let mut tx = pool.begin().await?;
    queries::revoke_session(&mut tx, record.session_id, Utc::now()).await?;
    tx.commit().await?;

    info!(session_id = %record.session_id, user_id = %record.user_id, "session revoked");
    Ok(())
}

async fn issue_refresh_token(
    conn: &mut PgConnection,
    codec: &TokenCodec,
    user: &User,
    app: &EchoApp,
    session_id: Uuid,
    scope: &str,
    now: DateTime<Utc>,
) -> Result<(String, DateTime<Utc>), OAuthError> {
    let token = generate_refresh_token();
    let token_hash = hash_refresh_token(&token);
    let expires_at = now + codec.settings().refresh_token_ttl();

    queries::insert_refresh_token(
        &mut *conn,
        &NewRefreshToken {
            token_hash: &token_hash,
            user_id: user.id,
            echo_app_id: app.id,
            session_id,
            scope,
            expires_at,
        },
    )
    .await?;

    Ok((token, expires_at))
}

fn parse_claim_id(value: &str) -> Result<Uuid, OAuthError> {
    parse_id(value).ok_or_else(|| OAuthError::InvalidGrant("Malformed authorization code".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_tokens_are_long_and_unique() {
        let a = generate_refresh_token();
        assert_eq!(a.len(), REFRESH_TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_refresh_token());
    }

    #[test]
    fn non_uuid_claims_are_invalid_grant() {
        assert!(matches!(
            parse_claim_id("nope"),
            Err(OAuthError::InvalidGrant(_))
        ));
    }
}
