//! Credential-store queries.
//!
//! Single-statement helpers take any `PgExecutor` so they work on the pool or
//! inside a caller's transaction. Helpers that issue several statements take
//! `&mut PgConnection`; the caller owns the transaction boundary.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::{
    AppMembership, AppSession, DeviceInfo, EchoApp, MembershipRole, RefreshTokenRecord, User,
};
use crate::uuid::uuidv7;

const USER_COLUMNS: &str = "id, email, name, total_paid, total_spent, is_admin, archived_at";
const APP_COLUMNS: &str =
    "id, name, description, authorized_callback_urls, is_archived, markup_rate, referral_rate";
const MEMBERSHIP_COLUMNS: &str = "id, user_id, echo_app_id, role, status, total_spent";
const SESSION_COLUMNS: &str =
    "id, user_id, echo_app_id, device_name, user_agent, ip_address, last_seen_at, revoked_at";
const REFRESH_COLUMNS: &str =
    "id, user_id, echo_app_id, session_id, scope, expires_at, is_archived, archived_at";

/// SHA-256 hash a refresh token for storage.
pub fn hash_refresh_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Create the user on first sign-in; later calls only refresh the display name.
///
/// An email already registered to a different id is refused with
/// `Unauthorized`; identities are never merged.
pub async fn ensure_user<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    email: &str,
    name: Option<&str>,
) -> Result<User, AuthError> {
    let sql = format!(
        "WITH inserted AS ( \
             INSERT INTO users (id, email, name) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING \
             RETURNING {USER_COLUMNS} \
         ), updated AS ( \
             UPDATE users SET name = COALESCE($3, name) \
             WHERE id = $1 AND NOT EXISTS (SELECT 1 FROM inserted) \
             RETURNING {USER_COLUMNS} \
         ) \
         SELECT {USER_COLUMNS} FROM inserted \
         UNION ALL SELECT {USER_COLUMNS} FROM updated"
    );
    sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .bind(email)
        .bind(name)
        .fetch_optional(exec)
        .await?
        .ok_or_else(|| AuthError::Unauthorized("Email is linked to another account".into()))
}

/// Fetch a non-archived user.
pub async fn find_user<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
) -> Result<Option<User>, AuthError> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND archived_at IS NULL");
    let user = sqlx::query_as::<_, User>(&sql)
        .bind(user_id)
        .fetch_optional(exec)
        .await?;
    Ok(user)
}

// ---------------------------------------------------------------------------
// Echo apps
// ---------------------------------------------------------------------------

/// Registration data for a new Echo app.
#[derive(Debug, Clone)]
pub struct NewEchoApp {
    pub name: String,
    pub description: Option<String>,
    pub authorized_callback_urls: Vec<String>,
    pub markup_rate: Decimal,
    pub referral_rate: Decimal,
}

/// Register an app and make `owner_id` its owner.
pub async fn create_app(
    conn: &mut PgConnection,
    owner_id: Uuid,
    app: &NewEchoApp,
) -> Result<EchoApp, AuthError> {
    let sql = format!(
        "INSERT INTO echo_apps \
         (id, name, description, authorized_callback_urls, markup_rate, referral_rate) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {APP_COLUMNS}"
    );
    let created = sqlx::query_as::<_, EchoApp>(&sql)
        .bind(uuidv7())
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.authorized_callback_urls)
        .bind(app.markup_rate)
        .bind(app.referral_rate)
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query(
        "INSERT INTO app_memberships (id, user_id, echo_app_id, role) \
         VALUES ($1, $2, $3, 'owner')",
    )
    .bind(uuidv7())
    .bind(owner_id)
    .bind(created.id)
    .execute(&mut *conn)
    .await?;

    Ok(created)
}

/// Fetch an app regardless of archival state.
pub async fn find_app<'e>(
    exec: impl PgExecutor<'e>,
    app_id: Uuid,
) -> Result<Option<EchoApp>, AuthError> {
    let sql = format!("SELECT {APP_COLUMNS} FROM echo_apps WHERE id = $1");
    let app = sqlx::query_as::<_, EchoApp>(&sql)
        .bind(app_id)
        .fetch_optional(exec)
        .await?;
    Ok(app)
}

/// Fetch an app only if it is active.
pub async fn find_active_app<'e>(
    exec: impl PgExecutor<'e>,
    app_id: Uuid,
) -> Result<Option<EchoApp>, AuthError> {
    Ok(find_app(exec, app_id).await?.filter(|a| !a.is_archived))
}

// ---------------------------------------------------------------------------
// Memberships
// ---------------------------------------------------------------------------

pub async fn find_membership<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    echo_app_id: Uuid,
) -> Result<Option<AppMembership>, AuthError> {
    let sql = format!(
        "SELECT {MEMBERSHIP_COLUMNS} FROM app_memberships \
         WHERE user_id = $1 AND echo_app_id = $2"
    );
    let membership = sqlx::query_as::<_, AppMembership>(&sql)
        .bind(user_id)
        .bind(echo_app_id)
        .fetch_optional(exec)
        .await?;
    Ok(membership)
}

/// Make sure the user holds at least a `customer` membership.
///
/// Concurrent callers converge on one row: the unique (user, app) constraint
/// turns the second insert into a no-op and both read the surviving row.
/// A `public` sentinel row is promoted to `customer`; other roles are kept.
pub async fn ensure_customer_membership(
    conn: &mut PgConnection,
    user_id: Uuid,
    echo_app_id: Uuid,
) -> Result<AppMembership, AuthError> {
    sqlx::query(
        "INSERT INTO app_memberships (id, user_id, echo_app_id, role) \
         VALUES ($1, $2, $3, 'customer') \
         ON CONFLICT (user_id, echo_app_id) DO NOTHING",
    )
    .bind(uuidv7())
    .bind(user_id)
    .bind(echo_app_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE app_memberships SET role = 'customer' \
         WHERE user_id = $1 AND echo_app_id = $2 AND role = $3",
    )
    .bind(user_id)
    .bind(echo_app_id)
    .bind(MembershipRole::Public)
    .execute(&mut *conn)
    .await?;

    find_membership(&mut *conn, user_id, echo_app_id)
        .await?
        .ok_or_else(|| AuthError::ValidationError("membership vanished after upsert".into()))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub async fn create_session<'e>(
    exec: impl PgExecutor<'e>,
    user_id: Uuid,
    echo_app_id: Uuid,
    device: &DeviceInfo,
) -> Result<AppSession, AuthError> {
    let sql = format!(
        "INSERT INTO app_sessions (id, user_id, echo_app_id, device_name, user_agent, ip_address) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING {SESSION_COLUMNS}"
    );
    let session = sqlx::query_as::<_, AppSession>(&sql)
        .bind(uuidv7())
        .bind(user_id)
        .bind(echo_app_id)
        .bind(&device.device_name)
        .bind(&device.user_agent)
        .bind(&device.ip_address)
        .fetch_one(exec)
        .await?;
    Ok(session)
}

pub async fn find_session<'e>(
    exec: impl PgExecutor<'e>,
    session_id: Uuid,
) -> Result<Option<AppSession>, AuthError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM app_sessions WHERE id = $1");
    let session = sqlx::query_as::<_, AppSession>(&sql)
        .bind(session_id)
        .fetch_optional(exec)
        .await?;
    Ok(session)
}

/// Bump `last_seen_at`; device fields are only overwritten when supplied.
pub async fn touch_session<'e>(
    exec: impl PgExecutor<'e>,
    session_id: Uuid,
    device: &DeviceInfo,
) -> Result<(), AuthError> {
    sqlx::query(
        "UPDATE app_sessions SET last_seen_at = now(), \
           device_name = COALESCE($2, device_name), \
           user_agent = COALESCE($3, user_agent), \
           ip_address = COALESCE($4, ip_address) \
         WHERE id = $1",
    )
    .bind(session_id)
    .bind(&device.device_name)
    .bind(&device.user_agent)
    .bind(&device.ip_address)
    .execute(exec)
    .await?;
    Ok(())
}

/// Revoke a session and archive every refresh token it owns. Idempotent.
pub async fn revoke_session(
    conn: &mut PgConnection,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    sqlx::query("UPDATE app_sessions SET revoked_at = COALESCE(revoked_at, $2) WHERE id = $1")
        .bind(session_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        "UPDATE refresh_tokens SET is_archived = TRUE, archived_at = COALESCE(archived_at, $2) \
         WHERE session_id = $1",
    )
    .bind(session_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Refresh tokens
// ---------------------------------------------------------------------------

/// Fields for a new refresh token row.
#[derive(Debug, Clone)]
pub struct NewRefreshToken<'a> {
    pub token_hash: &'a str,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub session_id: Uuid,
    pub scope: &'a str,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert_refresh_token<'e>(
    exec: impl PgExecutor<'e>,
    token: &NewRefreshToken<'_>,
) -> Result<RefreshTokenRecord, AuthError> {
    let sql = format!(
        "INSERT INTO refresh_tokens \
         (id, token_hash, user_id, echo_app_id, session_id, scope, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {REFRESH_COLUMNS}"
    );
    let record = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
        .bind(uuidv7())
        .bind(token.token_hash)
        .bind(token.user_id)
        .bind(token.echo_app_id)
        .bind(token.session_id)
        .bind(token.scope)
        .bind(token.expires_at)
        .fetch_one(exec)
        .await?;
    Ok(record)
}

/// Find a refresh token the caller may still redeem, locking its row.
///
/// Returns active tokens (including ones whose `expires_at` has passed, so the
/// caller can archive them) and archived tokens still inside the grace window
/// and not yet expired. Archived tokens past either bound are never returned.
pub async fn lock_redeemable_refresh_token(
    conn: &mut PgConnection,
    token_hash: &str,
    grace_cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<RefreshTokenRecord>, AuthError> {
    let sql = format!(
        "SELECT {REFRESH_COLUMNS} FROM refresh_tokens \
         WHERE token_hash = $1 \
           AND (NOT is_archived OR (archived_at > $2 AND expires_at > $3)) \
         FOR UPDATE"
    );
    let record = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
        .bind(token_hash)
        .bind(grace_cutoff)
        .bind(now)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(record)
}

/// Find a refresh token by hash with no usability filter (revocation path).
pub async fn find_refresh_token<'e>(
    exec: impl PgExecutor<'e>,
    token_hash: &str,
) -> Result<Option<RefreshTokenRecord>, AuthError> {
    let sql = format!("SELECT {REFRESH_COLUMNS} FROM refresh_tokens WHERE token_hash = $1");
    let record = sqlx::query_as::<_, RefreshTokenRecord>(&sql)
        .bind(token_hash)
        .fetch_optional(exec)
        .await?;
    Ok(record)
}

/// Archive a refresh token. Archiving twice keeps the first `archived_at`.
pub async fn archive_refresh_token<'e>(
    exec: impl PgExecutor<'e>,
    token_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    sqlx::query(
        "UPDATE refresh_tokens SET is_archived = TRUE, archived_at = COALESCE(archived_at, $2) \
         WHERE id = $1",
    )
    .bind(token_id)
    .bind(now)
    .execute(exec)
    .await?;
    Ok(())
}
