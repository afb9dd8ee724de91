//! Long-lived API keys for server-to-server callers.
//!
//! Keys are shown to the user once; only a salted SHA-256 digest is stored,
//! and validation is a lookup by that digest.

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::{Rng, rng};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::ApiKeyRecord;
use crate::uuid::uuidv7;

/// Prefix that makes keys recognisable in logs and secret scanners.
pub const API_KEY_PREFIX: &str = "echo_";

/// Random characters after the prefix.
const API_KEY_RANDOM_LEN: usize = 48;

/// Identity resolved from a valid API key.
#[derive(Debug, Clone)]
pub struct ApiKeyPrincipal {
    pub api_key_id: Uuid,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
}

fn generate_key() -> String {
    let random: String = rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{API_KEY_PREFIX}{random}")
}

/// Salted SHA-256 of a key, hex encoded.
pub fn hash_api_key(key: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Create a key for `user_id` on `echo_app_id`. Returns (plaintext, record).
pub async fn create_api_key(
    pool: &PgPool,
    salt: &str,
    user_id: Uuid,
    echo_app_id: Uuid,
    name: Option<&str>,
) -> Result<(String, ApiKeyRecord), AuthError> {
    let plaintext = generate_key();
    let key_hash = hash_api_key(&plaintext, salt);
    // Enough to identify a key in a listing without weakening it.
    let key_prefix: String = plaintext.chars().take(API_KEY_PREFIX.len() + 4).collect();

    let id = uuidv7();
    let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
        "INSERT INTO api_keys (id, key_hash, key_prefix, name, user_id, echo_app_id) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING created_at",
    )
    .bind(id)
    .bind(&key_hash)
    .bind(&key_prefix)
    .bind(name)
    .bind(user_id)
    .bind(echo_app_id)
    .fetch_one(pool)
    .await?;

    let record = ApiKeyRecord {
        id,
        key_prefix,
        name: name.map(str::to_string),
        user_id,
        echo_app_id,
        is_active: true,
        created_at,
    };
    Ok((plaintext, record))
}

/// Validate a presented key. `None` for unknown, inactive, or orphaned keys.
pub async fn validate_api_key(
    pool: &PgPool,
    salt: &str,
    key: &str,
) -> Result<Option<ApiKeyPrincipal>, AuthError> {
    if !key.starts_with(API_KEY_PREFIX) {
        return Ok(None);
    }
    let key_hash = hash_api_key(key, salt);

    let row = sqlx::query_as::<_, (Uuid, Uuid, Uuid)>(
        "UPDATE api_keys k SET last_used_at = now() \
         FROM users u, echo_apps a \
         WHERE k.key_hash = $1 \
           AND k.is_active \
           AND u.id = k.user_id AND u.archived_at IS NULL \
           AND a.id = k.echo_app_id AND NOT a.is_archived \
         RETURNING k.id, k.user_id, k.echo_app_id",
    )
    .bind(&key_hash)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(api_key_id, user_id, echo_app_id)| ApiKeyPrincipal {
        api_key_id,
        user_id,
        echo_app_id,
    }))
}

/// Deactivate a key owned by `user_id`. Returns whether a key was changed.
pub async fn deactivate_api_key(
    pool: &PgPool,
    key_id: Uuid,
    user_id: Uuid,
) -> Result<bool, AuthError> {
    let result = sqlx::query(
        "UPDATE api_keys SET is_active = FALSE \
         WHERE id = $1 AND user_id = $2 AND is_active",
    )
    .bind(key_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// List a user's keys for one app (hashes are never returned).
pub async fn list_api_keys(
    pool: &PgPool,
    user_id: Uuid,
    echo_app_id: Uuid,
) -> Result<Vec<ApiKeyRecord>, AuthError> {
    let rows = sqlx::query_as::<_, ApiKeyRecord>(
        "SELECT id, key_prefix, name, user_id, echo_app_id, is_active, created_at \
         FROM api_keys \
         WHERE user_id = $1 AND echo_app_id = $2 \
         ORDER BY created_at DESC",
    )
    .bind(user_id)
    .bind(echo_app_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
