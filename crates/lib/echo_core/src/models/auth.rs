//! Identity and credential domain models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Role a user holds within an Echo app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "membership_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Owner,
    Admin,
    Customer,
    /// Sentinel for users who can see the app but have never been granted access.
    Public,
}

impl MembershipRole {
    /// Owners and admins manage the app (pools, keys of other users, settings).
    pub fn can_manage(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "membership_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipStatus {
    Active,
    Revoked,
}

// =============================================================================
// DB row structs
// =============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub total_paid: Decimal,
    pub total_spent: Decimal,
    pub is_admin: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

impl User {
    /// Personal balance available for metered calls.
    pub fn balance(&self) -> Decimal {
        self.total_paid - self.total_spent
    }
}

/// A registered OAuth client. `id` doubles as the OAuth `client_id`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EchoApp {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub authorized_callback_urls: Vec<String>,
    pub is_archived: bool,
    pub markup_rate: Decimal,
    pub referral_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppMembership {
    pub id: Uuid,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub role: MembershipRole,
    pub status: MembershipStatus,
    pub total_spent: Decimal,
}

/// Device metadata captured when a session is created or refreshed.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AppSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Refresh token row. Only the SHA-256 of the token is persisted.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub session_id: Uuid,
    pub scope: String,
    pub expires_at: DateTime<Utc>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
}

/// API key row (without the hash).
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub key_prefix: String,
    pub name: Option<String>,
    pub user_id: Uuid,
    pub echo_app_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Token claims
// =============================================================================

/// JWT claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject is the user ID.
    pub sub: String,
    /// Audience is the Echo app ID.
    pub aud: String,
    pub user_id: String,
    pub app_id: String,
    pub scope: String,
    pub key_version: u32,
    /// Session that owns the refresh-token chain this token was minted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// JWT claims carried by authorization codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCodeClaims {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub scope: String,
    pub user_id: String,
    /// Random nonce so two codes for identical parameters never collide.
    pub code: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}
