//! Request and response bodies.
//!
//! Field names are snake_case to match RFC 6749 on the OAuth endpoints; the
//! resource endpoints follow suit. Money is serialized as decimal strings.

use chrono::{DateTime, Utc};
use echo_core::models::auth::{ApiKeyRecord, EchoApp, MembershipRole, User};
use echo_core::models::billing::SpendPool;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: String,
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeQuery {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
}

/// `POST /oauth/token` body, accepted as form or JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub code_verifier: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUser {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
}

impl From<&User> for TokenUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            email: u.email.clone(),
            name: u.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenApp {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

impl From<&EchoApp> for TokenApp {
    fn from(a: &EchoApp) -> Self {
        Self {
            id: a.id,
            name: a.name.clone(),
            description: a.description.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_token_expires_in: i64,
    pub scope: String,
    pub user: TokenUser,
    pub echo_app: TokenApp,
}

/// `POST /oauth/revoke` body (RFC 7009 names the field `token`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevokeRequest {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendPoolBalance {
    pub id: Uuid,
    pub balance: Decimal,
    /// What this user may still draw; `None` when the pool has no per-user cap.
    pub user_remaining: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub total_paid: Decimal,
    pub total_spent: Decimal,
    pub balance: Decimal,
    pub spend_pools: Vec<SpendPoolBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub echo_app_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub markup_rate: Decimal,
    pub role: Option<MembershipRole>,
    pub total_spent: Decimal,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateApiKeyResponse {
    pub id: Uuid,
    /// Plaintext key. Returned once and never again.
    pub key: String,
    pub key_prefix: String,
    pub name: Option<String>,
    pub echo_app_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySummary {
    pub id: Uuid,
    pub key_prefix: String,
    pub name: Option<String>,
    pub echo_app_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKeyRecord> for ApiKeySummary {
    fn from(k: ApiKeyRecord) -> Self {
        Self {
            id: k.id,
            key_prefix: k.key_prefix,
            name: k.name,
            echo_app_id: k.echo_app_id,
            is_active: k.is_active,
            created_at: k.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSpendPoolRequest {
    /// Omit for the app's default pool.
    pub name: Option<String>,
    pub per_user_spend_limit: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendPoolResponse {
    pub id: Uuid,
    pub echo_app_id: Uuid,
    pub name: String,
    pub total_paid: Decimal,
    pub total_spent: Decimal,
    pub per_user_spend_limit: Option<Decimal>,
}

impl From<SpendPool> for SpendPoolResponse {
    fn from(p: SpendPool) -> Self {
        Self {
            id: p.id,
            echo_app_id: p.echo_app_id,
            name: p.name,
            total_paid: p.total_paid,
            total_spent: p.total_spent,
            per_user_spend_limit: p.per_user_spend_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Webhooks / health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentWebhook {
    pub payment_id: String,
    pub user_id: Uuid,
    /// Minor units (cents).
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub echo_app_id: Option<Uuid>,
    pub spend_pool_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentWebhookResponse {
    pub payment_id: String,
    pub status: String,
    /// False when this delivery was a replay of an already-credited payment.
    pub credited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub db_connected: bool,
}
