//! Tunables for token issuance and billing.
//!
//! These are plain values resolved once at startup (see
//! `echo_api::config::ApiConfig::from_env`) and passed into the services;
//! nothing here is read from the environment lazily.

use chrono::Duration;
use rust_decimal::Decimal;

/// Access token lifetime: 15 minutes.
pub const DEFAULT_ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Authorization code lifetime: 5 minutes.
pub const DEFAULT_AUTH_CODE_TTL_SECS: i64 = 5 * 60;

/// Refresh token lifetime: 30 days.
pub const DEFAULT_REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

/// Window after archival during which a refresh token may be replayed.
pub const DEFAULT_REFRESH_GRACE_PERIOD_MS: i64 = 60_000;

/// Output tokens assumed by the pre-flight estimate when the request omits `max_tokens`.
pub const DEFAULT_PREFLIGHT_MAX_TOKENS: i64 = 4096;

/// Lifetimes and rotation policy for OAuth credentials.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub access_token_ttl_secs: i64,
    pub auth_code_ttl_secs: i64,
    pub refresh_token_ttl_secs: i64,
    pub refresh_grace_period_ms: i64,
    /// Embedded in every access token; tokens minted under another version are rejected.
    pub key_version: u32,
}

impl TokenSettings {
    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::seconds(self.refresh_token_ttl_secs)
    }

    pub fn refresh_grace_period(&self) -> Duration {
        Duration::milliseconds(self.refresh_grace_period_ms)
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: DEFAULT_ACCESS_TOKEN_TTL_SECS,
            auth_code_ttl_secs: DEFAULT_AUTH_CODE_TTL_SECS,
            refresh_token_ttl_secs: DEFAULT_REFRESH_TOKEN_TTL_SECS,
            refresh_grace_period_ms: DEFAULT_REFRESH_GRACE_PERIOD_MS,
            key_version: 1,
        }
    }
}

/// Ledger-wide billing policy. Per-app markup and referral rates live on the app row.
#[derive(Debug, Clone)]
pub struct BillingSettings {
    pub preflight_max_tokens: i64,
    /// Smallest balance a caller must hold before any provider call, regardless of estimate.
    pub minimum_balance: Decimal,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            preflight_max_tokens: DEFAULT_PREFLIGHT_MAX_TOKENS,
            minimum_balance: Decimal::ZERO,
        }
    }
}
