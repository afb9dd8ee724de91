//! API server configuration.

use std::str::FromStr;

use echo_core::auth::secret::resolve_secret;
use echo_core::config::{BillingSettings, TokenSettings};

/// A configuration the server refuses to start with.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptySecret(&'static str),

    #[error("OAUTH_CODE_SECRET and ACCESS_TOKEN_SECRET must differ")]
    SharedSigningSecret,
}

/// Upstream provider endpoints and credentials.
#[derive(Clone, Debug)]
pub struct ProviderEndpoints {
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub anthropic_api_key: Option<String>,
}

/// X402 pay-per-call settings. Disabled when no facilitator is configured.
#[derive(Clone, Debug)]
pub struct X402Settings {
    pub facilitator_url: Option<String>,
    /// Address that receives settled payments.
    pub pay_to: Option<String>,
    pub network: String,
    pub realm: String,
    /// Where a client can learn how to pay.
    pub link: String,
}

impl X402Settings {
    pub fn enabled(&self) -> bool {
        self.facilitator_url.is_some() && self.pay_to.is_some()
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Address to bind the HTTP listener (e.g. "127.0.0.1:3100").
    pub bind_addr: String,
    /// PostgreSQL connection URL.
    pub pg_connection_url: String,
    /// Signs authorization codes.
    pub oauth_code_secret: String,
    /// Signs access tokens.
    pub access_token_secret: String,
    /// Verifies the dashboard's `echo_session` tokens.
    pub dashboard_session_secret: String,
    /// Salt for API-key digests.
    pub api_key_salt: String,
    /// Shared secret expected in `x-webhook-secret`. Webhooks are refused when unset.
    pub payment_webhook_secret: Option<String>,
    pub tokens: TokenSettings,
    pub billing: BillingSettings,
    pub providers: ProviderEndpoints,
    pub x402: X402Settings,
}

impl ApiConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                   | Default                                |
    /// |----------------------------|----------------------------------------|
    /// | `BIND_ADDR`                | `127.0.0.1:3100`                       |
    /// | `DATABASE_URL`             | `postgres://localhost:5432/echo`       |
    /// | `OAUTH_CODE_SECRET`        | generated & persisted to file          |
    /// | `ACCESS_TOKEN_SECRET`      | generated & persisted to file          |
    /// | `DASHBOARD_SESSION_SECRET` | generated & persisted to file          |
    /// | `API_KEY_SALT`             | generated & persisted to file          |
    /// | `PAYMENT_WEBHOOK_SECRET`   | unset (webhook disabled)               |
    /// | `ACCESS_TOKEN_TTL_SECS`    | `900`                                  |
    /// | `AUTH_CODE_TTL_SECS`       | `300`                                  |
    /// | `REFRESH_TOKEN_TTL_SECS`   | `2592000` (30 days)                    |
    /// | `REFRESH_GRACE_PERIOD_MS`  | `60000`                                |
    /// | `ACCESS_TOKEN_KEY_VERSION` | `1`                                    |
    /// | `PREFLIGHT_MAX_TOKENS`     | `4096`                                 |
    /// | `OPENAI_BASE_URL`          | `https://api.openai.com/v1`            |
    /// | `OPENAI_API_KEY`           | unset                                  |
    /// | `ANTHROPIC_BASE_URL`       | `https://api.anthropic.com/v1`         |
    /// | `ANTHROPIC_API_KEY`        | unset                                  |
    /// | `X402_FACILITATOR_URL`     | unset (X402 disabled)                  |
    /// | `X402_PAY_TO`              | unset                                  |
    /// | `X402_NETWORK`             | `base`                                 |
    pub fn from_env() -> Self {
        let token_defaults = TokenSettings::default();
        let billing_defaults = BillingSettings::default();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3100".into()),
            pg_connection_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/echo".into()),
            oauth_code_secret: resolve_secret(&["OAUTH_CODE_SECRET"], "oauth_code_secret"),
            access_token_secret: resolve_secret(
                &["ACCESS_TOKEN_SECRET", "JWT_SECRET"],
                "access_token_secret",
            ),
            dashboard_session_secret: resolve_secret(
                &["DASHBOARD_SESSION_SECRET", "AUTH_SECRET"],
                "dashboard_session_secret",
            ),
            api_key_salt: resolve_secret(&["API_KEY_SALT"], "api_key_salt"),
            payment_webhook_secret: non_empty_var("PAYMENT_WEBHOOK_SECRET"),
            tokens: TokenSettings {
                access_token_ttl_secs: parsed_var(
                    "ACCESS_TOKEN_TTL_SECS",
                    token_defaults.access_token_ttl_secs,
                ),
                auth_code_ttl_secs: parsed_var("AUTH_CODE_TTL_SECS", token_defaults.auth_code_ttl_secs),
                refresh_token_ttl_secs: parsed_var(
                    "REFRESH_TOKEN_TTL_SECS",
                    token_defaults.refresh_token_ttl_secs,
                ),
                refresh_grace_period_ms: parsed_var(
                    "REFRESH_GRACE_PERIOD_MS",
                    token_defaults.refresh_grace_period_ms,
                ),
                key_version: parsed_var("ACCESS_TOKEN_KEY_VERSION", token_defaults.key_version),
            },
            billing: BillingSettings {
                preflight_max_tokens: parsed_var(
                    "PREFLIGHT_MAX_TOKENS",
                    billing_defaults.preflight_max_tokens,
                ),
                ..billing_defaults
            },
            providers: ProviderEndpoints {
                openai_base_url: std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
                openai_api_key: non_empty_var("OPENAI_API_KEY"),
                anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL")
                    .unwrap_or_else(|_| "https://api.anthropic.com/v1".into()),
                anthropic_api_key: non_empty_var("ANTHROPIC_API_KEY"),
            },
            x402: X402Settings {
                facilitator_url: non_empty_var("X402_FACILITATOR_URL"),
                pay_to: non_empty_var("X402_PAY_TO"),
                network: std::env::var("X402_NETWORK").unwrap_or_else(|_| "base".into()),
                realm: "echo".into(),
                link: std::env::var("X402_LINK")
                    .unwrap_or_else(|_| "https://x402.org".into()),
            },
        }
    }

    /// Authorization codes and access tokens must be signed with different,
    /// non-empty keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let signing = [
            ("OAUTH_CODE_SECRET", &self.oauth_code_secret),
            ("ACCESS_TOKEN_SECRET", &self.access_token_secret),
        ];
        if let Some((name, _)) = signing.into_iter().find(|(_, secret)| secret.is_empty()) {
            return Err(ConfigError::EmptySecret(name));
        }
        if self.oauth_code_secret == self.access_token_secret {
            return Err(ConfigError::SharedSigningSecret);
        }
        Ok(())
    }

    /// Fixed configuration for tests; never touches the environment or disk.
    pub fn for_tests() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            pg_connection_url: String::new(),
            oauth_code_secret: "test-code-secret".into(),
            access_token_secret: "test-access-secret".into(),
            dashboard_session_secret: "test-dashboard-secret".into(),
            api_key_salt: "test-salt".into(),
            payment_webhook_secret: Some("test-webhook-secret".into()),
            tokens: TokenSettings::default(),
            billing: BillingSettings::default(),
            providers: ProviderEndpoints {
                openai_base_url: "http://127.0.0.1:9/v1".into(),
                openai_api_key: None,
                anthropic_base_url: "http://127.0.0.1:9/v1".into(),
                anthropic_api_key: None,
            },
            x402: X402Settings {
                facilitator_url: None,
                pay_to: None,
                network: "base-sepolia".into(),
                realm: "echo".into(),
                link: "https://x402.org".into(),
            },
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(parsed_var("ECHO_TEST_UNSET_VARIABLE", 42_i64), 42);
    }

    #[test]
    fn signing_secrets_must_differ() {
        let mut cfg = ApiConfig::for_tests();
        assert_eq!(cfg.validate(), Ok(()));

        cfg.access_token_secret = cfg.oauth_code_secret.clone();
        assert_eq!(cfg.validate(), Err(ConfigError::SharedSigningSecret));

        cfg.oauth_code_secret = String::new();
        assert_eq!(cfg.validate(), Err(ConfigError::EmptySecret("OAUTH_CODE_SECRET")));
    }

    #[test]
    fn x402_needs_facilitator_and_payee() {
        let mut cfg = ApiConfig::for_tests().x402;
        assert!(!cfg.enabled());
        cfg.facilitator_url = Some("http://facilitator".into());
        assert!(!cfg.enabled());
        cfg.pay_to = Some("0xabc".into());
        assert!(cfg.enabled());
    }
}
