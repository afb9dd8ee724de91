//! # echo_api
//!
//! HTTP API library for the Echo billing gateway.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use echo_core::auth::token::TokenCodec;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{api_keys, health, oauth, proxy, resources, spend_pools, webhooks};
use crate::services::x402::{HttpFacilitator, PaymentFacilitator};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL connection pool.
    pub pool: PgPool,
    /// API configuration.
    pub config: ApiConfig,
    /// Signs and verifies authorization codes and access tokens.
    pub codec: Arc<TokenCodec>,
    /// Outbound client for providers and the X402 facilitator.
    pub http: reqwest::Client,
    /// `None` when X402 is not configured.
    pub facilitator: Option<Arc<dyn PaymentFacilitator>>,
}

impl AppState {
    /// Build state from config, wiring the HTTP facilitator when X402 is enabled.
    pub fn new(pool: PgPool, config: ApiConfig) -> Self {
        let http = reqwest::Client::new();
        let facilitator = config
            .x402
            .facilitator_url
            .as_ref()
            .filter(|_| config.x402.enabled())
            .map(|url| {
                Arc::new(HttpFacilitator::new(http.clone(), url.clone()))
                    as Arc<dyn PaymentFacilitator>
            });
        let codec = Arc::new(TokenCodec::new(
            config.oauth_code_secret.as_bytes(),
            config.access_token_secret.as_bytes(),
            config.tokens.clone(),
        ));
        Self {
            pool,
            config,
            codec,
            http,
            facilitator,
        }
    }

    /// Replace the facilitator (tests plug in a fake).
    pub fn with_facilitator(mut self, facilitator: Arc<dyn PaymentFacilitator>) -> Self {
        self.facilitator = Some(facilitator);
        self
    }
}

/// Run embedded database migrations.
///
/// Delegates to `echo_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    echo_core::migrate::migrate(pool).await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no bearer credential required)
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/oauth/authorize", get(oauth::authorize_handler))
        .route("/oauth/token", post(oauth::token_handler))
        .route("/oauth/revoke", post(oauth::revoke_handler))
        .route("/webhooks/payments", post(webhooks::payment_webhook_handler))
        // Proxy routes authenticate themselves: they also accept X402.
        .route("/chat/completions", post(proxy::chat_completions_handler))
        .route("/messages", post(proxy::messages_handler));

    // Protected routes (JWT access token or API key)
    let protected = Router::new()
        .route("/v1/balance", get(resources::balance_handler))
        .route("/v1/user", get(resources::user_handler))
        .route("/v1/apps/{id}", get(resources::app_handler))
        .route("/v1/transactions", get(resources::transactions_handler))
        .route(
            "/v1/apps/{id}/spend-pools",
            get(spend_pools::list_spend_pools_handler).post(spend_pools::create_spend_pool_handler),
        )
        .route(
            "/v1/api-keys",
            get(api_keys::list_api_keys_handler).post(api_keys::create_api_key_handler),
        )
        .route("/v1/api-keys/{id}", delete(api_keys::revoke_api_key_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_bearer,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
