//! Shared fixtures for database-backed integration tests.
//!
//! `TEST_DATABASE_URL` wins; otherwise a throwaway cluster is started with
//! `DbManager`. When neither works the caller gets `None` and skips.

#![allow(dead_code)]

use echo_core::auth::queries::{self, NewEchoApp};
use echo_core::auth::token::TokenCodec;
use echo_core::billing::payments::{PaymentSuccess, handle_payment_success};
use echo_core::config::TokenSettings;
use echo_core::db::DbManager;
use echo_core::migrate::connect_and_migrate;
use echo_core::models::auth::{EchoApp, User};
use echo_core::uuid::uuidv7;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

pub struct TestDb {
    pub pool: PgPool,
    manager: Option<DbManager>,
}

impl TestDb {
    pub async fn provision() -> Option<Self> {
        if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
            let pool = connect_and_migrate(&url, 10)
                .await
                .expect("connect to TEST_DATABASE_URL");
            return Some(Self { pool, manager: None });
        }

        let mut manager = match DbManager::ephemeral().await {
            Ok(m) => m,
            Err(e) => {
                eprintln!("skipping: no TEST_DATABASE_URL and no local PostgreSQL ({e})");
                return None;
            }
        };
        if let Err(e) = manager.start().await {
            eprintln!("skipping: could not start ephemeral PostgreSQL ({e})");
            return None;
        }
        let pool = manager.migrated_pool().await.expect("migrate ephemeral db");
        Some(Self {
            pool,
            manager: Some(manager),
        })
    }

    pub async fn teardown(mut self) {
        self.pool.close().await;
        if let Some(manager) = self.manager.as_mut() {
            manager.stop().await.expect("db stop");
        }
    }
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

pub fn codec(settings: TokenSettings) -> TokenCodec {
    TokenCodec::new(b"test-code-secret", b"test-access-secret", settings)
}

pub async fn seed_user(pool: &PgPool) -> User {
    let id = uuidv7();
    queries::ensure_user(pool, id, &format!("{id}@example.com"), Some("Test User"))
        .await
        .expect("seed user")
}

pub async fn seed_app(pool: &PgPool, owner: Uuid, markup: &str, referral: &str) -> EchoApp {
    let mut conn = pool.acquire().await.expect("acquire");
    queries::create_app(
        &mut conn,
        owner,
        &NewEchoApp {
            name: "Test App".into(),
            description: None,
            authorized_callback_urls: vec!["http://localhost:3000/callback".into()],
            markup_rate: dec(markup),
            referral_rate: dec(referral),
        },
    )
    .await
    .expect("seed app")
}

/// Credit a user's personal balance through the payment path.
pub async fn fund_user(pool: &PgPool, user_id: Uuid, cents: i64) {
    handle_payment_success(
        pool,
        &PaymentSuccess {
            user_id,
            amount_cents: cents,
            currency: "usd".into(),
            payment_id: format!("pay_{}", uuidv7()),
            metadata: serde_json::json!({}),
            echo_app_id: None,
            spend_pool_id: None,
        },
    )
    .await
    .expect("fund user");
}

pub async fn balance(pool: &PgPool, user_id: Uuid) -> Decimal {
    queries::find_user(pool, user_id)
        .await
        .expect("find user")
        .expect("user exists")
        .balance()
}
