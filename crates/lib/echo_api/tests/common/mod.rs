//! Shared fixtures for router tests.
//!
//! Database-backed tests use `TEST_DATABASE_URL` or a throwaway cluster
//! started by `DbManager`, and skip when neither is available. Tests that
//! never reach the database run against a lazy pool pointing nowhere.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{Request, Response, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use echo_api::config::ApiConfig;
use echo_api::{AppState, router};
use echo_core::auth::queries::{self, NewEchoApp};
use echo_core::db::DbManager;
use echo_core::migrate::connect_and_migrate;
use echo_core::models::auth::{EchoApp, User};
use echo_core::uuid::uuidv7;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;
use uuid::Uuid;

pub const CALLBACK: &str = "http://localhost:3000/callback";

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

/// A pool that fails fast: for tests that must not need a database.
pub fn unreachable_pool() -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(200))
        .connect_lazy("postgres://echo@127.0.0.1:1/echo")
        .expect("lazy pool")
}

pub fn app(state: AppState) -> Router {
    router(state)
}

pub fn state(pool: PgPool) -> AppState {
    AppState::new(pool, ApiConfig::for_tests())
}

/// Route OpenAI calls to `provider`.
pub fn state_with_provider(pool: PgPool, provider: &FakeProvider) -> AppState {
    let mut config = ApiConfig::for_tests();
    config.providers.openai_base_url = provider.base_url.clone();
    config.providers.openai_api_key = Some("sk-test".into());
    AppState::new(pool, config)
}

/// A local stand-in for the OpenAI chat completions endpoint.
///
/// Replies with the configured status and body. A body without an `id`
/// gets a fresh one per call.
#[derive(Clone)]
pub struct FakeProvider {
    pub base_url: String,
    calls: Arc<AtomicUsize>,
    reply: Arc<Mutex<(StatusCode, Value)>>,
}

impl FakeProvider {
    pub async fn start(status: StatusCode, body: Value) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake provider");
        let addr = listener.local_addr().expect("fake provider addr");
        let fake = Self {
            base_url: format!("http://{addr}/v1"),
            calls: Arc::new(AtomicUsize::new(0)),
            reply: Arc::new(Mutex::new((status, body))),
        };
        let routes = Router::new()
            .route("/v1/chat/completions", post(fake_completion))
            .with_state(fake.clone());
        tokio::spawn(async move {
            axum::serve(listener, routes).await.expect("fake provider");
        });
        fake
    }

    pub fn respond(&self, status: StatusCode, body: Value) {
        *self.reply.lock().expect("reply lock") = (status, body);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn fake_completion(State(fake): State<FakeProvider>) -> (StatusCode, Json<Value>) {
    fake.calls.fetch_add(1, Ordering::SeqCst);
    // Keep concurrent calls in flight together.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (status, mut body) = fake.reply.lock().expect("reply lock").clone();
    if let Some(obj) = body.as_object_mut() {
        obj.entry("id")
            .or_insert_with(|| Value::String(format!("chatcmpl-{}", uuidv7())));
    }
    (status, Json(body))
}

/// OpenAI-shaped completion reporting `prompt` and `completion` tokens.
pub fn completion(prompt: i64, completion: i64) -> Value {
    serde_json::json!({
        "object": "chat.completion",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}}],
        "usage": {"prompt_tokens": prompt, "completion_tokens": completion},
    })
}

/// Count rows of `table` belonging to `user_id`.
pub async fn count_rows(pool: &PgPool, table: &str, user_id: Uuid) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE user_id = $1"))
        .bind(user_id)
        .fetch_one(pool)
        .await
        .expect("count rows")
}

pub async fn send(app: &Router, req: Request<Body>) -> Response<Body> {
    app.clone().oneshot(req).await.expect("request")
}

pub async fn json_body(resp: Response<Body>) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("read body");
    serde_json::from_slice(&bytes).expect("parse JSON")
}

pub fn post_json(uri: &str, body: &Value, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).expect("request")
}

pub fn get(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request")
}

pub fn dec(value: &Value) -> Decimal {
    value
        .as_str()
        .expect("decimal string")
        .parse()
        .expect("decimal")
}

pub async fn seed_user(pool: &PgPool) -> User {
    let id = uuidv7();
    queries::ensure_user(pool, id, &format!("{id}@example.com"), Some("Router Test"))
        .await
        .expect("seed user")
}

pub async fn seed_app(pool: &PgPool, owner: Uuid) -> EchoApp {
    let mut conn = pool.acquire().await.expect("acquire");
    queries::create_app(
        &mut conn,
        owner,
        &NewEchoApp {
            name: "Router App".into(),
            description: Some("integration".into()),
            authorized_callback_urls: vec![CALLBACK.into()],
            markup_rate: "0.25".parse().unwrap(),
            referral_rate: Decimal::ZERO,
        },
    )
    .await
    .expect("seed app")
}
