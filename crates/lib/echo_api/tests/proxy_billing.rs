//! Account-billed proxy calls end to end, against a real PostgreSQL and a
//! local fake provider.

mod common;

use axum::Router;
use axum::http::StatusCode;
use echo_core::auth::api_keys::create_api_key;
use echo_core::models::auth::User;
use echo_core::uuid::uuidv7;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use uuid::Uuid;

use common::{
    FakeProvider, TestDb, app, completion, count_rows, dec, get, json_body, post_json, seed_app,
    seed_user, send, state_with_provider,
};

const WEBHOOK_SECRET: &str = "test-webhook-secret";

async fn fund(router: &Router, user_id: Uuid, cents: i64) {
    let payment = json!({
        "payment_id": format!("pay_{}", uuidv7()),
        "user_id": user_id,
        "amount": cents,
        "currency": "usd",
        "status": "completed",
    });
    let resp = send(
        router,
        post_json("/webhooks/payments", &payment, &[("x-webhook-secret", WEBHOOK_SECRET)]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

async fn total_spent(router: &Router, key: &str) -> Decimal {
    let resp = send(router, get("/v1/balance", &[("x-api-key", key)])).await;
    assert_eq!(resp.status(), StatusCode::OK);
    dec(&json_body(resp).await["total_spent"])
}

fn chat(max_tokens: i64) -> Value {
    json!({
        "model": "gpt-4o",
        "max_tokens": max_tokens,
        "messages": [{"role": "user", "content": "ping"}],
    })
}

struct Fixture {
    db: TestDb,
    router: Router,
    provider: FakeProvider,
    user: User,
    key: String,
    key_id: Uuid,
}

async fn fixture(reply: Value, cents: i64) -> Option<Fixture> {
    let db = TestDb::provision().await?;
    let provider = FakeProvider::start(StatusCode::OK, reply).await;
    let router = app(state_with_provider(db.pool.clone(), &provider));
    let user = seed_user(&db.pool).await;
    // Markup 0.25.
    let echo_app = seed_app(&db.pool, user.id).await;
    let (key, record) = create_api_key(&db.pool, "test-salt", user.id, echo_app.id, None)
        .await
        .expect("key");
    fund(&router, user.id, cents).await;
    Some(Fixture {
        db,
        router,
        provider,
        user,
        key,
        key_id: record.id,
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_cannot_overdraw() {
    // Each call reserves about 0.60 of a 1.00 balance.
    let Some(f) = fixture(completion(10, 48_000), 100).await else {
        return;
    };
    let request =
        || post_json("/chat/completions", &chat(48_000), &[("x-api-key", f.key.as_str())]);

    let (a, b) = tokio::join!(send(&f.router, request()), send(&f.router, request()));
    let mut statuses = [a.status(), b.status()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::PAYMENT_REQUIRED]);
    assert_eq!(f.provider.calls(), 1);

    // (10 * 2.50 + 48000 * 10.00) / 1M, plus 25%.
    assert_eq!(total_spent(&f.router, &f.key).await, Decimal::new(60_003_125, 8));
    assert_eq!(count_rows(&f.db.pool, "transactions", f.user.id).await, 1);
    assert_eq!(count_rows(&f.db.pool, "unbilled_usage", f.user.id).await, 0);
    assert_eq!(count_rows(&f.db.pool, "balance_holds", f.user.id).await, 0);

    f.db.teardown().await;
}

#[tokio::test]
async fn completed_call_is_billed_to_its_api_key() {
    let Some(f) = fixture(completion(1_000, 500), 500).await else {
        return;
    };

    let resp = send(
        &f.router,
        post_json("/chat/completions", &chat(500), &[("x-api-key", f.key.as_str())]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["choices"][0]["message"]["content"], "pong");
    let invocation_id = body["id"].as_str().expect("provider id").to_string();

    let (api_key_id, provider_id, total_cost): (Option<Uuid>, String, Decimal) = sqlx::query_as(
        "SELECT api_key_id, provider_transaction_id, total_cost FROM transactions \
         WHERE user_id = $1",
    )
    .bind(f.user.id)
    .fetch_one(&f.db.pool)
    .await
    .expect("transaction row");
    assert_eq!(api_key_id, Some(f.key_id));
    assert_eq!(provider_id, invocation_id);
    // (1000 * 2.50 + 500 * 10.00) / 1M is 0.0075, plus 25%.
    assert_eq!(total_cost, Decimal::new(9_375, 6));
    assert_eq!(total_spent(&f.router, &f.key).await, total_cost);
    assert_eq!(count_rows(&f.db.pool, "balance_holds", f.user.id).await, 0);

    f.db.teardown().await;
}

#[tokio::test]
async fn reply_without_usage_is_parked() {
    let reply = json!({"id": "chatcmpl-no-usage", "choices": []});
    let Some(f) = fixture(reply, 500).await else {
        return;
    };

    let resp = send(
        &f.router,
        post_json("/chat/completions", &chat(64), &[("x-api-key", f.key.as_str())]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(total_spent(&f.router, &f.key).await, Decimal::ZERO);
    assert_eq!(count_rows(&f.db.pool, "transactions", f.user.id).await, 0);
    let parked: String = sqlx::query_scalar(
        "SELECT provider_transaction_id FROM unbilled_usage WHERE user_id = $1",
    )
    .bind(f.user.id)
    .fetch_one(&f.db.pool)
    .await
    .expect("parked usage");
    assert_eq!(parked, "chatcmpl-no-usage");
    assert_eq!(count_rows(&f.db.pool, "balance_holds", f.user.id).await, 0);

    f.db.teardown().await;
}

#[tokio::test]
async fn replayed_provider_id_is_billed_once() {
    let mut reply = completion(1_000, 500);
    reply["id"] = json!(format!("chatcmpl-{}", uuidv7()));
    let Some(f) = fixture(reply, 500).await else {
        return;
    };

    for _ in 0..2 {
        let resp = send(
            &f.router,
            post_json("/chat/completions", &chat(500), &[("x-api-key", f.key.as_str())]),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert_eq!(f.provider.calls(), 2);
    assert_eq!(count_rows(&f.db.pool, "transactions", f.user.id).await, 1);
    assert_eq!(total_spent(&f.router, &f.key).await, Decimal::new(9_375, 6));
    assert_eq!(count_rows(&f.db.pool, "balance_holds", f.user.id).await, 0);

    f.db.teardown().await;
}

#[tokio::test]
async fn provider_errors_pass_through_unbilled() {
    let Some(f) = fixture(completion(1_000, 500), 500).await else {
        return;
    };
    f.provider.respond(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "slow down", "type": "rate_limit"}}),
    );

    let resp = send(
        &f.router,
        post_json("/chat/completions", &chat(500), &[("x-api-key", f.key.as_str())]),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json_body(resp).await["error"]["type"], "rate_limit");

    assert_eq!(total_spent(&f.router, &f.key).await, Decimal::ZERO);
    assert_eq!(count_rows(&f.db.pool, "transactions", f.user.id).await, 0);
    assert_eq!(count_rows(&f.db.pool, "balance_holds", f.user.id).await, 0);

    f.db.teardown().await;
}
