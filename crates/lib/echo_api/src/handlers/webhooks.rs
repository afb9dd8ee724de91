//! Payment provider webhook.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use echo_core::billing::payments::{self, PaymentOutcome, PaymentSuccess};
use serde_json::Value;
use tracing::{info, warn};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::models::{PaymentWebhook, PaymentWebhookResponse};

/// Header carrying the shared webhook secret.
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";

/// `POST /webhooks/payments`: record a checkout and credit it on completion.
///
/// Redeliveries of a completed `payment_id` return `credited: false`.
pub async fn payment_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PaymentWebhook>,
) -> AppResult<Json<PaymentWebhookResponse>> {
    verify_secret(&headers, state.config.payment_webhook_secret.as_deref())?;

    let event = PaymentSuccess {
        user_id: body.user_id,
        amount_cents: body.amount,
        currency: body.currency,
        payment_id: body.payment_id,
        metadata: match body.metadata {
            Value::Null => Value::Object(Default::default()),
            other => other,
        },
        echo_app_id: body.echo_app_id,
        spend_pool_id: body.spend_pool_id,
    };

    match body.status.as_str() {
        "completed" | "succeeded" => {
            let outcome = payments::handle_payment_success(&state.pool, &event).await?;
            let credited = matches!(outcome, PaymentOutcome::Credited(_));
            Ok(Json(PaymentWebhookResponse {
                payment_id: outcome.payment().payment_id.clone(),
                status: "completed".into(),
                credited,
            }))
        }
        "pending" => {
            let payment = payments::record_pending_payment(&state.pool, &event).await?;
            info!(payment_id = %payment.payment_id, "payment pending");
            Ok(Json(PaymentWebhookResponse {
                payment_id: payment.payment_id,
                status: "pending".into(),
                credited: false,
            }))
        }
        other => Err(AppError::Validation(format!(
            "Unsupported payment status '{other}'"
        ))),
    }
}

fn verify_secret(headers: &HeaderMap, expected: Option<&str>) -> AppResult<()> {
    let Some(expected) = expected else {
        warn!("payment webhook received but PAYMENT_WEBHOOK_SECRET is unset");
        return Err(AppError::Unauthorized("Webhook is not configured".into()));
    };
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::Unauthorized("Invalid webhook secret".into()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn secret_must_match_exactly() {
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static("s3cret"));
        assert!(verify_secret(&headers, Some("s3cret")).is_ok());
        assert!(verify_secret(&headers, Some("s3cret!")).is_err());
        assert!(verify_secret(&HeaderMap::new(), Some("s3cret")).is_err());
    }

    #[test]
    fn unset_secret_refuses_everything() {
        let mut headers = HeaderMap::new();
        headers.insert(WEBHOOK_SECRET_HEADER, HeaderValue::from_static(""));
        assert!(matches!(
            verify_secret(&headers, None),
            Err(AppError::Unauthorized(_))
        ));
    }
}
