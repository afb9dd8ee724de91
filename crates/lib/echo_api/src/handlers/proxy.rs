//! Metered LLM proxy: `POST /chat/completions` (OpenAI) and `POST /messages` (Anthropic).
//!
//! Account callers reserve the projected cost against their balance before
//! the provider is called. The reservation is replaced by a debit of the
//! provider's reported usage afterwards, or released if nothing is billed.
//! Callers without an account pay per call through X402.
//!
//! The provider call and its accounting run on a spawned task, so a client
//! that disconnects mid-call does not cancel the debit.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use echo_core::billing::ledger::{self, CompletedInvocation};
use echo_core::billing::pricing::{self, ModelPricing, Provider};
use echo_core::uuid::uuidv7;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::{Credential, Principal, authenticate};
use crate::services::upstream::{self, UpstreamReply};
use crate::services::x402::{self, PaymentFacilitator, PaymentRequirements, X402Error};

/// Response header carrying the X402 settlement receipt.
const PAYMENT_RESPONSE_HEADER: &str = "x-payment-response";

/// Rough characters-per-token ratio for pre-flight input estimates.
const CHARS_PER_TOKEN: i64 = 4;

/// `POST /chat/completions`
pub async fn chat_completions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    proxy(state, Provider::OpenAi, "/chat/completions", headers, body).await
}

/// `POST /messages`
pub async fn messages_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<Response> {
    proxy(state, Provider::Anthropic, "/messages", headers, body).await
}

/// A validated request, priced before it is sent.
#[derive(Debug, Clone)]
struct PlannedCall {
    provider: Provider,
    model: String,
    pricing: ModelPricing,
    estimated_raw_cost: Decimal,
}

impl PlannedCall {
    fn from_body(body: &Value, provider: Provider, default_max_tokens: i64) -> AppResult<Self> {
        if !body.is_object() {
            return Err(AppError::Validation("Request body must be a JSON object".into()));
        }
        if body.get("stream").and_then(Value::as_bool) == Some(true) {
            return Err(AppError::Validation(
                "Streaming is not supported; usage is billed from the complete response".into(),
            ));
        }
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| AppError::Validation("model is required".into()))?;

        let pricing = pricing::require(model)?;
        if pricing.provider != provider {
            return Err(AppError::Validation(format!(
                "Model '{model}' is not served by the {provider} endpoint"
            )));
        }

        let input_tokens = estimate_input_tokens(body);
        let max_output = body
            .get("max_tokens")
            .or_else(|| body.get("max_completion_tokens"))
            .and_then(Value::as_i64)
            .unwrap_or(default_max_tokens)
            .max(0);

        Ok(Self {
            provider,
            model: model.to_string(),
            estimated_raw_cost: pricing::estimate(&pricing, input_tokens, max_output),
            pricing,
        })
    }

    fn invocation(&self, reply: &UpstreamReply, user_id: Uuid, echo_app_id: Uuid) -> CompletedInvocation {
        let invocation_id = reply
            .response_id()
            .map(str::to_string)
            .unwrap_or_else(|| uuidv7().to_string());
        let (input_tokens, output_tokens, raw_cost) = match reply.usage(self.provider) {
            Some(u) => (
                u.input_tokens,
                u.output_tokens,
                self.pricing.cost(u.input_tokens, u.output_tokens),
            ),
            // Unknown usage: park the estimate for reconciliation.
            None => (0, 0, self.estimated_raw_cost),
        };
        CompletedInvocation {
            invocation_id,
            user_id,
            echo_app_id,
            api_key_id: None,
            hold_id: None,
            provider: self.provider.as_str().to_string(),
            model: self.model.clone(),
            input_tokens,
            output_tokens,
            tool_cost: Decimal::ZERO,
            raw_cost,
        }
    }
}

/// Serialized request size over four, rounded up.
fn estimate_input_tokens(body: &Value) -> i64 {
    let chars = i64::try_from(body.to_string().len()).unwrap_or(i64::MAX);
    chars.saturating_add(CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

async fn proxy(
    state: AppState,
    provider: Provider,
    resource: &'static str,
    headers: HeaderMap,
    body: Value,
) -> AppResult<Response> {
    let call = PlannedCall::from_body(&body, provider, state.config.billing.preflight_max_tokens)?;

    match Credential::from_headers(&headers) {
        None => {
            let accepts =
                x402::requirements_for(&state.config.x402, resource, call.estimated_raw_cost);
            Ok(x402::payment_required(
                &state.config.x402,
                accepts,
                "An API key, access token, or X402 payment is required",
            ))
        }
        Some(Credential::X402(payment)) => {
            proxy_x402(state, call, resource, payment, headers, body).await
        }
        Some(credential) => {
            let principal = authenticate(&state, &credential).await?;
            proxy_account(state, call, principal, headers, body).await
        }
    }
}

async fn proxy_account(
    state: AppState,
    call: PlannedCall,
    principal: Principal,
    headers: HeaderMap,
    body: Value,
) -> AppResult<Response> {
    let hold = ledger::preflight(
        &state.pool,
        principal.user_id,
        principal.echo_app_id,
        call.estimated_raw_cost,
        state.config.billing.minimum_balance,
    )
    .await?;
    debug!(
        user_id = %principal.user_id,
        echo_app_id = %principal.echo_app_id,
        model = %call.model,
        estimate = %call.estimated_raw_cost,
        hold_id = %hold.id,
        funding = ?hold.funding,
        "pre-flight passed"
    );

    let task = tokio::spawn(call_and_bill(state, call, principal, hold.id, headers, body));
    let reply = task
        .await
        .map_err(|e| AppError::Internal(format!("proxy task failed: {e}")))??;
    Ok(reply_response(reply))
}

async fn call_and_bill(
    state: AppState,
    call: PlannedCall,
    principal: Principal,
    hold_id: Uuid,
    headers: HeaderMap,
    body: Value,
) -> AppResult<UpstreamReply> {
    let reply = match upstream::forward(
        &state.http,
        &state.config.providers,
        call.provider,
        &headers,
        &body,
    )
    .await
    {
        Ok(reply) => reply,
        Err(e) => {
            release_hold(&state, hold_id).await;
            return Err(e);
        }
    };
    if reply.is_success() {
        bill(&state, &call, &principal, hold_id, &reply).await;
    } else {
        warn!(status = reply.status, model = %call.model, "provider call failed; not billed");
        release_hold(&state, hold_id).await;
    }
    Ok(reply)
}

async fn bill(
    state: &AppState,
    call: &PlannedCall,
    principal: &Principal,
    hold_id: Uuid,
    reply: &UpstreamReply,
) {
    let inv = CompletedInvocation {
        api_key_id: principal.api_key_id,
        hold_id: Some(hold_id),
        ..call.invocation(reply, principal.user_id, principal.echo_app_id)
    };

    if reply.usage(call.provider).is_none() {
        if let Err(e) =
            ledger::record_unbilled_usage(&state.pool, &inv, "provider response carried no usage")
                .await
        {
            error!(invocation_id = %inv.invocation_id, error = %e, "failed to park unbilled usage");
        }
        release_hold(state, hold_id).await;
        return;
    }

    match ledger::settle_invocation(&state.pool, &inv).await {
        Ok(outcome) if outcome.is_duplicate() => {
            info!(invocation_id = %inv.invocation_id, "invocation already billed");
        }
        Ok(_) => {}
        // Already parked by `settle_invocation`; the caller still gets the reply.
        Err(e) => error!(invocation_id = %inv.invocation_id, error = %e, "billing failed"),
    }
}

/// Drop a hold for a call that will not be billed. An unreleased hold
/// expires on its own, so failures are only logged.
async fn release_hold(state: &AppState, hold_id: Uuid) {
    if let Err(e) = ledger::release_hold(&state.pool, hold_id).await {
        error!(%hold_id, error = %e, "failed to release balance hold");
    }
}

async fn proxy_x402(
    state: AppState,
    call: PlannedCall,
    resource: &'static str,
    payment: String,
    headers: HeaderMap,
    body: Value,
) -> AppResult<Response> {
    let settings = &state.config.x402;
    let (Some(facilitator), Some(requirements)) = (
        state.facilitator.clone(),
        x402::requirements_for(settings, resource, call.estimated_raw_cost),
    ) else {
        return Err(AppError::Unauthorized(
            "X402 payments are not accepted by this gateway".into(),
        ));
    };

    match facilitator.verify(&payment, &requirements).await {
        Ok(verified) => debug!(payer = ?verified.payer, model = %call.model, "x402 payment verified"),
        Err(X402Error::Invalid(reason)) => {
            return Ok(x402::payment_required(settings, Some(requirements), &reason));
        }
        Err(e @ X402Error::Facilitator(_)) => return Err(AppError::Upstream(e.to_string())),
    }

    let task = tokio::spawn(call_and_settle(
        state,
        call,
        facilitator,
        payment,
        requirements,
        headers,
        body,
    ));
    task.await
        .map_err(|e| AppError::Internal(format!("proxy task failed: {e}")))?
}

async fn call_and_settle(
    state: AppState,
    call: PlannedCall,
    facilitator: Arc<dyn PaymentFacilitator>,
    payment: String,
    requirements: PaymentRequirements,
    headers: HeaderMap,
    body: Value,
) -> AppResult<Response> {
    let reply =
        upstream::forward(&state.http, &state.config.providers, call.provider, &headers, &body)
            .await?;
    if !reply.is_success() {
        warn!(status = reply.status, "provider call failed; x402 payment not settled");
        return Ok(reply_response(reply));
    }

    let settlement = facilitator.settle(&payment, &requirements).await.map_err(|e| {
        error!(error = %e, model = %call.model, "x402 settlement failed after provider call");
        AppError::PaymentRequired("Payment could not be settled".into())
    })?;

    let inv = call.invocation(&reply, Uuid::nil(), Uuid::nil());
    let settled_amount = settled_amount(&requirements);
    match ledger::record_x402_settlement(
        &state.pool,
        &settlement.transaction,
        &settlement.network,
        &inv,
        settled_amount,
    )
    .await
    {
        Ok(true) => info!(transaction = %settlement.transaction, %settled_amount, "x402 call settled"),
        Ok(false) => info!(transaction = %settlement.transaction, "x402 settlement already recorded"),
        Err(e) => error!(transaction = %settlement.transaction, error = %e, "failed to record x402 settlement"),
    }

    let mut response = reply_response(reply);
    let receipt = json!({
        "success": true,
        "transaction": settlement.transaction,
        "network": settlement.network,
    });
    if let Ok(value) = HeaderValue::from_str(&STANDARD.encode(receipt.to_string())) {
        response.headers_mut().insert(PAYMENT_RESPONSE_HEADER, value);
    }
    Ok(response)
}

fn settled_amount(requirements: &PaymentRequirements) -> Decimal {
    requirements
        .max_amount_required
        .parse::<u64>()
        .map(x402::atomic_to_usd)
        .unwrap_or(Decimal::ZERO)
}

/// Pass the provider's status and body through unchanged.
fn reply_response(reply: UpstreamReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(reply.body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_a_priced_call() {
        let body = json!({
            "model": "gpt-4o-mini",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}],
        });
        let call = PlannedCall::from_body(&body, Provider::OpenAi, 4096).unwrap();
        assert_eq!(call.model, "gpt-4o-mini");
        let input = estimate_input_tokens(&body);
        assert_eq!(call.estimated_raw_cost, call.pricing.cost(input, 100));
    }

    #[test]
    fn default_output_ceiling_applies() {
        let body = json!({"model": "claude-3-5-haiku-latest", "messages": []});
        let call = PlannedCall::from_body(&body, Provider::Anthropic, 1000).unwrap();
        let input = estimate_input_tokens(&body);
        assert_eq!(call.estimated_raw_cost, call.pricing.cost(input, 1000));
    }

    #[test]
    fn rejects_streaming_unknown_and_mismatched_models() {
        let stream = json!({"model": "gpt-4o", "stream": true});
        assert!(matches!(
            PlannedCall::from_body(&stream, Provider::OpenAi, 10),
            Err(AppError::Validation(_))
        ));

        let unknown = json!({"model": "mystery-1"});
        assert!(PlannedCall::from_body(&unknown, Provider::OpenAi, 10).is_err());

        let wrong_endpoint = json!({"model": "claude-opus-4-20250514"});
        assert!(PlannedCall::from_body(&wrong_endpoint, Provider::OpenAi, 10).is_err());

        assert!(PlannedCall::from_body(&json!({}), Provider::OpenAi, 10).is_err());
        assert!(PlannedCall::from_body(&json!([1, 2]), Provider::OpenAi, 10).is_err());
    }

    #[test]
    fn input_estimate_rounds_up() {
        // `{"a":1}` is 7 characters.
        assert_eq!(estimate_input_tokens(&json!({"a": 1})), 2);
    }

    #[test]
    fn invocation_uses_provider_id_and_usage() {
        let call = PlannedCall::from_body(&json!({"model": "gpt-4o"}), Provider::OpenAi, 10).unwrap();
        let reply = UpstreamReply {
            status: 200,
            body: json!({"id": "chatcmpl-9", "usage": {"prompt_tokens": 1000, "completion_tokens": 500}}),
        };
        let inv = call.invocation(&reply, Uuid::nil(), Uuid::nil());
        assert_eq!(inv.invocation_id, "chatcmpl-9");
        assert_eq!(inv.input_tokens, 1000);
        // 1000 * 2.50/M + 500 * 10.00/M
        assert_eq!(inv.raw_cost, "0.0075".parse::<Decimal>().unwrap());
    }

    #[test]
    fn settled_amount_reads_atomic_units() {
        let requirements = PaymentRequirements {
            scheme: "exact".into(),
            network: "base".into(),
            max_amount_required: "2500".into(),
            resource: "/messages".into(),
            description: String::new(),
            pay_to: "0x0".into(),
            max_timeout_seconds: 60,
        };
        assert_eq!(settled_amount(&requirements), "0.0025".parse::<Decimal>().unwrap());
    }
}
