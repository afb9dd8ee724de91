//! Upstream LLM provider calls.
//!
//! The gateway holds the provider credentials; callers never see them. Only
//! a short allow-list of request headers is forwarded.

use std::time::Duration;

use axum::http::HeaderMap;
use echo_core::billing::pricing::Provider;
use serde_json::Value;

use crate::config::ProviderEndpoints;
use crate::error::AppError;

/// Upper bound on one provider call. Shorter than the balance hold lifetime.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Anthropic API version sent when the caller does not pick one.
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Provider → endpoint + auth header mapping.
struct ProviderMapping {
    path: &'static str,
    auth_header_name: &'static str,
    auth_header_prefix: &'static str,
    forwarded_headers: &'static [&'static str],
}

fn provider_mapping(provider: Provider) -> ProviderMapping {
    match provider {
        Provider::OpenAi => ProviderMapping {
            path: "/chat/completions",
            auth_header_name: "authorization",
            auth_header_prefix: "Bearer ",
            forwarded_headers: &["openai-organization", "openai-project"],
        },
        Provider::Anthropic => ProviderMapping {
            path: "/messages",
            auth_header_name: "x-api-key",
            auth_header_prefix: "",
            forwarded_headers: &["anthropic-version", "anthropic-beta"],
        },
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// A complete (non-streaming) provider response.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: Value,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Provider-generated response id, used as the ledger idempotency key.
    pub fn response_id(&self) -> Option<&str> {
        self.body.get("id").and_then(Value::as_str)
    }

    pub fn usage(&self, provider: Provider) -> Option<Usage> {
        extract_usage(provider, &self.body)
    }
}

/// Read token counts out of a provider response body.
pub fn extract_usage(provider: Provider, body: &Value) -> Option<Usage> {
    let usage = body.get("usage")?;
    let (input_key, output_key) = match provider {
        Provider::OpenAi => ("prompt_tokens", "completion_tokens"),
        Provider::Anthropic => ("input_tokens", "output_tokens"),
    };
    Some(Usage {
        input_tokens: usage.get(input_key)?.as_i64()?,
        output_tokens: usage.get(output_key).and_then(Value::as_i64).unwrap_or(0),
    })
}

/// Send `body` to the provider and wait for the full response.
pub async fn forward(
    client: &reqwest::Client,
    endpoints: &ProviderEndpoints,
    provider: Provider,
    headers: &HeaderMap,
    body: &Value,
) -> Result<UpstreamReply, AppError> {
    let mapping = provider_mapping(provider);
    let (base_url, api_key) = match provider {
        Provider::OpenAi => (&endpoints.openai_base_url, endpoints.openai_api_key.as_deref()),
        Provider::Anthropic => (
            &endpoints.anthropic_base_url,
            endpoints.anthropic_api_key.as_deref(),
        ),
    };
    let api_key = api_key.ok_or_else(|| {
        AppError::Upstream(format!("No API key configured for provider: {provider}"))
    })?;

    let url = format!("{}{}", base_url.trim_end_matches('/'), mapping.path);
    let mut req_builder = client.post(&url).timeout(UPSTREAM_TIMEOUT).json(body);

    for (name, value) in headers.iter() {
        if mapping.forwarded_headers.contains(&name.as_str())
            && let Ok(v) = value.to_str()
        {
            req_builder = req_builder.header(name.as_str(), v);
        }
    }
    if provider == Provider::Anthropic && !headers.contains_key("anthropic-version") {
        req_builder = req_builder.header("anthropic-version", DEFAULT_ANTHROPIC_VERSION);
    }

    let auth_value = format!("{}{}", mapping.auth_header_prefix, api_key);
    req_builder = req_builder.header(mapping.auth_header_name, &auth_value);

    let response = req_builder
        .send()
        .await
        .map_err(|e| AppError::Upstream(format!("Upstream request failed: {e}")))?;
    let status = response.status().as_u16();
    let body = response
        .json::<Value>()
        .await
        .map_err(|e| AppError::Upstream(format!("Upstream returned an unreadable body: {e}")))?;

    Ok(UpstreamReply { status, body })
}
