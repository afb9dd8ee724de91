//! X402 pay-per-call.
//!
//! A caller without an account answers a 402 challenge by attaching a signed
//! payment in the `x-payment` header. The facilitator verifies it before the
//! provider call and settles it afterwards; the gateway never holds funds.

use async_trait::async_trait;
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header::WWW_AUTHENTICATE};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::X402Settings;

/// Protocol version spoken to clients and the facilitator.
pub const X402_VERSION: u32 = 1;

/// Request header carrying the base64 payment payload.
pub const PAYMENT_HEADER: &str = "x-payment";

/// USDC has six decimals.
const ATOMIC_UNITS_PER_USD: i64 = 1_000_000;

const MAX_TIMEOUT_SECONDS: u64 = 120;

#[derive(Debug, Error)]
pub enum X402Error {
    #[error("Invalid payment: {0}")]
    Invalid(String),

    #[error("Facilitator error: {0}")]
    Facilitator(String),
}

/// What the caller must pay for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Atomic units, as a decimal string.
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct VerifiedPayment {
    pub payer: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settlement {
    /// On-chain transaction reference.
    pub transaction: String,
    pub network: String,
}

/// Verifies and settles X402 payments.
#[async_trait]
pub trait PaymentFacilitator: Send + Sync {
    async fn verify(
        &self,
        payment: &str,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, X402Error>;

    async fn settle(
        &self,
        payment: &str,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, X402Error>;
}

/// Facilitator reached over HTTP (`POST /verify`, `POST /settle`).
pub struct HttpFacilitator {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    invalid_reason: Option<String>,
    payer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    success: bool,
    error_reason: Option<String>,
    transaction: Option<String>,
    network: Option<String>,
}

impl HttpFacilitator {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        payment: &str,
        requirements: &PaymentRequirements,
    ) -> Result<T, X402Error> {
        let body = json!({
            "x402Version": X402_VERSION,
            "paymentPayload": decode_payment(payment)?,
            "paymentRequirements": requirements,
        });
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))?;
        if !response.status().is_success() {
            return Err(X402Error::Facilitator(format!(
                "{path} returned {}",
                response.status()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| X402Error::Facilitator(e.to_string()))
    }
}

#[async_trait]
impl PaymentFacilitator for HttpFacilitator {
    async fn verify(
        &self,
        payment: &str,
        requirements: &PaymentRequirements,
    ) -> Result<VerifiedPayment, X402Error> {
        let resp: VerifyResponse = self.call("/verify", payment, requirements).await?;
        if !resp.is_valid {
            return Err(X402Error::Invalid(
                resp.invalid_reason.unwrap_or_else(|| "rejected".into()),
            ));
        }
        Ok(VerifiedPayment { payer: resp.payer })
    }

    async fn settle(
        &self,
        payment: &str,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement, X402Error> {
        let resp: SettleResponse = self.call("/settle", payment, requirements).await?;
        match (resp.success, resp.transaction) {
            (true, Some(transaction)) => Ok(Settlement {
                transaction,
                network: resp.network.unwrap_or_else(|| requirements.network.clone()),
            }),
            _ => Err(X402Error::Facilitator(
                resp.error_reason.unwrap_or_else(|| "settlement failed".into()),
            )),
        }
    }
}

/// Decode the base64 JSON payload of an `x-payment` header.
pub fn decode_payment(header: &str) -> Result<Value, X402Error> {
    let bytes = STANDARD
        .decode(header.trim())
        .map_err(|_| X402Error::Invalid("x-payment is not base64".into()))?;
    serde_json::from_slice(&bytes).map_err(|_| X402Error::Invalid("x-payment is not JSON".into()))
}

/// Dollars to USDC atomic units, rounded up.
pub fn usd_to_atomic(amount: Decimal) -> u64 {
    (amount * Decimal::from(ATOMIC_UNITS_PER_USD))
        .ceil()
        .to_u64()
        .unwrap_or(0)
}

pub fn atomic_to_usd(amount: u64) -> Decimal {
    Decimal::from(amount) / Decimal::from(ATOMIC_UNITS_PER_USD)
}

/// Requirements for a call expected to cost at most `amount`, if X402 is enabled.
pub fn requirements_for(
    settings: &X402Settings,
    resource: &str,
    amount: Decimal,
) -> Option<PaymentRequirements> {
    if !settings.enabled() {
        return None;
    }
    Some(PaymentRequirements {
        scheme: "exact".into(),
        network: settings.network.clone(),
        max_amount_required: usd_to_atomic(amount).max(1).to_string(),
        resource: resource.to_string(),
        description: "Metered LLM call".into(),
        pay_to: settings.pay_to.clone().unwrap_or_default(),
        max_timeout_seconds: MAX_TIMEOUT_SECONDS,
    })
}

pub fn challenge_header(settings: &X402Settings) -> String {
    format!(
        "X-402 realm=\"{}\";link=\"{}\";network=\"{}\"",
        settings.realm, settings.link, settings.network
    )
}

/// 402 response with the challenge header and the accepted payment schemes.
pub fn payment_required(
    settings: &X402Settings,
    accepts: Option<PaymentRequirements>,
    description: &str,
) -> Response {
    let body = json!({
        "error": "payment_required",
        "error_description": description,
        "x402Version": X402_VERSION,
        "schemes": ["bearer", "x-api-key", "x402"],
        "accepts": accepts.into_iter().collect::<Vec<_>>(),
    });
    let mut resp = (StatusCode::PAYMENT_REQUIRED, Json(body)).into_response();
    if let Ok(hv) = HeaderValue::from_str(&challenge_header(settings)) {
        resp.headers_mut().insert(WWW_AUTHENTICATE, hv);
    }
    resp
}
