//! Per-model provider prices.

use std::fmt;

use rust_decimal::Decimal;

use super::BillingError;

/// Upstream LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dollar prices per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    pub provider: Provider,
    pub input_per_million: Decimal,
    pub output_per_million: Decimal,
}

impl ModelPricing {
    /// Raw provider cost of a call.
    pub fn cost(&self, input_tokens: i64, output_tokens: i64) -> Decimal {
        let million = Decimal::from(1_000_000);
        (Decimal::from(input_tokens) * self.input_per_million
            + Decimal::from(output_tokens) * self.output_per_million)
            / million
    }
}

// (model prefix, provider, input cents/M, output cents/M). More specific
// prefixes come first so dated snapshots resolve to the right family.
const PRICE_TABLE: &[(&str, Provider, i64, i64)] = &[
    ("gpt-4o-mini", Provider::OpenAi, 15, 60),
    ("gpt-4o", Provider::OpenAi, 250, 1000),
    ("gpt-4.1-nano", Provider::OpenAi, 10, 40),
    ("gpt-4.1-mini", Provider::OpenAi, 40, 160),
    ("gpt-4.1", Provider::OpenAi, 200, 800),
    ("o3-mini", Provider::OpenAi, 110, 440),
    ("o4-mini", Provider::OpenAi, 110, 440),
    ("claude-3-5-haiku", Provider::Anthropic, 80, 400),
    ("claude-3-5-sonnet", Provider::Anthropic, 300, 1500),
    ("claude-3-7-sonnet", Provider::Anthropic, 300, 1500),
    ("claude-sonnet-4", Provider::Anthropic, 300, 1500),
    ("claude-opus-4", Provider::Anthropic, 1500, 7500),
];

/// Look up pricing for `model`, matching dated snapshots by family prefix.
pub fn lookup(model: &str) -> Option<ModelPricing> {
    PRICE_TABLE
        .iter()
        .find(|(prefix, ..)| model.starts_with(prefix))
        .map(|&(_, provider, input, output)| ModelPricing {
            provider,
            input_per_million: Decimal::new(input, 2),
            output_per_million: Decimal::new(output, 2),
        })
}

/// Like [`lookup`], but unknown models are an error.
pub fn require(model: &str) -> Result<ModelPricing, BillingError> {
    lookup(model).ok_or_else(|| BillingError::UnsupportedModel(model.to_string()))
}

/// Worst-case raw cost of a call before it is made.
///
/// `max_output_tokens` is the request's own cap, or the configured preflight
/// ceiling when the client did not set one.
pub fn estimate(pricing: &ModelPricing, input_tokens: i64, max_output_tokens: i64) -> Decimal {
    pricing.cost(input_tokens, max_output_tokens)
}
