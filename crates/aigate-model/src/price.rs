use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Token count one price unit covers: prices are currency units per million
/// tokens.
pub const PRICE_UNIT: i64 = 1_000_000;

/// Prices stay `Decimal` from the seed file through admission and the
/// recorder; money never round-trips through binary floats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    #[serde(default)]
    pub input_price: Decimal,
    #[serde(default)]
    pub output_price: Decimal,
    /// Flat per-call price for modes without meaningful token counts
    /// (image generation, PDF parsing).
    #[serde(default)]
    pub per_request_price: Decimal,
}

/// Per-model configuration resolved by the router before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default)]
    pub price: Price,
    /// Upstream model name override; empty means no remap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_model: Option<String>,
}

impl ModelConfig {
    pub fn actual_model(&self) -> &str {
        self.actual_model.as_deref().unwrap_or(&self.model)
    }
}
