use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::TokenUsage;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input_usd_micros_per_token: u64,
    #[serde(default)]
    pub output_usd_micros_per_token: u64,
    #[serde(default)]
    pub per_request_usd_micros: u64,
}

impl ModelPricing {
    pub fn cost_usd_micros(&self, usage: TokenUsage) -> u64 {
        let input = u64::from(usage.input_tokens).saturating_mul(self.input_usd_micros_per_token);
        let output =
            u64::from(usage.output_tokens).saturating_mul(self.output_usd_micros_per_token);
        input
            .saturating_add(output)
            .saturating_add(self.per_request_usd_micros)
    }
}

/// One model's entry in a litellm-style `model_prices.json`. Unknown keys
/// (`max_tokens`, `litellm_provider`, ...) are ignored.
#[derive(Debug, Default, Deserialize)]
struct PriceEntry {
    input_cost_per_token: Option<f64>,
    input_cost_per_1k_tokens: Option<f64>,
    output_cost_per_token: Option<f64>,
    output_cost_per_1k_tokens: Option<f64>,
    cost_per_request: Option<f64>,
}

impl PriceEntry {
    fn input_usd(&self) -> Option<f64> {
        self.input_cost_per_token
            .or(self.input_cost_per_1k_tokens.map(|per_1k| per_1k / 1000.0))
    }

    fn output_usd(&self) -> Option<f64> {
        self.output_cost_per_token
            .or(self.output_cost_per_1k_tokens.map(|per_1k| per_1k / 1000.0))
    }
}

/// Prices for models whose config carries none, keyed by model name.
#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

#[derive(Debug, Error)]
pub enum PricingTableError {
    #[error("model {model} has neither an input nor an output cost")]
    MissingCosts { model: String },
    #[error("model {model}: {field} must be a finite, non-negative USD amount")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("invalid pricing json: {0}")]
    Json(#[from] serde_json::Error),
}

impl PricingTable {
    pub fn from_litellm_json_str(raw: &str) -> Result<Self, PricingTableError> {
        let entries: HashMap<String, PriceEntry> = serde_json::from_str(raw)?;
        let mut models = HashMap::with_capacity(entries.len());
        for (model, entry) in entries {
            let (input, output) = (entry.input_usd(), entry.output_usd());
            if input.is_none() && output.is_none() {
                return Err(PricingTableError::MissingCosts { model });
            }
            let micros = |usd: Option<f64>, field| {
                usd.map_or(Ok(0), |usd| usd_to_micros(usd, &model, field))
            };
            let pricing = ModelPricing {
                input_usd_micros_per_token: micros(input, "input cost")?,
                output_usd_micros_per_token: micros(output, "output cost")?,
                per_request_usd_micros: micros(entry.cost_per_request, "cost_per_request")?,
            };
            models.insert(model, pricing);
        }
        Ok(Self { models })
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn usd_to_micros(usd: f64, model: &str, field: &'static str) -> Result<u64, PricingTableError> {
    if !usd.is_finite() || usd < 0.0 {
        return Err(PricingTableError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    // `as` saturates at u64::MAX for out-of-range floats.
    Ok((usd * 1_000_000.0).round() as u64)
}
