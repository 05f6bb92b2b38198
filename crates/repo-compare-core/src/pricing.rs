//! Static model whitelist and per-token pricing.
//!
//! Every chat model the system may call must appear in [`MODEL_RATES`].
//! Cost for an unknown model is an error, never a silent `$0`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// USD price per one million tokens for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub model: &'static str,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

pub const MODEL_RATES: &[ModelRate] = &[
    ModelRate {
        model: "gpt-4o-mini",
        input_per_million: 0.15,
        output_per_million: 0.60,
    },
    ModelRate {
        model: "gpt-4o",
        input_per_million: 2.50,
        output_per_million: 10.00,
    },
    ModelRate {
        model: "gpt-4.1-nano",
        input_per_million: 0.10,
        output_per_million: 0.40,
    },
    ModelRate {
        model: "gpt-4.1-mini",
        input_per_million: 0.40,
        output_per_million: 1.60,
    },
    ModelRate {
        model: "gpt-4.1",
        input_per_million: 2.00,
        output_per_million: 8.00,
    },
];

/// Token counts reported by a completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl TokenUsage {
    pub fn new(input_tokens: i64, output_tokens: i64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

pub fn rate_for(model: &str) -> Option<&'static ModelRate> {
    MODEL_RATES.iter().find(|r| r.model == model)
}

pub fn is_supported(model: &str) -> bool {
    rate_for(model).is_some()
}

/// Fail unless `model` is on the whitelist.
pub fn ensure_supported(model: &str) -> Result<()> {
    if !is_supported(model) {
        let known: Vec<&str> = MODEL_RATES.iter().map(|r| r.model).collect();
        bail!(
            "Unsupported model '{}'. Known models: {}",
            model,
            known.join(", ")
        );
    }
    Ok(())
}

/// `input_tokens × input_rate + output_tokens × output_rate`, in USD.
pub fn cost_for(model: &str, usage: TokenUsage) -> Result<f64> {
    let rate = match rate_for(model) {
        Some(rate) => rate,
        None => bail!("No pricing for model '{}'; refusing to record cost", model),
    };
    let input = usage.input_tokens.max(0) as f64 * rate.input_per_million / 1_000_000.0;
    let output = usage.output_tokens.max(0) as f64 * rate.output_per_million / 1_000_000.0;
    Ok(input + output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_uses_both_rates() {
        let cost = cost_for("gpt-4o-mini", TokenUsage::new(1_000_000, 1_000_000)).unwrap();
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_is_an_error() {
        assert!(cost_for("gpt-9-turbo", TokenUsage::new(10, 10)).is_err());
        assert!(ensure_supported("gpt-9-turbo").is_err());
        assert!(ensure_supported("gpt-4o").is_ok());
    }

    #[test]
    fn zero_usage_is_free_and_nonnegative() {
        assert_eq!(cost_for("gpt-4o", TokenUsage::default()).unwrap(), 0.0);
        assert_eq!(cost_for("gpt-4o", TokenUsage::new(-5, -5)).unwrap(), 0.0);
    }

    #[test]
    fn usage_adds() {
        let total = TokenUsage::new(1, 2) + TokenUsage::new(3, 4);
        assert_eq!(total, TokenUsage::new(4, 6));
    }
}
