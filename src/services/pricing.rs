//! Price ratios and charge computation
//!
//! Ratios are fixed-point micro-units so every charge is computed with integer arithmetic.

use crate::models::Usage;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Micro-units per 1.0
pub const RATIO_SCALE: u64 = 1_000_000;

/// Non-negative fixed-point ratio, 1.0 = 1_000_000
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct PriceRatio(u64);

impl PriceRatio {
    pub const ONE: PriceRatio = PriceRatio(RATIO_SCALE);
    pub const ZERO: PriceRatio = PriceRatio(0);

    pub const fn from_micros(micros: u64) -> Self {
        PriceRatio(micros)
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let micros = (value * RATIO_SCALE as f64).round();
        if micros > u64::MAX as f64 {
            return None;
        }
        Some(PriceRatio(micros as u64))
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Product of two ratios, rounded to the nearest micro-unit
    pub fn mul(self, other: PriceRatio) -> PriceRatio {
        let product = self.0 as u128 * other.0 as u128;
        let scaled = (product + RATIO_SCALE as u128 / 2) / RATIO_SCALE as u128;
        PriceRatio(u64::try_from(scaled).unwrap_or(u64::MAX))
    }
}

impl TryFrom<f64> for PriceRatio {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        PriceRatio::from_f64(value).ok_or_else(|| format!("invalid price ratio: {}", value))
    }
}

impl From<PriceRatio> for f64 {
    fn from(ratio: PriceRatio) -> f64 {
        ratio.0 as f64 / RATIO_SCALE as f64
    }
}

impl fmt::Display for PriceRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", f64::from(*self))
    }
}

/// Pricing section of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Per-model price ratio
    #[serde(rename = "modelRatio", default)]
    pub model_ratio: HashMap<String, PriceRatio>,

    /// Per-model multiplier applied to completion tokens
    #[serde(rename = "completionRatio", default)]
    pub completion_ratio: HashMap<String, PriceRatio>,

    /// Per-group multiplier
    #[serde(rename = "groupRatio", default)]
    pub group_ratio: HashMap<String, PriceRatio>,

    /// Ratio used for models missing from modelRatio
    #[serde(rename = "defaultModelRatio", default = "default_model_ratio")]
    pub default_model_ratio: PriceRatio,
}

fn default_model_ratio() -> PriceRatio {
    PriceRatio::from_micros(30 * RATIO_SCALE)
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            group_ratio: HashMap::new(),
            default_model_ratio: default_model_ratio(),
        }
    }
}

impl PricingConfig {
    pub fn model_ratio(&self, model: &str) -> PriceRatio {
        self.model_ratio
            .get(model)
            .copied()
            .unwrap_or(self.default_model_ratio)
    }

    pub fn completion_ratio(&self, model: &str) -> PriceRatio {
        self.completion_ratio
            .get(model)
            .copied()
            .unwrap_or(PriceRatio::ONE)
    }

    pub fn group_ratio(&self, group: &str) -> PriceRatio {
        self.group_ratio.get(group).copied().unwrap_or(PriceRatio::ONE)
    }
}

/// Price applying to one call, resolved once per request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeRate {
    /// modelRatio × groupRatio
    pub ratio: PriceRatio,
    pub completion_ratio: PriceRatio,
}

impl ChargeRate {
    pub fn new(ratio: PriceRatio, completion_ratio: PriceRatio) -> Self {
        Self { ratio, completion_ratio }
    }

    /// ceil((prompt + completion × completionRatio) × ratio), at least 1 when anything was used
    ///
    /// The split is taken from [`Usage::normalized`], so a reported total is always billed.
    pub fn charge(&self, usage: &Usage) -> i64 {
        if self.ratio.is_zero() {
            return 0;
        }
        let usage = usage.normalized();
        let scale = RATIO_SCALE as u128;
        // weighted tokens, still in micro-units
        let weighted = usage.prompt_tokens as u128 * scale
            + usage.completion_tokens as u128 * self.completion_ratio.micros() as u128;
        if weighted == 0 {
            return 0;
        }
        let amount = weighted
            .saturating_mul(self.ratio.micros() as u128)
            .div_ceil(scale * scale);
        i64::try_from(amount).unwrap_or(i64::MAX).max(1)
    }

    /// Reservation estimate for a token count
    pub fn estimate(&self, tokens: i64) -> i64 {
        if tokens <= 0 || self.ratio.is_zero() {
            return 0;
        }
        let amount = (tokens as u128 * self.ratio.micros() as u128).div_ceil(RATIO_SCALE as u128);
        i64::try_from(amount).unwrap_or(i64::MAX)
    }
}

/// Process-wide pricing, swapped atomically on reload
pub struct PricingTable {
    current: ArcSwap<PricingConfig>,
}

impl PricingTable {
    pub fn new(config: PricingConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Replace the whole table; in-flight requests keep the rate they resolved
    pub fn reload(&self, config: PricingConfig) {
        info!(
            "Reloading pricing: {} model ratios, {} group ratios",
            config.model_ratio.len(),
            config.group_ratio.len()
        );
        self.current.store(Arc::new(config));
    }

    pub fn snapshot(&self) -> Arc<PricingConfig> {
        self.current.load_full()
    }

    /// Rate for a model billed to a group
    pub fn charge_rate(&self, model: &str, group: &str) -> ChargeRate {
        let config = self.current.load();
        ChargeRate {
            ratio: config.model_ratio(model).mul(config.group_ratio(group)),
            completion_ratio: config.completion_ratio(model),
        }
    }
}

impl fmt::Debug for PricingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PricingTable")
            .field("current", &*self.current.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratio(value: f64) -> PriceRatio {
        PriceRatio::from_f64(value).unwrap()
    }

    #[test]
    fn test_ratio_parsing() {
        let config: PricingConfig = serde_json::from_str(
            r#"{"modelRatio": {"gpt-x": 2.5}, "groupRatio": {"vip": 0.8}}"#,
        )
        .unwrap();
        assert_eq!(config.model_ratio("gpt-x").micros(), 2_500_000);
        assert_eq!(config.model_ratio("unknown").micros(), 30_000_000);
        assert_eq!(config.group_ratio("vip").micros(), 800_000);
        assert_eq!(config.group_ratio("default"), PriceRatio::ONE);

        assert!(serde_json::from_str::<PricingConfig>(r#"{"modelRatio": {"m": -1}}"#).is_err());
    }

    #[test]
    fn test_charge_total_tokens_times_ratio() {
        let rate = ChargeRate::new(ratio(2.0), PriceRatio::ONE);
        assert_eq!(rate.charge(&Usage::new(30, 12)), 84);
    }

    #[test]
    fn test_charge_rounds_up_and_has_minimum() {
        let rate = ChargeRate::new(ratio(0.001), PriceRatio::ONE);
        assert_eq!(rate.charge(&Usage::new(1, 0)), 1);
        let rate = ChargeRate::new(ratio(0.5), PriceRatio::ONE);
        assert_eq!(rate.charge(&Usage::new(3, 0)), 2);
        assert_eq!(rate.charge(&Usage::default()), 0);
        let rate = ChargeRate::new(PriceRatio::ZERO, PriceRatio::ONE);
        assert_eq!(rate.charge(&Usage::new(100, 100)), 0);
    }

    #[test]
    fn test_completion_ratio_weights_completion_only() {
        let rate = ChargeRate::new(ratio(1.0), ratio(3.0));
        assert_eq!(rate.charge(&Usage::new(10, 10)), 40);
    }

    #[test]
    fn test_charge_bills_reported_total() {
        let rate = ChargeRate::new(ratio(2.0), PriceRatio::ONE);
        let total_only = Usage {
            total_tokens: 42,
            ..Default::default()
        };
        assert_eq!(rate.charge(&total_only), 84);

        let inconsistent = Usage {
            prompt_tokens: 30,
            completion_tokens: 0,
            total_tokens: 42,
        };
        assert_eq!(rate.charge(&inconsistent), 84);
    }

    #[test]
    fn test_charge_of_huge_usage_does_not_overflow() {
        let rate = ChargeRate::new(ratio(1_000_000.0), ratio(1_000_000.0));
        let charged = rate.charge(&Usage::new(u32::MAX, u32::MAX));
        assert!(charged > 0);

        let rate = ChargeRate::new(PriceRatio::from_micros(u64::MAX), PriceRatio::from_micros(u64::MAX));
        assert_eq!(rate.charge(&Usage::new(u32::MAX, u32::MAX)), i64::MAX);
    }

    #[test]
    fn test_table_combines_model_and_group() {
        let mut config = PricingConfig::default();
        config.model_ratio.insert("gpt-x".to_string(), ratio(2.5));
        config.group_ratio.insert("vip".to_string(), ratio(0.8));
        let table = PricingTable::new(config);

        assert_eq!(table.charge_rate("gpt-x", "vip").ratio, ratio(2.0));
        assert_eq!(table.charge_rate("gpt-x", "default").ratio, ratio(2.5));

        table.reload(PricingConfig::default());
        assert_eq!(table.charge_rate("gpt-x", "vip").ratio, ratio(30.0));
    }

    #[test]
    fn test_estimate() {
        let rate = ChargeRate::new(ratio(1.5), PriceRatio::ONE);
        assert_eq!(rate.estimate(101), 152);
        assert_eq!(rate.estimate(0), 0);
    }
}
