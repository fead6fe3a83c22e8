use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::types::ids::FeedId;

/// Per-feed sanity rules applied to every observation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ValidationRules {
    pub min_price: f64,
    pub max_price: f64,
    pub max_deviation_pct: f64,
    pub max_age_seconds: u64,
    /// 0-100
    pub min_confidence: u8,
}

const STABLECOINS: [&str; 4] = ["USDC", "USDT", "DAI", "BUSD"];

impl ValidationRules {
    pub fn stablecoin() -> Self {
        ValidationRules {
            min_price: 0.95,
            max_price: 1.05,
            max_deviation_pct: 3.0,
            max_age_seconds: 300,
            min_confidence: 80,
        }
    }

    pub fn btc_usd() -> Self {
        ValidationRules {
            min_price: 1_000.0,
            max_price: 1_000_000.0,
            max_deviation_pct: 10.0,
            max_age_seconds: 300,
            min_confidence: 70,
        }
    }

    pub fn eth_usd() -> Self {
        ValidationRules {
            min_price: 10.0,
            max_price: 100_000.0,
            max_deviation_pct: 10.0,
            max_age_seconds: 300,
            min_confidence: 70,
        }
    }

    /// Built-in rules for well-known feeds, used when configuration has no
    /// entry.
    pub fn fallback_for(feed_id: &FeedId) -> Option<Self> {
        match (feed_id.asset(), feed_id.quote()) {
            (asset, "USD") if STABLECOINS.contains(&asset) => Some(Self::stablecoin()),
            ("BTC", "USD") => Some(Self::btc_usd()),
            ("ETH", "USD") => Some(Self::eth_usd()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_price > 0.0) {
            return Err(format!("min_price must be positive, got {}", self.min_price));
        }
        if self.max_price < self.min_price {
            return Err(format!(
                "max_price {} below min_price {}",
                self.max_price, self.min_price
            ));
        }
        if !(self.max_deviation_pct > 0.0) {
            return Err("max_deviation_pct must be positive".to_string());
        }
        if self.max_age_seconds == 0 {
            return Err("max_age_seconds must be positive".to_string());
        }
        if self.min_confidence > 100 {
            return Err(format!("min_confidence {} above 100", self.min_confidence));
        }
        Ok(())
    }
}

/// Rules keyed by feed id. Loaded once, read-only afterwards.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ValidationPresets(HashMap<FeedId, ValidationRules>);

impl ValidationPresets {
    pub fn new(presets: HashMap<FeedId, ValidationRules>) -> Self {
        ValidationPresets(presets)
    }

    pub fn insert(&mut self, feed_id: FeedId, rules: ValidationRules) {
        self.0.insert(feed_id, rules);
    }

    /// Configured rules, else the built-in fallback.
    pub fn rules_for(&self, feed_id: &FeedId) -> Option<ValidationRules> {
        self.0
            .get(feed_id)
            .cloned()
            .or_else(|| ValidationRules::fallback_for(feed_id))
    }

    pub fn validate(&self) -> Result<(), String> {
        for (feed_id, rules) in &self.0 {
            rules.validate().map_err(|e| format!("preset {}: {}", feed_id, e))?;
        }
        Ok(())
    }
}
