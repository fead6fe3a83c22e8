use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::types::ids::FeedId;
use crate::types::price::Price;
use crate::types::timestamp::Timestamp;

/// One price reading from one provider at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub feed_id: FeedId,
    pub price: Price,
    /// Decimals the provider reported the price with.
    pub decimals: u32,
    pub timestamp: Timestamp,
    pub round_id: u64,
    /// 0-100
    pub confidence: u8,
    pub source_name: String,
}

impl Observation {
    pub fn new(
        feed_id: FeedId,
        source_name: impl Into<String>,
        price: Price,
        timestamp: Timestamp,
    ) -> Self {
        Observation {
            feed_id,
            price,
            decimals: Price::DECIMALS,
            timestamp,
            round_id: 0,
            confidence: 100,
            source_name: source_name.into(),
        }
    }

    /// Builds an observation from a provider's native fixed-point value.
    pub fn from_raw(
        feed_id: FeedId,
        source_name: impl Into<String>,
        raw: i128,
        decimals: u32,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let source_name = source_name.into();
        let price = Price::from_scaled(raw, decimals).ok_or_else(|| Error::InvalidObservation {
            provider: source_name.clone(),
            reason: format!("price {} with {} decimals is out of range", raw, decimals),
        })?;

        Ok(Observation {
            decimals,
            ..Observation::new(feed_id, source_name, price, timestamp)
        })
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_round_id(mut self, round_id: u64) -> Self {
        self.round_id = round_id;
        self
    }
}
