pub mod adapters;
pub mod aggregator;
pub mod cache;
pub mod circuit_breaker;
pub mod consensus;
pub mod context;
pub mod service;
pub mod statistics;
pub mod validator;

use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::types::ids::FeedId;

pub use adapters::FeedAdapter;
pub use context::{CancelSignal, FetchContext};
pub use service::{AggregateRequest, OracleService, OracleServiceBuilder};

/// Wires one adapter to one feed.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_name: String,
    pub feed_id: FeedId,
    pub adapter: AdapterKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterKind {
    /// Always reports the same price, stamped with the current time.
    Fixed {
        price: f64,
        #[serde(default = "default_confidence")]
        confidence: u8,
    },
}

fn default_confidence() -> u8 {
    100
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source_name.trim().is_empty() {
            return Err(Error::ConfigError(format!(
                "source for {} has an empty name", self.feed_id
            )));
        }
        match &self.adapter {
            AdapterKind::Fixed { price, confidence } => {
                if !(*price > 0.0) {
                    return Err(Error::ConfigError(format!(
                        "source {} has non-positive price {}", self.source_name, price
                    )));
                }
                if *confidence > 100 {
                    return Err(Error::ConfigError(format!(
                        "source {} has confidence {} above 100", self.source_name, confidence
                    )));
                }
            }
        }
        Ok(())
    }
}
