use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};

pub mod aggregation;
pub mod circuit_breaker;
pub mod loader;
pub mod presets;

pub use aggregation::{AggregationConfig, ConsensusConfig};
pub use circuit_breaker::CircuitBreakerConfig;
pub use loader::{AppConfig, LoggingConfig, ServerConfig};
pub use presets::{ValidationPresets, ValidationRules};

pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const MAX_STALENESS_SECS: u64 = 86_400;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Request deadline when the caller gives none
    pub default_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    /// Retries after a network error, within the request deadline
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// How far in the future an observation timestamp may be
    pub max_clock_skew_ms: u64,
}

impl FetchConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            default_timeout_ms: 5_000,
            cache_ttl_ms: 1_000,
            max_retries: 1,
            retry_backoff_ms: 100,
            max_clock_skew_ms: 5_000,
        }
    }
}

/// Engine settings shared by every feed.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleConfig {
    pub aggregation: AggregationConfig,
    pub consensus: ConsensusConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub fetch: FetchConfig,
}

impl OracleConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::ConfigError(msg));

        let aggregation = &self.aggregation;
        if aggregation.min_sources == 0 {
            return fail("aggregation.min_sources must be at least 1".to_string());
        }
        if !(aggregation.outlier_mad_k > 0.0) {
            return fail("aggregation.outlier_mad_k must be positive".to_string());
        }
        if !(0.0..50.0).contains(&aggregation.trim_pct) {
            return fail(format!("aggregation.trim_pct {} outside [0, 50)", aggregation.trim_pct));
        }
        if !(aggregation.mode_precision > 0.0) {
            return fail("aggregation.mode_precision must be positive".to_string());
        }

        if !(0.0..=1.0).contains(&self.consensus.min_agreement) {
            return fail(format!(
                "consensus.min_agreement {} outside [0, 1]",
                self.consensus.min_agreement
            ));
        }

        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return fail("circuit_breaker thresholds must be at least 1".to_string());
        }
        if breaker.open_timeout_ms == 0 || breaker.max_open_timeout_ms < breaker.open_timeout_ms {
            return fail("circuit_breaker.max_open_timeout_ms must be >= open_timeout_ms > 0".to_string());
        }

        let fetch = &self.fetch;
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&fetch.default_timeout_ms) {
            return fail(format!(
                "fetch.default_timeout_ms {} outside [{}, {}]",
                fetch.default_timeout_ms, MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS
            ));
        }

        Ok(())
    }
}
