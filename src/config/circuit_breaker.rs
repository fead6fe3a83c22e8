use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Base time spent Open before a half-open trial
    pub open_timeout_ms: u64,
    /// Cap for the doubling open timeout after failed trials
    pub max_open_timeout_ms: u64,
    /// Failures further apart than this do not form a streak
    pub monitoring_window_ms: u64,
    /// A single deviation above this trips the breaker immediately
    pub max_price_deviation_pct: f64,
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn monitoring_window(&self) -> Duration {
        Duration::from_millis(self.monitoring_window_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            open_timeout_ms: 30_000,       // 30s
            max_open_timeout_ms: 300_000,  // 5m
            monitoring_window_ms: 60_000,  // 1m
            max_price_deviation_pct: 25.0,
        }
    }
}
