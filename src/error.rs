use std::collections::BTreeMap;
use std::fmt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use crate::types::timestamp::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // Transport Errors
    #[error("Network error from {provider}: {reason}")]
    Network {
        provider: String,
        reason: String,
    },

    #[error("Fetch from {provider} timed out after {timeout_ms}ms")]
    Timeout {
        provider: String,
        timeout_ms: u64,
    },

    #[error("Request for {feed_id} cancelled")]
    Cancelled { feed_id: String },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for {provider}: {reason}")]
    Authentication {
        provider: String,
        reason: String,
    },

    // Observation Errors
    #[error("Invalid observation from {provider}: {reason}")]
    InvalidObservation {
        provider: String,
        reason: String,
    },

    #[error("Price {price} from {provider} outside bounds [{min}, {max}]")]
    PriceOutOfBounds {
        provider: String,
        price: f64,
        min: f64,
        max: f64,
    },

    #[error("Stale data from {provider}: age {age_ms}ms exceeds {max_age_ms}ms")]
    StaleData {
        provider: String,
        age_ms: u64,
        max_age_ms: u64,
    },

    #[error("Confidence {confidence} from {provider} below minimum {min_confidence}")]
    LowConfidence {
        provider: String,
        confidence: u8,
        min_confidence: u8,
    },

    #[error("Price from {provider} deviates {deviation_pct:.2}% from reference, max {max_deviation_pct:.2}%")]
    PriceDeviation {
        provider: String,
        deviation_pct: f64,
        max_deviation_pct: f64,
    },

    // Fault Isolation Errors
    #[error("Circuit breaker open for {provider}, next attempt at {next_attempt_at}")]
    CircuitOpen {
        provider: String,
        next_attempt_at: Timestamp,
    },

    // Aggregation Errors
    #[error("Insufficient sources for {feed_id}: need {required}, got {available}")]
    InsufficientSources {
        feed_id: String,
        available: usize,
        required: usize,
    },

    // Request / Configuration Errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    DataValidationError,
    StaleDataError,
    PriceDeviationError,
    LowConfidenceError,
    CircuitBreakerError,
    AggregationError,
    ConfigurationError,
    RateLimitError,
    AuthenticationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::DataValidationError => "DATA_VALIDATION_ERROR",
            ErrorCode::StaleDataError => "STALE_DATA_ERROR",
            ErrorCode::PriceDeviationError => "PRICE_DEVIATION_ERROR",
            ErrorCode::LowConfidenceError => "LOW_CONFIDENCE_ERROR",
            ErrorCode::CircuitBreakerError => "CIRCUIT_BREAKER_ERROR",
            ErrorCode::AggregationError => "AGGREGATION_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::RateLimitError => "RATE_LIMIT_ERROR",
            ErrorCode::AuthenticationError => "AUTHENTICATION_ERROR",
        }
    }

    pub fn recovery_actions(&self) -> &'static [&'static str] {
        match self {
            ErrorCode::NetworkError => &[
                "Retry with exponential backoff",
                "Check provider connectivity",
            ],
            ErrorCode::DataValidationError => &[
                "Source excluded for this round",
                "Review the feed's configured price bounds",
            ],
            ErrorCode::StaleDataError => &[
                "Wait for the provider to publish a fresh round",
                "Widen max staleness tolerance for this request",
            ],
            ErrorCode::PriceDeviationError => &[
                "Verify the provider against independent sources",
                "Inspect circuit breaker state for the source",
            ],
            ErrorCode::LowConfidenceError => &[
                "Source excluded for this round",
                "Lower the minimum confidence for this request",
            ],
            ErrorCode::CircuitBreakerError => &[
                "Wait for the breaker to enter half-open",
                "Reset the breaker after operator review",
            ],
            ErrorCode::AggregationError => &[
                "Retry once more sources recover",
                "Fall back to the last trusted price",
            ],
            ErrorCode::ConfigurationError => &[
                "Fix the feed's preset or adapter wiring",
            ],
            ErrorCode::RateLimitError => &[
                "Retry after the indicated delay",
                "Reduce request frequency",
            ],
            ErrorCode::AuthenticationError => &[
                "Rotate or fix provider credentials",
                "Operator intervention required",
            ],
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Network { .. } | Error::Timeout { .. } | Error::Cancelled { .. } => {
                ErrorCode::NetworkError
            }
            Error::RateLimited { .. } => ErrorCode::RateLimitError,
            Error::Authentication { .. } => ErrorCode::AuthenticationError,
            Error::InvalidObservation { .. }
            | Error::PriceOutOfBounds { .. }
            | Error::InvalidRequest(_) => ErrorCode::DataValidationError,
            Error::StaleData { .. } => ErrorCode::StaleDataError,
            Error::LowConfidence { .. } => ErrorCode::LowConfidenceError,
            Error::PriceDeviation { .. } => ErrorCode::PriceDeviationError,
            Error::CircuitOpen { .. } => ErrorCode::CircuitBreakerError,
            Error::InsufficientSources { .. } => ErrorCode::AggregationError,
            Error::ConfigError(_) => ErrorCode::ConfigurationError,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Error::Cancelled { .. } | Error::InvalidRequest(_) => Severity::Low,
            Error::Network { .. } | Error::Timeout { .. } | Error::RateLimited { .. } => {
                Severity::Medium
            }
            Error::InvalidObservation { .. }
            | Error::PriceOutOfBounds { .. }
            | Error::LowConfidence { .. } => Severity::Medium,
            Error::StaleData { age_ms, max_age_ms, .. } => {
                let over = age_ms.saturating_sub(*max_age_ms) as f64;
                let ratio = over / (*max_age_ms).max(1) as f64;
                if ratio <= 0.25 {
                    Severity::Low
                } else if ratio <= 1.0 {
                    Severity::Medium
                } else if ratio <= 4.0 {
                    Severity::High
                } else {
                    Severity::Critical
                }
            }
            Error::PriceDeviation { deviation_pct, .. } => {
                if *deviation_pct > 50.0 {
                    Severity::Critical
                } else if *deviation_pct > 25.0 {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            Error::CircuitOpen { .. } => Severity::High,
            Error::InsufficientSources { .. } => Severity::High,
            Error::Authentication { .. } | Error::ConfigError(_) => Severity::Critical,
        }
    }

    /// Errors that must abort the whole request instead of excluding one
    /// source.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Authentication { .. } | Error::ConfigError(_))
    }

    /// Whether the failure is the source's fault and should count against
    /// its circuit breaker.
    pub fn counts_against_source(&self) -> bool {
        !matches!(
            self,
            Error::Cancelled { .. }
                | Error::CircuitOpen { .. }
                | Error::InsufficientSources { .. }
                | Error::InvalidRequest(_)
                | Error::ConfigError(_)
        )
    }

    /// Provider named by a per-source error.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Error::Network { provider, .. }
            | Error::Timeout { provider, .. }
            | Error::RateLimited { provider, .. }
            | Error::Authentication { provider, .. }
            | Error::InvalidObservation { provider, .. }
            | Error::PriceOutOfBounds { provider, .. }
            | Error::StaleData { provider, .. }
            | Error::LowConfidence { provider, .. }
            | Error::PriceDeviation { provider, .. }
            | Error::CircuitOpen { provider, .. } => Some(provider.as_str()),
            _ => None,
        }
    }

    pub fn context(&self) -> BTreeMap<String, Value> {
        let mut context = BTreeMap::new();
        if let Some(provider) = self.provider() {
            context.insert("provider".to_string(), json!(provider));
        }

        match self {
            Error::Timeout { timeout_ms, .. } => {
                context.insert("timeout".to_string(), json!(true));
                context.insert("timeout_ms".to_string(), json!(timeout_ms));
            }
            Error::Cancelled { feed_id } => {
                context.insert("cancelled".to_string(), json!(true));
                context.insert("feed_id".to_string(), json!(feed_id));
            }
            Error::RateLimited { retry_after_ms, .. } => {
                context.insert("retry_after_ms".to_string(), json!(retry_after_ms));
            }
            Error::PriceOutOfBounds { price, min, max, .. } => {
                context.insert("price".to_string(), json!(price));
                context.insert("min_price".to_string(), json!(min));
                context.insert("max_price".to_string(), json!(max));
            }
            Error::StaleData { age_ms, max_age_ms, .. } => {
                context.insert("age_ms".to_string(), json!(age_ms));
                context.insert("max_age_ms".to_string(), json!(max_age_ms));
            }
            Error::LowConfidence { confidence, min_confidence, .. } => {
                context.insert("confidence".to_string(), json!(confidence));
                context.insert("min_confidence".to_string(), json!(min_confidence));
            }
            Error::PriceDeviation { deviation_pct, max_deviation_pct, .. } => {
                context.insert("deviation_pct".to_string(), json!(deviation_pct));
                context.insert("max_deviation_pct".to_string(), json!(max_deviation_pct));
            }
            Error::CircuitOpen { next_attempt_at, .. } => {
                context.insert("next_attempt_at".to_string(), json!(next_attempt_at));
            }
            Error::InsufficientSources { feed_id, available, required } => {
                context.insert("feed_id".to_string(), json!(feed_id));
                context.insert("available".to_string(), json!(available));
                context.insert("required".to_string(), json!(required));
            }
            _ => {}
        }

        context
    }
}

/// Wire form of an [`Error`] handed to callers.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct OracleError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub timestamp: Timestamp,
    pub context: BTreeMap<String, Value>,
    pub recovery_actions: Vec<String>,
}

impl OracleError {
    pub fn from_error(error: &Error, timestamp: Timestamp) -> Self {
        let code = error.code();
        OracleError {
            code,
            message: error.to_string(),
            severity: error.severity(),
            timestamp,
            context: error.context(),
            recovery_actions: code
                .recovery_actions()
                .iter()
                .map(|action| action.to_string())
                .collect(),
        }
    }
}
