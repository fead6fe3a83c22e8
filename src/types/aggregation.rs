use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use crate::error::ErrorCode;
use crate::types::ids::FeedId;
use crate::types::price::Price;
use crate::types::timestamp::Timestamp;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    #[default]
    Median,
    Mean,
    WeightedAverage,
    TrimmedMean,
    Mode,
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregationMethod::Median => "median",
            AggregationMethod::Mean => "mean",
            AggregationMethod::WeightedAverage => "weighted_average",
            AggregationMethod::TrimmedMean => "trimmed_mean",
            AggregationMethod::Mode => "mode",
        };
        write!(f, "{}", name)
    }
}

/// Why a source did not contribute to the aggregated price.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExclusionReason {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationSource {
    pub provider: String,
    /// Absent when the source produced no observation this round.
    pub price: Option<Price>,
    pub weight: f64,
    pub confidence: Option<u8>,
    pub included: bool,
    pub exclusion_reason: Option<ExclusionReason>,
}

impl AggregationSource {
    pub fn excluded(
        provider: impl Into<String>,
        price: Option<Price>,
        confidence: Option<u8>,
        reason: ExclusionReason,
    ) -> Self {
        AggregationSource {
            provider: provider.into(),
            price,
            weight: 0.0,
            confidence,
            included: false,
            exclusion_reason: Some(reason),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub std_dev: f64,
    pub variance: f64,
    /// Median absolute deviation
    pub mad: f64,
    pub range: f64,
    /// Interquartile range
    pub iqr: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutlierReason {
    #[serde(rename = "exceeds MAD threshold")]
    MadThreshold,
    #[serde(rename = "exceeds max deviation from median")]
    MaxDeviation,
}

impl fmt::Display for OutlierReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutlierReason::MadThreshold => write!(f, "exceeds MAD threshold"),
            OutlierReason::MaxDeviation => write!(f, "exceeds max deviation from median"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlierRecord {
    pub provider: String,
    pub price: Price,
    pub reason: OutlierReason,
    /// Multiples of MAD for the MAD rule, percent for the deviation rule.
    pub deviation_score: f64,
    /// Percent distance from the median, regardless of the rule that fired.
    pub deviation_pct: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusInfo {
    /// 0.0-1.0
    pub agreement: f64,
    pub participant_count: usize,
    pub threshold_met: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub feed_id: FeedId,
    pub aggregated_price: Price,
    pub price_decimals: u32,
    pub method: AggregationMethod,
    /// Sorted by provider name.
    pub sources: Vec<AggregationSource>,
    /// 0-100
    pub confidence: f64,
    pub statistics: Statistics,
    pub outliers: Vec<OutlierRecord>,
    pub consensus: ConsensusInfo,
    pub timestamp: Timestamp,
    pub processing_time_ms: u64,
    /// 0-100
    pub quality_score: u8,
}

impl AggregationResult {
    pub fn included_sources(&self) -> impl Iterator<Item = &AggregationSource> {
        self.sources.iter().filter(|s| s.included)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AggregateResponse {
    pub result: Arc<AggregationResult>,
    pub from_cache: bool,
    pub response_time_ms: u64,
}
