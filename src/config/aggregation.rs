use serde::{Deserialize, Serialize};
use crate::types::aggregation::AggregationMethod;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub method: AggregationMethod,
    /// Quorum: validated, non-outlier observations needed for a price
    pub min_sources: usize,
    /// Outlier cut-off in multiples of the median absolute deviation
    pub outlier_mad_k: f64,
    /// Percent trimmed from each end for `trimmed_mean`
    pub trim_pct: f64,
    /// Bucket width in price units for `mode`
    pub mode_precision: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            method: AggregationMethod::Median,
            min_sources: 3,
            outlier_mad_k: 3.0,
            trim_pct: 10.0,
            mode_precision: 0.01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub min_participants: usize,
    /// 0.0-1.0
    pub min_agreement: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            min_participants: 3,
            min_agreement: 0.95,
        }
    }
}
