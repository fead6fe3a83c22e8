use crate::config::ConsensusConfig;
use crate::price_infra::statistics;
use crate::types::aggregation::ConsensusInfo;
use crate::types::price::Price;

/// Measures how tightly the included prices cluster around the aggregate.
#[derive(Clone, Debug)]
pub struct ConsensusEvaluator {
    config: ConsensusConfig,
}

impl ConsensusEvaluator {
    pub fn new(config: ConsensusConfig) -> Self {
        ConsensusEvaluator { config }
    }

    /// `included_prices` must be sorted ascending.
    pub fn evaluate(&self, aggregated_price: Price, included_prices: &[f64]) -> ConsensusInfo {
        let participant_count = included_prices.len();
        let price = aggregated_price.to_f64();

        let agreement = if participant_count == 0 || price <= 0.0 {
            0.0
        } else {
            (1.0 - statistics::std_dev(included_prices) / price).clamp(0.0, 1.0)
        };

        ConsensusInfo {
            agreement,
            participant_count,
            threshold_met: participant_count >= self.config.min_participants
                && agreement >= self.config.min_agreement,
        }
    }
}

/// 0-100. Weighs agreement over confidence and halves the score when the
/// consensus threshold is missed.
pub fn quality_score(consensus: &ConsensusInfo, confidence: f64) -> u8 {
    let agreement = consensus.agreement.clamp(0.0, 1.0);
    let confidence = (confidence / 100.0).clamp(0.0, 1.0);

    let mut score = 100.0 * (0.6 * agreement + 0.4 * confidence);
    if !consensus.threshold_met {
        score /= 2.0;
    }
    score.round().clamp(0.0, 100.0) as u8
}
