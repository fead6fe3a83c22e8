use std::cmp::Ordering;
use std::collections::BTreeMap;
use crate::config::AggregationConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::price_infra::statistics;
use crate::types::aggregation::{
    AggregationMethod, AggregationSource, ExclusionReason, OutlierReason, OutlierRecord, Statistics,
};
use crate::types::ids::FeedId;
use crate::types::observation::Observation;
use crate::types::price::Price;

/// Aggregator output before consensus and request metadata are attached.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationOutcome {
    pub aggregated_price: Price,
    pub method: AggregationMethod,
    /// One entry per input observation, sorted by provider.
    pub sources: Vec<AggregationSource>,
    pub confidence: f64,
    /// Over every input observation, outliers included.
    pub statistics: Statistics,
    pub outliers: Vec<OutlierRecord>,
    /// Prices of the included observations, ascending.
    pub included_prices: Vec<f64>,
}

/// Combines validated observations into one price. Pure: the same set of
/// observations always yields the same outcome, whatever their order.
#[derive(Clone, Debug)]
pub struct PriceAggregator {
    config: AggregationConfig,
}

impl PriceAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        PriceAggregator { config }
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn aggregate(
        &self,
        feed_id: &FeedId,
        observations: &[Observation],
        max_deviation_pct: f64,
    ) -> Result<AggregationOutcome> {
        let required = self.config.min_sources;
        if observations.len() < required {
            return Err(Error::InsufficientSources {
                feed_id: feed_id.to_string(),
                available: observations.len(),
                required,
            });
        }

        // Step 1: Canonical order, independent of arrival order
        let ordered = canonical_order(observations);

        // Step 2: Dispersion over every observation
        let raw_prices: Vec<f64> = ordered.iter().map(|o| o.price.to_f64()).collect();
        let statistics = statistics::dispersion(&raw_prices);

        // Step 3: Outliers relative to the median
        let (included, outliers) = self.partition_outliers(&ordered, &raw_prices, statistics.mad, max_deviation_pct);

        if included.len() < required {
            return Err(Error::InsufficientSources {
                feed_id: feed_id.to_string(),
                available: included.len(),
                required,
            });
        }

        // Step 4: Price and per-source weights
        let included_prices: Vec<f64> = included.iter().map(|o| o.price.to_f64()).collect();
        let (price, weights) = self.combine(&included, &included_prices);

        let aggregated_price = Price::from_f64(price);
        if !aggregated_price.is_positive() {
            return Err(Error::InsufficientSources {
                feed_id: feed_id.to_string(),
                available: 0,
                required,
            });
        }

        // Step 5: Confidence, penalized by the outlier share
        let weighted_confidence: f64 = included
            .iter()
            .zip(&weights)
            .map(|(o, w)| o.confidence as f64 * w)
            .sum();
        let outlier_share = outliers.len() as f64 / ordered.len() as f64;
        let confidence = (weighted_confidence * (1.0 - outlier_share)).clamp(0.0, 100.0);

        let mut sources: Vec<AggregationSource> = included
            .iter()
            .zip(&weights)
            .map(|(o, w)| AggregationSource {
                provider: o.source_name.clone(),
                price: Some(o.price),
                weight: *w,
                confidence: Some(o.confidence),
                included: true,
                exclusion_reason: None,
            })
            .collect();

        for outlier in &outliers {
            let confidence = ordered
                .iter()
                .find(|o| o.source_name == outlier.provider && o.price == outlier.price)
                .map(|o| o.confidence);
            sources.push(AggregationSource::excluded(
                outlier.provider.clone(),
                Some(outlier.price),
                confidence,
                ExclusionReason {
                    code: ErrorCode::PriceDeviationError,
                    message: format!("{} (score {:.2})", outlier.reason, outlier.deviation_score),
                },
            ));
        }
        sources.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.price.cmp(&b.price)));

        Ok(AggregationOutcome {
            aggregated_price,
            method: self.config.method,
            sources,
            confidence,
            statistics,
            outliers,
            included_prices,
        })
    }

    /// Outliers `aggregate` flags for these observations, including when
    /// the survivors then fall short of quorum. Empty when the input is
    /// already below quorum, since no partition happens then.
    pub fn outliers(&self, observations: &[Observation], max_deviation_pct: f64) -> Vec<OutlierRecord> {
        if observations.len() < self.config.min_sources {
            return Vec::new();
        }
        let ordered = canonical_order(observations);
        let prices: Vec<f64> = ordered.iter().map(|o| o.price.to_f64()).collect();
        let mad = statistics::mad(&prices);
        self.partition_outliers(&ordered, &prices, mad, max_deviation_pct).1
    }

    fn partition_outliers<'a>(
        &self,
        ordered: &[&'a Observation],
        sorted_prices: &[f64],
        mad: f64,
        max_deviation_pct: f64,
    ) -> (Vec<&'a Observation>, Vec<OutlierRecord>) {
        let center = statistics::median(sorted_prices);
        let mad_limit = self.config.outlier_mad_k * mad;

        let mut included = Vec::with_capacity(ordered.len());
        let mut outliers = Vec::new();

        for (observation, price) in ordered.iter().zip(sorted_prices) {
            let deviation = (price - center).abs();
            let deviation_pct = if center > 0.0 { deviation / center * 100.0 } else { 0.0 };

            // A zero MAD means most sources agree exactly; only the
            // percentage rule applies then.
            let verdict = if mad > 0.0 && deviation > mad_limit {
                Some((OutlierReason::MadThreshold, deviation / mad))
            } else if deviation_pct > max_deviation_pct {
                Some((OutlierReason::MaxDeviation, deviation_pct))
            } else {
                None
            };

            match verdict {
                Some((reason, deviation_score)) => {
                    tracing::debug!(
                        provider = %observation.source_name,
                        price = %observation.price,
                        %reason,
                        deviation_score,
                        "Outlier excluded"
                    );
                    outliers.push(OutlierRecord {
                        provider: observation.source_name.clone(),
                        price: observation.price,
                        reason,
                        deviation_score,
                        deviation_pct,
                    });
                }
                None => included.push(*observation),
            }
        }

        (included, outliers)
    }

    /// Returns the aggregated price and one weight per included observation.
    fn combine(&self, included: &[&Observation], prices: &[f64]) -> (f64, Vec<f64>) {
        let n = prices.len();
        let equal = vec![1.0 / n as f64; n];

        match self.config.method {
            AggregationMethod::Median => (statistics::median(prices), equal),
            AggregationMethod::Mean => (statistics::mean(prices), equal),
            AggregationMethod::WeightedAverage => {
                let total: f64 = included.iter().map(|o| o.confidence as f64).sum();
                if total <= 0.0 {
                    return (statistics::mean(prices), equal);
                }
                let weights: Vec<f64> = included.iter().map(|o| o.confidence as f64 / total).collect();
                let price = prices.iter().zip(&weights).map(|(p, w)| p * w).sum();
                (price, weights)
            }
            AggregationMethod::TrimmedMean => {
                let mut trim = (n as f64 * self.config.trim_pct / 100.0).floor() as usize;
                if trim * 2 >= n {
                    trim = (n - 1) / 2;
                }
                let kept = &prices[trim..n - trim];
                let share = 1.0 / kept.len() as f64;
                let weights = (0..n)
                    .map(|i| if i >= trim && i < n - trim { share } else { 0.0 })
                    .collect();
                (statistics::mean(kept), weights)
            }
            AggregationMethod::Mode => {
                let precision = self.config.mode_precision;
                let mut buckets: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
                for (i, price) in prices.iter().enumerate() {
                    buckets.entry((price / precision).round() as i64).or_default().push(i);
                }

                // Ascending iteration plus strict comparison keeps the lowest
                // bucket on ties.
                let mut winner: &[usize] = &[];
                for members in buckets.values() {
                    if members.len() > winner.len() {
                        winner = members;
                    }
                }

                let share = 1.0 / winner.len() as f64;
                let mut weights = vec![0.0; n];
                for &i in winner {
                    weights[i] = share;
                }
                let price = winner.iter().map(|&i| prices[i]).sum::<f64>() * share;
                (price, weights)
            }
        }
    }
}

fn canonical_order(observations: &[Observation]) -> Vec<&Observation> {
    let mut ordered: Vec<&Observation> = observations.iter().collect();
    ordered.sort_by(|a, b| compare_observations(a, b));
    ordered
}

fn compare_observations(a: &Observation, b: &Observation) -> Ordering {
    a.price
        .cmp(&b.price)
        .then_with(|| a.source_name.cmp(&b.source_name))
        .then_with(|| a.timestamp.cmp(&b.timestamp))
}
