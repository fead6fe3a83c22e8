use crate::config::ValidationRules;
use crate::error::{Error, Result};
use crate::types::ids::FeedId;
use crate::types::observation::Observation;
use crate::types::price::Price;
use crate::types::timestamp::Timestamp;

/// Stateless per-observation checks. The first violated rule wins.
#[derive(Clone, Debug)]
pub struct ObservationValidator {
    max_clock_skew_ms: u64,
}

impl ObservationValidator {
    pub fn new(max_clock_skew_ms: u64) -> Self {
        ObservationValidator { max_clock_skew_ms }
    }

    pub fn validate(
        &self,
        observation: &Observation,
        expected_feed: &FeedId,
        rules: &ValidationRules,
        reference: Option<Price>,
        now: Timestamp,
    ) -> Result<()> {
        self.validate_structure(observation, expected_feed, now)?;
        self.validate_bounds(observation, rules)?;
        self.validate_freshness(observation, rules, now)?;
        self.validate_confidence(observation, rules)?;
        if let Some(reference) = reference {
            self.validate_deviation(observation, rules, reference)?;
        }
        Ok(())
    }

    fn validate_structure(
        &self,
        observation: &Observation,
        expected_feed: &FeedId,
        now: Timestamp,
    ) -> Result<()> {
        let invalid = |reason: String| Error::InvalidObservation {
            provider: observation.source_name.clone(),
            reason,
        };

        if &observation.feed_id != expected_feed {
            return Err(invalid(format!(
                "observation is for {}, expected {}",
                observation.feed_id, expected_feed
            )));
        }
        if !observation.price.is_positive() {
            return Err(invalid(format!("non-positive price {}", observation.price)));
        }
        if observation.confidence > 100 {
            return Err(invalid(format!("confidence {} above 100", observation.confidence)));
        }
        let ahead_ms = observation.timestamp.as_millis().saturating_sub(now.as_millis());
        if ahead_ms > self.max_clock_skew_ms {
            return Err(invalid(format!("timestamp {}ms in the future", ahead_ms)));
        }
        Ok(())
    }

    fn validate_bounds(&self, observation: &Observation, rules: &ValidationRules) -> Result<()> {
        let price = observation.price.to_f64();
        if price < rules.min_price || price > rules.max_price {
            return Err(Error::PriceOutOfBounds {
                provider: observation.source_name.clone(),
                price,
                min: rules.min_price,
                max: rules.max_price,
            });
        }
        Ok(())
    }

    fn validate_freshness(
        &self,
        observation: &Observation,
        rules: &ValidationRules,
        now: Timestamp,
    ) -> Result<()> {
        let age_ms = now.saturating_since(observation.timestamp).as_millis() as u64;
        let max_age_ms = rules.max_age_seconds.saturating_mul(1000);
        if age_ms > max_age_ms {
            return Err(Error::StaleData {
                provider: observation.source_name.clone(),
                age_ms,
                max_age_ms,
            });
        }
        Ok(())
    }

    fn validate_confidence(&self, observation: &Observation, rules: &ValidationRules) -> Result<()> {
        if observation.confidence < rules.min_confidence {
            return Err(Error::LowConfidence {
                provider: observation.source_name.clone(),
                confidence: observation.confidence,
                min_confidence: rules.min_confidence,
            });
        }
        Ok(())
    }

    fn validate_deviation(
        &self,
        observation: &Observation,
        rules: &ValidationRules,
        reference: Price,
    ) -> Result<()> {
        let Some(deviation_pct) = observation.price.deviation_pct(reference) else {
            return Ok(());
        };
        if deviation_pct > rules.max_deviation_pct {
            return Err(Error::PriceDeviation {
                provider: observation.source_name.clone(),
                deviation_pct,
                max_deviation_pct: rules.max_deviation_pct,
            });
        }
        Ok(())
    }
}

impl Default for ObservationValidator {
    fn default() -> Self {
        Self::new(5_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, Severity};
    use std::time::Duration;

    fn now() -> Timestamp {
        Timestamp::from_secs(1_700_000_000)
    }

    fn feed() -> FeedId {
        FeedId::parse("ETH-USD").unwrap()
    }

    fn rules() -> ValidationRules {
        ValidationRules {
            min_price: 100.0,
            max_price: 10_000.0,
            max_deviation_pct: 10.0,
            max_age_seconds: 60,
            min_confidence: 70,
        }
    }

    fn observation(price: f64) -> Observation {
        Observation::new(feed(), "chainlink", Price::from_f64(price), now()).with_confidence(90)
    }

    fn check(obs: &Observation, reference: Option<Price>) -> Result<()> {
        ObservationValidator::default().validate(obs, &feed(), &rules(), reference, now())
    }

    #[test]
    fn test_valid_observation_passes() {
        assert!(check(&observation(3000.0), Some(Price::from_f64(3050.0))).is_ok());
    }

    #[test]
    fn test_out_of_bounds() {
        let err = check(&observation(50.0), None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataValidationError);

        let err = check(&observation(20_000.0), None).unwrap_err();
        assert!(matches!(err, Error::PriceOutOfBounds { .. }));
    }

    #[test]
    fn test_staleness_boundary() {
        let mut at_limit = observation(3000.0);
        at_limit.timestamp = now() - Duration::from_secs(60);
        assert!(check(&at_limit, None).is_ok());

        let mut over_limit = observation(3000.0);
        over_limit.timestamp = now() - Duration::from_secs(61);
        let err = check(&over_limit, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleDataError);
        assert_eq!(err.severity(), Severity::Low);
    }

    #[test]
    fn test_low_confidence() {
        let obs = observation(3000.0).with_confidence(50);
        let err = check(&obs, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LowConfidenceError);
    }

    #[test]
    fn test_deviation_from_reference() {
        let err = check(&observation(3400.0), Some(Price::from_f64(3000.0))).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PriceDeviationError);
        assert_eq!(err.severity(), Severity::Medium);

        let err = check(&observation(9000.0), Some(Price::from_f64(3000.0))).unwrap_err();
        assert_eq!(err.severity(), Severity::Critical);
    }

    #[test]
    fn test_checks_short_circuit_in_order() {
        // Out of bounds, stale and low confidence all at once: bounds wins.
        let mut obs = observation(50.0).with_confidence(10);
        obs.timestamp = now() - Duration::from_secs(3600);
        let err = check(&obs, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataValidationError);

        // Stale and low confidence: staleness wins.
        let mut obs = observation(3000.0).with_confidence(10);
        obs.timestamp = now() - Duration::from_secs(3600);
        let err = check(&obs, None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::StaleDataError);
    }

    #[test]
    fn test_structural_checks() {
        let mut wrong_feed = observation(3000.0);
        wrong_feed.feed_id = FeedId::parse("BTC-USD").unwrap();
        assert!(matches!(check(&wrong_feed, None), Err(Error::InvalidObservation { .. })));

        let over_confident = observation(3000.0).with_confidence(101);
        assert!(matches!(check(&over_confident, None), Err(Error::InvalidObservation { .. })));

        let mut future = observation(3000.0);
        future.timestamp = now() + Duration::from_secs(60);
        assert!(matches!(check(&future, None), Err(Error::InvalidObservation { .. })));
    }
}
