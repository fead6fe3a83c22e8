use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use async_trait::async_trait;
use crate::error::{Error, Result};
use crate::price_infra::adapters::FeedAdapter;
use crate::price_infra::{AdapterKind, FetchContext, SourceConfig};
use crate::types::ids::FeedId;
use crate::types::observation::Observation;
use crate::types::price::Price;
use crate::types::timestamp::Clock;

/// Reports a constant price for a single feed. Each fetch is a new round.
pub struct FixedPriceAdapter {
    source_name: String,
    feed_id: FeedId,
    price: Price,
    confidence: u8,
    clock: Arc<dyn Clock>,
    round: AtomicU64,
}

impl FixedPriceAdapter {
    pub fn new(
        source_name: impl Into<String>,
        feed_id: FeedId,
        price: Price,
        confidence: u8,
        clock: Arc<dyn Clock>,
    ) -> Self {
        FixedPriceAdapter {
            source_name: source_name.into(),
            feed_id,
            price,
            confidence,
            clock,
            round: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &SourceConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        match &config.adapter {
            AdapterKind::Fixed { price, confidence } => Ok(Self::new(
                config.source_name.clone(),
                config.feed_id.clone(),
                Price::from_f64(*price),
                *confidence,
                clock,
            )),
        }
    }
}

#[async_trait]
impl FeedAdapter for FixedPriceAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self, _ctx: &FetchContext, feed_id: &FeedId) -> Result<Observation> {
        if feed_id != &self.feed_id {
            return Err(Error::ConfigError(format!(
                "source {} serves {}, not {}", self.source_name, self.feed_id, feed_id
            )));
        }

        let round_id = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(
            Observation::new(feed_id.clone(), &self.source_name, self.price, self.clock.now())
                .with_confidence(self.confidence)
                .with_round_id(round_id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_infra::CancelSignal;
    use crate::types::ids::RequestId;
    use crate::types::timestamp::{ManualClock, Timestamp};
    use std::time::Duration;

    fn ctx() -> FetchContext {
        FetchContext::new(
            RequestId::new(),
            tokio::time::Instant::now() + Duration::from_secs(5),
            CancelSignal::new(),
        )
    }

    #[tokio::test]
    async fn test_rounds_increment() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
        let feed = FeedId::parse("ETH-USD").unwrap();
        let adapter = FixedPriceAdapter::new("desk", feed.clone(), Price::from_f64(3000.0), 95, clock.clone());

        let first = adapter.fetch(&ctx(), &feed).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let second = adapter.fetch(&ctx(), &feed).await.unwrap();

        assert_eq!(first.round_id, 1);
        assert_eq!(second.round_id, 2);
        assert_eq!(second.confidence, 95);
        assert_eq!(second.timestamp, Timestamp::from_secs(1_700_000_001));
    }

    #[tokio::test]
    async fn test_wrong_feed_is_configuration_error() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1)));
        let feed = FeedId::parse("ETH-USD").unwrap();
        let adapter = FixedPriceAdapter::new("desk", feed, Price::from_f64(3000.0), 95, clock);

        let other = FeedId::parse("BTC-USD").unwrap();
        let err = adapter.fetch(&ctx(), &other).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
