use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use crate::error::{Error, Result};
use crate::price_infra::adapters::FeedAdapter;
use crate::price_infra::FetchContext;
use crate::types::ids::FeedId;
use crate::types::observation::Observation;
use crate::types::price::Price;
use crate::types::timestamp::Clock;

/// One scripted reply.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Price {
        price: f64,
        confidence: u8,
        /// How old the observation is when returned
        age: Duration,
    },
    Fail(Error),
}

impl MockResponse {
    pub fn price(price: f64) -> Self {
        MockResponse::Price {
            price,
            confidence: 100,
            age: Duration::ZERO,
        }
    }
}

/// Scriptable adapter for tests and local runs.
///
/// Replies are taken from a queue; once it is empty the default reply is
/// repeated.
pub struct MockAdapter {
    source_name: String,
    clock: Arc<dyn Clock>,
    script: Mutex<VecDeque<MockResponse>>,
    default: Mutex<MockResponse>,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    round: AtomicU64,
}

impl MockAdapter {
    pub fn new(source_name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let source_name = source_name.into();
        MockAdapter {
            default: Mutex::new(MockResponse::Fail(Error::Network {
                provider: source_name.clone(),
                reason: "no scripted response".to_string(),
            })),
            source_name,
            clock,
            script: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            round: AtomicU64::new(0),
        }
    }

    /// Adapter that always returns `price` with full confidence.
    pub fn with_price(source_name: impl Into<String>, price: f64, clock: Arc<dyn Clock>) -> Self {
        let adapter = Self::new(source_name, clock);
        adapter.set_default(MockResponse::price(price));
        adapter
    }

    /// Adapter that always fails with `error`.
    pub fn failing(source_name: impl Into<String>, error: Error, clock: Arc<dyn Clock>) -> Self {
        let adapter = Self::new(source_name, clock);
        adapter.set_default(MockResponse::Fail(error));
        adapter
    }

    pub fn set_default(&self, response: MockResponse) {
        *self.default.lock() = response;
    }

    /// Queues a reply used before the default.
    pub fn push(&self, response: MockResponse) -> &Self {
        self.script.lock().push_back(response);
        self
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn next_response(&self) -> MockResponse {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone())
    }
}

#[async_trait]
impl FeedAdapter for MockAdapter {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    async fn fetch(&self, _ctx: &FetchContext, feed_id: &FeedId) -> Result<Observation> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_response() {
            MockResponse::Price { price, confidence, age } => {
                let round_id = self.round.fetch_add(1, Ordering::SeqCst) + 1;
                let timestamp = self.clock.now() - age;
                Ok(
                    Observation::new(feed_id.clone(), &self.source_name, Price::from_f64(price), timestamp)
                        .with_confidence(confidence)
                        .with_round_id(round_id),
                )
            }
            MockResponse::Fail(error) => Err(error),
        }
    }
}
