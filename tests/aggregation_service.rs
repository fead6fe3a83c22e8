use std::sync::Arc;
use std::time::Duration;
use oracle_infra::config::OracleConfig;
use oracle_infra::error::{Error, ErrorCode, OracleError};
use oracle_infra::price_infra::adapters::{MockAdapter, MockResponse};
use oracle_infra::price_infra::circuit_breaker::BreakerState;
use oracle_infra::price_infra::{AggregateRequest, CancelSignal, FeedAdapter, OracleService};
use oracle_infra::types::aggregation::{AggregationMethod, OutlierReason};
use oracle_infra::types::ids::FeedId;
use oracle_infra::types::timestamp::{Clock, ManualClock, Timestamp};

struct Harness {
    clock: Arc<ManualClock>,
    service: OracleService,
    adapters: Vec<Arc<MockAdapter>>,
}

impl Harness {
    fn adapter(&self, name: &str) -> &MockAdapter {
        self.adapters
            .iter()
            .find(|a| a.source_name() == name)
            .unwrap()
    }

    fn fetch_counts(&self) -> Vec<usize> {
        self.adapters.iter().map(|a| a.fetch_count()).collect()
    }
}

fn eth() -> FeedId {
    FeedId::parse("ETH-USD").unwrap()
}

fn harness(config: OracleConfig, prices: &[(&str, f64)]) -> Harness {
    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000)));
    let adapters: Vec<Arc<MockAdapter>> = prices
        .iter()
        .map(|(name, price)| Arc::new(MockAdapter::with_price(*name, *price, clock.clone())))
        .collect();

    let mut builder = OracleService::builder(config).with_clock(clock.clone());
    for adapter in &adapters {
        builder = builder.with_adapter(eth(), adapter.clone());
    }

    Harness {
        clock,
        service: builder.build().unwrap(),
        adapters,
    }
}

fn eth_scenario() -> Harness {
    harness(
        OracleConfig::default(),
        &[
            ("chainlink", 3000.0),
            ("pyth", 3005.0),
            ("band", 2998.0),
            ("api3", 3010.0),
            ("dia", 50000.0),
        ],
    )
}

fn no_retries() -> OracleConfig {
    let mut config = OracleConfig::default();
    config.fetch.max_retries = 0;
    config
}

#[tokio::test]
async fn test_eth_usd_end_to_end() {
    let h = eth_scenario();
    let response = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();
    let result = &response.result;

    assert!(!response.from_cache);
    assert_eq!(result.method, AggregationMethod::Median);
    let price = result.aggregated_price.to_f64();
    assert!((3000.0..=3005.0).contains(&price), "price {}", price);

    assert_eq!(result.outliers.len(), 1);
    assert_eq!(result.outliers[0].provider, "dia");
    assert_eq!(result.outliers[0].reason, OutlierReason::MadThreshold);

    assert!(result.consensus.threshold_met);
    assert_eq!(result.consensus.participant_count, 4);
    assert!(result.quality_score > 80);

    let names: Vec<&str> = result.sources.iter().map(|s| s.provider.as_str()).collect();
    assert_eq!(names, vec!["api3", "band", "chainlink", "dia", "pyth"]);

    let included_weight: f64 = result.included_sources().map(|s| s.weight).sum();
    assert!((included_weight - 1.0).abs() < 1e-9);

    // A 1500% deviation is manipulation-grade: the breaker opens at once.
    let snapshots = h.service.breaker_snapshots(&eth()).unwrap();
    let dia = snapshots.iter().find(|s| s.source_name == "dia").unwrap();
    assert_eq!(dia.state, BreakerState::Open);
    assert!(snapshots.iter().filter(|s| s.source_name != "dia").all(|s| s.state == BreakerState::Closed));
}

#[tokio::test]
async fn test_cache_hit_makes_no_fetches() {
    let h = eth_scenario();

    h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();
    let after_first = h.fetch_counts();

    let cached = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();
    assert!(cached.from_cache);
    assert_eq!(h.fetch_counts(), after_first);

    let stats = h.service.cache_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.active, 1);
}

#[tokio::test]
async fn test_cache_expires_and_overrides_bypass_it() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0)],
    );
    h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();

    let overridden = h
        .service
        .aggregate(AggregateRequest::new(eth()).with_min_confidence(50))
        .await
        .unwrap();
    assert!(!overridden.from_cache);
    assert_eq!(h.adapter("a").fetch_count(), 2);

    let uncached = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert!(!uncached.from_cache);

    h.clock.advance(Duration::from_secs(1));
    let expired = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();
    assert!(!expired.from_cache);
    assert_eq!(h.adapter("a").fetch_count(), 4);
}

#[tokio::test]
async fn test_quorum_not_met() {
    let h = harness(OracleConfig::default(), &[("a", 3000.0), ("b", 3001.0)]);

    let err = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AggregationError);
    assert!(matches!(err, Error::InsufficientSources { available: 2, required: 3, .. }));

    let wire = OracleError::from_error(&err, h.clock.now());
    assert_eq!(wire.code, ErrorCode::AggregationError);
    assert!(!wire.recovery_actions.is_empty());
}

#[tokio::test]
async fn test_stale_source_excluded_unless_tolerance_widened() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("d", 3003.0)],
    );
    h.adapter("d").set_default(MockResponse::Price {
        price: 3003.0,
        confidence: 100,
        age: Duration::from_secs(600),
    });

    let response = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();
    let d = response.result.sources.iter().find(|s| s.provider == "d").unwrap();
    assert!(!d.included);
    assert_eq!(d.exclusion_reason.as_ref().unwrap().code, ErrorCode::StaleDataError);

    let widened = h
        .service
        .aggregate(AggregateRequest::new(eth()).with_max_staleness_secs(900))
        .await
        .unwrap();
    assert_eq!(widened.result.consensus.participant_count, 4);
}

#[tokio::test]
async fn test_deviation_from_reference_excluded() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("d", 3001.0)],
    );
    h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();

    // 13% away from the last accepted price
    h.adapter("d").set_default(MockResponse::price(3400.0));
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();

    let d = response.result.sources.iter().find(|s| s.provider == "d").unwrap();
    assert_eq!(d.exclusion_reason.as_ref().unwrap().code, ErrorCode::PriceDeviationError);
    assert_eq!(response.result.consensus.participant_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_slow_source_times_out() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("slow", 3001.0)],
    );
    h.adapter("slow").set_delay(Some(Duration::from_secs(10)));

    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).with_timeout_ms(1_000))
        .await
        .unwrap();

    let slow = response.result.sources.iter().find(|s| s.provider == "slow").unwrap();
    assert!(!slow.included);
    assert_eq!(slow.exclusion_reason.as_ref().unwrap().code, ErrorCode::NetworkError);
    assert!(response.response_time_ms >= 1_000);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_leaves_breakers_untouched() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0)],
    );
    for adapter in &h.adapters {
        adapter.set_delay(Some(Duration::from_secs(3)));
    }

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = h
        .service
        .aggregate_with_cancel(AggregateRequest::new(eth()), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(err.code(), ErrorCode::NetworkError);
    assert_eq!(err.context()["cancelled"], serde_json::json!(true));

    for snapshot in h.service.breaker_snapshots(&eth()).unwrap() {
        assert_eq!(snapshot.total_failures, 0);
        assert_eq!(snapshot.total_successes, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_keeps_failures_already_recorded() {
    let h = harness(
        no_retries(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("bad", 3001.0)],
    );
    for name in ["a", "b", "c"] {
        h.adapter(name).set_delay(Some(Duration::from_secs(3)));
    }
    h.adapter("bad").set_default(MockResponse::Fail(Error::Network {
        provider: "bad".to_string(),
        reason: "connection refused".to_string(),
    }));

    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = h
        .service
        .aggregate_with_cancel(AggregateRequest::new(eth()), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(h.adapter("bad").fetch_count(), 1);

    for snapshot in h.service.breaker_snapshots(&eth()).unwrap() {
        let expected_failures = if snapshot.source_name == "bad" { 1 } else { 0 };
        assert_eq!(snapshot.total_failures, expected_failures, "{}", snapshot.source_name);
        assert_eq!(snapshot.total_successes, 0);
    }
}

fn move_all(h: &Harness, by: f64) {
    for adapter in &h.adapters {
        let price = match adapter.source_name() {
            "a" => 3000.0,
            "b" => 3001.0,
            _ => 3002.0,
        };
        adapter.set_default(MockResponse::price(price + by));
    }
}

#[tokio::test]
async fn test_expired_reference_lets_genuine_move_through() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0)],
    );
    h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();

    // Every source moves 13%, past the 10% allowed against the reference.
    move_all(&h, 400.0);
    let err = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AggregationError);

    // ETH-USD tolerates 300s of staleness; the reference ages out with it.
    h.clock.advance(Duration::from_secs(301));
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert_eq!(response.result.aggregated_price.to_f64(), 3401.0);
    assert_eq!(h.service.reference_price(&eth()), Some(response.result.aggregated_price));
}

#[tokio::test]
async fn test_breaker_reset_drops_reference_price() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0)],
    );
    h.service.aggregate(AggregateRequest::new(eth())).await.unwrap();

    move_all(&h, 400.0);
    assert!(h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .is_err());

    assert_eq!(h.service.reset_breakers(&eth()).unwrap(), 3);
    assert!(h.service.reference_price(&eth()).is_none());

    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert_eq!(response.result.consensus.participant_count, 3);
}

#[tokio::test]
async fn test_authentication_failure_aborts_request() {
    let h = harness(
        OracleConfig::default(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("locked", 3001.0)],
    );
    h.adapter("locked").set_default(MockResponse::Fail(Error::Authentication {
        provider: "locked".to_string(),
        reason: "api key revoked".to_string(),
    }));

    let err = h.service.aggregate(AggregateRequest::new(eth())).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationError);
}

#[tokio::test]
async fn test_failing_source_trips_then_recovers() {
    let h = harness(
        no_retries(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("flaky", 3001.0)],
    );
    h.adapter("flaky").set_default(MockResponse::Fail(Error::Network {
        provider: "flaky".to_string(),
        reason: "connection refused".to_string(),
    }));

    for _ in 0..3 {
        h.service
            .aggregate(AggregateRequest::new(eth()).without_cache())
            .await
            .unwrap();
    }
    assert_eq!(h.adapter("flaky").fetch_count(), 3);

    // Open: the source is skipped without a fetch.
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert_eq!(h.adapter("flaky").fetch_count(), 3);
    let flaky = response.result.sources.iter().find(|s| s.provider == "flaky").unwrap();
    assert_eq!(flaky.exclusion_reason.as_ref().unwrap().code, ErrorCode::CircuitBreakerError);

    // After the open timeout a healthy trial closes the breaker.
    h.adapter("flaky").set_default(MockResponse::price(3001.0));
    h.clock.advance(Duration::from_secs(30));
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert_eq!(response.result.consensus.participant_count, 4);

    let snapshots = h.service.breaker_snapshots(&eth()).unwrap();
    assert!(snapshots.iter().all(|s| s.state == BreakerState::Closed));
}

#[tokio::test]
async fn test_rate_limited_source_is_throttled() {
    let h = harness(
        no_retries(),
        &[("a", 3000.0), ("b", 3001.0), ("c", 3002.0), ("busy", 3001.0)],
    );
    h.adapter("busy").push(MockResponse::Fail(Error::RateLimited {
        provider: "busy".to_string(),
        retry_after_ms: 5_000,
    }));

    h.service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();

    assert_eq!(h.adapter("busy").fetch_count(), 1);
    let busy = response.result.sources.iter().find(|s| s.provider == "busy").unwrap();
    assert_eq!(busy.exclusion_reason.as_ref().unwrap().code, ErrorCode::RateLimitError);

    h.clock.advance(Duration::from_secs(5));
    let response = h
        .service
        .aggregate(AggregateRequest::new(eth()).without_cache())
        .await
        .unwrap();
    assert_eq!(response.result.consensus.participant_count, 4);
}

#[tokio::test]
async fn test_unknown_feed_is_configuration_error() {
    let h = eth_scenario();
    let request = AggregateRequest::new(FeedId::parse("SOL-USD").unwrap());

    let err = h.service.aggregate(request).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

#[tokio::test]
async fn test_invalid_request_rejected_before_fetching() {
    let h = eth_scenario();
    let request = AggregateRequest::new(eth()).with_timeout_ms(50);

    let err = h.service.aggregate(request).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DataValidationError);
    assert!(h.fetch_counts().iter().all(|c| *c == 0));
}
