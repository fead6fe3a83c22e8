use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
    core::Collector,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Aggregation metrics
    pub static ref AGGREGATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_aggregations_total", "Aggregation requests by outcome"),
        &["feed_id", "outcome"]
    ).expect("valid metric definition");

    pub static ref OUTLIERS_DETECTED: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_outliers_detected_total", "Observations excluded as statistical outliers"),
        &["feed_id", "source"]
    ).expect("valid metric definition");

    pub static ref SOURCE_EXCLUSIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_source_exclusions_total", "Sources excluded from a round by error code"),
        &["feed_id", "source", "code"]
    ).expect("valid metric definition");

    // Cache metrics
    pub static ref CACHE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_cache_hits_total", "Requests served from the result cache"),
        &["feed_id"]
    ).expect("valid metric definition");

    pub static ref CACHE_MISSES: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_cache_misses_total", "Cacheable requests that had to aggregate"),
        &["feed_id"]
    ).expect("valid metric definition");

    // Circuit breaker metrics
    pub static ref BREAKER_TRANSITIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("oracle_breaker_transitions_total", "Circuit breaker state changes"),
        &["feed_id", "source", "to"]
    ).expect("valid metric definition");

    // Latency metrics
    pub static ref AGGREGATION_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "oracle_aggregation_latency_seconds",
            "End-to-end aggregation latency"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["feed_id"]
    ).expect("valid metric definition");

    pub static ref FETCH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "oracle_fetch_latency_seconds",
            "Per-source fetch latency, retries included"
        ).buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        &["source"]
    ).expect("valid metric definition");
}

fn collectors() -> Vec<Box<dyn Collector>> {
    vec![
        Box::new(AGGREGATIONS_TOTAL.clone()),
        Box::new(OUTLIERS_DETECTED.clone()),
        Box::new(SOURCE_EXCLUSIONS.clone()),
        Box::new(CACHE_HITS.clone()),
        Box::new(CACHE_MISSES.clone()),
        Box::new(BREAKER_TRANSITIONS.clone()),
        Box::new(AGGREGATION_LATENCY.clone()),
        Box::new(FETCH_LATENCY.clone()),
    ]
}

/// Registers every collector with [`REGISTRY`]. Safe to call more than once.
pub fn register_metrics() -> prometheus::Result<()> {
    for collector in collectors() {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Text exposition of [`REGISTRY`].
pub fn gather_text() -> prometheus::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        register_metrics().unwrap();
        register_metrics().unwrap();

        AGGREGATIONS_TOTAL.with_label_values(&["ETH-USD", "success"]).inc();
        let text = gather_text().unwrap();
        assert!(text.contains("oracle_aggregations_total"));
    }
}
