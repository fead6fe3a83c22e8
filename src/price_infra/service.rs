use std::collections::HashMap;
use std::sync::Arc;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;
use crate::config::{
    AppConfig, OracleConfig, ValidationPresets, ValidationRules, MAX_REQUEST_TIMEOUT_MS,
    MAX_STALENESS_SECS, MIN_REQUEST_TIMEOUT_MS,
};
use crate::error::{Error, Result};
use crate::observability::metrics::{
    AGGREGATIONS_TOTAL, AGGREGATION_LATENCY, CACHE_HITS, CACHE_MISSES, FETCH_LATENCY,
    OUTLIERS_DETECTED, SOURCE_EXCLUSIONS,
};
use crate::observability::tracing::{trace_aggregation, trace_fetch};
use crate::price_infra::adapters::{FeedAdapter, FixedPriceAdapter};
use crate::price_infra::aggregator::PriceAggregator;
use crate::price_infra::cache::{CacheStats, ResultCache};
use crate::price_infra::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry};
use crate::price_infra::consensus::{quality_score, ConsensusEvaluator};
use crate::price_infra::validator::ObservationValidator;
use crate::price_infra::{CancelSignal, FetchContext, SourceConfig};
use crate::types::aggregation::{
    AggregateResponse, AggregationResult, AggregationSource, ExclusionReason, OutlierRecord,
};
use crate::types::ids::{BreakerKey, FeedId, RequestId};
use crate::types::observation::Observation;
use crate::types::price::Price;
use crate::types::timestamp::{Clock, SystemClock, Timestamp};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AggregateRequest {
    pub feed_id: FeedId,
    /// Overrides the preset's `max_age_seconds` for this request
    #[serde(default)]
    pub max_staleness_secs: Option<u64>,
    /// Overrides the preset's `min_confidence` for this request
    #[serde(default)]
    pub min_confidence: Option<u8>,
    #[serde(default = "default_allow_cached")]
    pub allow_cached: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_allow_cached() -> bool {
    true
}

impl AggregateRequest {
    pub fn new(feed_id: FeedId) -> Self {
        AggregateRequest {
            feed_id,
            max_staleness_secs: None,
            min_confidence: None,
            allow_cached: true,
            timeout_ms: None,
        }
    }

    pub fn with_max_staleness_secs(mut self, secs: u64) -> Self {
        self.max_staleness_secs = Some(secs);
        self
    }

    pub fn with_min_confidence(mut self, confidence: u8) -> Self {
        self.min_confidence = Some(confidence);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.allow_cached = false;
        self
    }

    /// Requests that change validation rules neither read nor fill the cache.
    pub fn has_overrides(&self) -> bool {
        self.max_staleness_secs.is_some() || self.min_confidence.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(secs) = self.max_staleness_secs {
            if secs > MAX_STALENESS_SECS {
                return Err(Error::InvalidRequest(format!(
                    "max_staleness_secs {} exceeds {}", secs, MAX_STALENESS_SECS
                )));
            }
        }
        if let Some(confidence) = self.min_confidence {
            if confidence > 100 {
                return Err(Error::InvalidRequest(format!(
                    "min_confidence {} outside 0-100", confidence
                )));
            }
        }
        if let Some(timeout_ms) = self.timeout_ms {
            if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&timeout_ms) {
                return Err(Error::InvalidRequest(format!(
                    "timeout_ms {} outside {}-{}",
                    timeout_ms, MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS
                )));
            }
        }
        Ok(())
    }
}

/// A configured feed and the sources behind it.
#[derive(Clone, Debug, Serialize)]
pub struct FeedInfo {
    pub feed_id: FeedId,
    pub sources: Vec<String>,
    pub rules: Option<ValidationRules>,
    pub reference_price: Option<Price>,
}

type FetchOutcome = (String, Result<Observation>);

/// Last accepted aggregate for a feed, the anchor for deviation checks.
#[derive(Clone, Copy, Debug)]
struct ReferencePrice {
    price: Price,
    stored_at: Timestamp,
}

/// Entry point for price requests. Shared across tasks behind an `Arc`.
pub struct OracleService {
    config: OracleConfig,
    presets: ValidationPresets,
    adapters: HashMap<FeedId, Vec<Arc<dyn FeedAdapter>>>,
    breakers: CircuitBreakerRegistry,
    cache: ResultCache,
    reference_prices: DashMap<FeedId, ReferencePrice>,
    clock: Arc<dyn Clock>,
    validator: ObservationValidator,
    aggregator: PriceAggregator,
    consensus: ConsensusEvaluator,
}

impl OracleService {
    pub fn builder(config: OracleConfig) -> OracleServiceBuilder {
        OracleServiceBuilder::new(config)
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub async fn aggregate(&self, request: AggregateRequest) -> Result<AggregateResponse> {
        self.aggregate_with_cancel(request, CancelSignal::new()).await
    }

    /// Like [`aggregate`](Self::aggregate), abandoning in-flight fetches once
    /// `cancel` fires.
    pub async fn aggregate_with_cancel(
        &self,
        request: AggregateRequest,
        cancel: CancelSignal,
    ) -> Result<AggregateResponse> {
        let request_id = RequestId::new();
        let span = trace_aggregation(&request.feed_id, &request_id);
        let started = Instant::now();

        let outcome = self
            .run(&request, request_id, &cancel, started)
            .instrument(span)
            .await;

        let feed_label = request.feed_id.as_str();
        match &outcome {
            Ok(response) => {
                let label = if response.from_cache { "cached" } else { "success" };
                AGGREGATIONS_TOTAL.with_label_values(&[feed_label, label]).inc();
            }
            Err(error) => {
                tracing::warn!(feed_id = feed_label, %request_id, %error, "Aggregation failed");
                AGGREGATIONS_TOTAL.with_label_values(&[feed_label, error.code().as_str()]).inc();
            }
        }
        AGGREGATION_LATENCY
            .with_label_values(&[feed_label])
            .observe(started.elapsed().as_secs_f64());

        outcome
    }

    async fn run(
        &self,
        request: &AggregateRequest,
        request_id: RequestId,
        cancel: &CancelSignal,
        started: Instant,
    ) -> Result<AggregateResponse> {
        let feed_id = &request.feed_id;

        // Step 1: Request, rules and adapters
        request.validate()?;
        let rules = self.rules_for(request)?;
        let adapters = self.adapters_for(feed_id)?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled { feed_id: feed_id.to_string() });
        }

        // Step 2: Cache
        let cacheable = !request.has_overrides();
        if cacheable && request.allow_cached {
            if let Some(result) = self.cache.get(feed_id, self.clock.now()) {
                CACHE_HITS.with_label_values(&[feed_id.as_str()]).inc();
                return Ok(AggregateResponse {
                    result,
                    from_cache: true,
                    response_time_ms: started.elapsed().as_millis() as u64,
                });
            }
            CACHE_MISSES.with_label_values(&[feed_id.as_str()]).inc();
        }

        // Step 3: Breaker admission
        let now = self.clock.now();
        let mut excluded: Vec<AggregationSource> = Vec::new();
        let mut admitted: Vec<Arc<dyn FeedAdapter>> = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let key = BreakerKey::new(feed_id.clone(), adapter.source_name());
            match self.breakers.try_acquire(&key, now) {
                Ok(_) => admitted.push(adapter.clone()),
                Err(error) => excluded.push(exclude(feed_id, adapter.source_name(), &error, None)),
            }
        }

        // Step 4: Concurrent fetches bounded by the request deadline
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.fetch.default_timeout_ms);
        let deadline = started + std::time::Duration::from_millis(timeout_ms);

        let mut fetches: FuturesUnordered<_> = admitted
            .into_iter()
            .map(|adapter| {
                let ctx = FetchContext::new(request_id, deadline, cancel.clone());
                self.fetch_source(adapter, feed_id, ctx, timeout_ms)
            })
            .collect();

        // Step 5: Validation as each fetch lands. Breaker updates are
        // committed per source, so a later cancellation keeps them.
        let reference = self.reference_for(feed_id, &rules, self.clock.now());
        let mut observations: Vec<Observation> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(%feed_id, "Request cancelled, abandoning fetches");
                    return Err(Error::Cancelled { feed_id: feed_id.to_string() });
                }
                next = fetches.next() => match next {
                    Some(fetched) => {
                        if let Some(observation) = self.screen(feed_id, &rules, reference, fetched, &mut excluded)? {
                            observations.push(observation);
                        }
                    }
                    None => break,
                },
            }
        }
        drop(fetches);

        // Step 6: Aggregation and breaker bookkeeping
        let now = self.clock.now();
        let outcome = match self.aggregator.aggregate(feed_id, &observations, rules.max_deviation_pct) {
            Ok(outcome) => outcome,
            Err(error) => {
                let outliers = self.aggregator.outliers(&observations, rules.max_deviation_pct);
                let survivors = observations
                    .iter()
                    .map(|o| o.source_name.as_str())
                    .filter(|name| !outliers.iter().any(|outlier| outlier.provider == *name));
                self.record_verdicts(feed_id, survivors, &outliers, &rules, now);
                return Err(error);
            }
        };
        let included = outcome
            .sources
            .iter()
            .filter(|s| s.included)
            .map(|s| s.provider.as_str());
        self.record_verdicts(feed_id, included, &outcome.outliers, &rules, now);

        let consensus = self.consensus.evaluate(outcome.aggregated_price, &outcome.included_prices);
        let quality = quality_score(&consensus, outcome.confidence);

        let mut sources = outcome.sources;
        sources.extend(excluded);
        sources.sort_by(|a, b| a.provider.cmp(&b.provider));

        let result = Arc::new(AggregationResult {
            feed_id: feed_id.clone(),
            aggregated_price: outcome.aggregated_price,
            price_decimals: Price::DECIMALS,
            method: outcome.method,
            sources,
            confidence: outcome.confidence,
            statistics: outcome.statistics,
            outliers: outcome.outliers,
            consensus,
            timestamp: now,
            processing_time_ms: started.elapsed().as_millis() as u64,
            quality_score: quality,
        });

        // Step 7: Reference price and cache
        self.reference_prices.insert(
            feed_id.clone(),
            ReferencePrice { price: result.aggregated_price, stored_at: now },
        );
        if cacheable {
            self.cache.insert(result.clone(), now);
        }

        tracing::info!(
            %feed_id,
            price = %result.aggregated_price,
            method = %result.method,
            included = result.consensus.participant_count,
            outliers = result.outliers.len(),
            agreement = result.consensus.agreement,
            quality = result.quality_score,
            "Aggregated price"
        );

        Ok(AggregateResponse {
            result,
            from_cache: false,
            response_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Fetches one source, retrying network errors with exponential back-off
    /// while the deadline allows.
    async fn fetch_source(
        &self,
        adapter: Arc<dyn FeedAdapter>,
        feed_id: &FeedId,
        mut ctx: FetchContext,
        timeout_ms: u64,
    ) -> FetchOutcome {
        let source = adapter.source_name().to_string();
        let started = Instant::now();
        let fetch = &self.config.fetch;

        let result = loop {
            let attempt = tokio::time::timeout_at(ctx.deadline, adapter.fetch(&ctx, feed_id))
                .instrument(trace_fetch(&source, ctx.attempt))
                .await;

            let fetched = match attempt {
                Ok(fetched) => fetched,
                Err(_) => break Err(Error::Timeout { provider: source.clone(), timeout_ms }),
            };

            match fetched {
                Err(error @ Error::Network { .. }) if ctx.attempt < fetch.max_retries => {
                    let backoff = fetch.retry_backoff().saturating_mul(2u32.saturating_pow(ctx.attempt));
                    if Instant::now() + backoff >= ctx.deadline {
                        break Err(error);
                    }
                    tracing::debug!(source = %source, attempt = ctx.attempt, ?backoff, %error, "Retrying fetch");
                    tokio::time::sleep(backoff).await;
                    ctx.attempt += 1;
                }
                other => break other,
            }
        };

        FETCH_LATENCY
            .with_label_values(&[source.as_str()])
            .observe(started.elapsed().as_secs_f64());
        (source, result)
    }

    /// Validates one fetch result and commits any failure to the source's
    /// breaker. Fatal adapter errors abort the request.
    fn screen(
        &self,
        feed_id: &FeedId,
        rules: &ValidationRules,
        reference: Option<Price>,
        (source, fetched): FetchOutcome,
        excluded: &mut Vec<AggregationSource>,
    ) -> Result<Option<Observation>> {
        let key = BreakerKey::new(feed_id.clone(), source.as_str());
        let now = self.clock.now();

        let observation = match fetched {
            Ok(observation) => observation,
            Err(error) if error.is_fatal() => {
                self.breakers.record_failure(&key, &error, now);
                tracing::error!(%feed_id, source = %source, %error, "Fatal adapter error, aborting request");
                return Err(error);
            }
            Err(error) => {
                excluded.push(exclude(feed_id, &source, &error, None));
                self.breakers.record_failure(&key, &error, now);
                return Ok(None);
            }
        };

        match self.validator.validate(&observation, feed_id, rules, reference, now) {
            Ok(()) => Ok(Some(observation)),
            Err(error) => {
                excluded.push(exclude(feed_id, &source, &error, Some(&observation)));
                self.breakers.record_failure(&key, &error, now);
                Ok(None)
            }
        }
    }

    /// Successes for `included`, deviation failures for `outliers`.
    fn record_verdicts<'a>(
        &self,
        feed_id: &FeedId,
        included: impl IntoIterator<Item = &'a str>,
        outliers: &[OutlierRecord],
        rules: &ValidationRules,
        now: Timestamp,
    ) {
        for provider in included {
            let key = BreakerKey::new(feed_id.clone(), provider);
            self.breakers.record_success(&key, now);
        }

        for outlier in outliers {
            OUTLIERS_DETECTED
                .with_label_values(&[feed_id.as_str(), outlier.provider.as_str()])
                .inc();
            let key = BreakerKey::new(feed_id.clone(), outlier.provider.as_str());
            let error = Error::PriceDeviation {
                provider: outlier.provider.clone(),
                deviation_pct: outlier.deviation_pct,
                max_deviation_pct: rules.max_deviation_pct,
            };
            self.breakers.record_failure(&key, &error, now);
        }
    }

    /// The stored reference, unless it is older than the feed's staleness
    /// limit. An expired anchor would otherwise reject every source after a
    /// genuine move.
    fn reference_for(&self, feed_id: &FeedId, rules: &ValidationRules, now: Timestamp) -> Option<Price> {
        let reference = *self.reference_prices.get(feed_id)?.value();
        let max_age = std::time::Duration::from_secs(rules.max_age_seconds);
        if now.saturating_since(reference.stored_at) > max_age {
            tracing::debug!(%feed_id, stored_at = %reference.stored_at, "Reference price expired");
            return None;
        }
        Some(reference.price)
    }

    fn rules_for(&self, request: &AggregateRequest) -> Result<ValidationRules> {
        let mut rules = self.presets.rules_for(&request.feed_id).ok_or_else(|| {
            Error::ConfigError(format!("no validation rules for {}", request.feed_id))
        })?;
        if let Some(secs) = request.max_staleness_secs {
            rules.max_age_seconds = secs;
        }
        if let Some(confidence) = request.min_confidence {
            rules.min_confidence = confidence;
        }
        Ok(rules)
    }

    fn adapters_for(&self, feed_id: &FeedId) -> Result<&[Arc<dyn FeedAdapter>]> {
        match self.adapters.get(feed_id) {
            Some(adapters) if !adapters.is_empty() => Ok(adapters),
            _ => Err(Error::ConfigError(format!("no sources configured for {}", feed_id))),
        }
    }

    /// Configured feeds, sorted by id.
    pub fn feeds(&self) -> Vec<FeedInfo> {
        let mut feeds: Vec<FeedInfo> = self
            .adapters
            .iter()
            .map(|(feed_id, adapters)| FeedInfo {
                feed_id: feed_id.clone(),
                sources: adapters.iter().map(|a| a.source_name().to_string()).collect(),
                rules: self.presets.rules_for(feed_id),
                reference_price: self.reference_price(feed_id),
            })
            .collect();
        feeds.sort_by(|a, b| a.feed_id.cmp(&b.feed_id));
        feeds
    }

    pub fn reference_price(&self, feed_id: &FeedId) -> Option<Price> {
        self.reference_prices.get(feed_id).map(|entry| entry.value().price)
    }

    /// One snapshot per configured source, untouched breakers reported closed.
    pub fn breaker_snapshots(&self, feed_id: &FeedId) -> Result<Vec<BreakerSnapshot>> {
        let adapters = self.adapters_for(feed_id)?;
        let now = self.clock.now();

        let mut snapshots: Vec<BreakerSnapshot> = adapters
            .iter()
            .map(|adapter| {
                let key = BreakerKey::new(feed_id.clone(), adapter.source_name());
                self.breakers.snapshot(&key, now).unwrap_or_else(|| {
                    CircuitBreaker::new(key, self.config.circuit_breaker.clone()).snapshot(now)
                })
            })
            .collect();
        snapshots.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        Ok(snapshots)
    }

    pub fn reset_breakers(&self, feed_id: &FeedId) -> Result<usize> {
        self.adapters_for(feed_id)?;
        let reset = self.breakers.reset_feed(feed_id);
        // The old anchor may be what tripped the breakers.
        self.reference_prices.remove(feed_id);
        tracing::info!(%feed_id, reset, "Breakers and reference price reset by operator");
        Ok(reset)
    }

    pub fn invalidate_cache(&self, feed_id: &FeedId) -> bool {
        self.cache.invalidate(feed_id)
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats(self.clock.now())
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

fn exclude(
    feed_id: &FeedId,
    source: &str,
    error: &Error,
    observation: Option<&Observation>,
) -> AggregationSource {
    let code = error.code();
    SOURCE_EXCLUSIONS
        .with_label_values(&[feed_id.as_str(), source, code.as_str()])
        .inc();
    tracing::debug!(%feed_id, source, %code, %error, "Source excluded");

    AggregationSource::excluded(
        source,
        observation.map(|o| o.price),
        observation.map(|o| o.confidence),
        ExclusionReason {
            code,
            message: error.to_string(),
        },
    )
}

pub struct OracleServiceBuilder {
    config: OracleConfig,
    presets: ValidationPresets,
    adapters: HashMap<FeedId, Vec<Arc<dyn FeedAdapter>>>,
    sources: Vec<SourceConfig>,
    clock: Arc<dyn Clock>,
}

impl OracleServiceBuilder {
    pub fn new(config: OracleConfig) -> Self {
        OracleServiceBuilder {
            config,
            presets: ValidationPresets::default(),
            adapters: HashMap::new(),
            sources: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Engine settings, presets and configured sources from `app`.
    pub fn from_app_config(app: &AppConfig) -> Self {
        OracleServiceBuilder {
            presets: app.presets.clone(),
            sources: app.sources.clone(),
            ..Self::new(app.oracle.clone())
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_presets(mut self, presets: ValidationPresets) -> Self {
        self.presets = presets;
        self
    }

    pub fn with_rules(mut self, feed_id: FeedId, rules: ValidationRules) -> Self {
        self.presets.insert(feed_id, rules);
        self
    }

    pub fn with_adapter(mut self, feed_id: FeedId, adapter: Arc<dyn FeedAdapter>) -> Self {
        self.adapters.entry(feed_id).or_default().push(adapter);
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(mut self) -> Result<OracleService> {
        self.config.validate()?;
        self.presets.validate().map_err(Error::ConfigError)?;

        for source in self.sources.iter().filter(|s| s.enabled) {
            let adapter = FixedPriceAdapter::from_config(source, self.clock.clone())?;
            self.adapters
                .entry(source.feed_id.clone())
                .or_default()
                .push(Arc::new(adapter));
        }

        for (feed_id, adapters) in &self.adapters {
            let mut names: Vec<&str> = adapters.iter().map(|a| a.source_name()).collect();
            names.sort_unstable();
            if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
                return Err(Error::ConfigError(format!(
                    "source {} registered twice for {}", pair[0], feed_id
                )));
            }
        }

        tracing::info!(
            feeds = self.adapters.len(),
            sources = self.adapters.values().map(Vec::len).sum::<usize>(),
            "Oracle service built"
        );

        Ok(OracleService {
            breakers: CircuitBreakerRegistry::new(self.config.circuit_breaker.clone()),
            cache: ResultCache::new(self.config.fetch.cache_ttl()),
            reference_prices: DashMap::new(),
            validator: ObservationValidator::new(self.config.fetch.max_clock_skew_ms),
            aggregator: PriceAggregator::new(self.config.aggregation.clone()),
            consensus: ConsensusEvaluator::new(self.config.consensus.clone()),
            presets: self.presets,
            adapters: self.adapters,
            clock: self.clock,
            config: self.config,
        })
    }
}
