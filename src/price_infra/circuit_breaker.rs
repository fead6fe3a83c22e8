use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use crate::config::CircuitBreakerConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::observability::metrics::BREAKER_TRANSITIONS;
use crate::types::ids::{BreakerKey, FeedId};
use crate::types::timestamp::Timestamp;
use crate::utils::helper::{alert_operations_team_critical, alert_operations_team_warning};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Permission to fetch from a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open probe
    Trial,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TripReason {
    FailureThreshold { failures: u32 },
    SevereDeviation { deviation_pct: f64 },
    TrialFailed,
}

/// State machine for one `(feed, source)` pair. Callers hold the registry
/// lock for the whole read-modify-write.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    key: BreakerKey,
    config: CircuitBreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure_at: Option<Timestamp>,
    opened_at: Option<Timestamp>,
    next_attempt_at: Option<Timestamp>,
    current_timeout_ms: u64,
    trial_started_at: Option<Timestamp>,
    throttled_until: Option<Timestamp>,
    last_error: Option<ErrorCode>,
    last_trip: Option<TripReason>,
}

impl CircuitBreaker {
    pub fn new(key: BreakerKey, config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            current_timeout_ms: config.open_timeout_ms,
            key,
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure_at: None,
            opened_at: None,
            next_attempt_at: None,
            trial_started_at: None,
            throttled_until: None,
            last_error: None,
            last_trip: None,
        }
    }

    pub fn key(&self) -> &BreakerKey {
        &self.key
    }

    /// Stored state, without applying an elapsed open timeout.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// State as a caller would see it at `now`.
    pub fn effective_state(&self, now: Timestamp) -> BreakerState {
        match (self.state, self.next_attempt_at) {
            (BreakerState::Open, Some(next)) if now >= next => BreakerState::HalfOpen,
            (state, _) => state,
        }
    }

    pub fn last_trip(&self) -> Option<TripReason> {
        self.last_trip
    }

    pub fn try_acquire(&mut self, now: Timestamp) -> Result<Admission> {
        if let Some(until) = self.throttled_until {
            if now < until {
                return Err(Error::RateLimited {
                    provider: self.key.source_name.clone(),
                    retry_after_ms: until.as_millis() - now.as_millis(),
                });
            }
            self.throttled_until = None;
        }

        match self.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let next = self.next_attempt_at.unwrap_or(now);
                if now < next {
                    return Err(self.open_error(next));
                }
                self.state = BreakerState::HalfOpen;
                self.consecutive_successes = 0;
                self.trial_started_at = Some(now);
                Ok(Admission::Trial)
            }
            BreakerState::HalfOpen => {
                // An abandoned trial frees the slot once the current timeout
                // has passed.
                if let Some(started) = self.trial_started_at {
                    let expires = started + self.current_timeout();
                    if now < expires {
                        return Err(self.open_error(expires));
                    }
                }
                self.trial_started_at = Some(now);
                Ok(Admission::Trial)
            }
        }
    }

    pub fn on_success(&mut self, _now: Timestamp) {
        self.total_successes += 1;

        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.trial_started_at = None;
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.success_threshold {
                    self.close();
                }
            }
            // Result of a fetch admitted before another request tripped us
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&mut self, error: &Error, now: Timestamp) {
        self.total_failures += 1;
        self.last_error = Some(error.code());

        if let Error::RateLimited { retry_after_ms, .. } = error {
            self.throttled_until = Some(now + std::time::Duration::from_millis(*retry_after_ms));
            if self.state == BreakerState::HalfOpen {
                self.trial_started_at = None;
            }
            return;
        }

        if let Error::PriceDeviation { deviation_pct, .. } = error {
            if *deviation_pct > self.config.max_price_deviation_pct {
                self.last_failure_at = Some(now);
                if self.state == BreakerState::HalfOpen {
                    self.back_off();
                }
                self.trip(now, TripReason::SevereDeviation { deviation_pct: *deviation_pct });
                return;
            }
        }

        match self.state {
            BreakerState::Closed => {
                if let Some(last) = self.last_failure_at {
                    if now.saturating_since(last) > self.config.monitoring_window() {
                        self.consecutive_failures = 0;
                    }
                }
                self.consecutive_failures += 1;
                self.last_failure_at = Some(now);

                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now, TripReason::FailureThreshold {
                        failures: self.consecutive_failures,
                    });
                }
            }
            BreakerState::HalfOpen => {
                self.last_failure_at = Some(now);
                self.back_off();
                self.trip(now, TripReason::TrialFailed);
            }
            BreakerState::Open => {
                self.last_failure_at = Some(now);
            }
        }
    }

    /// Operator reset back to a fresh closed breaker.
    pub fn reset(&mut self) {
        *self = CircuitBreaker::new(self.key.clone(), self.config.clone());
    }

    pub fn snapshot(&self, now: Timestamp) -> BreakerSnapshot {
        BreakerSnapshot {
            feed_id: self.key.feed_id.clone(),
            source_name: self.key.source_name.clone(),
            state: self.effective_state(now),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            last_failure_at: self.last_failure_at,
            opened_at: self.opened_at,
            next_attempt_at: self.next_attempt_at,
            open_timeout_ms: self.current_timeout_ms,
            throttled_until: self.throttled_until.filter(|until| *until > now),
            last_error: self.last_error,
            last_trip: self.last_trip,
        }
    }

    fn trip(&mut self, now: Timestamp, reason: TripReason) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.next_attempt_at = Some(now + self.current_timeout());
        self.trial_started_at = None;
        self.consecutive_successes = 0;
        self.last_trip = Some(reason);
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.current_timeout_ms = self.config.open_timeout_ms;
        self.opened_at = None;
        self.next_attempt_at = None;
        self.trial_started_at = None;
    }

    /// Doubles the open timeout after a failed trial, up to the cap.
    fn back_off(&mut self) {
        self.current_timeout_ms = self
            .current_timeout_ms
            .saturating_mul(2)
            .min(self.config.max_open_timeout_ms);
    }

    fn current_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.current_timeout_ms)
    }

    fn open_error(&self, next_attempt_at: Timestamp) -> Error {
        Error::CircuitOpen {
            provider: self.key.source_name.clone(),
            next_attempt_at,
        }
    }
}

/// Read-only view of one breaker.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub feed_id: FeedId,
    pub source_name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub last_failure_at: Option<Timestamp>,
    pub opened_at: Option<Timestamp>,
    pub next_attempt_at: Option<Timestamp>,
    pub open_timeout_ms: u64,
    pub throttled_until: Option<Timestamp>,
    pub last_error: Option<ErrorCode>,
    pub last_trip: Option<TripReason>,
}

/// Every breaker of the process, one lock per key.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<BreakerKey, Arc<Mutex<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreakerRegistry {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn try_acquire(&self, key: &BreakerKey, now: Timestamp) -> Result<Admission> {
        self.update(key, |breaker| breaker.try_acquire(now))
    }

    pub fn record_success(&self, key: &BreakerKey, now: Timestamp) {
        self.update(key, |breaker| breaker.on_success(now));
    }

    pub fn record_failure(&self, key: &BreakerKey, error: &Error, now: Timestamp) {
        if !error.counts_against_source() {
            return;
        }
        self.update(key, |breaker| breaker.on_failure(error, now));
    }

    pub fn snapshot(&self, key: &BreakerKey, now: Timestamp) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.get(key).map(|entry| entry.value().clone())?;
        let snapshot = breaker.lock().snapshot(now);
        Some(snapshot)
    }

    /// Snapshots of every breaker tracked for `feed_id`, by source name.
    pub fn snapshots_for(&self, feed_id: &FeedId, now: Timestamp) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<Mutex<CircuitBreaker>>> = self
            .breakers
            .iter()
            .filter(|entry| &entry.key().feed_id == feed_id)
            .map(|entry| entry.value().clone())
            .collect();

        let mut snapshots: Vec<BreakerSnapshot> =
            breakers.iter().map(|breaker| breaker.lock().snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.source_name.cmp(&b.source_name));
        snapshots
    }

    pub fn reset(&self, key: &BreakerKey) -> bool {
        let Some(breaker) = self.breakers.get(key).map(|entry| entry.value().clone()) else {
            return false;
        };
        breaker.lock().reset();
        tracing::info!(breaker = %key, "Circuit breaker reset");
        true
    }

    /// Resets every breaker of `feed_id`, returning how many were reset.
    pub fn reset_feed(&self, feed_id: &FeedId) -> usize {
        let keys: Vec<BreakerKey> = self
            .breakers
            .iter()
            .filter(|entry| &entry.key().feed_id == feed_id)
            .map(|entry| entry.key().clone())
            .collect();
        keys.iter().filter(|key| self.reset(key)).count()
    }

    fn breaker(&self, key: &BreakerKey) -> Arc<Mutex<CircuitBreaker>> {
        // Clone the Arc so the shard guard is released before locking.
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(key.clone(), self.config.clone()))))
            .value()
            .clone()
    }

    fn update<R>(&self, key: &BreakerKey, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let breaker = self.breaker(key);
        let mut guard = breaker.lock();

        let before = guard.state();
        let result = f(&mut *guard);
        let after = guard.state();

        if before != after {
            report_transition(key, before, after, guard.last_trip());
        }
        result
    }
}

fn report_transition(key: &BreakerKey, from: BreakerState, to: BreakerState, trip: Option<TripReason>) {
    BREAKER_TRANSITIONS
        .with_label_values(&[key.feed_id.as_str(), key.source_name.as_str(), to.as_str()])
        .inc();

    match (to, trip) {
        (BreakerState::Open, Some(TripReason::SevereDeviation { deviation_pct })) => {
            tracing::error!(
                breaker = %key,
                from = from.as_str(),
                deviation_pct,
                "Circuit breaker tripped on severe price deviation"
            );
            alert_operations_team_critical(format!(
                "Possible price manipulation on {}: deviation {:.2}%",
                key, deviation_pct
            ));
        }
        (BreakerState::Open, reason) => {
            tracing::warn!(breaker = %key, from = from.as_str(), ?reason, "Circuit breaker opened");
            alert_operations_team_warning(format!("Circuit breaker opened for {}", key));
        }
        (BreakerState::HalfOpen, _) => {
            tracing::info!(breaker = %key, "Circuit breaker half-open, admitting trial");
        }
        (BreakerState::Closed, _) => {
            tracing::info!(breaker = %key, "Circuit breaker closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key() -> BreakerKey {
        BreakerKey::new(FeedId::parse("ETH-USD").unwrap(), "chainlink")
    }

    fn network() -> Error {
        Error::Network {
            provider: "chainlink".to_string(),
            reason: "connection reset".to_string(),
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(key(), CircuitBreakerConfig::default())
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);

        cb.on_failure(&network(), t0);
        cb.on_failure(&network(), t0);
        assert_eq!(cb.state(), BreakerState::Closed);

        cb.on_failure(&network(), t0);
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(matches!(cb.try_acquire(t0), Err(Error::CircuitOpen { .. })));
        assert_eq!(cb.last_trip(), Some(TripReason::FailureThreshold { failures: 3 }));
    }

    #[test]
    fn test_success_resets_streak() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);

        cb.on_failure(&network(), t0);
        cb.on_failure(&network(), t0);
        cb.on_success(t0);
        cb.on_failure(&network(), t0);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_accumulate() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);

        cb.on_failure(&network(), t0);
        cb.on_failure(&network(), t0);
        cb.on_failure(&network(), t0 + Duration::from_secs(61));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_single_trial() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);
        for _ in 0..3 {
            cb.on_failure(&network(), t0);
        }

        let later = t0 + Duration::from_secs(30);
        assert_eq!(cb.effective_state(later), BreakerState::HalfOpen);
        assert_eq!(cb.try_acquire(later).unwrap(), Admission::Trial);
        assert!(matches!(cb.try_acquire(later), Err(Error::CircuitOpen { .. })));

        cb.on_success(later);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.try_acquire(later).unwrap(), Admission::Normal);
    }

    #[test]
    fn test_abandoned_trial_expires() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);
        for _ in 0..3 {
            cb.on_failure(&network(), t0);
        }

        let trial_at = t0 + Duration::from_secs(30);
        assert_eq!(cb.try_acquire(trial_at).unwrap(), Admission::Trial);
        // Never reported back
        assert!(cb.try_acquire(trial_at + Duration::from_secs(29)).is_err());
        assert_eq!(cb.try_acquire(trial_at + Duration::from_secs(30)).unwrap(), Admission::Trial);
    }

    #[test]
    fn test_failed_trial_doubles_timeout() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);
        for _ in 0..3 {
            cb.on_failure(&network(), t0);
        }

        let trial_at = t0 + Duration::from_secs(30);
        cb.try_acquire(trial_at).unwrap();
        cb.on_failure(&network(), trial_at);

        assert_eq!(cb.state(), BreakerState::Open);
        let snapshot = cb.snapshot(trial_at);
        assert_eq!(snapshot.open_timeout_ms, 60_000);
        assert_eq!(snapshot.next_attempt_at, Some(trial_at + Duration::from_secs(60)));
        assert_eq!(cb.last_trip(), Some(TripReason::TrialFailed));
    }

    #[test]
    fn test_timeout_capped_and_reset_on_close() {
        let config = CircuitBreakerConfig {
            open_timeout_ms: 100_000,
            max_open_timeout_ms: 150_000,
            ..CircuitBreakerConfig::default()
        };
        let mut cb = CircuitBreaker::new(key(), config);
        let mut now = Timestamp::from_secs(1_000);
        for _ in 0..3 {
            cb.on_failure(&network(), now);
        }

        now = now + Duration::from_secs(100);
        cb.try_acquire(now).unwrap();
        cb.on_failure(&network(), now);
        assert_eq!(cb.snapshot(now).open_timeout_ms, 150_000);

        now = now + Duration::from_secs(150);
        cb.try_acquire(now).unwrap();
        cb.on_success(now);
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.snapshot(now).open_timeout_ms, 100_000);
    }

    #[test]
    fn test_severe_deviation_trips_immediately() {
        let mut cb = breaker();
        let severe = Error::PriceDeviation {
            provider: "chainlink".to_string(),
            deviation_pct: 40.0,
            max_deviation_pct: 10.0,
        };
        cb.on_failure(&severe, Timestamp::from_secs(1_000));

        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.last_trip(), Some(TripReason::SevereDeviation { deviation_pct: 40.0 }));
    }

    #[test]
    fn test_severe_deviation_during_trial_doubles_timeout() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);
        for _ in 0..3 {
            cb.on_failure(&network(), t0);
        }

        let trial_at = t0 + Duration::from_secs(30);
        assert_eq!(cb.try_acquire(trial_at).unwrap(), Admission::Trial);
        let severe = Error::PriceDeviation {
            provider: "chainlink".to_string(),
            deviation_pct: 1_500.0,
            max_deviation_pct: 10.0,
        };
        cb.on_failure(&severe, trial_at);

        let snapshot = cb.snapshot(trial_at);
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.open_timeout_ms, 60_000);
        assert_eq!(snapshot.next_attempt_at, Some(trial_at + Duration::from_secs(60)));
        assert_eq!(snapshot.last_failure_at, Some(trial_at));
    }

    #[test]
    fn test_rate_limit_throttles_without_counting() {
        let mut cb = breaker();
        let t0 = Timestamp::from_secs(1_000);
        let limited = Error::RateLimited {
            provider: "chainlink".to_string(),
            retry_after_ms: 2_000,
        };
        for _ in 0..3 {
            cb.on_failure(&limited, t0);
        }

        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(matches!(
            cb.try_acquire(t0 + Duration::from_secs(1)),
            Err(Error::RateLimited { retry_after_ms: 1_000, .. })
        ));
        assert_eq!(cb.try_acquire(t0 + Duration::from_secs(2)).unwrap(), Admission::Normal);
    }

    #[test]
    fn test_registry_reset_and_snapshots() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let t0 = Timestamp::from_secs(1_000);
        let other = BreakerKey::new(key().feed_id.clone(), "api3");

        for _ in 0..3 {
            registry.record_failure(&key(), &network(), t0);
        }
        registry.record_success(&other, t0);

        let snapshots = registry.snapshots_for(&key().feed_id, t0);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].source_name, "api3");
        assert_eq!(snapshots[1].state, BreakerState::Open);

        assert_eq!(registry.reset_feed(&key().feed_id), 2);
        assert_eq!(registry.snapshot(&key(), t0).unwrap().state, BreakerState::Closed);
    }

    #[test]
    fn test_registry_ignores_caller_side_errors() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
        let t0 = Timestamp::from_secs(1_000);
        let cancelled = Error::Cancelled { feed_id: "ETH-USD".to_string() };

        for _ in 0..5 {
            registry.record_failure(&key(), &cancelled, t0);
        }
        assert!(registry.snapshot(&key(), t0).is_none());
    }
}
