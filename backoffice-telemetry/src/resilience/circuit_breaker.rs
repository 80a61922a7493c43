//! Circuit breaker guarding one telemetry path.
//!
//! A circuit breaker monitors for failures and temporarily blocks calls when
//! failures exceed a threshold, giving the downstream sink time to recover.
//!
//! # States
//!
//! - **Closed**: normal operation, calls pass through
//! - **Open**: `max_failures` consecutive failures seen, calls fail fast
//! - **HalfOpen**: one trial call admitted after `reset_timeout`
//!
//! State lives behind a `std::sync::Mutex` that is only held for the
//! admission check and the outcome update, never across the guarded call.
//! Transitions are queued under that lock and delivered to a
//! [`BreakerListener`] after it is released, one delivery at a time and in
//! the order they happened.
//!
//! Every transition starts a new generation. An outcome reported by a call
//! admitted in an earlier generation is counted in the stats but does not
//! move the breaker or its open timer.
//!
//! # Example
//!
//! ```no_run
//! use backoffice_telemetry::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "metrics",
//!     CircuitBreakerConfig {
//!         max_failures: 5,
//!         reset_timeout: Duration::from_secs(30),
//!     },
//! );
//!
//! match breaker.call_sync(|| Ok::<_, std::io::Error>(42)) {
//!     Ok(result) => println!("Success: {}", result),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use crate::config::BreakerSettings;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Testing if the sink has recovered
    HalfOpen,
    /// Too many failures, calls are rejected
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half-open",
            CircuitState::Open => "open",
        }
    }

    /// Value of the `telemetry_breaker_state` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub max_failures: u32,
    /// Time to wait before admitting a trial call
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl From<BreakerSettings> for CircuitBreakerConfig {
    fn from(settings: BreakerSettings) -> Self {
        Self {
            max_failures: settings.max_failures.max(1),
            reset_timeout: settings.reset_timeout,
        }
    }
}

/// Circuit breaker errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, call rejected
    #[error("Circuit breaker is open for {name}")]
    Open { name: String },

    /// A trial call is already in flight in the half-open state
    #[error("Circuit breaker rejected call for {name}")]
    Rejected { name: String },

    /// Execution failed with underlying error
    #[error("Execution failed: {0}")]
    ExecutionFailed(E),
}

impl<E> CircuitBreakerError<E> {
    /// True for the fail-fast variants.
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            CircuitBreakerError::Open { .. } | CircuitBreakerError::Rejected { .. }
        )
    }
}

/// Receives every state transition exactly once.
pub trait BreakerListener: Send + Sync {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState);
}

/// Metrics for circuit breaker
#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    failures: AtomicU64,
    successes: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    rejected_count: AtomicU64,
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    trial_in_flight: bool,
    generation: u64,
    pending: VecDeque<(CircuitState, CircuitState)>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            trial_in_flight: false,
            generation: 0,
            pending: VecDeque::new(),
        }
    }

    /// Returns true when the state changed. The change is queued for the
    /// listener.
    fn transition(&mut self, to: CircuitState) -> bool {
        let from = self.state;
        if from == to {
            return false;
        }
        self.state = to;
        self.generation += 1;
        self.pending.push_back((from, to));
        true
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub max_failures: u32,
    #[serde(with = "crate::config::duration_ms", rename = "reset_timeout_ms")]
    pub reset_timeout: Duration,
    /// Time since the last recorded failure
    #[serde(skip)]
    pub since_last_failure: Option<Duration>,
    pub stats: CircuitBreakerStats,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub failures: u64,
    pub successes: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub rejected_count: u64,
}

/// Circuit breaker implementation
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    metrics: CircuitBreakerMetrics,
    listener: Option<Arc<dyn BreakerListener>>,
    delivery: Mutex<()>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to one guarded call. Report the outcome with
/// [`success`](BreakerPermit::success) or [`failure`](BreakerPermit::failure);
/// a permit dropped without either counts as a failure.
#[must_use = "report the outcome of the guarded call"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    done: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.done = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.breaker.on_error(self.generation);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.on_error(self.generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        debug!(breaker = %name, "creating circuit breaker");

        Self {
            name,
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            metrics: CircuitBreakerMetrics::default(),
            listener: None,
            delivery: Mutex::new(()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn BreakerListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            opened_count: self.metrics.opened_count.load(Ordering::Relaxed),
            closed_count: self.metrics.closed_count.load(Ordering::Relaxed),
            rejected_count: self.metrics.rejected_count.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            max_failures: self.config.max_failures,
            reset_timeout: self.config.reset_timeout,
            since_last_failure: state.last_failure_time.map(|t| t.elapsed()),
            stats: self.metrics(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission check. Moves an expired open breaker to half-open and
    /// admits that one trial call.
    pub fn try_acquire<E>(&self) -> Result<BreakerPermit<'_>, CircuitBreakerError<E>> {
        let admitted = {
            let mut state = self.lock();
            match state.state {
                CircuitState::Closed => Ok(state.generation),
                CircuitState::Open => {
                    let expired = state
                        .last_failure_time
                        .map_or(true, |t| t.elapsed() >= self.config.reset_timeout);
                    if expired {
                        state.trial_in_flight = true;
                        state.transition(CircuitState::HalfOpen);
                        Ok(state.generation)
                    } else {
                        Err(CircuitBreakerError::Open {
                            name: self.name.clone(),
                        })
                    }
                }
                CircuitState::HalfOpen => {
                    if state.trial_in_flight {
                        Err(CircuitBreakerError::Rejected {
                            name: self.name.clone(),
                        })
                    } else {
                        state.trial_in_flight = true;
                        Ok(state.generation)
                    }
                }
            }
        };

        self.deliver();
        match admitted {
            Ok(generation) => Ok(BreakerPermit {
                breaker: self,
                generation,
                done: false,
            }),
            Err(e) => {
                self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Call a synchronous function with circuit breaker protection
    pub fn call_sync<F, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.try_acquire()?;
        match f() {
            Ok(result) => {
                permit.success();
                Ok(result)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::ExecutionFailed(e))
            }
        }
    }

    /// Call an async function with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match f().await {
            Ok(result) => {
                permit.success();
                Ok(result)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::ExecutionFailed(e))
            }
        }
    }

    fn on_success(&self, generation: u64) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);
        let closed = {
            let mut state = self.lock();
            if state.generation != generation {
                debug!(breaker = %self.name, "ignoring success from an earlier state");
                return;
            }
            state.consecutive_failures = 0;
            state.trial_in_flight = false;
            state.transition(CircuitState::Closed)
        };
        if closed {
            self.metrics.closed_count.fetch_add(1, Ordering::Relaxed);
            info!(breaker = %self.name, "circuit breaker closed after successful trial");
        }
        self.deliver();
    }

    fn on_error(&self, generation: u64) {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        let opened = {
            let mut state = self.lock();
            if state.generation != generation {
                debug!(breaker = %self.name, "ignoring failure from an earlier state");
                return;
            }
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            state.last_failure_time = Some(Instant::now());
            match state.state {
                CircuitState::Closed if state.consecutive_failures >= self.config.max_failures => {
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "circuit breaker opening"
                    );
                    state.transition(CircuitState::Open)
                }
                CircuitState::HalfOpen => {
                    warn!(breaker = %self.name, "circuit breaker re-opening after failed trial");
                    state.trial_in_flight = false;
                    state.transition(CircuitState::Open)
                }
                _ => false,
            }
        };
        if opened {
            self.metrics.opened_count.fetch_add(1, Ordering::Relaxed);
        }
        self.deliver();
    }

    /// Hands queued transitions to the listener in order. Whoever holds the
    /// delivery lock drains the queue; a thread that finds it taken leaves
    /// its transition to the holder.
    fn deliver(&self) {
        loop {
            let delivering = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                let next = self.lock().pending.pop_front();
                let Some((from, to)) = next else { break };
                if let Some(listener) = &self.listener {
                    listener.on_state_change(&self.name, from, to);
                }
            }
            drop(delivering);
            if self.lock().pending.is_empty() {
                return;
            }
        }
    }

    /// Reset the circuit breaker to closed state
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            info!(breaker = %self.name, "manually resetting circuit breaker");
            state.consecutive_failures = 0;
            state.last_failure_time = None;
            state.trial_in_flight = false;
            state.transition(CircuitState::Closed);
        }
        self.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[derive(Default)]
    struct Transitions(Mutex<Vec<(String, CircuitState, CircuitState)>>);

    impl BreakerListener for Transitions {
        fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
            self.0.lock().unwrap().push((name.to_string(), from, to));
        }
    }

    fn breaker(max_failures: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                max_failures,
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call_sync(|| Err::<(), _>("error"));
    }

    #[test]
    fn test_circuit_breaker_starts_closed() {
        assert_eq!(breaker(5, 1000).state(), CircuitState::Closed);
    }

    #[test]
    fn test_successful_calls_keep_circuit_closed() {
        let breaker = breaker(5, 1000);

        for _ in 0..10 {
            let result = breaker.call_sync(|| Ok::<_, ()>(42));
            assert!(result.is_ok());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        let stats = breaker.metrics();
        assert_eq!(stats.successes, 10);
        assert_eq!(stats.failures, 0);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = breaker(3, 1000);
        fail(&breaker);
        fail(&breaker);
        let _ = breaker.call_sync(|| Ok::<_, ()>(()));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let breaker = breaker(3, 1000);

        for _ in 0..3 {
            let result = breaker.call_sync(|| Err::<(), _>("error"));
            assert!(matches!(result, Err(CircuitBreakerError::ExecutionFailed(_))));
        }

        assert_eq!(breaker.state(), CircuitState::Open);
        let stats = breaker.metrics();
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.opened_count, 1);
    }

    #[test]
    fn test_open_circuit_rejects_calls() {
        let breaker = breaker(2, 10_000);
        fail(&breaker);
        fail(&breaker);

        let result = breaker.call_sync(|| Ok::<_, ()>(42));
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(breaker.metrics().rejected_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_on_success() {
        let transitions = Arc::new(Transitions::default());
        let breaker = breaker(2, 100).with_listener(transitions.clone());
        fail(&breaker);
        fail(&breaker);

        sleep(Duration::from_millis(150)).await;
        assert!(breaker.call_sync(|| Ok::<_, ()>(42)).is_ok());

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        let seen: Vec<_> = transitions
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|(_, from, to)| (*from, *to))
            .collect();
        assert_eq!(
            seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure() {
        let breaker = breaker(2, 100);
        fail(&breaker);
        fail(&breaker);

        sleep(Duration::from_millis(150)).await;
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.metrics().opened_count, 2);

        // The timer restarted with the failed trial.
        let result = breaker.call_sync(|| Ok::<_, ()>(()));
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial() {
        let breaker = breaker(1, 100);
        fail(&breaker);
        sleep(Duration::from_millis(150)).await;

        let trial = breaker.try_acquire::<()>().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(
            breaker.try_acquire::<()>(),
            Err(CircuitBreakerError::Rejected { .. })
        ));
        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_permit_counts_as_failure() {
        let breaker = breaker(1, 100);
        fail(&breaker);
        sleep(Duration::from_millis(150)).await;

        drop(breaker.try_acquire::<()>().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_failure_does_not_extend_open_timer() {
        let breaker = breaker(1, 100);
        let slow = breaker.try_acquire::<()>().unwrap();
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        slow.failure();
        sleep(Duration::from_millis(30)).await;

        // Only the failure that opened the breaker starts the timer.
        let trial = breaker.try_acquire::<()>().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        trial.success();
        assert_eq!(breaker.metrics().failures, 2);
    }

    #[test]
    fn test_late_success_does_not_close_open_breaker() {
        let breaker = breaker(1, 10_000);
        let slow = breaker.try_acquire::<()>().unwrap();
        fail(&breaker);

        slow.success();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.metrics().closed_count, 0);
    }

    #[test]
    fn test_concurrent_transitions_reach_listener_in_order() {
        let transitions = Arc::new(Transitions::default());
        let breaker = breaker(1, 0).with_listener(transitions.clone());

        std::thread::scope(|s| {
            for worker in 0..8 {
                let breaker = &breaker;
                s.spawn(move || {
                    for i in 0..500 {
                        if let Ok(permit) = breaker.try_acquire::<()>() {
                            if (i + worker) % 3 == 0 {
                                permit.success();
                            } else {
                                permit.failure();
                            }
                        }
                    }
                });
            }
        });

        let seen = transitions.0.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].1, CircuitState::Closed);
        for pair in seen.windows(2) {
            assert_eq!(pair[0].2, pair[1].1, "transition chain broken: {pair:?}");
        }
        assert_eq!(seen.last().map(|t| t.2), Some(breaker.state()));
    }

    #[tokio::test]
    async fn test_async_call() {
        let breaker = breaker(1, 10_000);
        assert_eq!(breaker.call(|| async { Ok::<_, ()>(7) }).await.unwrap(), 7);
        let _ = breaker.call(|| async { Err::<(), _>("down") }).await;
        assert!(matches!(
            breaker.call(|| async { Ok::<_, ()>(7) }).await,
            Err(CircuitBreakerError::Open { .. })
        ));
    }

    #[test]
    fn test_manual_reset() {
        let breaker = breaker(2, 10_000);
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.call_sync(|| Ok::<_, ()>(42)).is_ok());
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("half-open")
        );
        assert_eq!(CircuitState::Open.gauge_value(), 2.0);
    }
}
