//! Graceful degradation for the telemetry paths.
//!
//! Every protected call goes through [`DegradationCoordinator::execute_with_fallback`]
//! (or its async twin):
//!
//! 1. The breaker of the component admits or rejects the call under a short lock.
//! 2. The primary operation runs without any coordinator lock held.
//! 3. If it fails or the breaker is open, the fallback runs and backup mode
//!    is entered.
//! 4. On success the breaker records it and backup mode is cleared once a
//!    breaker listed in `backup_exit_components` is closed.
//!
//! Callers never see an error from a protected call.

use super::circuit_breaker::{
    BreakerListener, BreakerPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState,
};
use super::fallback::FallbackSink;
use crate::config::TelemetryConfig;
use crate::context::TelemetryContext;
use crate::error::{CollectorError, ExportError, MetricsError};
use crate::error_tracker::ErrorEvent;
use crate::health::HealthStatus;
use crate::metrics::{pipeline, Counter, Gauge, Registry, TelemetryCollector};
use crate::tracer::exporter::{ErrorExporter, SpanExporter};
use crate::tracer::SpanData;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const METRICS: &str = "metrics";
pub const TRACING: &str = "tracing";
pub const ERROR_TRACKING: &str = "error_tracking";
pub const HEALTH: &str = "health";

/// Components that get a breaker at construction.
pub const PROTECTED_COMPONENTS: [&str; 4] = [METRICS, TRACING, ERROR_TRACKING, HEALTH];

/// Window within which repeated notifications of one transition are
/// suppressed.
pub const NOTIFICATION_WINDOW: Duration = Duration::from_secs(5 * 60);

/// User callback for breaker transitions.
pub type StateChangeCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

// ============================================================================
// Notification gate
// ============================================================================

/// The coordinator's [`BreakerListener`].
///
/// Every transition updates the `telemetry_breaker_state` gauge. A
/// transition repeated within [`NOTIFICATION_WINDOW`] is not logged again
/// and not forwarded to the callback.
pub struct NotificationGate {
    window: Duration,
    last_sent: Mutex<HashMap<(String, CircuitState, CircuitState), Instant>>,
    callback: RwLock<Option<StateChangeCallback>>,
    gauge: Gauge,
}

impl fmt::Debug for NotificationGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationGate")
            .field("window", &self.window)
            .finish()
    }
}

impl NotificationGate {
    pub fn new(gauge: Gauge, window: Duration) -> Self {
        Self {
            window,
            last_sent: Mutex::new(HashMap::new()),
            callback: RwLock::new(None),
            gauge,
        }
    }

    pub fn set_callback(&self, callback: StateChangeCallback) {
        *self.callback.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Returns true when the notification goes out, false when suppressed.
    fn admit(&self, name: &str, from: CircuitState, to: CircuitState) -> bool {
        let now = Instant::now();
        let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
        let key = (name.to_string(), from, to);
        match last_sent.get(&key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last_sent.insert(key, now);
                true
            }
        }
    }
}

impl BreakerListener for NotificationGate {
    fn on_state_change(&self, name: &str, from: CircuitState, to: CircuitState) {
        self.gauge.with_labels(&[name]).set(to.gauge_value());

        if !self.admit(name, from, to) {
            debug!(breaker = %name, %from, %to, "breaker notification suppressed");
            return;
        }
        match to {
            CircuitState::Open => {
                warn!(breaker = %name, %from, %to, "telemetry path degraded, using fallback")
            }
            _ => info!(breaker = %name, %from, %to, "telemetry breaker state changed"),
        }

        let callback = self
            .callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(name, from, to);
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

#[derive(Debug, Default)]
struct ComponentStats {
    successes: AtomicU64,
    failures: AtomicU64,
    circuit_open: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failures: u32,
    pub successes_total: u64,
    pub failures_total: u64,
    /// Calls short-circuited while the breaker was open or on trial
    pub circuit_open_total: u64,
}

/// Snapshot returned by [`DegradationCoordinator::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub backup_mode: bool,
    pub fallback_enabled: bool,
    pub last_successful_op: Option<DateTime<Utc>>,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub fallback_entries: usize,
}

struct CoordinatorInner {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    stats: DashMap<String, Arc<ComponentStats>>,
    config: TelemetryConfig,
    gate: Arc<NotificationGate>,
    primary: Arc<dyn TelemetryCollector>,
    fallback: Arc<FallbackSink>,
    fallback_enabled: bool,
    backup_exit: BTreeSet<String>,
    backup_mode: AtomicBool,
    last_successful_op: Mutex<Option<DateTime<Utc>>>,
    fallback_events: Counter,
    export_failures: Counter,
}

/// Routes telemetry calls to the primary path or to the fallback sink.
/// Cheap to clone.
#[derive(Clone)]
pub struct DegradationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for DegradationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationCoordinator")
            .field("backup_mode", &self.is_backup_mode())
            .field("fallback_enabled", &self.inner.fallback_enabled)
            .finish()
    }
}

impl DegradationCoordinator {
    pub fn new(
        config: &TelemetryConfig,
        primary: Arc<dyn TelemetryCollector>,
        registry: &Registry,
    ) -> Result<Self, MetricsError> {
        let gauge = pipeline::breaker_state(registry)?;
        let gate = Arc::new(NotificationGate::new(gauge.clone(), NOTIFICATION_WINDOW));
        let inner = CoordinatorInner {
            breakers: DashMap::new(),
            stats: DashMap::new(),
            config: config.clone(),
            gate,
            primary,
            fallback: Arc::new(FallbackSink::new(config.fallback_max_entries)),
            fallback_enabled: config.fallback_enabled,
            backup_exit: config.backup_exit_components.iter().cloned().collect(),
            backup_mode: AtomicBool::new(false),
            last_successful_op: Mutex::new(None),
            fallback_events: pipeline::fallback_events(registry)?,
            export_failures: pipeline::export_failures(registry)?,
        };
        let coordinator = Self {
            inner: Arc::new(inner),
        };
        for component in PROTECTED_COMPONENTS {
            coordinator.breaker(component);
            gauge
                .with_labels(&[component])
                .set(CircuitState::Closed.gauge_value());
        }
        Ok(coordinator)
    }

    /// Forwards deduplicated breaker transitions to `callback`.
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.inner.gate.set_callback(Arc::new(callback));
    }

    /// The breaker of `component`, created from the configured settings on
    /// first use.
    pub fn breaker(&self, component: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.inner.breakers.get(component) {
            return Arc::clone(breaker.value());
        }
        let entry = self
            .inner
            .breakers
            .entry(component.to_string())
            .or_insert_with(|| {
                let config = CircuitBreakerConfig::from(self.inner.config.breaker_settings(component));
                let listener: Arc<dyn BreakerListener> = self.inner.gate.clone();
                Arc::new(CircuitBreaker::new(component, config).with_listener(listener))
            });
        Arc::clone(entry.value())
    }

    fn stats(&self, component: &str) -> Arc<ComponentStats> {
        if let Some(stats) = self.inner.stats.get(component) {
            return Arc::clone(stats.value());
        }
        Arc::clone(
            self.inner
                .stats
                .entry(component.to_string())
                .or_default()
                .value(),
        )
    }

    pub fn fallback(&self) -> &Arc<FallbackSink> {
        &self.inner.fallback
    }

    pub fn is_backup_mode(&self) -> bool {
        self.inner.backup_mode.load(Ordering::Acquire)
    }

    /// Runs `op` behind the breaker of `component`. When `op` fails or the
    /// breaker rejects the call, `fallback` produces the result instead.
    pub fn execute_with_fallback<T, E, Op, Fb>(&self, component: &str, op: Op, fallback: Fb) -> T
    where
        E: fmt::Display,
        Op: FnOnce() -> Result<T, E>,
        Fb: FnOnce() -> T,
    {
        let breaker = self.breaker(component);
        let permit = match breaker.try_acquire::<E>() {
            Ok(permit) => permit,
            Err(rejection) => return self.on_rejected(component, rejection, fallback),
        };
        match op() {
            Ok(value) => {
                self.on_success(component, &breaker, permit);
                value
            }
            Err(e) => self.on_failure(component, permit, &e, fallback),
        }
    }

    /// Async form of [`execute_with_fallback`](Self::execute_with_fallback).
    /// The fallback stays synchronous.
    pub async fn execute_with_fallback_async<T, E, Op, Fut, Fb>(
        &self,
        component: &str,
        op: Op,
        fallback: Fb,
    ) -> T
    where
        E: fmt::Display,
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> T,
    {
        let breaker = self.breaker(component);
        let permit = match breaker.try_acquire::<E>() {
            Ok(permit) => permit,
            Err(rejection) => return self.on_rejected(component, rejection, fallback),
        };
        match op().await {
            Ok(value) => {
                self.on_success(component, &breaker, permit);
                value
            }
            Err(e) => self.on_failure(component, permit, &e, fallback),
        }
    }

    fn on_rejected<T, E, Fb>(
        &self,
        component: &str,
        rejection: CircuitBreakerError<E>,
        fallback: Fb,
    ) -> T
    where
        Fb: FnOnce() -> T,
    {
        debug_assert!(rejection.is_circuit_open());
        self.stats(component)
            .circuit_open
            .fetch_add(1, Ordering::Relaxed);
        self.enter_backup_mode();
        fallback()
    }

    fn on_success(&self, component: &str, breaker: &CircuitBreaker, permit: BreakerPermit<'_>) {
        permit.success();
        self.stats(component)
            .successes
            .fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .last_successful_op
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        if self.inner.backup_exit.contains(component)
            && breaker.state() == CircuitState::Closed
            && self.inner.backup_mode.swap(false, Ordering::AcqRel)
        {
            info!(component = %component, "telemetry left backup mode");
        }
    }

    fn on_failure<T, E, Fb>(
        &self,
        component: &str,
        permit: BreakerPermit<'_>,
        error: &E,
        fallback: Fb,
    ) -> T
    where
        E: fmt::Display,
        Fb: FnOnce() -> T,
    {
        permit.failure();
        self.stats(component)
            .failures
            .fetch_add(1, Ordering::Relaxed);
        self.inner
            .export_failures
            .with_labels(&[component])
            .inc();
        debug!(component = %component, error = %error, "primary telemetry path failed");
        self.enter_backup_mode();
        fallback()
    }

    fn enter_backup_mode(&self) {
        if !self.inner.backup_mode.swap(true, Ordering::AcqRel) {
            warn!("telemetry entered backup mode");
        }
    }

    /// Stores into the fallback sink when it is enabled.
    fn store_fallback(&self, component: &str, store: impl FnOnce(&FallbackSink)) {
        if !self.inner.fallback_enabled {
            return;
        }
        store(&self.inner.fallback);
        self.inner
            .fallback_events
            .with_labels(&[component])
            .inc();
    }

    pub fn status(&self) -> CoordinatorStatus {
        let breakers = self
            .inner
            .breakers
            .iter()
            .map(|entry| {
                let snapshot = entry.value().snapshot();
                let stats = self.stats(entry.key());
                (
                    entry.key().clone(),
                    BreakerStatus {
                        state: snapshot.state,
                        failures: snapshot.consecutive_failures,
                        successes_total: stats.successes.load(Ordering::Relaxed),
                        failures_total: stats.failures.load(Ordering::Relaxed),
                        circuit_open_total: stats.circuit_open.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        CoordinatorStatus {
            backup_mode: self.is_backup_mode(),
            fallback_enabled: self.inner.fallback_enabled,
            last_successful_op: *self
                .inner
                .last_successful_op
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            breakers,
            fallback_entries: self.inner.fallback.total_len(),
        }
    }

    /// Wraps a span exporter behind the `tracing` breaker.
    pub fn protect_span_exporter(&self, exporter: Arc<dyn SpanExporter>) -> Arc<dyn SpanExporter> {
        Arc::new(ResilientSpanExporter {
            inner: exporter,
            coordinator: self.clone(),
        })
    }

    /// Wraps an error exporter behind the `error_tracking` breaker.
    pub fn protect_error_exporter(
        &self,
        exporter: Arc<dyn ErrorExporter>,
    ) -> Arc<dyn ErrorExporter> {
        Arc::new(ResilientErrorExporter {
            inner: exporter,
            coordinator: self.clone(),
        })
    }
}

impl TelemetryCollector for DegradationCoordinator {
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            METRICS,
            || self.inner.primary.record_http_request(method, route, status, duration),
            || {
                self.store_fallback(METRICS, |sink| {
                    let _ = sink.record_http_request(method, route, status, duration);
                })
            },
        );
        Ok(())
    }

    fn record_db_query(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
    ) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            METRICS,
            || self.inner.primary.record_db_query(operation, table, duration, success),
            || {
                self.store_fallback(METRICS, |sink| {
                    let _ = sink.record_db_query(operation, table, duration, success);
                })
            },
        );
        Ok(())
    }

    fn record_cache_operation(
        &self,
        operation: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            METRICS,
            || self.inner.primary.record_cache_operation(operation, hit, duration),
            || {
                self.store_fallback(METRICS, |sink| {
                    let _ = sink.record_cache_operation(operation, hit, duration);
                })
            },
        );
        Ok(())
    }

    fn record_business_event(&self, event: &str, value: f64) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            METRICS,
            || self.inner.primary.record_business_event(event, value),
            || {
                self.store_fallback(METRICS, |sink| {
                    let _ = sink.record_business_event(event, value);
                })
            },
        );
        Ok(())
    }

    fn record_error(&self, error_type: &str, component: &str) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            METRICS,
            || self.inner.primary.record_error(error_type, component),
            || {
                self.store_fallback(METRICS, |sink| {
                    let _ = sink.record_error(error_type, component);
                })
            },
        );
        Ok(())
    }

    fn record_health_check(
        &self,
        check: &str,
        status: HealthStatus,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.execute_with_fallback(
            HEALTH,
            || self.inner.primary.record_health_check(check, status, duration),
            || {
                self.store_fallback(HEALTH, |sink| {
                    let _ = sink.record_health_check(check, status, duration);
                })
            },
        );
        Ok(())
    }
}

// ============================================================================
// Resilient exporters
// ============================================================================

/// A span exporter whose failures go to the fallback sink.
pub struct ResilientSpanExporter {
    inner: Arc<dyn SpanExporter>,
    coordinator: DegradationCoordinator,
}

#[async_trait]
impl SpanExporter for ResilientSpanExporter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn export(&self, spans: &[SpanData]) -> Result<(), ExportError> {
        let inner = &self.inner;
        self.coordinator
            .execute_with_fallback_async(
                TRACING,
                || inner.export(spans),
                || {
                    self.coordinator
                        .store_fallback(TRACING, |sink| sink.record_spans(spans))
                },
            )
            .await;
        Ok(())
    }

    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ExportError> {
        self.inner.shutdown(ctx).await
    }
}

/// An error exporter whose failures go to the fallback sink.
pub struct ResilientErrorExporter {
    inner: Arc<dyn ErrorExporter>,
    coordinator: DegradationCoordinator,
}

#[async_trait]
impl ErrorExporter for ResilientErrorExporter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn export_errors(&self, events: &[ErrorEvent]) -> Result<(), ExportError> {
        let inner = &self.inner;
        self.coordinator
            .execute_with_fallback_async(
                ERROR_TRACKING,
                || inner.export_errors(events),
                || {
                    self.coordinator
                        .store_fallback(ERROR_TRACKING, |sink| sink.record_error_events(events))
                },
            )
            .await;
        Ok(())
    }

    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ExportError> {
        self.inner.shutdown(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{LabelPolicy, PrometheusCollector};
    use crate::resilience::fallback::{HEALTH_CHECKS, HTTP_REQUESTS, SPANS};
    use crate::tracer::exporter::InMemoryExporter;
    use crate::tracer::span::{Resource, SpanKind, SpanStatus};
    use crate::tracer::{SpanId, TraceId};
    use std::sync::atomic::AtomicBool;
    use tokio::time::sleep;

    /// A collector that fails while `down` is set.
    #[derive(Default)]
    struct Flaky {
        down: AtomicBool,
        calls: AtomicU64,
    }

    impl Flaky {
        fn result(&self) -> Result<(), CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                Err(CollectorError::Unavailable("primary down".into()))
            } else {
                Ok(())
            }
        }
    }

    impl TelemetryCollector for Flaky {
        fn record_http_request(&self, _: &str, _: &str, _: u16, _: Duration) -> Result<(), CollectorError> {
            self.result()
        }
        fn record_db_query(&self, _: &str, _: &str, _: Duration, _: bool) -> Result<(), CollectorError> {
            self.result()
        }
        fn record_cache_operation(&self, _: &str, _: bool, _: Duration) -> Result<(), CollectorError> {
            self.result()
        }
        fn record_business_event(&self, _: &str, _: f64) -> Result<(), CollectorError> {
            self.result()
        }
        fn record_error(&self, _: &str, _: &str) -> Result<(), CollectorError> {
            self.result()
        }
        fn record_health_check(&self, _: &str, _: HealthStatus, _: Duration) -> Result<(), CollectorError> {
            self.result()
        }
    }

    fn config() -> TelemetryConfig {
        TelemetryConfig::builder()
            .breaker(METRICS, 3, Duration::from_millis(50))
            .breaker(HEALTH, 1, Duration::from_millis(50))
            .build()
    }

    fn coordinator(primary: Arc<Flaky>) -> (DegradationCoordinator, Registry) {
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let coordinator = DegradationCoordinator::new(&config(), primary, &registry).unwrap();
        (coordinator, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_metrics_path_trips_and_retries() {
        let primary = Arc::new(Flaky::default());
        primary.down.store(true, Ordering::SeqCst);
        let (coordinator, registry) = coordinator(primary.clone());
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        coordinator.on_state_change(move |name, from, to| {
            seen.lock().unwrap().push((name.to_string(), from, to));
        });

        for _ in 0..3 {
            coordinator
                .record_http_request("GET", "/x", 200, Duration::from_millis(1))
                .unwrap();
        }
        assert_eq!(coordinator.fallback().len(HTTP_REQUESTS), 3);
        assert_eq!(coordinator.breaker(METRICS).state(), CircuitState::Open);
        assert!(coordinator.is_backup_mode());

        // Open: the primary is not called at all.
        coordinator
            .record_http_request("GET", "/x", 200, Duration::from_millis(1))
            .unwrap();
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.fallback().len(HTTP_REQUESTS), 4);

        sleep(Duration::from_millis(60)).await;
        coordinator
            .record_http_request("GET", "/x", 200, Duration::from_millis(1))
            .unwrap();
        assert_eq!(coordinator.fallback().len(HTTP_REQUESTS), 5);
        assert_eq!(coordinator.breaker(METRICS).state(), CircuitState::Open);

        let transitions: Vec<_> = transitions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, from, to)| (*from, *to))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Open),
            ]
        );

        let status = coordinator.status();
        assert_eq!(status.breakers[METRICS].failures_total, 4);
        assert_eq!(status.breakers[METRICS].circuit_open_total, 1);
        let gauge = pipeline::breaker_state(&registry).unwrap();
        assert_eq!(gauge.get(&[METRICS]), 2.0);
        let fallback_events = pipeline::fallback_events(&registry).unwrap();
        assert_eq!(fallback_events.get(&[METRICS]), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_mode_clears_when_exit_breaker_closes() {
        let primary = Arc::new(Flaky::default());
        primary.down.store(true, Ordering::SeqCst);
        let (coordinator, _) = coordinator(primary.clone());

        coordinator
            .record_health_check("db", HealthStatus::Healthy, Duration::ZERO)
            .unwrap();
        assert!(coordinator.is_backup_mode());
        assert_eq!(coordinator.fallback().len(HEALTH_CHECKS), 1);

        primary.down.store(false, Ordering::SeqCst);
        sleep(Duration::from_millis(60)).await;
        coordinator
            .record_health_check("db", HealthStatus::Healthy, Duration::ZERO)
            .unwrap();
        assert_eq!(coordinator.breaker(HEALTH).state(), CircuitState::Closed);
        assert!(!coordinator.is_backup_mode());
        assert!(coordinator.status().last_successful_op.is_some());
    }

    #[test]
    fn test_success_on_non_exit_breaker_keeps_backup_mode() {
        let primary = Arc::new(Flaky::default());
        let (coordinator, _) = coordinator(primary);

        let _: () = coordinator.execute_with_fallback(TRACING, || Err::<(), _>("down"), || ());
        assert!(coordinator.is_backup_mode());
        let _: () = coordinator.execute_with_fallback(TRACING, || Ok::<(), &str>(()), || ());
        assert!(coordinator.is_backup_mode());
    }

    #[test]
    fn test_fallback_result_is_returned() {
        let (coordinator, _) = coordinator(Arc::new(Flaky::default()));
        let value = coordinator.execute_with_fallback(ERROR_TRACKING, || Err::<u32, _>("down"), || 7);
        assert_eq!(value, 7);
        let value = coordinator.execute_with_fallback(ERROR_TRACKING, || Ok::<u32, &str>(1), || 7);
        assert_eq!(value, 1);
    }

    #[test]
    fn test_disabled_fallback_discards() {
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let config = TelemetryConfig::builder().fallback_enabled(false).build();
        let primary = Arc::new(Flaky::default());
        primary.down.store(true, Ordering::SeqCst);
        let coordinator = DegradationCoordinator::new(&config, primary, &registry).unwrap();

        coordinator.record_business_event("signup", 1.0).unwrap();
        assert!(coordinator.fallback().is_empty());
        assert!(!coordinator.status().fallback_enabled);
    }

    #[test]
    fn test_notification_gate_deduplicates() {
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let gate = NotificationGate::new(
            pipeline::breaker_state(&registry).unwrap(),
            NOTIFICATION_WINDOW,
        );
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        gate.set_callback(Arc::new(move |_, _, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        gate.on_state_change("metrics", CircuitState::Closed, CircuitState::Open);
        gate.on_state_change("metrics", CircuitState::Closed, CircuitState::Open);
        gate.on_state_change("metrics", CircuitState::Open, CircuitState::HalfOpen);
        gate.on_state_change("tracing", CircuitState::Closed, CircuitState::Open);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_primary_prometheus_path() {
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let primary = Arc::new(PrometheusCollector::new(&registry).unwrap());
        let coordinator =
            DegradationCoordinator::new(&TelemetryConfig::default(), primary, &registry).unwrap();
        coordinator
            .record_http_request("GET", "/orders", 200, Duration::from_millis(3))
            .unwrap();
        assert!(coordinator.fallback().is_empty());
        assert!(!coordinator.is_backup_mode());
        assert_eq!(coordinator.status().breakers.len(), 4);
    }

    struct FailingSpans;

    #[async_trait]
    impl SpanExporter for FailingSpans {
        fn name(&self) -> &str {
            "failing"
        }
        async fn export(&self, _spans: &[SpanData]) -> Result<(), ExportError> {
            Err(ExportError::Failed("collector unreachable".into()))
        }
    }

    fn span() -> SpanData {
        SpanData {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            name: "op".to_string(),
            kind: SpanKind::Internal,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: Duration::ZERO,
            status: SpanStatus::ok(),
            attributes: Default::default(),
            events: Vec::new(),
            links: Vec::new(),
            sampled: true,
            sample_rate: 1.0,
            resource: Arc::new(Resource::detect("svc", "1.0.0", "test")),
            dropped_attributes: 0,
            dropped_events: 0,
            dropped_links: 0,
        }
    }

    #[tokio::test]
    async fn test_resilient_span_exporter() {
        let (coordinator, registry) = coordinator(Arc::new(Flaky::default()));
        let failing = coordinator.protect_span_exporter(Arc::new(FailingSpans));
        failing.export(&[span(), span()]).await.unwrap();
        assert_eq!(coordinator.fallback().len(SPANS), 2);
        let failures = pipeline::export_failures(&registry).unwrap();
        assert_eq!(failures.get(&[TRACING]), 1.0);

        let memory = Arc::new(InMemoryExporter::new());
        let healthy = coordinator.protect_span_exporter(memory.clone());
        healthy.export(&[span()]).await.unwrap();
        assert_eq!(memory.spans().len(), 1);
        assert_eq!(healthy.name(), "in_memory");
    }
}
