//! Typed metric families with labelled series, stored in a `prometheus`
//! registry.
//!
//! Registration takes a short write lock on the family table and checks the
//! new descriptor against any earlier one of the same name. Recording never
//! does: handles hold their family directly and series are cached per label
//! tuple in a sharded map.

use crate::error::MetricsError;
use dashmap::DashMap;
use prometheus::core::Collector;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

/// Counter for observations dropped by the registry itself.
pub const INTERNAL_ERRORS_METRIC: &str = "telemetry_internal_errors_total";

/// Default latency buckets, in seconds.
pub const DEFAULT_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

fn valid_metric_name(name: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

fn valid_label_name(label: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(label) && !label.starts_with("__"))
}

// ============================================================================
// Descriptors
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// What a family was registered with. Two registrations of one name must
/// carry equal descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyDesc {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_keys: Vec<String>,
    pub buckets: Vec<f64>,
}

impl FamilyDesc {
    // The backend refuses an empty help string.
    fn help_text(&self) -> String {
        if self.help.is_empty() {
            self.name.clone()
        } else {
            self.help.clone()
        }
    }

    fn label_refs(&self) -> Vec<&str> {
        self.label_keys.iter().map(String::as_str).collect()
    }
}

/// What to do with an observation whose label tuple has the wrong arity, or
/// a negative counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPolicy {
    /// Fail loudly. Default in debug builds.
    Panic,
    /// Discard the observation and count it under
    /// `telemetry_internal_errors_total{component="metrics"}`.
    Drop,
}

impl Default for LabelPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LabelPolicy::Panic
        } else {
            LabelPolicy::Drop
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

/// A `prometheus` metric vector that a family stores its series in.
trait SeriesBackend: Clone + Send + Sync + 'static {
    type Series: Clone + Send + Sync;

    fn build(desc: &FamilyDesc) -> Result<Self, prometheus::Error>;

    fn series(&self, values: &[&str]) -> Result<Self::Series, prometheus::Error>;

    fn collector(&self) -> Box<dyn Collector>;
}

impl SeriesBackend for CounterVec {
    type Series = prometheus::Counter;

    fn build(desc: &FamilyDesc) -> Result<Self, prometheus::Error> {
        CounterVec::new(
            Opts::new(desc.name.clone(), desc.help_text()),
            &desc.label_refs(),
        )
    }

    fn series(&self, values: &[&str]) -> Result<Self::Series, prometheus::Error> {
        self.get_metric_with_label_values(values)
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

impl SeriesBackend for GaugeVec {
    type Series = prometheus::Gauge;

    fn build(desc: &FamilyDesc) -> Result<Self, prometheus::Error> {
        GaugeVec::new(
            Opts::new(desc.name.clone(), desc.help_text()),
            &desc.label_refs(),
        )
    }

    fn series(&self, values: &[&str]) -> Result<Self::Series, prometheus::Error> {
        self.get_metric_with_label_values(values)
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

impl SeriesBackend for HistogramVec {
    type Series = prometheus::Histogram;

    fn build(desc: &FamilyDesc) -> Result<Self, prometheus::Error> {
        HistogramVec::new(
            HistogramOpts::new(desc.name.clone(), desc.help_text()).buckets(desc.buckets.clone()),
            &desc.label_refs(),
        )
    }

    fn series(&self, values: &[&str]) -> Result<Self::Series, prometheus::Error> {
        self.get_metric_with_label_values(values)
    }

    fn collector(&self) -> Box<dyn Collector> {
        Box::new(self.clone())
    }
}

// ============================================================================
// Families
// ============================================================================

struct Family<B: SeriesBackend> {
    desc: FamilyDesc,
    backend: B,
    series: DashMap<Vec<String>, B::Series>,
    shared: Arc<Shared>,
}

struct Shared {
    policy: LabelPolicy,
    internal_errors: Option<prometheus::Counter>,
}

impl Shared {
    fn reject(&self, family: &str, reason: &str) {
        match self.policy {
            LabelPolicy::Panic => panic!("metric {family}: {reason}"),
            LabelPolicy::Drop => {
                tracing::debug!(metric = family, reason, "dropping metric observation");
                if let Some(counter) = &self.internal_errors {
                    counter.inc();
                }
            }
        }
    }
}

impl<B: SeriesBackend> std::fmt::Debug for Family<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Family")
            .field("desc", &self.desc)
            .field("series", &self.series.len())
            .finish()
    }
}

impl<B: SeriesBackend> Family<B> {
    fn new(desc: FamilyDesc, backend: B, shared: Arc<Shared>) -> Self {
        Self {
            desc,
            backend,
            series: DashMap::new(),
            shared,
        }
    }

    fn cell(&self, values: &[&str]) -> Option<B::Series> {
        if values.len() != self.desc.label_keys.len() {
            self.shared.reject(
                &self.desc.name,
                &format!(
                    "expected {} label values, got {}",
                    self.desc.label_keys.len(),
                    values.len()
                ),
            );
            return None;
        }
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        if let Some(cell) = self.series.get(&key) {
            return Some(cell.value().clone());
        }
        match self.backend.series(values) {
            Ok(series) => Some(self.series.entry(key).or_insert(series).value().clone()),
            Err(e) => {
                self.shared.reject(&self.desc.name, &e.to_string());
                None
            }
        }
    }

    /// A series that has been recorded before. Reading never creates one.
    fn existing(&self, values: &[&str]) -> Option<B::Series> {
        let key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        self.series.get(&key).map(|c| c.value().clone())
    }
}

#[derive(Debug, Clone)]
enum AnyFamily {
    Counter(Arc<Family<CounterVec>>),
    Gauge(Arc<Family<GaugeVec>>),
    Histogram(Arc<Family<HistogramVec>>),
}

impl AnyFamily {
    fn desc(&self) -> &FamilyDesc {
        match self {
            AnyFamily::Counter(f) => &f.desc,
            AnyFamily::Gauge(f) => &f.desc,
            AnyFamily::Histogram(f) => &f.desc,
        }
    }

    /// Label-free families always expose their single series.
    fn touch_unlabelled(&self) {
        if !self.desc().label_keys.is_empty() {
            return;
        }
        match self {
            AnyFamily::Counter(f) => {
                f.cell(&[]);
            }
            AnyFamily::Gauge(f) => {
                f.cell(&[]);
            }
            AnyFamily::Histogram(f) => {
                f.cell(&[]);
            }
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// The process metrics registry. Cheap to clone.
#[derive(Clone)]
pub struct Registry {
    families: Arc<RwLock<BTreeMap<String, AnyFamily>>>,
    backend: prometheus::Registry,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let families = self.families.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Registry")
            .field("policy", &self.shared.policy)
            .field("families", &families.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn backend_error(name: &str, e: prometheus::Error) -> MetricsError {
    MetricsError::Backend {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_policy(LabelPolicy::default())
    }

    pub fn with_policy(policy: LabelPolicy) -> Self {
        let backend = prometheus::Registry::new();
        let desc = FamilyDesc {
            name: INTERNAL_ERRORS_METRIC.to_string(),
            help: "Observations dropped by the telemetry core".to_string(),
            kind: MetricKind::Counter,
            label_keys: vec!["component".to_string()],
            buckets: Vec::new(),
        };

        let internal = CounterVec::build(&desc).and_then(|vec| {
            backend.register(vec.collector())?;
            let counter = vec.series(&["metrics"])?;
            Ok((vec, counter))
        });
        let (vec, counter) = match internal {
            Ok((vec, counter)) => (Some(vec), Some(counter)),
            Err(e) => {
                tracing::error!(error = %e, "internal error counter unavailable");
                (None, None)
            }
        };
        let shared = Arc::new(Shared {
            policy,
            internal_errors: counter.clone(),
        });

        let mut families = BTreeMap::new();
        if let (Some(vec), Some(counter)) = (vec, counter) {
            let family = Family::new(desc, vec, Arc::clone(&shared));
            family.series.insert(vec!["metrics".to_string()], counter);
            families.insert(
                INTERNAL_ERRORS_METRIC.to_string(),
                AnyFamily::Counter(Arc::new(family)),
            );
        }

        Self {
            families: Arc::new(RwLock::new(families)),
            backend,
            shared,
        }
    }

    pub fn policy(&self) -> LabelPolicy {
        self.shared.policy
    }

    /// Observations dropped under [`LabelPolicy::Drop`].
    pub fn internal_errors(&self) -> f64 {
        self.shared
            .internal_errors
            .as_ref()
            .map(|c| c.get())
            .unwrap_or(0.0)
    }

    /// The backing `prometheus` registry, for exposition.
    pub fn backend(&self) -> &prometheus::Registry {
        &self.backend
    }

    pub fn counter(&self, name: &str, help: &str, labels: &[&str]) -> Result<Counter, MetricsError> {
        let desc = describe(name, help, labels, MetricKind::Counter, Vec::new())?;
        match self.register::<CounterVec>(desc, AnyFamily::Counter)? {
            AnyFamily::Counter(family) => Ok(Counter { family }),
            _ => Err(MetricsError::Conflict {
                name: name.to_string(),
            }),
        }
    }

    pub fn gauge(&self, name: &str, help: &str, labels: &[&str]) -> Result<Gauge, MetricsError> {
        let desc = describe(name, help, labels, MetricKind::Gauge, Vec::new())?;
        match self.register::<GaugeVec>(desc, AnyFamily::Gauge)? {
            AnyFamily::Gauge(family) => Ok(Gauge { family }),
            _ => Err(MetricsError::Conflict {
                name: name.to_string(),
            }),
        }
    }

    /// Buckets must be finite, non-empty and strictly increasing. `+Inf` is
    /// implied and must not be passed.
    pub fn histogram(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        buckets: &[f64],
    ) -> Result<Histogram, MetricsError> {
        validate_buckets(name, buckets)?;
        if labels.contains(&"le") {
            return Err(MetricsError::InvalidLabel {
                name: name.to_string(),
                label: "le".to_string(),
            });
        }
        let desc = describe(name, help, labels, MetricKind::Histogram, buckets.to_vec())?;
        match self.register::<HistogramVec>(desc, AnyFamily::Histogram)? {
            AnyFamily::Histogram(family) => Ok(Histogram { family }),
            _ => Err(MetricsError::Conflict {
                name: name.to_string(),
            }),
        }
    }

    fn register<B: SeriesBackend>(
        &self,
        desc: FamilyDesc,
        wrap: fn(Arc<Family<B>>) -> AnyFamily,
    ) -> Result<AnyFamily, MetricsError> {
        let mut families = self.families.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = families.get(&desc.name) {
            if existing.desc() == &desc {
                return Ok(existing.clone());
            }
            return Err(MetricsError::Conflict { name: desc.name });
        }

        let backend = B::build(&desc).map_err(|e| backend_error(&desc.name, e))?;
        self.backend
            .register(backend.collector())
            .map_err(|e| backend_error(&desc.name, e))?;

        let name = desc.name.clone();
        let family = wrap(Arc::new(Family::new(desc, backend, Arc::clone(&self.shared))));
        family.touch_unlabelled();
        families.insert(name, family.clone());
        Ok(family)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.families
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    /// Registered family names, in name order.
    pub fn family_names(&self) -> Vec<String> {
        self.families
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

fn describe(
    name: &str,
    help: &str,
    labels: &[&str],
    kind: MetricKind,
    buckets: Vec<f64>,
) -> Result<FamilyDesc, MetricsError> {
    if !valid_metric_name(name) {
        return Err(MetricsError::InvalidName(name.to_string()));
    }
    let mut seen = Vec::with_capacity(labels.len());
    for label in labels {
        if !valid_label_name(label) || seen.contains(label) {
            return Err(MetricsError::InvalidLabel {
                name: name.to_string(),
                label: label.to_string(),
            });
        }
        seen.push(*label);
    }
    Ok(FamilyDesc {
        name: name.to_string(),
        help: help.to_string(),
        kind,
        label_keys: labels.iter().map(|l| l.to_string()).collect(),
        buckets,
    })
}

fn validate_buckets(name: &str, buckets: &[f64]) -> Result<(), MetricsError> {
    let invalid = |reason: &str| MetricsError::InvalidBuckets {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if buckets.is_empty() {
        return Err(invalid("no buckets given"));
    }
    if buckets.iter().any(|b| !b.is_finite()) {
        return Err(invalid("bucket bounds must be finite"));
    }
    if buckets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid("bucket bounds must be strictly increasing"));
    }
    Ok(())
}

// ============================================================================
// Handles
// ============================================================================

/// A counter family.
#[derive(Debug, Clone)]
pub struct Counter {
    family: Arc<Family<CounterVec>>,
}

/// A counter bound to one label tuple. A handle from a rejected tuple is inert.
#[derive(Clone)]
pub struct CounterHandle {
    cell: Option<prometheus::Counter>,
    family: Arc<Family<CounterVec>>,
}

impl std::fmt::Debug for CounterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterHandle")
            .field("family", &self.family.desc.name)
            .field("value", &self.get())
            .finish()
    }
}

impl Counter {
    pub fn with_labels(&self, values: &[&str]) -> CounterHandle {
        CounterHandle {
            cell: self.family.cell(values),
            family: Arc::clone(&self.family),
        }
    }

    pub fn inc(&self) {
        self.with_labels(&[]).inc();
    }

    pub fn inc_by(&self, delta: f64) {
        self.with_labels(&[]).inc_by(delta);
    }

    /// Current value of a series, zero if it has never been recorded.
    pub fn get(&self, values: &[&str]) -> f64 {
        self.family.existing(values).map(|c| c.get()).unwrap_or(0.0)
    }

    pub fn name(&self) -> &str {
        &self.family.desc.name
    }
}

impl CounterHandle {
    pub fn inc(&self) {
        self.inc_by(1.0);
    }

    pub fn inc_by(&self, delta: f64) {
        let Some(cell) = &self.cell else { return };
        if delta < 0.0 || delta.is_nan() {
            self.family
                .shared
                .reject(&self.family.desc.name, "counters cannot decrease");
            return;
        }
        cell.inc_by(delta);
    }

    pub fn get(&self) -> f64 {
        self.cell.as_ref().map(|c| c.get()).unwrap_or(0.0)
    }
}

/// A gauge family.
#[derive(Debug, Clone)]
pub struct Gauge {
    family: Arc<Family<GaugeVec>>,
}

/// A gauge bound to one label tuple.
#[derive(Clone)]
pub struct GaugeHandle {
    cell: Option<prometheus::Gauge>,
}

impl std::fmt::Debug for GaugeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaugeHandle")
            .field("value", &self.get())
            .finish()
    }
}

impl Gauge {
    pub fn with_labels(&self, values: &[&str]) -> GaugeHandle {
        GaugeHandle {
            cell: self.family.cell(values),
        }
    }

    pub fn set(&self, value: f64) {
        self.with_labels(&[]).set(value);
    }

    pub fn add(&self, delta: f64) {
        self.with_labels(&[]).add(delta);
    }

    pub fn sub(&self, delta: f64) {
        self.with_labels(&[]).sub(delta);
    }

    pub fn get(&self, values: &[&str]) -> f64 {
        self.family.existing(values).map(|c| c.get()).unwrap_or(0.0)
    }

    pub fn name(&self) -> &str {
        &self.family.desc.name
    }
}

impl GaugeHandle {
    pub fn set(&self, value: f64) {
        if let Some(cell) = &self.cell {
            cell.set(value);
        }
    }

    pub fn add(&self, delta: f64) {
        if let Some(cell) = &self.cell {
            cell.add(delta);
        }
    }

    pub fn sub(&self, delta: f64) {
        self.add(-delta);
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn dec(&self) {
        self.add(-1.0);
    }

    pub fn get(&self) -> f64 {
        self.cell.as_ref().map(|c| c.get()).unwrap_or(0.0)
    }
}

/// A histogram family.
#[derive(Debug, Clone)]
pub struct Histogram {
    family: Arc<Family<HistogramVec>>,
}

/// A histogram bound to one label tuple.
#[derive(Clone)]
pub struct HistogramHandle {
    cell: Option<prometheus::Histogram>,
}

impl std::fmt::Debug for HistogramHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistogramHandle")
            .field("count", &self.count())
            .finish()
    }
}

impl Histogram {
    pub fn with_labels(&self, values: &[&str]) -> HistogramHandle {
        HistogramHandle {
            cell: self.family.cell(values),
        }
    }

    pub fn observe(&self, value: f64) {
        self.with_labels(&[]).observe(value);
    }

    /// `(count, sum)` of a series.
    pub fn get(&self, values: &[&str]) -> (u64, f64) {
        self.family
            .existing(values)
            .map(|c| (c.get_sample_count(), c.get_sample_sum()))
            .unwrap_or((0, 0.0))
    }

    pub fn name(&self) -> &str {
        &self.family.desc.name
    }
}

impl HistogramHandle {
    pub fn observe(&self, value: f64) {
        if let Some(cell) = &self.cell {
            cell.observe(value);
        }
    }

    pub fn observe_duration(&self, duration: std::time::Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Starts a timer that records its elapsed seconds on drop.
    pub fn start_timer(&self) -> DurationGuard {
        DurationGuard::new(self.clone())
    }

    pub fn count(&self) -> u64 {
        self.cell
            .as_ref()
            .map(|c| c.get_sample_count())
            .unwrap_or(0)
    }
}

/// Timer guard that automatically records duration when dropped
pub struct DurationGuard {
    start: Instant,
    histogram: HistogramHandle,
    armed: bool,
}

impl DurationGuard {
    pub fn new(histogram: HistogramHandle) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            armed: true,
        }
    }

    /// Drops the guard without recording.
    pub fn discard(mut self) {
        self.armed = false;
    }
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        if self.armed {
            self.histogram.observe_duration(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::exposition::encode_text;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::with_policy(LabelPolicy::Drop)
    }

    #[test]
    fn test_counter_series() {
        let r = registry();
        let c = r
            .counter("jobs_total", "Jobs processed", &["queue", "status"])
            .unwrap();
        c.with_labels(&["billing", "ok"]).inc();
        c.with_labels(&["billing", "ok"]).inc_by(2.0);
        c.with_labels(&["billing", "failed"]).inc();

        assert_eq!(c.get(&["billing", "ok"]), 3.0);
        assert_eq!(c.get(&["billing", "failed"]), 1.0);
        assert_eq!(c.get(&["billing", "retry"]), 0.0);
    }

    #[test]
    fn test_reading_a_series_does_not_expose_it() {
        let r = registry();
        let c = r.counter("reads_total", "Reads", &["k"]).unwrap();
        assert_eq!(c.get(&["never"]), 0.0);

        let text = encode_text(&r).unwrap();
        assert!(!text.contains("never"));
    }

    #[test]
    fn test_identical_registration_is_idempotent() {
        let r = registry();
        let a = r.counter("events_total", "Events", &["kind"]).unwrap();
        let b = r.counter("events_total", "Events", &["kind"]).unwrap();
        a.with_labels(&["x"]).inc();
        assert_eq!(b.get(&["x"]), 1.0);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let r = registry();
        r.counter("events_total", "Events", &["kind"]).unwrap();

        let err = r.counter("events_total", "Events", &["other"]).unwrap_err();
        assert_eq!(
            err,
            MetricsError::Conflict {
                name: "events_total".to_string()
            }
        );
        assert!(r.gauge("events_total", "Events", &["kind"]).is_err());
        assert!(r.counter("events_total", "Different help", &["kind"]).is_err());
    }

    #[test]
    fn test_invalid_names() {
        let r = registry();
        assert!(matches!(
            r.counter("9lives", "", &[]),
            Err(MetricsError::InvalidName(_))
        ));
        assert!(matches!(
            r.counter("ok_total", "", &["bad-label"]),
            Err(MetricsError::InvalidLabel { .. })
        ));
        assert!(matches!(
            r.counter("ok_total", "", &["__reserved"]),
            Err(MetricsError::InvalidLabel { .. })
        ));
        assert!(matches!(
            r.histogram("latency", "", &["le"], &[1.0]),
            Err(MetricsError::InvalidLabel { .. })
        ));
    }

    #[test]
    fn test_invalid_buckets() {
        let r = registry();
        for buckets in [&[][..], &[1.0, 1.0][..], &[2.0, 1.0][..], &[1.0, f64::INFINITY][..]] {
            assert!(matches!(
                r.histogram("latency_seconds", "", &[], buckets),
                Err(MetricsError::InvalidBuckets { .. })
            ));
        }
    }

    #[test]
    fn test_label_mismatch_is_dropped_and_counted() {
        let r = registry();
        let c = r.counter("calls_total", "", &["method"]).unwrap();
        c.with_labels(&["GET", "extra"]).inc();
        c.with_labels(&[]).inc();
        c.with_labels(&["GET"]).inc_by(-1.0);

        assert_eq!(r.internal_errors(), 3.0);
        assert_eq!(c.get(&["GET"]), 0.0);
    }

    #[test]
    #[should_panic(expected = "expected 1 label values, got 0")]
    fn test_label_mismatch_panics_under_panic_policy() {
        let r = Registry::with_policy(LabelPolicy::Panic);
        let c = r.counter("calls_total", "", &["method"]).unwrap();
        c.inc();
    }

    #[test]
    fn test_gauge_operations() {
        let r = registry();
        let g = r.gauge("queue_depth", "", &[]).unwrap();
        g.set(10.0);
        g.add(5.0);
        g.sub(3.0);
        assert_eq!(g.get(&[]), 12.0);
    }

    #[test]
    fn test_histogram_count_and_sum() {
        let r = registry();
        let h = r
            .histogram("latency_seconds", "", &[], &[0.1, 0.5, 1.0])
            .unwrap();
        for v in [0.05, 0.1, 0.3, 0.7, 2.0] {
            h.observe(v);
        }

        let (count, sum) = h.get(&[]);
        assert_eq!(count, 5);
        assert!((sum - 3.15).abs() < 1e-9);
    }

    #[test]
    fn test_family_names_are_ordered() {
        let r = registry();
        r.counter("b_total", "", &["k"]).unwrap();
        r.counter("a_total", "", &[]).unwrap();

        assert_eq!(
            r.family_names(),
            vec!["a_total", "b_total", INTERNAL_ERRORS_METRIC]
        );
    }

    #[test]
    fn test_duration_guard_records() {
        let r = registry();
        let h = r
            .histogram("op_seconds", "", &["op"], DEFAULT_DURATION_BUCKETS)
            .unwrap();
        let handle = h.with_labels(&["sync"]);
        {
            let _guard = handle.start_timer();
        }
        handle.start_timer().discard();
        assert_eq!(h.get(&["sync"]).0, 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let r = registry();
        let c = r.counter("hits_total", "", &[]).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        c.inc();
                    }
                });
            }
        });
        assert_eq!(c.get(&[]), 8000.0);
    }
}
