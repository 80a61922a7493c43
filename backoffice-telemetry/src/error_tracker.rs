//! Error tracking with deduplication, aggregation and bounded retention.
//!
//! - Repeats of the same `(type, message)` update one stored event.
//! - Aggregations group events by `(type, category, component)`.
//! - After every insertion, events older than `max_age` are pruned, then the
//!   oldest are dropped until at most `max_errors` remain.
//! - Newly stored events are handed to the registered exporters through a
//!   bounded queue drained by a single background task.

use crate::attributes::{Attributes, Sanitizer};
use crate::config::TelemetryConfig;
use crate::context::TelemetryContext;
use crate::error::TelemetryError;
use crate::logging::LogLevel;
use crate::metrics::pipeline;
use crate::metrics::{Counter, Registry};
use crate::shutdown::{GracefulShutdown, ShutdownError};
use crate::tracer::exporter::ErrorExporter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Debug => "debug",
            ErrorSeverity::Info => "info",
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
            ErrorSeverity::Fatal => "fatal",
        }
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            ErrorSeverity::Debug => LogLevel::Debug,
            ErrorSeverity::Info => LogLevel::Info,
            ErrorSeverity::Warning => LogLevel::Warn,
            ErrorSeverity::Error | ErrorSeverity::Critical => LogLevel::Error,
            ErrorSeverity::Fatal => LogLevel::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    System,
    Network,
    Database,
    Auth,
    Business,
    Validation,
    External,
    Security,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::System => "system",
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Business => "business",
            ErrorCategory::Validation => "validation",
            ErrorCategory::External => "external",
            ErrorCategory::Security => "security",
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One deduplicated error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub message: String,
    pub error_type: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub context: Attributes,
    pub recoverable: bool,
    pub affected_users: BTreeSet<String>,
    pub tags: BTreeMap<String, String>,
}

/// The input of [`ErrorTracker::track_report`].
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub error_type: String,
    pub message: String,
    pub severity: ErrorSeverity,
    pub category: ErrorCategory,
    pub component: String,
    pub context: Attributes,
    pub stack_trace: Option<String>,
    pub recoverable: bool,
    pub tags: BTreeMap<String, String>,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            severity: ErrorSeverity::Error,
            category: ErrorCategory::System,
            component: "unknown".to_string(),
            context: Attributes::new(),
            stack_trace: None,
            recoverable: true,
            tags: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn context(mut self, context: Attributes) -> Self {
        self.context = context;
        self
    }

    pub fn stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregationKey {
    pub error_type: String,
    pub category: ErrorCategory,
    pub component: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorAggregation {
    pub key: AggregationKey,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub unique_users: BTreeSet<String>,
    pub event_ids: BTreeSet<String>,
    /// Occurrences per hour since `first_seen`, with at least one hour as
    /// the denominator.
    pub trend: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total_events: usize,
    pub total_occurrences: u64,
    pub by_severity: BTreeMap<String, u64>,
    pub by_category: BTreeMap<String, u64>,
    pub by_component: BTreeMap<String, u64>,
}

/// Deterministic id of an error: the first 32 hex chars of
/// `sha256(type || 0x00 || message)`.
pub fn error_id(error_type: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(32);
    id
}

/// Text of a panic payload from `catch_unwind` or `JoinError::into_panic`.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Clone)]
pub struct ErrorTrackerConfig {
    pub max_errors: usize,
    pub max_age: Duration,
    pub queue_size: usize,
    pub export_timeout: Duration,
    pub sanitizer: Sanitizer,
}

impl Default for ErrorTrackerConfig {
    fn default() -> Self {
        Self {
            max_errors: 1000,
            max_age: Duration::from_secs(24 * 60 * 60),
            queue_size: 1024,
            export_timeout: Duration::from_secs(10),
            sanitizer: Sanitizer::default(),
        }
    }
}

impl From<&TelemetryConfig> for ErrorTrackerConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            max_errors: config.error_max_entries,
            max_age: config.error_max_age,
            queue_size: config.error_queue_size,
            export_timeout: config.export_timeout,
            sanitizer: Sanitizer::new(&config.sanitize_attributes, config.enable_sanitization),
        }
    }
}

enum Command {
    Export(Box<ErrorEvent>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

type Exporters = Arc<RwLock<Vec<Arc<dyn ErrorExporter>>>>;

struct TrackerInner {
    config: ErrorTrackerConfig,
    events: RwLock<HashMap<String, ErrorEvent>>,
    aggregations: RwLock<BTreeMap<AggregationKey, ErrorAggregation>>,
    exporters: Exporters,
    tx: mpsc::Sender<Command>,
    tracked: Counter,
    dropped: Counter,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Deduplicating error store. Cheap to clone.
#[derive(Clone)]
pub struct ErrorTracker {
    inner: Arc<TrackerInner>,
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("max_errors", &self.inner.config.max_errors)
            .field("events", &self.len())
            .finish()
    }
}

impl ErrorTracker {
    /// Creates the tracker and spawns its export task on the current Tokio
    /// runtime.
    pub fn new(config: ErrorTrackerConfig, registry: &Registry) -> Result<Self, TelemetryError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::Runtime(e.to_string()))?;

        let tracked = pipeline::errors_tracked(registry)?;
        let dropped = pipeline::error_events_dropped(registry)?;
        let failures = pipeline::export_failures(registry)?;
        let exporters: Exporters = Arc::new(RwLock::new(Vec::new()));
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));

        let worker = runtime.spawn(export_loop(
            rx,
            Arc::clone(&exporters),
            config.export_timeout,
            failures,
        ));

        Ok(Self {
            inner: Arc::new(TrackerInner {
                config,
                events: RwLock::new(HashMap::new()),
                aggregations: RwLock::new(BTreeMap::new()),
                exporters,
                tx,
                tracked,
                dropped,
                closed: AtomicBool::new(false),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn add_exporter(&self, exporter: Arc<dyn ErrorExporter>) {
        self.inner
            .exporters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(exporter);
    }

    /// Records `err`. The type is the Rust type name of `E`. Returns the
    /// event id.
    pub fn track<E>(
        &self,
        ctx: &TelemetryContext,
        err: &E,
        component: &str,
        severity: ErrorSeverity,
        category: ErrorCategory,
        extra: Attributes,
    ) -> String
    where
        E: std::error::Error + ?Sized,
    {
        let report = ErrorReport::new(std::any::type_name::<E>(), err.to_string())
            .severity(severity)
            .category(category)
            .component(component)
            .context(extra);
        self.track_report(ctx, report)
    }

    pub fn track_report(&self, ctx: &TelemetryContext, report: ErrorReport) -> String {
        self.record(ctx, report, Utc::now())
    }

    /// Records a recovered panic as a critical, unrecoverable system error
    /// with a captured backtrace.
    pub fn track_panic(
        &self,
        ctx: &TelemetryContext,
        payload: &(dyn Any + Send),
        component: &str,
    ) -> String {
        let report = ErrorReport::new("panic", panic_message(payload))
            .severity(ErrorSeverity::Critical)
            .category(ErrorCategory::System)
            .component(component)
            .stack_trace(Backtrace::force_capture().to_string())
            .recoverable(false);
        self.track_report(ctx, report)
    }

    /// Records a failed task. Panics go through [`track_panic`]; a
    /// cancelled task is recorded as a recoverable system error.
    ///
    /// [`track_panic`]: ErrorTracker::track_panic
    pub fn track_join_error(
        &self,
        ctx: &TelemetryContext,
        err: tokio::task::JoinError,
        component: &str,
    ) -> String {
        if err.is_panic() {
            let payload = err.into_panic();
            self.track_panic(ctx, payload.as_ref(), component)
        } else {
            self.track(ctx, &err, component, ErrorSeverity::Warning, ErrorCategory::System, Attributes::new())
        }
    }

    fn record(&self, ctx: &TelemetryContext, report: ErrorReport, now: DateTime<Utc>) -> String {
        let inner = &self.inner;
        let id = error_id(&report.error_type, &report.message);
        let user_id = non_empty(ctx.user_id());
        let context = inner.config.sanitizer.sanitize_map(report.context);
        let key = AggregationKey {
            error_type: report.error_type.clone(),
            category: report.category,
            component: report.component.clone(),
        };

        inner
            .tracked
            .with_labels(&[report.severity.as_str()])
            .inc();

        let mut new_event = None;
        {
            let mut events = inner.events.write().unwrap_or_else(|e| e.into_inner());
            let mut aggregations = inner
                .aggregations
                .write()
                .unwrap_or_else(|e| e.into_inner());

            match events.get_mut(&id) {
                Some(event) => {
                    event.count += 1;
                    event.last_seen = now.max(event.last_seen);
                    event.context.extend(context);
                    if let Some(user) = &user_id {
                        event.affected_users.insert(user.clone());
                    }
                    if report.severity > event.severity {
                        event.severity = report.severity;
                    }
                }
                None => {
                    let event = ErrorEvent {
                        id: id.clone(),
                        first_seen: now,
                        last_seen: now,
                        count: 1,
                        message: report.message,
                        error_type: report.error_type,
                        severity: report.severity,
                        category: report.category,
                        component: report.component,
                        user_id: user_id.clone(),
                        request_id: non_empty(ctx.request_id()),
                        trace_id: non_empty(ctx.trace_id()),
                        stack_trace: report.stack_trace,
                        context,
                        recoverable: report.recoverable,
                        affected_users: user_id.iter().cloned().collect(),
                        tags: report.tags,
                    };
                    new_event = Some(event.clone());
                    events.insert(id.clone(), event);
                }
            }

            let aggregation = aggregations
                .entry(key.clone())
                .or_insert_with(|| ErrorAggregation {
                    key,
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                    unique_users: BTreeSet::new(),
                    event_ids: BTreeSet::new(),
                    trend: 0.0,
                });
            aggregation.count += 1;
            aggregation.last_seen = now.max(aggregation.last_seen);
            aggregation.event_ids.insert(id.clone());
            if let Some(user) = &user_id {
                aggregation.unique_users.insert(user.clone());
            }
            aggregation.trend = trend(aggregation.count, aggregation.first_seen, now);

            self.prune(&mut events, &mut aggregations, now);
        }

        if let Some(event) = new_event {
            debug!(
                error.id = %event.id,
                error.type = %event.error_type,
                component = %event.component,
                "new error tracked"
            );
            self.enqueue(event);
        }
        id
    }

    fn prune(
        &self,
        events: &mut HashMap<String, ErrorEvent>,
        aggregations: &mut BTreeMap<AggregationKey, ErrorAggregation>,
        now: DateTime<Utc>,
    ) {
        let max_age = chrono::Duration::from_std(self.inner.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut removed: HashSet<String> = HashSet::new();
        events.retain(|id, event| {
            let keep = event.last_seen >= cutoff;
            if !keep {
                removed.insert(id.clone());
            }
            keep
        });

        let max_errors = self.inner.config.max_errors;
        if events.len() > max_errors {
            let mut by_age: Vec<(DateTime<Utc>, String)> = events
                .values()
                .map(|e| (e.last_seen, e.id.clone()))
                .collect();
            by_age.sort();
            let excess = events.len() - max_errors;
            for (_, id) in by_age.into_iter().take(excess) {
                if events.remove(&id).is_some() {
                    removed.insert(id);
                }
            }
        }

        if removed.is_empty() {
            return;
        }
        // One event can feed several aggregations when the same error is
        // reported from more than one component or category.
        aggregations.retain(|_, aggregation| {
            aggregation.event_ids.retain(|id| !removed.contains(id));
            !aggregation.event_ids.is_empty()
        });
    }

    fn enqueue(&self, event: ErrorEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.dropped.with_labels(&["closed"]).inc();
            return;
        }
        match self.inner.tx.try_send(Command::Export(Box::new(event))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.dropped.with_labels(&["queue_full"]).inc();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.dropped.with_labels(&["closed"]).inc();
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Most recently seen first.
    pub fn list(
        &self,
        limit: usize,
        severity: Option<ErrorSeverity>,
        category: Option<ErrorCategory>,
    ) -> Vec<ErrorEvent> {
        let events = self.inner.events.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<ErrorEvent> = events
            .values()
            .filter(|e| severity.map_or(true, |s| e.severity == s))
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        matching.truncate(limit);
        matching
    }

    pub fn get(&self, id: &str) -> Option<ErrorEvent> {
        self.inner
            .events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Highest count first.
    pub fn aggregations(&self) -> Vec<ErrorAggregation> {
        let mut aggregations: Vec<ErrorAggregation> = self
            .inner
            .aggregations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        aggregations.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        aggregations
    }

    pub fn summary(&self) -> ErrorSummary {
        let events = self.inner.events.read().unwrap_or_else(|e| e.into_inner());
        let mut summary = ErrorSummary {
            total_events: events.len(),
            ..Default::default()
        };
        for event in events.values() {
            summary.total_occurrences += event.count;
            *summary
                .by_severity
                .entry(event.severity.as_str().to_string())
                .or_default() += event.count;
            *summary
                .by_category
                .entry(event.category.as_str().to_string())
                .or_default() += event.count;
            *summary
                .by_component
                .entry(event.component.clone())
                .or_default() += event.count;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.inner
            .events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut events = self.inner.events.write().unwrap_or_else(|e| e.into_inner());
        let mut aggregations = self
            .inner
            .aggregations
            .write()
            .unwrap_or_else(|e| e.into_inner());
        events.clear();
        aggregations.clear();
    }

    pub fn dropped(&self, reason: &str) -> f64 {
        self.inner.dropped.get(&[reason])
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Waits until every queued event has been offered to the exporters.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Drains the export queue and shuts every exporter down within the
    /// deadline of `ctx`.
    pub async fn close(&self, ctx: &TelemetryContext) -> Result<(), ShutdownError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let drain = async {
            let (tx, rx) = oneshot::channel();
            if self.inner.tx.send(Command::Shutdown(tx)).await.is_ok() {
                let _ = rx.await;
            }
            let worker = self
                .inner
                .worker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(worker) = worker {
                if let Err(e) = worker.await {
                    warn!(error = %e, "error export task ended abnormally");
                }
            }
        };
        let drained = tokio::select! {
            _ = drain => true,
            _ = ctx.cancelled() => false,
        };

        let exporters = self
            .inner
            .exporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut result = if drained {
            Ok(())
        } else {
            Err(ShutdownError::ComponentFailed {
                component: "error_tracker".to_string(),
                reason: "export queue drain timed out".to_string(),
            })
        };
        for exporter in exporters {
            let outcome = tokio::select! {
                out = exporter.shutdown(ctx) => Some(out),
                _ = ctx.cancelled() => None,
            };
            let failure = match outcome {
                Some(Ok(())) => continue,
                Some(Err(e)) => e.to_string(),
                None => "timed out".to_string(),
            };
            warn!(exporter = exporter.name(), reason = %failure, "error exporter shutdown failed");
            result = result.and(Err(ShutdownError::ComponentFailed {
                component: format!("error_tracker/{}", exporter.name()),
                reason: failure,
            }));
        }
        result
    }
}

#[async_trait]
impl GracefulShutdown for ErrorTracker {
    fn name(&self) -> &str {
        "error_tracker"
    }

    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ShutdownError> {
        self.close(ctx).await
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn trend(count: u64, first_seen: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let hours = (now - first_seen).num_seconds() as f64 / 3600.0;
    count as f64 / hours.max(1.0)
}

async fn export_loop(
    mut rx: mpsc::Receiver<Command>,
    exporters: Exporters,
    timeout: Duration,
    failures: Counter,
) {
    let failures = failures.with_labels(&["error_tracking"]);
    let export = |event: Box<ErrorEvent>| {
        let exporters = exporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let failures = failures.clone();
        async move {
            let batch = std::slice::from_ref(event.as_ref());
            for exporter in exporters {
                match tokio::time::timeout(timeout, exporter.export_errors(batch)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failures.inc();
                        warn!(exporter = exporter.name(), error = %e, "error export failed");
                    }
                    Err(_) => {
                        failures.inc();
                        warn!(exporter = exporter.name(), "error export timed out");
                    }
                }
            }
        }
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::Export(event) => export(event).await,
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Shutdown(done) => {
                while let Ok(Command::Export(event)) = rx.try_recv() {
                    export(event).await;
                }
                let _ = done.send(());
                break;
            }
        }
    }
}
