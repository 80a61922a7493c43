//! The tracer: span start, sampling, the active registry and the export
//! pipeline.

use super::exporter::SpanExporter;
use super::ids::{SpanContext, SpanId, TraceId};
use super::propagation::{Extracted, Extractor, Injector, Propagator};
use super::span::{
    RecordingSpan, Resource, Span, SpanData, SpanKind, SpanLimits, SpanLink, SpanProcessor,
    SpanStatus,
};
use crate::attributes::{Attributes, Sanitizer};
use crate::config::TelemetryConfig;
use crate::context::TelemetryContext;
use crate::error::{ExportError, MetricsError};
use crate::metrics::pipeline;
use crate::metrics::{Counter, Gauge, Registry};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const FORCED_SHUTDOWN_MESSAGE: &str = "tracer shutdown";

/// Options for [`Tracer::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub attributes: Attributes,
    pub links: Vec<SpanLink>,
    /// Parent extracted from an inbound carrier. Used only when the context
    /// carries no span of its own.
    pub remote_parent: Option<Extracted>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::attributes::AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn link(mut self, link: SpanLink) -> Self {
        self.links.push(link);
        self
    }

    pub fn remote_parent(mut self, parent: Option<Extracted>) -> Self {
        self.remote_parent = parent;
        self
    }
}

struct Parent {
    trace_id: TraceId,
    span_id: Option<SpanId>,
    sampled: Option<bool>,
    trace_state: Option<String>,
}

#[derive(Debug, Clone)]
struct TracerMetrics {
    exported: Counter,
    dropped: Counter,
    failures: Counter,
    active: Gauge,
}

impl TracerMetrics {
    fn new(registry: &Registry) -> Result<Self, MetricsError> {
        Ok(Self {
            exported: pipeline::spans_exported(registry)?,
            dropped: pipeline::spans_dropped(registry)?,
            failures: pipeline::export_failures(registry)?,
            active: pipeline::active_spans(registry)?,
        })
    }
}

struct TracerCore {
    weak_self: Weak<TracerCore>,
    sample_rate: f64,
    force_sampling: bool,
    limits: SpanLimits,
    sanitizer: Arc<Sanitizer>,
    propagator: Propagator,
    enable_baggage: bool,
    resource: Arc<Resource>,
    async_export: bool,
    batch_size: usize,
    export_timeout: Duration,
    max_queue_size: usize,
    flush_interval: Duration,
    log_spans: bool,
    active: RwLock<HashMap<SpanId, Arc<RecordingSpan>>>,
    queue: Mutex<VecDeque<SpanData>>,
    exporters: RwLock<Vec<Arc<dyn SpanExporter>>>,
    flush_lock: tokio::sync::Mutex<()>,
    tasks: TaskTracker,
    stop: CancellationToken,
    shut_down: AtomicBool,
    metrics: TracerMetrics,
}

/// Creates spans and ships them to the registered exporters. Cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    core: Arc<TracerCore>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("service", &self.core.resource.service_name)
            .field("sample_rate", &self.core.sample_rate)
            .field("active_spans", &self.active_span_count())
            .finish()
    }
}

impl Tracer {
    pub fn new(config: &TelemetryConfig, registry: &Registry) -> Result<Self, MetricsError> {
        let metrics = TracerMetrics::new(registry)?;
        let core = Arc::new_cyclic(|weak_self| TracerCore {
            weak_self: weak_self.clone(),
            sample_rate: config.sample_rate,
            force_sampling: config.force_sampling,
            limits: SpanLimits {
                max_attributes: config.max_attributes_per_span,
                max_events: config.max_events_per_span,
                max_links: config.max_links_per_span,
            },
            sanitizer: Arc::new(Sanitizer::new(
                &config.sanitize_attributes,
                config.enable_sanitization,
            )),
            propagator: Propagator::new(config.propagation_format, config.enable_baggage),
            enable_baggage: config.enable_baggage,
            resource: Arc::new(Resource::detect(
                config.service_name.as_str(),
                config.service_version.as_str(),
                config.environment.as_str(),
            )),
            async_export: config.async_export,
            batch_size: config.batch_size.max(1),
            export_timeout: config.export_timeout,
            max_queue_size: config.max_queue_size.max(1),
            flush_interval: config.flush_interval,
            log_spans: config.log_spans,
            active: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            exporters: RwLock::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            tasks: TaskTracker::new(),
            stop: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            metrics,
        });
        Ok(Self { core })
    }

    pub fn add_exporter(&self, exporter: Arc<dyn SpanExporter>) {
        self.core
            .exporters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(exporter);
    }

    pub fn propagator(&self) -> &Propagator {
        &self.core.propagator
    }

    pub fn resource(&self) -> &Resource {
        &self.core.resource
    }

    /// Reads a remote parent from `carrier` in the configured format.
    pub fn extract(&self, carrier: &dyn Extractor) -> Option<Extracted> {
        self.core.propagator.extract(carrier)
    }

    /// Writes the span context and baggage of `ctx` into `carrier`.
    pub fn inject(&self, ctx: &TelemetryContext, carrier: &mut dyn Injector) {
        self.core.propagator.inject(ctx, carrier);
    }

    /// Starts a span and returns the derived context carrying it.
    ///
    /// The parent is the span on `ctx`, else `options.remote_parent`, else
    /// the raw `trace_id`/`span_id` strings on `ctx`. Without any parent a
    /// new trace begins. After shutdown a non-recording span is returned.
    pub fn start(
        &self,
        ctx: &TelemetryContext,
        operation: &str,
        kind: SpanKind,
        options: StartOptions,
    ) -> (TelemetryContext, Span) {
        let core = &self.core;
        let StartOptions {
            attributes,
            links,
            remote_parent,
        } = options;

        let mut remote_baggage = None;
        let parent = match (ctx.span_context(), remote_parent) {
            (Some(sc), _) if sc.is_valid() => Some(Parent {
                trace_id: sc.trace_id,
                span_id: Some(sc.span_id),
                sampled: Some(sc.sampled),
                trace_state: sc.trace_state.clone(),
            }),
            (_, Some(extracted)) => {
                remote_baggage = Some(extracted.baggage);
                Some(Parent {
                    trace_id: extracted.span_context.trace_id,
                    span_id: Some(extracted.span_context.span_id),
                    sampled: extracted.sampled,
                    trace_state: extracted.span_context.trace_state,
                })
            }
            _ => TraceId::from_hex(ctx.trace_id()).ok().map(|trace_id| Parent {
                trace_id,
                span_id: SpanId::from_hex(ctx.span_id()).ok(),
                sampled: None,
                trace_state: None,
            }),
        };

        let (trace_id, parent_span_id, inherited, trace_state) = match parent {
            Some(p) => (p.trace_id, p.span_id, p.sampled, p.trace_state),
            None => (TraceId::generate(), None, None, None),
        };
        let span_id = SpanId::generate();
        let sampled = !core.shut_down.load(Ordering::Acquire) && core.should_sample(inherited);

        let mut span_context = SpanContext::new(trace_id, span_id, sampled);
        span_context.trace_state = trace_state;

        let mut next = ctx.with_span_context(span_context.clone());
        if next.correlation_id().is_empty() {
            next = next.with_correlation_id(trace_id.to_string());
        }
        if core.enable_baggage {
            for (key, value) in remote_baggage.into_iter().flatten() {
                next = next.with_baggage(key, value);
            }
        }

        if !sampled {
            return (next, Span::non_recording(span_context));
        }

        let data = SpanData {
            trace_id,
            span_id,
            parent_span_id,
            name: operation.to_string(),
            kind,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: Duration::ZERO,
            status: SpanStatus::default(),
            attributes: Attributes::new(),
            events: Vec::new(),
            links: Vec::new(),
            sampled,
            sample_rate: core.sample_rate,
            resource: Arc::clone(&core.resource),
            dropped_attributes: 0,
            dropped_events: 0,
            dropped_links: 0,
        };
        let weak: Weak<TracerCore> = core.weak_self.clone();
        let processor: Weak<dyn SpanProcessor> = weak;
        let recording = Arc::new(RecordingSpan::new(
            data,
            core.limits,
            Arc::clone(&core.sanitizer),
            next.clone(),
            processor,
        ));
        let span = Span::recording(span_context, Arc::clone(&recording));
        span.set_attributes(attributes);
        for link in links {
            span.add_link(link);
        }

        {
            let mut active = core.active.write().unwrap_or_else(|e| e.into_inner());
            active.insert(span_id, recording);
            core.metrics.active.set(active.len() as f64);
        }

        (next, span)
    }

    /// Number of sampled spans started and not yet finished.
    pub fn active_span_count(&self) -> usize {
        self.core
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Spans waiting in the export queue.
    pub fn queued_span_count(&self) -> usize {
        self.core
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Exports everything queued and waits for in-flight synchronous exports.
    pub async fn force_flush(&self) {
        self.core.flush().await;
        self.core.tasks.close();
        self.core.tasks.wait().await;
        self.core.tasks.reopen();
    }

    /// Starts the periodic flusher. It stops when `token` is cancelled or
    /// the tracer shuts down.
    pub fn spawn_flusher(&self, token: CancellationToken) -> JoinHandle<()> {
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = core.stop.cancelled() => break,
                    _ = interval.tick() => core.flush().await,
                }
            }
            debug!("span flusher stopped");
        })
    }

    /// Stops the flusher, ends every active span with an error status,
    /// exports what is queued and shuts the exporters down within the
    /// deadline of `ctx`.
    pub async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ExportError> {
        let core = &self.core;
        if core.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        core.stop.cancel();

        let still_active: Vec<Arc<RecordingSpan>> = core
            .active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        if !still_active.is_empty() {
            warn!(count = still_active.len(), "ending unfinished spans at shutdown");
        }
        for span in still_active {
            span.end(Some(SpanStatus::error(FORCED_SHUTDOWN_MESSAGE)));
        }

        let drain = async {
            self.force_flush().await;
        };
        let mut result = Ok(());
        if within_deadline(ctx, drain).await.is_none() {
            result = Err(ExportError::Timeout(ctx.remaining().unwrap_or_default()));
        }

        let exporters = core.exporters();
        for exporter in exporters {
            match within_deadline(ctx, exporter.shutdown(ctx)).await {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    warn!(exporter = exporter.name(), error = %e, "span exporter shutdown failed");
                    result = result.and(Err(e));
                }
                None => {
                    warn!(exporter = exporter.name(), "span exporter shutdown timed out");
                    result = result.and(Err(ExportError::Timeout(Duration::ZERO)));
                }
            }
        }

        info!("tracer shut down");
        result
    }
}

/// Runs `fut` until it completes, `ctx` is cancelled or its deadline passes.
pub(crate) async fn within_deadline<F: std::future::Future>(
    ctx: &TelemetryContext,
    fut: F,
) -> Option<F::Output> {
    tokio::select! {
        out = fut => Some(out),
        _ = ctx.cancelled() => None,
    }
}

impl TracerCore {
    fn should_sample(&self, inherited: Option<bool>) -> bool {
        if self.force_sampling {
            return true;
        }
        match inherited {
            Some(sampled) => sampled,
            None if self.sample_rate >= 1.0 => true,
            None if self.sample_rate <= 0.0 => false,
            None => rand::thread_rng().gen::<f64>() < self.sample_rate,
        }
    }

    fn exporters(&self) -> Vec<Arc<dyn SpanExporter>> {
        self.exporters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn enqueue(&self, data: SpanData) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= self.max_queue_size {
            self.metrics.dropped.with_labels(&["queue_full"]).inc();
            return;
        }
        queue.push_back(data);
    }

    async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        loop {
            let batch: Vec<SpanData> = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                let n = queue.len().min(self.batch_size);
                queue.drain(..n).collect()
            };
            if batch.is_empty() {
                break;
            }
            self.export_batch(&batch).await;
        }
    }

    async fn export_batch(&self, batch: &[SpanData]) {
        let exporters = self.exporters();
        if exporters.is_empty() {
            self.metrics
                .dropped
                .with_labels(&["no_exporter"])
                .inc_by(batch.len() as f64);
            return;
        }
        for exporter in exporters {
            match tokio::time::timeout(self.export_timeout, exporter.export(batch)).await {
                Ok(Ok(())) => self.metrics.exported.inc_by(batch.len() as f64),
                Ok(Err(e)) => {
                    self.metrics.failures.with_labels(&["tracing"]).inc();
                    warn!(exporter = exporter.name(), error = %e, spans = batch.len(), "span export failed");
                }
                Err(_) => {
                    self.metrics.failures.with_labels(&["tracing"]).inc();
                    warn!(
                        exporter = exporter.name(),
                        timeout_ms = self.export_timeout.as_millis() as u64,
                        "span export timed out"
                    );
                }
            }
        }
    }
}

impl SpanProcessor for TracerCore {
    fn on_end(&self, data: SpanData) {
        {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            active.remove(&data.span_id);
            self.metrics.active.set(active.len() as f64);
        }

        if self.log_spans {
            debug!(
                span.name = %data.name,
                trace_id = %data.trace_id,
                span_id = %data.span_id,
                duration_ms = data.duration.as_millis() as u64,
                status = ?data.status.code,
                "span finished"
            );
        }

        if self.async_export || self.stop.is_cancelled() {
            self.enqueue(data);
            return;
        }

        let Some(core) = self.weak_self.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = async move { core.export_batch(std::slice::from_ref(&data)).await };
                self.tasks.spawn_on(task, &handle);
            }
            Err(_) => self.enqueue(data),
        }
    }
}

#[async_trait]
impl crate::shutdown::GracefulShutdown for Tracer {
    fn name(&self) -> &str {
        "tracer"
    }

    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), crate::shutdown::ShutdownError> {
        Tracer::shutdown(self, ctx)
            .await
            .map_err(|e| crate::shutdown::ShutdownError::ComponentFailed {
                component: "tracer".to_string(),
                reason: e.to_string(),
            })
    }
}
