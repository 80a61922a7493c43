//! The `Telemetry` container: one typed value owning every component.
//!
//! ```no_run
//! use backoffice_telemetry::config::TelemetryConfig;
//! use backoffice_telemetry::Telemetry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = Arc::new(Telemetry::init(TelemetryConfig::default())?);
//! telemetry.start_background();
//!
//! let app = telemetry.router();
//! # let _ = app;
//!
//! telemetry.shutdown(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

use crate::attrs;
use crate::config::TelemetryConfig;
use crate::context::TelemetryContext;
use crate::error::TelemetryError;
use crate::error_tracker::{ErrorTracker, ErrorTrackerConfig};
use crate::health::{probe_fn, BuildInfo, CheckResult, HealthEngine, HealthStatus, ProbeConfig};
use crate::http::{self, HttpMetrics};
use crate::logging::{LogSink, Logger, LoggerConfig, StdoutJsonSink};
use crate::metrics::{PrometheusCollector, Registry, ResourceSampler, TelemetryCollector};
use crate::resilience::{CircuitState, DegradationCoordinator};
use crate::shutdown::{ShutdownCoordinator, ShutdownError};
use crate::tracer::exporter::{ErrorExporter, LogExporter, SpanExporter};
use crate::tracer::Tracer;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound for [`Telemetry::shutdown`] regardless of the caller's
/// deadline.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Name of the built-in, non-critical probe reporting on the pipeline itself.
pub const PIPELINE_PROBE: &str = "telemetry_pipeline";

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`Telemetry`] with custom sinks, exporters and probes.
pub struct TelemetryBuilder {
    config: TelemetryConfig,
    log_sink: Option<Arc<dyn LogSink>>,
    span_exporters: Vec<Arc<dyn SpanExporter>>,
    error_exporters: Vec<Arc<dyn ErrorExporter>>,
    probes: Vec<ProbeConfig>,
    build_info: Option<BuildInfo>,
    registry: Option<Registry>,
}

impl TelemetryBuilder {
    pub fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            log_sink: None,
            span_exporters: Vec::new(),
            error_exporters: Vec::new(),
            probes: Vec::new(),
            build_info: None,
            registry: None,
        }
    }

    /// Replaces the default stdout JSON sink.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.span_exporters.push(exporter);
        self
    }

    pub fn error_exporter(mut self, exporter: Arc<dyn ErrorExporter>) -> Self {
        self.error_exporters.push(exporter);
        self
    }

    pub fn probe(mut self, probe: ProbeConfig) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn build_info(mut self, build_info: BuildInfo) -> Self {
        self.build_info = Some(build_info);
        self
    }

    /// Uses an existing registry instead of a fresh one.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validates the config and wires the components. Must be called inside
    /// a Tokio runtime, since the logger and exporters spawn their workers.
    pub fn build(self) -> Result<Telemetry, TelemetryError> {
        let config = self.config;
        config.validate()?;

        let registry = self.registry.unwrap_or_default();
        let collector = Arc::new(PrometheusCollector::new(&registry)?);
        let coordinator = DegradationCoordinator::new(
            &config,
            Arc::clone(&collector) as Arc<dyn TelemetryCollector>,
            &registry,
        )?;

        let sink = self
            .log_sink
            .unwrap_or_else(|| Arc::new(StdoutJsonSink) as Arc<dyn LogSink>);
        let logger = Logger::new(LoggerConfig::from(&config), sink, &registry)?;

        let breaker_logger = logger.clone();
        coordinator.on_state_change(move |component, from, to| {
            let fields = attrs! {
                "component" => component,
                "from" => from.as_str(),
                "to" => to.as_str(),
            };
            let ctx = TelemetryContext::new();
            if to == CircuitState::Open {
                breaker_logger.warn(&ctx, "circuit breaker opened", fields);
            } else {
                breaker_logger.info(&ctx, "circuit breaker state changed", fields);
            }
        });

        let tracer = Tracer::new(&config, &registry)?;
        if config.log_spans {
            tracer.add_exporter(coordinator.protect_span_exporter(Arc::new(LogExporter::new(
                logger.clone(),
            ))));
        }
        for exporter in self.span_exporters {
            tracer.add_exporter(coordinator.protect_span_exporter(exporter));
        }

        let errors = ErrorTracker::new(ErrorTrackerConfig::from(&config), &registry)?;
        errors.add_exporter(
            coordinator.protect_error_exporter(Arc::new(LogExporter::new(logger.clone()))),
        );
        for exporter in self.error_exporters {
            errors.add_exporter(coordinator.protect_error_exporter(exporter));
        }

        let build_info = self
            .build_info
            .unwrap_or_else(|| BuildInfo::new(config.service_version.clone()));
        let health = Arc::new(HealthEngine::new(build_info));
        health.set_collector(Arc::new(coordinator.clone()));
        health.add(pipeline_probe(coordinator.clone()));
        for probe in self.probes {
            health.add(probe);
        }

        let sampler = Arc::new(ResourceSampler::new(&registry, config.sampler_interval)?);
        let http_metrics = HttpMetrics::new(&registry)?;

        let shutdown = ShutdownCoordinator::new(DEFAULT_SHUTDOWN_TIMEOUT);
        let background = CancellationToken::new();
        let tasks: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let background = background.clone();
            let tasks = Arc::clone(&tasks);
            shutdown.on_shutdown(move || {
                let background = background.clone();
                let tasks = Arc::clone(&tasks);
                async move {
                    background.cancel();
                    let handles =
                        std::mem::take(&mut *tasks.lock().unwrap_or_else(|e| e.into_inner()));
                    debug!(tasks = handles.len(), "stopping background tasks");
                    for handle in handles {
                        let _ = handle.await;
                    }
                }
            });
        }
        shutdown.register_component(Arc::new(tracer.clone()));
        shutdown.register_component(Arc::new(errors.clone()));
        shutdown.register_component(Arc::new(logger.clone()));

        info!(
            service = %config.service_name,
            version = %config.service_version,
            environment = %config.environment,
            "telemetry initialized"
        );

        Ok(Telemetry {
            config,
            registry,
            collector,
            coordinator,
            logger,
            tracer,
            errors,
            health,
            sampler,
            http_metrics,
            shutdown,
            background,
            tasks,
        })
    }
}

/// Degraded while the coordinator is in backup mode. Internal, so it never
/// keeps the composite out of `unhealthy`.
fn pipeline_probe(coordinator: DegradationCoordinator) -> ProbeConfig {
    let probe = probe_fn(move |_ctx| {
        let status = coordinator.status();
        async move {
            let open: Vec<String> = status
                .breakers
                .iter()
                .filter(|(_, b)| b.state != CircuitState::Closed)
                .map(|(name, _)| name.clone())
                .collect();
            let result = if status.backup_mode {
                CheckResult::degraded("telemetry pipeline in backup mode")
            } else {
                CheckResult::healthy("telemetry pipeline operational")
            };
            Ok(result
                .with_detail("backup_mode", status.backup_mode)
                .with_detail("fallback_entries", status.fallback_entries as i64)
                .with_detail("breakers_not_closed", open.join(",")))
        }
    });
    ProbeConfig::new(PIPELINE_PROBE, probe)
        .critical(false)
        .internal(true)
        .description("circuit breakers and fallback of the telemetry pipeline")
}

// ============================================================================
// Container
// ============================================================================

/// Every telemetry component of one process. Share it as `Arc<Telemetry>`.
pub struct Telemetry {
    config: TelemetryConfig,
    registry: Registry,
    collector: Arc<PrometheusCollector>,
    coordinator: DegradationCoordinator,
    logger: Logger,
    tracer: Tracer,
    errors: ErrorTracker,
    health: Arc<HealthEngine>,
    sampler: Arc<ResourceSampler>,
    http_metrics: HttpMetrics,
    shutdown: ShutdownCoordinator,
    background: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("service", &self.config.service_name)
            .field("coordinator", &self.coordinator)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Telemetry {
    /// Builds the container with the default sinks. See [`TelemetryBuilder::build`].
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        TelemetryBuilder::new(config).build()
    }

    pub fn builder(config: TelemetryConfig) -> TelemetryBuilder {
        TelemetryBuilder::new(config)
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The unprotected primary collector.
    pub fn primary_collector(&self) -> &Arc<PrometheusCollector> {
        &self.collector
    }

    /// The collector every caller should record through.
    pub fn coordinator(&self) -> &DegradationCoordinator {
        &self.coordinator
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    pub fn health(&self) -> &Arc<HealthEngine> {
        &self.health
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    /// `/metrics`, the health endpoints and the request middleware.
    pub fn router(self: &Arc<Self>) -> Router {
        http::router(Arc::clone(self))
    }

    /// Spawns the resource sampler, the span flusher and the health
    /// scheduler. A second call is a no-op.
    pub fn start_background(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() || self.background.is_cancelled() {
            return;
        }
        tasks.push(Arc::clone(&self.sampler).spawn(self.background.child_token()));
        tasks.push(self.tracer.spawn_flusher(self.background.child_token()));
        tasks.push(Arc::clone(&self.health).spawn_scheduler(self.background.child_token()));
        debug!(tasks = tasks.len(), "background tasks started");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// Stops the background tasks, then drains the tracer, the error
    /// tracker and the logger in that order, within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        let ctx = TelemetryContext::new().with_timeout(deadline);
        let result = self.shutdown.shutdown_with(&ctx).await;
        if let Err(e) = &result {
            if !matches!(e, ShutdownError::AlreadyShuttingDown) {
                tracing::warn!(error = %e, "telemetry shutdown incomplete");
            }
        }
        result
    }

    /// Status of the pipeline probe at its last run.
    pub fn pipeline_status(&self) -> Option<HealthStatus> {
        self.health.last_result(PIPELINE_PROBE).map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::tracer::exporter::InMemoryExporter;
    use crate::tracer::provider::StartOptions;
    use crate::tracer::SpanKind;

    fn config() -> TelemetryConfig {
        TelemetryConfig::builder()
            .service_name("orders")
            .service_version("1.2.3")
            .build()
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let config = TelemetryConfig::builder().sample_rate(1.5).build();
        let err = Telemetry::init(config).unwrap_err();
        assert!(matches!(err, TelemetryError::Config(_)));
    }

    #[tokio::test]
    async fn test_init_registers_pipeline_probe() {
        let telemetry = Telemetry::builder(config())
            .log_sink(Arc::new(MemorySink::new()))
            .build()
            .unwrap();

        assert!(telemetry.health().names().contains(&PIPELINE_PROBE.to_string()));
        let result = telemetry
            .health()
            .run(PIPELINE_PROBE, &TelemetryContext::new())
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(telemetry.pipeline_status(), Some(HealthStatus::Healthy));
    }

    #[tokio::test]
    async fn test_shutdown_drains_spans_then_rejects_second_call() {
        let spans = Arc::new(InMemoryExporter::new());
        let telemetry = Telemetry::builder(config())
            .log_sink(Arc::new(MemorySink::new()))
            .span_exporter(spans.clone())
            .build()
            .unwrap();
        telemetry.start_background();
        telemetry.start_background();

        let (_ctx, span) = telemetry.tracer().start(
            &TelemetryContext::new(),
            "checkout",
            SpanKind::Internal,
            StartOptions::new(),
        );
        span.finish();

        telemetry.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(spans.spans().len(), 1);
        assert!(spans.is_shutdown());
        assert!(telemetry.is_shutting_down());
        assert!(matches!(
            telemetry.shutdown(Duration::from_secs(1)).await,
            Err(ShutdownError::AlreadyShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_tracked_errors_reach_custom_exporter_on_shutdown() {
        let exporter = Arc::new(InMemoryExporter::new());
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::builder(config())
            .log_sink(sink.clone())
            .error_exporter(exporter.clone())
            .build()
            .unwrap();

        let err = std::io::Error::other("disk full");
        telemetry.errors().track(
            &TelemetryContext::new(),
            &err,
            "storage",
            crate::error_tracker::ErrorSeverity::Error,
            crate::error_tracker::ErrorCategory::System,
            Default::default(),
        );
        telemetry.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(exporter.errors().len(), 1);
        assert!(!sink.is_empty());
    }
}
