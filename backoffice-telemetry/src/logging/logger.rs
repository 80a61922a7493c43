//! Context-enriched structured logger.
//!
//! Producers never wait on the sink: events go through a bounded queue that
//! a single consumer task drains. When the queue is full the event is dropped
//! and counted under `telemetry_dropped_logs_total{reason="queue_full"}`.

use super::sink::LogSink;
use crate::attributes::{AttributeValue, Attributes, Sanitizer};
use crate::config::TelemetryConfig;
use crate::context::TelemetryContext;
use crate::error::{ConfigError, TelemetryError};
use crate::metrics::pipeline;
use crate::metrics::{Counter, Registry};
use crate::shutdown::{GracefulShutdown, ShutdownError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(ConfigError::LogLevel(other.to_string())),
        }
    }
}

/// One emitted log record. Absent identifiers serialize as missing keys.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub service: String,
    pub hostname: String,
    pub pid: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub span_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub fields: Attributes,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub service: String,
    pub level: LogLevel,
    pub queue_size: usize,
    pub sanitizer: Sanitizer,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            service: "backoffice".to_string(),
            level: LogLevel::Info,
            queue_size: 4096,
            sanitizer: Sanitizer::default(),
        }
    }
}

impl From<&TelemetryConfig> for LoggerConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            service: config.service_name.clone(),
            level: config.log_level,
            queue_size: config.log_queue_size,
            sanitizer: Sanitizer::new(&config.sanitize_attributes, config.enable_sanitization),
        }
    }
}

enum Command {
    Event(Box<LogEvent>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

struct LoggerInner {
    config: LoggerConfig,
    hostname: String,
    pid: u32,
    tx: mpsc::Sender<Command>,
    dropped: Counter,
    sink_failures: Counter,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// The structured logger. Cheap to clone.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("level", &self.inner.config.level)
            .field("queue_size", &self.inner.config.queue_size)
            .finish()
    }
}

impl Logger {
    /// Creates the logger and spawns its consumer task on the current Tokio
    /// runtime.
    pub fn new(
        config: LoggerConfig,
        sink: Arc<dyn LogSink>,
        registry: &Registry,
    ) -> Result<Self, TelemetryError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TelemetryError::Runtime(e.to_string()))?;

        let dropped = pipeline::dropped_logs(registry)?;
        let sink_failures = pipeline::export_failures(registry)?;
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));

        let worker = runtime.spawn(consume(rx, sink, sink_failures.clone()));

        Ok(Self {
            inner: Arc::new(LoggerInner {
                config,
                hostname: sysinfo::System::host_name().unwrap_or_default(),
                pid: std::process::id(),
                tx,
                dropped,
                sink_failures,
                closed: AtomicBool::new(false),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn level(&self) -> LogLevel {
        self.inner.config.level
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.inner.config.level
    }

    pub fn log(&self, ctx: &TelemetryContext, level: LogLevel, message: &str, fields: Attributes) {
        if !self.enabled(level) {
            return;
        }
        if ctx.is_cancelled() {
            self.drop_event("cancelled");
            return;
        }
        if self.inner.closed.load(Ordering::Acquire) {
            self.drop_event("closed");
            return;
        }

        let event = self.build_event(ctx, level, message, fields);
        match self.inner.tx.try_send(Command::Event(Box::new(event))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => self.drop_event("queue_full"),
            Err(mpsc::error::TrySendError::Closed(_)) => self.drop_event("closed"),
        }
    }

    fn build_event(
        &self,
        ctx: &TelemetryContext,
        level: LogLevel,
        message: &str,
        fields: Attributes,
    ) -> LogEvent {
        let mut merged: Attributes = ctx
            .baggage()
            .iter()
            .map(|(k, v)| (k.clone(), AttributeValue::from(v.as_str())))
            .collect();
        merged.extend(fields);

        LogEvent {
            level,
            timestamp: Utc::now(),
            message: message.to_string(),
            service: self.inner.config.service.clone(),
            hostname: self.inner.hostname.clone(),
            pid: self.inner.pid,
            correlation_id: ctx.correlation_id().to_string(),
            trace_id: ctx.trace_id().to_string(),
            span_id: ctx.span_id().to_string(),
            request_id: ctx.request_id().to_string(),
            user_id: ctx.user_id().to_string(),
            session_id: ctx.session_id().to_string(),
            fields: self.inner.config.sanitizer.sanitize_map(merged),
        }
    }

    fn drop_event(&self, reason: &str) {
        self.inner.dropped.with_labels(&[reason]).inc();
    }

    pub fn debug(&self, ctx: &TelemetryContext, message: &str, fields: Attributes) {
        self.log(ctx, LogLevel::Debug, message, fields);
    }

    pub fn info(&self, ctx: &TelemetryContext, message: &str, fields: Attributes) {
        self.log(ctx, LogLevel::Info, message, fields);
    }

    pub fn warn(&self, ctx: &TelemetryContext, message: &str, fields: Attributes) {
        self.log(ctx, LogLevel::Warn, message, fields);
    }

    pub fn error(&self, ctx: &TelemetryContext, message: &str, fields: Attributes) {
        self.log(ctx, LogLevel::Error, message, fields);
    }

    /// Emits at `fatal`. The process is not terminated.
    pub fn fatal(&self, ctx: &TelemetryContext, message: &str, fields: Attributes) {
        self.log(ctx, LogLevel::Fatal, message, fields);
    }

    // ------------------------------------------------------------------
    // Category helpers
    // ------------------------------------------------------------------

    pub fn audit(
        &self,
        ctx: &TelemetryContext,
        action: &str,
        user_id: &str,
        resource: &str,
        mut fields: Attributes,
    ) {
        fields.insert("category".into(), "audit".into());
        fields.insert("action".into(), action.into());
        fields.insert("actor_id".into(), user_id.into());
        fields.insert("resource".into(), resource.into());
        self.log(ctx, LogLevel::Info, &format!("audit: {action}"), fields);
    }

    pub fn performance(
        &self,
        ctx: &TelemetryContext,
        operation: &str,
        duration: Duration,
        mut fields: Attributes,
    ) {
        fields.insert("category".into(), "performance".into());
        fields.insert("operation".into(), operation.into());
        fields.insert("duration_ms".into(), (duration.as_secs_f64() * 1000.0).into());
        self.log(ctx, LogLevel::Info, &format!("performance: {operation}"), fields);
    }

    pub fn business(&self, ctx: &TelemetryContext, event: &str, mut fields: Attributes) {
        fields.insert("category".into(), "business".into());
        fields.insert("event".into(), event.into());
        self.log(ctx, LogLevel::Info, &format!("business: {event}"), fields);
    }

    /// Security events log at `warn`, or `error` for high and critical severity.
    pub fn security(
        &self,
        ctx: &TelemetryContext,
        event: &str,
        severity: &str,
        mut fields: Attributes,
    ) {
        let level = match severity.to_ascii_lowercase().as_str() {
            "high" | "critical" => LogLevel::Error,
            _ => LogLevel::Warn,
        };
        fields.insert("category".into(), "security".into());
        fields.insert("event".into(), event.into());
        fields.insert("severity".into(), severity.into());
        self.log(ctx, level, &format!("security: {event}"), fields);
    }

    /// Waits until every event queued before this call has reached the sink.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Drains the queue, flushes the sink and stops the consumer. Later log
    /// calls are dropped with reason `closed`.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
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
                warn!(error = %e, "log consumer task ended abnormally");
            }
        }
        debug!("logger shut down");
    }

    pub fn dropped(&self, reason: &str) -> f64 {
        self.inner.dropped.get(&[reason])
    }

    pub fn sink_failures(&self) -> f64 {
        self.inner.sink_failures.get(&["logging"])
    }
}

async fn consume(mut rx: mpsc::Receiver<Command>, sink: Arc<dyn LogSink>, failures: Counter) {
    let failures = failures.with_labels(&["logging"]);
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => {
                if let Err(e) = sink.write(&event) {
                    failures.inc();
                    warn!(error = %e, "log sink write failed");
                }
            }
            Command::Flush(done) => {
                if let Err(e) = sink.flush() {
                    failures.inc();
                    warn!(error = %e, "log sink flush failed");
                }
                let _ = done.send(());
            }
            Command::Shutdown(done) => {
                while let Ok(Command::Event(event)) = rx.try_recv() {
                    if sink.write(&event).is_err() {
                        failures.inc();
                    }
                }
                let _ = sink.flush();
                let _ = done.send(());
                break;
            }
        }
    }
}

#[async_trait]
impl GracefulShutdown for Logger {
    fn name(&self) -> &str {
        "logger"
    }

    async fn shutdown(&self, ctx: &TelemetryContext) -> Result<(), ShutdownError> {
        tokio::select! {
            _ = Logger::shutdown(self) => Ok(()),
            _ = ctx.cancelled() => Err(ShutdownError::ComponentFailed {
                component: "logger".to_string(),
                reason: "log queue drain timed out".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use crate::error::SinkError;
    use crate::logging::sink::MemorySink;
    use crate::metrics::LabelPolicy;
    use pretty_assertions::assert_eq;

    fn logger_with(config: LoggerConfig) -> (Logger, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let logger = Logger::new(config, sink.clone(), &registry).unwrap();
        (logger, sink)
    }

    #[tokio::test]
    async fn test_event_carries_context() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        let ctx = TelemetryContext::new()
            .with_correlation_id("c-1")
            .with_trace_id("0af7651916cd43dd8448eb211c80319c")
            .with_request_id("r-1")
            .with_user_id("u-1");

        logger.info(&ctx, "order placed", attrs! {"order_id" => 7i64});
        logger.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.level, LogLevel::Info);
        assert_eq!(e.correlation_id, "c-1");
        assert_eq!(e.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(e.request_id, "r-1");
        assert_eq!(e.user_id, "u-1");
        assert_eq!(e.session_id, "");
        assert_eq!(e.pid, std::process::id());
        assert_eq!(e.fields["order_id"], AttributeValue::Int(7));
    }

    #[tokio::test]
    async fn test_level_filtering() {
        let (logger, sink) = logger_with(LoggerConfig {
            level: LogLevel::Warn,
            ..Default::default()
        });
        let ctx = TelemetryContext::new();
        logger.debug(&ctx, "d", Attributes::new());
        logger.info(&ctx, "i", Attributes::new());
        logger.warn(&ctx, "w", Attributes::new());
        logger.fatal(&ctx, "f", Attributes::new());
        logger.flush().await;

        let levels: Vec<LogLevel> = sink.events().iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![LogLevel::Warn, LogLevel::Fatal]);
    }

    #[tokio::test]
    async fn test_call_fields_override_baggage() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        let ctx = TelemetryContext::new()
            .with_baggage("tenant", "acme")
            .with_baggage("region", "eu");

        logger.info(&ctx, "m", attrs! {"region" => "us"});
        logger.flush().await;

        let fields = &sink.events()[0].fields;
        assert_eq!(fields["tenant"], AttributeValue::from("acme"));
        assert_eq!(fields["region"], AttributeValue::from("us"));
    }

    #[tokio::test]
    async fn test_fields_are_sanitized() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        logger.info(
            &TelemetryContext::new(),
            "login",
            attrs! {"password" => "hunter2", "user" => "bob"},
        );
        logger.flush().await;

        let fields = &sink.events()[0].fields;
        assert_eq!(fields["password"], AttributeValue::from("[REDACTED]"));
        assert_eq!(fields["user"], AttributeValue::from("bob"));
    }

    #[tokio::test]
    async fn test_cancelled_context_is_dropped() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        let ctx = TelemetryContext::new();
        ctx.cancel();

        logger.error(&ctx, "never written", Attributes::new());
        logger.flush().await;

        assert!(sink.is_empty());
        assert_eq!(logger.dropped("cancelled"), 1.0);
    }

    struct BlockedSink {
        gate: std::sync::Mutex<()>,
    }

    impl LogSink for BlockedSink {
        fn write(&self, _event: &LogEvent) -> Result<(), SinkError> {
            let _held = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_overflow_drops_and_counts() {
        let sink = Arc::new(BlockedSink {
            gate: std::sync::Mutex::new(()),
        });
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let logger = Logger::new(
            LoggerConfig {
                queue_size: 4,
                ..Default::default()
            },
            sink.clone(),
            &registry,
        )
        .unwrap();

        let held = sink.gate.lock().unwrap();
        let ctx = TelemetryContext::new();
        for i in 0..50 {
            logger.info(&ctx, &format!("event {i}"), Attributes::new());
        }
        drop(held);

        logger.flush().await;
        assert!(logger.dropped("queue_full") >= 40.0);
    }

    #[tokio::test]
    async fn test_category_helpers() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        let ctx = TelemetryContext::new();
        logger.audit(&ctx, "delete", "u-1", "invoice/9", Attributes::new());
        logger.performance(&ctx, "export", Duration::from_millis(1500), Attributes::new());
        logger.business(&ctx, "order_placed", attrs! {"amount" => 12.5});
        logger.security(&ctx, "brute_force", "high", Attributes::new());
        logger.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].fields["category"], AttributeValue::from("audit"));
        assert_eq!(events[0].fields["resource"], AttributeValue::from("invoice/9"));
        assert_eq!(events[1].fields["duration_ms"], AttributeValue::Float(1500.0));
        assert_eq!(events[2].fields["event"], AttributeValue::from("order_placed"));
        assert_eq!(events[3].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_closes() {
        let (logger, sink) = logger_with(LoggerConfig::default());
        let ctx = TelemetryContext::new();
        for _ in 0..10 {
            logger.info(&ctx, "queued", Attributes::new());
        }
        logger.shutdown().await;
        assert_eq!(sink.len(), 10);

        logger.info(&ctx, "late", Attributes::new());
        assert_eq!(sink.len(), 10);
        assert_eq!(logger.dropped("closed"), 1.0);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("fatal".parse::<LogLevel>().unwrap(), LogLevel::Fatal);
        assert!("loud".parse::<LogLevel>().is_err());
        assert!(LogLevel::Debug < LogLevel::Fatal);
    }
}
