//! Exporter capabilities for finished spans and tracked errors.
//!
//! Exporters are injected collaborators. The tracer and the error tracker
//! call them from background tasks only, each call bounded by the configured
//! export timeout.

use super::span::SpanData;
use crate::attributes::{AttributeValue, Attributes};
use crate::context::TelemetryContext;
use crate::error::ExportError;
use crate::error_tracker::ErrorEvent;
use crate::logging::Logger;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Destination for batches of finished spans.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, spans: &[SpanData]) -> Result<(), ExportError>;

    async fn shutdown(&self, _ctx: &TelemetryContext) -> Result<(), ExportError> {
        Ok(())
    }
}

/// Destination for newly tracked error events.
#[async_trait]
pub trait ErrorExporter: Send + Sync {
    fn name(&self) -> &str;

    async fn export_errors(&self, events: &[ErrorEvent]) -> Result<(), ExportError>;

    async fn shutdown(&self, _ctx: &TelemetryContext) -> Result<(), ExportError> {
        Ok(())
    }
}

// ============================================================================
// Log exporter
// ============================================================================

/// Writes one log line per span or error event through the [`Logger`].
#[derive(Debug, Clone)]
pub struct LogExporter {
    logger: Logger,
}

impl LogExporter {
    pub fn new(logger: Logger) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl SpanExporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn export(&self, spans: &[SpanData]) -> Result<(), ExportError> {
        for span in spans {
            let ctx = TelemetryContext::new().with_span_context(span.context());
            let mut fields = Attributes::new();
            fields.insert("span.name".into(), span.name.as_str().into());
            fields.insert("span.kind".into(), span.kind.as_str().into());
            fields.insert(
                "duration_ms".into(),
                AttributeValue::Float(span.duration.as_secs_f64() * 1000.0),
            );
            fields.insert(
                "status".into(),
                serde_json::to_value(span.status.code)
                    .map(AttributeValue::from)
                    .unwrap_or_else(|_| "unset".into()),
            );
            if let Some(parent) = span.parent_span_id {
                fields.insert("parent_span_id".into(), parent.to_string().into());
            }
            fields.insert("attributes".into(), AttributeValue::Map(span.attributes.clone()));
            self.logger.info(&ctx, "span finished", fields);
        }
        Ok(())
    }
}

#[async_trait]
impl ErrorExporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn export_errors(&self, events: &[ErrorEvent]) -> Result<(), ExportError> {
        for event in events {
            let mut ctx = TelemetryContext::new();
            if let Some(trace_id) = &event.trace_id {
                ctx = ctx.with_trace_id(trace_id.as_str());
            }
            if let Some(request_id) = &event.request_id {
                ctx = ctx.with_request_id(request_id.as_str());
            }
            let mut fields = Attributes::new();
            fields.insert("error.id".into(), event.id.as_str().into());
            fields.insert("error.type".into(), event.error_type.as_str().into());
            fields.insert("error.category".into(), event.category.as_str().into());
            fields.insert("error.severity".into(), event.severity.as_str().into());
            fields.insert("component".into(), event.component.as_str().into());
            fields.insert("count".into(), event.count.into());
            self.logger
                .log(&ctx, event.severity.log_level(), &event.message, fields);
        }
        Ok(())
    }
}

// ============================================================================
// In-memory exporter
// ============================================================================

/// Keeps everything it receives. Rejects exports after `shutdown`.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<SpanData>>,
    errors: Mutex<Vec<ErrorEvent>>,
    shut_down: AtomicBool,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn errors(&self) -> Vec<ErrorEvent> {
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset(&self) {
        self.spans.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.errors.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), ExportError> {
        if self.is_shutdown() {
            return Err(ExportError::Shutdown("in_memory".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SpanExporter for InMemoryExporter {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn export(&self, spans: &[SpanData]) -> Result<(), ExportError> {
        self.check_open()?;
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(spans);
        Ok(())
    }

    async fn shutdown(&self, _ctx: &TelemetryContext) -> Result<(), ExportError> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl ErrorExporter for InMemoryExporter {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn export_errors(&self, events: &[ErrorEvent]) -> Result<(), ExportError> {
        self.check_open()?;
        self.errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(events);
        Ok(())
    }

    async fn shutdown(&self, _ctx: &TelemetryContext) -> Result<(), ExportError> {
        self.shut_down.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{LogLevel, LoggerConfig, MemorySink};
    use crate::metrics::{LabelPolicy, Registry};
    use crate::tracer::span::{Resource, SpanKind, SpanStatus};
    use crate::tracer::{SpanId, TraceId};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn finished_span() -> SpanData {
        SpanData {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: Some(SpanId::generate()),
            name: "GET /orders".to_string(),
            kind: SpanKind::Server,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: Duration::from_millis(12),
            status: SpanStatus::ok(),
            attributes: Attributes::new(),
            events: Vec::new(),
            links: Vec::new(),
            sampled: true,
            sample_rate: 1.0,
            resource: Arc::new(Resource::detect("orders", "1.0.0", "test")),
            dropped_attributes: 0,
            dropped_events: 0,
            dropped_links: 0,
        }
    }

    #[tokio::test]
    async fn test_in_memory_exporter_rejects_after_shutdown() {
        let exporter = InMemoryExporter::new();
        SpanExporter::export(&exporter, &[finished_span()]).await.unwrap();
        assert_eq!(exporter.spans().len(), 1);

        SpanExporter::shutdown(&exporter, &TelemetryContext::new())
            .await
            .unwrap();
        assert!(matches!(
            SpanExporter::export(&exporter, &[finished_span()]).await,
            Err(ExportError::Shutdown(_))
        ));
    }

    #[tokio::test]
    async fn test_log_exporter_writes_one_line_per_span() {
        let sink = Arc::new(MemorySink::new());
        let registry = Registry::with_policy(LabelPolicy::Panic);
        let logger = Logger::new(LoggerConfig::default(), sink.clone(), &registry).unwrap();
        let exporter = LogExporter::new(logger.clone());

        let spans = vec![finished_span(), finished_span()];
        SpanExporter::export(&exporter, &spans).await.unwrap();
        logger.flush().await;

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, LogLevel::Info);
        assert_eq!(events[0].trace_id, spans[0].trace_id.to_string());
        assert_eq!(events[0].span_id, spans[0].span_id.to_string());
        assert_eq!(events[0].fields["span.kind"], AttributeValue::from("server"));
        assert_eq!(events[0].fields["status"], AttributeValue::from("ok"));
    }
}
