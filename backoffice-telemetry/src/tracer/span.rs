//! The span model and the caller-owned [`Span`] handle.

use super::ids::{SpanContext, SpanId, TraceId};
use crate::attributes::{AttributeValue, Attributes, Sanitizer};
use crate::context::TelemetryContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;

pub const SDK_NAME: &str = "backoffice-telemetry";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Span model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
    #[default]
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
            SpanKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub attributes: Attributes,
}

impl SpanLink {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self {
            trace_id,
            span_id,
            attributes: Attributes::new(),
        }
    }

    pub fn to_context(context: &SpanContext) -> Self {
        Self::new(context.trace_id, context.span_id)
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Service and runtime description attached to every span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub sdk_name: String,
    pub sdk_version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub os: String,
    pub arch: String,
    pub pid: u32,
    pub hostname: String,
}

impl Resource {
    pub fn detect(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        environment: impl Into<String>,
    ) -> Self {
        let runtime_version = option_env!("CARGO_PKG_RUST_VERSION")
            .filter(|v| !v.is_empty())
            .unwrap_or("stable");
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            environment: environment.into(),
            sdk_name: SDK_NAME.to_string(),
            sdk_version: SDK_VERSION.to_string(),
            runtime_name: "rust".to_string(),
            runtime_version: runtime_version.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
            hostname: sysinfo::System::host_name().unwrap_or_default(),
        }
    }
}

/// Per-span budgets. Additions past a budget are dropped and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanLimits {
    pub max_attributes: usize,
    pub max_events: usize,
    pub max_links: usize,
}

impl Default for SpanLimits {
    fn default() -> Self {
        Self {
            max_attributes: 128,
            max_events: 128,
            max_links: 32,
        }
    }
}

/// A finished (or in-flight) span as handed to exporters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanData {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
    pub status: SpanStatus,
    pub attributes: Attributes,
    pub events: Vec<SpanEvent>,
    pub links: Vec<SpanLink>,
    pub sampled: bool,
    pub sample_rate: f64,
    #[serde(serialize_with = "serialize_resource")]
    pub resource: Arc<Resource>,
    pub dropped_attributes: u32,
    pub dropped_events: u32,
    pub dropped_links: u32,
}

fn serialize_resource<S: Serializer>(resource: &Arc<Resource>, s: S) -> Result<S::Ok, S::Error> {
    resource.as_ref().serialize(s)
}

impl SpanData {
    pub fn context(&self) -> SpanContext {
        SpanContext::new(self.trace_id, self.span_id, self.sampled)
    }
}

// ============================================================================
// Span handle
// ============================================================================

/// Receives spans when they finish.
pub(crate) trait SpanProcessor: Send + Sync {
    fn on_end(&self, data: SpanData);
}

struct SpanState {
    data: SpanData,
    started: Instant,
    finished: bool,
}

pub(crate) struct RecordingSpan {
    state: Mutex<SpanState>,
    limits: SpanLimits,
    sanitizer: Arc<Sanitizer>,
    ctx: TelemetryContext,
    processor: Weak<dyn SpanProcessor>,
}

impl RecordingSpan {
    pub(crate) fn new(
        data: SpanData,
        limits: SpanLimits,
        sanitizer: Arc<Sanitizer>,
        ctx: TelemetryContext,
        processor: Weak<dyn SpanProcessor>,
    ) -> Self {
        Self {
            state: Mutex::new(SpanState {
                data,
                started: Instant::now(),
                finished: false,
            }),
            limits,
            sanitizer,
            ctx,
            processor,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SpanState) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.finished {
            return None;
        }
        Some(f(&mut state))
    }

    fn set_attribute(&self, key: String, value: AttributeValue) {
        let value = self.sanitizer.sanitize(&key, value);
        let max = self.limits.max_attributes;
        self.with_state(|s| {
            let attributes = &mut s.data.attributes;
            if attributes.contains_key(&key) || attributes.len() < max {
                attributes.insert(key, value);
            } else {
                s.data.dropped_attributes += 1;
            }
        });
    }

    fn add_event(&self, name: String, attributes: Attributes) {
        let attributes = self.sanitizer.sanitize_map(attributes);
        let max = self.limits.max_events;
        self.with_state(|s| {
            if s.data.events.len() < max {
                s.data.events.push(SpanEvent {
                    name,
                    timestamp: Utc::now(),
                    attributes,
                });
            } else {
                s.data.dropped_events += 1;
            }
        });
    }

    fn add_link(&self, link: SpanLink) {
        let link = SpanLink {
            attributes: self.sanitizer.sanitize_map(link.attributes),
            ..link
        };
        let max = self.limits.max_links;
        self.with_state(|s| {
            if s.data.links.len() < max {
                s.data.links.push(link);
            } else {
                s.data.dropped_links += 1;
            }
        });
    }

    fn set_status(&self, status: SpanStatus) {
        self.with_state(|s| s.data.status = status);
    }

    /// Ends the span. `forced` overrides any status already set.
    pub(crate) fn end(&self, forced: Option<SpanStatus>) -> bool {
        let data = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.finished {
                return false;
            }
            state.finished = true;

            let elapsed = state.started.elapsed();
            let data = &mut state.data;
            data.duration = elapsed;
            data.end_time = data.start_time
                + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());

            if let Some(status) = forced {
                data.status = status;
            } else if self.ctx.is_cancelled() {
                if data.status.code != StatusCode::Error {
                    data.status = SpanStatus::error("cancelled");
                }
            } else if data.status.code == StatusCode::Unset {
                data.status = SpanStatus::ok();
            }
            data.clone()
        };

        if let Some(processor) = self.processor.upgrade() {
            processor.on_end(data);
        }
        true
    }

    fn snapshot(&self) -> SpanData {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .clone()
    }

    fn is_finished(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).finished
    }
}

/// A started span.
///
/// Unsampled spans still carry a valid [`SpanContext`] for propagation but
/// record nothing. Every mutator is a no-op on such spans and on finished
/// spans.
#[derive(Clone)]
pub struct Span {
    context: SpanContext,
    recording: Option<Arc<RecordingSpan>>,
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("trace_id", &self.context.trace_id)
            .field("span_id", &self.context.span_id)
            .field("recording", &self.recording.is_some())
            .finish()
    }
}

impl Span {
    pub(crate) fn recording(context: SpanContext, inner: Arc<RecordingSpan>) -> Self {
        Self {
            context,
            recording: Some(inner),
        }
    }

    pub(crate) fn non_recording(context: SpanContext) -> Self {
        Self {
            context,
            recording: None,
        }
    }

    /// A span with an invalid context that records nothing.
    pub fn noop() -> Self {
        Self::non_recording(SpanContext::new(TraceId::INVALID, SpanId::INVALID, false))
    }

    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.context.span_id
    }

    pub fn is_recording(&self) -> bool {
        self.recording.as_ref().is_some_and(|r| !r.is_finished())
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        if let Some(r) = &self.recording {
            r.set_attribute(key.into(), value.into());
        }
    }

    pub fn set_attributes(&self, attributes: Attributes) {
        if let Some(r) = &self.recording {
            for (key, value) in attributes {
                r.set_attribute(key, value);
            }
        }
    }

    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) {
        if let Some(r) = &self.recording {
            r.add_event(name.into(), attributes);
        }
    }

    pub fn add_link(&self, link: SpanLink) {
        if let Some(r) = &self.recording {
            r.add_link(link);
        }
    }

    pub fn set_status(&self, code: StatusCode, message: impl Into<String>) {
        if let Some(r) = &self.recording {
            r.set_status(SpanStatus {
                code,
                message: message.into(),
            });
        }
    }

    /// Marks the span as failed with `err`, records `error.type` and
    /// `error.message`, and appends an `error` event.
    pub fn set_error<E>(&self, err: &E)
    where
        E: std::error::Error + ?Sized,
    {
        self.record_error(std::any::type_name::<E>(), &err.to_string());
    }

    pub fn record_error(&self, error_type: &str, message: &str) {
        let Some(r) = &self.recording else {
            return;
        };
        r.set_status(SpanStatus::error(message));
        r.set_attribute("error.type".to_string(), error_type.into());
        r.set_attribute("error.message".to_string(), message.into());
        let mut attrs = Attributes::new();
        attrs.insert("error.type".to_string(), error_type.into());
        attrs.insert("error.message".to_string(), message.into());
        r.add_event("error".to_string(), attrs);
    }

    /// Ends the span. Returns `false` when it was already finished or does
    /// not record.
    pub fn finish(&self) -> bool {
        self.recording.as_ref().is_some_and(|r| r.end(None))
    }

    pub fn finish_with_status(&self, code: StatusCode, message: impl Into<String>) -> bool {
        self.set_status(code, message);
        self.finish()
    }

    /// Current recorded state, for inspection.
    pub fn data(&self) -> Option<SpanData> {
        self.recording.as_ref().map(|r| r.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SpanData>>);

    impl SpanProcessor for Collect {
        fn on_end(&self, data: SpanData) {
            self.0.lock().unwrap().push(data);
        }
    }

    fn data() -> SpanData {
        SpanData {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            name: "op".to_string(),
            kind: SpanKind::Internal,
            start_time: Utc::now(),
            end_time: Utc::now(),
            duration: Duration::ZERO,
            status: SpanStatus::default(),
            attributes: Attributes::new(),
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

    fn span_with(limits: SpanLimits, ctx: TelemetryContext) -> (Span, Arc<Collect>) {
        let collect = Arc::new(Collect::default());
        let processor: Arc<dyn SpanProcessor> = collect.clone();
        let data = data();
        let context = data.context();
        let inner = RecordingSpan::new(
            data,
            limits,
            Arc::new(Sanitizer::default()),
            ctx,
            Arc::downgrade(&processor),
        );
        (Span::recording(context, Arc::new(inner)), collect)
    }

    fn span() -> (Span, Arc<Collect>) {
        span_with(SpanLimits::default(), TelemetryContext::new())
    }

    #[test]
    fn test_finish_defaults_status_to_ok() {
        let (span, collect) = span();
        assert!(span.finish());

        let spans = collect.0.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status.code, StatusCode::Ok);
        assert!(spans[0].end_time >= spans[0].start_time);
    }

    #[test]
    fn test_double_finish_is_noop() {
        let (span, collect) = span();
        assert!(span.finish());
        assert!(!span.finish());
        span.set_attribute("late", "ignored");
        assert_eq!(collect.0.lock().unwrap().len(), 1);
        assert!(!span.data().unwrap().attributes.contains_key("late"));
    }

    #[test]
    fn test_attribute_budget() {
        let limits = SpanLimits {
            max_attributes: 3,
            max_events: 2,
            max_links: 1,
        };
        let (span, _) = span_with(limits, TelemetryContext::new());
        for i in 0..10 {
            span.set_attribute(format!("k{i}"), i as i64);
            span.add_event(format!("e{i}"), Attributes::new());
            span.add_link(SpanLink::new(TraceId::generate(), SpanId::generate()));
        }
        span.set_attribute("k0", "overwritten");

        let data = span.data().unwrap();
        assert_eq!(data.attributes.len(), 3);
        assert_eq!(data.attributes["k0"], AttributeValue::from("overwritten"));
        assert_eq!(data.events.len(), 2);
        assert_eq!(data.events[0].name, "e0");
        assert_eq!(data.events[1].name, "e1");
        assert_eq!(data.links.len(), 1);
        assert_eq!(data.dropped_attributes, 7);
        assert_eq!(data.dropped_events, 8);
        assert_eq!(data.dropped_links, 9);
    }

    #[test]
    fn test_set_error() {
        let (span, collect) = span();
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        span.set_error(&err);
        span.finish();

        let data = &collect.0.lock().unwrap()[0];
        assert_eq!(data.status, SpanStatus::error("disk full"));
        let error_type = data.attributes["error.type"].as_str().unwrap();
        assert!(error_type.starts_with("std::io"));
        assert_eq!(data.events.last().unwrap().name, "error");
    }

    #[test]
    fn test_explicit_status_is_kept() {
        let (span, collect) = span();
        span.finish_with_status(StatusCode::Error, "boom");
        assert_eq!(collect.0.lock().unwrap()[0].status, SpanStatus::error("boom"));
    }

    #[test]
    fn test_cancelled_context_finishes_with_error() {
        let ctx = TelemetryContext::new();
        let (span, collect) = span_with(SpanLimits::default(), ctx.clone());
        ctx.cancel();
        span.finish();
        assert_eq!(
            collect.0.lock().unwrap()[0].status,
            SpanStatus::error("cancelled")
        );
    }

    #[test]
    fn test_sensitive_attributes_are_redacted() {
        let (span, _) = span();
        span.set_attribute("db.password", "hunter2");
        span.add_event("login", attrs! {"auth_header" => "Bearer x", "user" => "bob"});

        let data = span.data().unwrap();
        assert_eq!(data.attributes["db.password"], AttributeValue::from("[REDACTED]"));
        assert_eq!(
            data.events[0].attributes["auth_header"],
            AttributeValue::from("[REDACTED]")
        );
        assert_eq!(data.events[0].attributes["user"], AttributeValue::from("bob"));
    }

    #[test]
    fn test_noop_span() {
        let span = Span::noop();
        span.set_attribute("k", "v");
        assert!(!span.is_recording());
        assert!(!span.finish());
        assert!(span.data().is_none());
        assert!(!span.context().is_valid());
    }

    #[test]
    fn test_span_data_serializes() {
        let (span, collect) = span();
        span.set_attribute("http.route", "/orders");
        span.finish();

        let json = serde_json::to_value(&collect.0.lock().unwrap()[0]).unwrap();
        assert_eq!(json["kind"], "internal");
        assert_eq!(json["status"]["code"], "ok");
        assert_eq!(json["resource"]["service_name"], "svc");
        assert_eq!(json["attributes"]["http.route"], "/orders");
        assert!(json.get("parent_span_id").is_none());
    }

    proptest! {
        #[test]
        fn prop_attribute_count_never_exceeds_budget(max in 1usize..16, calls in 0usize..64) {
            let limits = SpanLimits { max_attributes: max, ..SpanLimits::default() };
            let (span, _) = span_with(limits, TelemetryContext::new());
            for i in 0..calls {
                span.set_attribute(format!("key{i}"), i as i64);
            }
            let data = span.data().unwrap();
            prop_assert_eq!(data.attributes.len(), calls.min(max));
        }
    }
}
