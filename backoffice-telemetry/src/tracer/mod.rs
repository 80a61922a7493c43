//! Span-based tracing.
//!
//! - [`ids`]: trace and span identifiers, and the propagated [`SpanContext`]
//! - [`span`]: the span model and the caller-owned [`Span`] handle
//! - [`provider`]: the [`Tracer`] with sampling, the active registry and batched
//!   export
//! - [`propagation`]: W3C and B3 header injection and extraction
//! - [`exporter`]: the exporter capabilities and the built-in exporters

pub mod exporter;
pub mod ids;
pub mod propagation;
pub mod provider;
pub mod span;

pub use exporter::{ErrorExporter, InMemoryExporter, LogExporter, SpanExporter};
pub use ids::{InvalidId, SpanContext, SpanId, TraceId};
pub use propagation::{Extracted, Extractor, Injector, Propagator};
pub use provider::{StartOptions, Tracer};
pub use span::{
    Resource, Span, SpanData, SpanEvent, SpanKind, SpanLimits, SpanLink, SpanStatus, StatusCode,
};
