//! Metrics registry, exposition and resource sampling.
//!
//! - [`registry`]: counter, gauge and histogram families with label tuples,
//!   backed by a `prometheus` registry
//! - [`exposition`]: Prometheus text format rendering
//! - [`sampler`]: periodic process and host resource gauges
//! - [`collector`]: the request/db/cache/business/health recording surface
//! - [`pipeline`]: self-metrics shared by the logger, tracer, error tracker
//!   and coordinator

pub mod collector;
pub mod exposition;
pub mod pipeline;
pub mod registry;
pub mod sampler;

pub use collector::{PrometheusCollector, TelemetryCollector};
pub use exposition::{encode_text, TEXT_CONTENT_TYPE};
pub use registry::{
    Counter, CounterHandle, DurationGuard, FamilyDesc, Gauge, GaugeHandle, Histogram,
    HistogramHandle, LabelPolicy, MetricKind, Registry, DEFAULT_DURATION_BUCKETS,
    INTERNAL_ERRORS_METRIC,
};
pub use sampler::{ProcessSnapshot, ResourceSampler};
