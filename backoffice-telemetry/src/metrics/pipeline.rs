//! Self-metrics of the telemetry pipeline.
//!
//! Several components record into the same families, so the signatures live
//! here and every component registers through these functions.

use super::registry::{Counter, Gauge, Registry};
use crate::error::MetricsError;

pub fn dropped_logs(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_dropped_logs_total",
        "Log events dropped before reaching the sink",
        &["reason"],
    )
}

pub fn export_failures(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_export_failures_total",
        "Failed exporter or sink calls",
        &["component"],
    )
}

pub fn spans_exported(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_spans_exported_total",
        "Spans handed to exporters successfully",
        &[],
    )
}

pub fn spans_dropped(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_spans_dropped_total",
        "Finished spans dropped before export",
        &["reason"],
    )
}

pub fn active_spans(registry: &Registry) -> Result<Gauge, MetricsError> {
    registry.gauge(
        "telemetry_active_spans",
        "Sampled spans started and not yet finished",
        &[],
    )
}

pub fn errors_tracked(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_errors_tracked_total",
        "Error occurrences recorded by the error tracker",
        &["severity"],
    )
}

pub fn error_events_dropped(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_error_events_dropped_total",
        "Error events dropped before export",
        &["reason"],
    )
}

pub fn fallback_events(registry: &Registry) -> Result<Counter, MetricsError> {
    registry.counter(
        "telemetry_fallback_events_total",
        "Events routed to the in-memory fallback sink",
        &["component"],
    )
}

pub fn breaker_state(registry: &Registry) -> Result<Gauge, MetricsError> {
    registry.gauge(
        "telemetry_breaker_state",
        "Circuit breaker state (0 closed, 1 half-open, 2 open)",
        &["component"],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::registry::LabelPolicy;

    #[test]
    fn test_repeated_registration_shares_series() {
        let registry = Registry::with_policy(LabelPolicy::Drop);
        export_failures(&registry)
            .unwrap()
            .with_labels(&["tracing"])
            .inc();
        let again = export_failures(&registry).unwrap();
        assert_eq!(again.get(&["tracing"]), 1.0);
    }
}
