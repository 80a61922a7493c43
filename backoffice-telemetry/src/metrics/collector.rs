//! The metrics-collector surface shared by the primary path and the fallback.

use super::registry::{Counter, Histogram, Registry, DEFAULT_DURATION_BUCKETS};
use crate::error::{CollectorError, MetricsError};
use crate::health::HealthStatus;
use std::time::Duration;

/// Operations every collector accepts.
///
/// Implemented by [`PrometheusCollector`], by the fallback sink, and by the
/// degradation coordinator that routes between the two.
pub trait TelemetryCollector: Send + Sync {
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration: Duration,
    ) -> Result<(), CollectorError>;

    fn record_db_query(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
    ) -> Result<(), CollectorError>;

    fn record_cache_operation(
        &self,
        operation: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<(), CollectorError>;

    fn record_business_event(&self, event: &str, value: f64) -> Result<(), CollectorError>;

    fn record_error(&self, error_type: &str, component: &str) -> Result<(), CollectorError>;

    fn record_health_check(
        &self,
        check: &str,
        status: HealthStatus,
        duration: Duration,
    ) -> Result<(), CollectorError>;
}

/// Records collector calls into registry families.
#[derive(Debug, Clone)]
pub struct PrometheusCollector {
    http_requests: Counter,
    http_duration: Histogram,
    db_queries: Counter,
    db_duration: Histogram,
    cache_operations: Counter,
    cache_duration: Histogram,
    business_events: Counter,
    errors: Counter,
    health_checks: Counter,
    health_duration: Histogram,
}

impl PrometheusCollector {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        Ok(Self {
            http_requests: registry.counter(
                "http_requests_total",
                "Total number of HTTP requests",
                &["method", "route", "status"],
            )?,
            http_duration: registry.histogram(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "route"],
                DEFAULT_DURATION_BUCKETS,
            )?,
            db_queries: registry.counter(
                "db_queries_total",
                "Total number of database queries",
                &["operation", "table", "status"],
            )?,
            db_duration: registry.histogram(
                "db_query_duration_seconds",
                "Database query duration in seconds",
                &["operation", "table"],
                &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0],
            )?,
            cache_operations: registry.counter(
                "cache_operations_total",
                "Total number of cache operations",
                &["operation", "result"],
            )?,
            cache_duration: registry.histogram(
                "cache_operation_duration_seconds",
                "Cache operation duration in seconds",
                &["operation"],
                &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
            )?,
            business_events: registry.counter(
                "business_events_total",
                "Business events, weighted by value",
                &["event"],
            )?,
            errors: registry.counter(
                "errors_total",
                "Errors by type and component",
                &["type", "component"],
            )?,
            health_checks: registry.counter(
                "health_checks_total",
                "Health check executions by result",
                &["check", "status"],
            )?,
            health_duration: registry.histogram(
                "health_check_duration_seconds",
                "Health check duration in seconds",
                &["check"],
                DEFAULT_DURATION_BUCKETS,
            )?,
        })
    }
}

impl TelemetryCollector for PrometheusCollector {
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        let status = status.to_string();
        self.http_requests
            .with_labels(&[method, route, status.as_str()])
            .inc();
        self.http_duration
            .with_labels(&[method, route])
            .observe_duration(duration);
        Ok(())
    }

    fn record_db_query(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
    ) -> Result<(), CollectorError> {
        let status = if success { "success" } else { "error" };
        self.db_queries
            .with_labels(&[operation, table, status])
            .inc();
        self.db_duration
            .with_labels(&[operation, table])
            .observe_duration(duration);
        Ok(())
    }

    fn record_cache_operation(
        &self,
        operation: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        let result = if hit { "hit" } else { "miss" };
        self.cache_operations
            .with_labels(&[operation, result])
            .inc();
        self.cache_duration
            .with_labels(&[operation])
            .observe_duration(duration);
        Ok(())
    }

    fn record_business_event(&self, event: &str, value: f64) -> Result<(), CollectorError> {
        self.business_events.with_labels(&[event]).inc_by(value.max(0.0));
        Ok(())
    }

    fn record_error(&self, error_type: &str, component: &str) -> Result<(), CollectorError> {
        self.errors.with_labels(&[error_type, component]).inc();
        Ok(())
    }

    fn record_health_check(
        &self,
        check: &str,
        status: HealthStatus,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.health_checks
            .with_labels(&[check, status.as_str()])
            .inc();
        self.health_duration
            .with_labels(&[check])
            .observe_duration(duration);
        Ok(())
    }
}
