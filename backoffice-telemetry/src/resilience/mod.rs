//! Graceful degradation of the telemetry paths.
//!
//! - **Circuit Breaker**: stops calling a failing sink until it has had time
//!   to recover
//! - **Fallback Sink**: bounded in-memory store for observations whose
//!   primary path failed
//! - **Coordinator**: wraps the collector and exporters, drives the breakers
//!   and tracks backup mode
//!
//! # Example
//!
//! ```no_run
//! use backoffice_telemetry::config::TelemetryConfig;
//! use backoffice_telemetry::metrics::{PrometheusCollector, Registry, TelemetryCollector};
//! use backoffice_telemetry::resilience::DegradationCoordinator;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new();
//! let primary = Arc::new(PrometheusCollector::new(&registry)?);
//! let coordinator = DegradationCoordinator::new(&TelemetryConfig::default(), primary, &registry)?;
//!
//! coordinator.record_http_request("GET", "/orders", 200, Duration::from_millis(4))?;
//! println!("{:?}", coordinator.status());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod coordinator;
pub mod fallback;

pub use circuit_breaker::{
    BreakerListener, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerError, CircuitBreakerStats, CircuitState,
};
pub use coordinator::{
    BreakerStatus, CoordinatorStatus, DegradationCoordinator, NotificationGate,
    ResilientErrorExporter, ResilientSpanExporter, StateChangeCallback,
};
pub use fallback::{FallbackEntry, FallbackRecord, FallbackSink};
