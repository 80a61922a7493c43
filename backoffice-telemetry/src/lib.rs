//! Observability core for back-office services.
//!
//! One [`Telemetry`] value owns the metrics registry, the structured logger,
//! the tracer, the error tracker, the health engine and the degradation
//! coordinator that keeps them working when a sink fails. Build it once at
//! start-up, share it as `Arc<Telemetry>` and shut it down explicitly.

pub mod attributes;
pub mod config;
pub mod context;
pub mod error;
pub mod error_tracker;
pub mod health;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod shutdown;
pub mod telemetry;
pub mod tracer;

pub use attributes::{AttributeValue, Attributes};
pub use config::TelemetryConfig;
pub use context::TelemetryContext;
pub use error::{TelemetryError, TelemetryResult};
pub use telemetry::{Telemetry, TelemetryBuilder};
