use std::time::Duration;
use thiserror::Error;

/// Errors raised while registering metric families.
///
/// These are configuration errors: they surface from `Telemetry::init` and
/// are expected to abort process startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricsError {
    #[error("Metric family {name} already registered with a different signature")]
    Conflict { name: String },

    #[error("Invalid metric name: {0}")]
    InvalidName(String),

    #[error("Invalid label name {label} on metric {name}")]
    InvalidLabel { name: String, label: String },

    #[error("Invalid histogram buckets for {name}: {reason}")]
    InvalidBuckets { name: String, reason: String },

    #[error("Metric backend rejected {name}: {reason}")]
    Backend { name: String, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Errors returned by span and error exporters.
#[derive(Error, Debug, Clone)]
pub enum ExportError {
    #[error("Export failed: {0}")]
    Failed(String),

    #[error("Export timed out after {0:?}")]
    Timeout(Duration),

    #[error("Exporter {0} is shut down")]
    Shutdown(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}

/// Errors returned by log sinks.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write log event: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode log event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by the primary collector surface.
#[derive(Error, Debug, Clone)]
pub enum CollectorError {
    #[error("Collector unavailable: {0}")]
    Unavailable(String),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Service name cannot be empty")]
    EmptyServiceName,

    #[error("Sample rate must be between 0.0 and 1.0, got {0}")]
    SampleRate(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Invalid log level: {0}")]
    LogLevel(String),
}

/// Umbrella error for telemetry initialization and shutdown.
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] crate::shutdown::ShutdownError),

    #[error("Subscriber error: {0}")]
    Subscriber(String),

    #[error("No Tokio runtime available: {0}")]
    Runtime(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
