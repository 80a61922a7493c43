//! Installation of the process-wide `tracing` subscriber.
//!
//! The crate's own diagnostics (breaker transitions, exporter failures,
//! shutdown progress) go through `tracing`, so the host installs a
//! subscriber once at startup.

use crate::error::TelemetryError;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Multi-line human-readable output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSubscriberConfig {
    pub format: LogFormat,
    /// Default directive when neither `filter` nor `RUST_LOG` is set
    pub level: String,
    /// Explicit `EnvFilter` directives, overriding `RUST_LOG`
    pub filter: Option<String>,
}

impl Default for LogSubscriberConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
            filter: None,
        }
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Installs the global subscriber. Returns `TelemetryError::Subscriber` when
/// the filter is invalid or a subscriber is already installed.
pub fn init_tracing_subscriber(config: &LogSubscriberConfig) -> Result<(), TelemetryError> {
    let env_filter = build_filter(config)?;

    let result = match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(json_layer).try_init()
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_filter(env_filter);
            tracing_subscriber::registry().with(pretty_layer).try_init()
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer().compact().with_filter(env_filter);
            tracing_subscriber::registry().with(compact_layer).try_init()
        }
    };

    result.map_err(|e| TelemetryError::Subscriber(e.to_string()))?;
    tracing::info!(format = ?config.format, "tracing subscriber initialized");
    Ok(())
}

fn build_filter(config: &LogSubscriberConfig) -> Result<EnvFilter, TelemetryError> {
    match &config.filter {
        Some(filter) => {
            EnvFilter::try_new(filter).map_err(|e| TelemetryError::Subscriber(e.to_string()))
        }
        None => Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.level))),
    }
}
