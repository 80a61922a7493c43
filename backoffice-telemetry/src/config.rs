//! Telemetry configuration.
//!
//! A single structured object consumed by [`crate::Telemetry::init`]. Every
//! field has a default, so partial documents deserialize cleanly. Durations
//! are written as integer milliseconds.

use crate::attributes::DEFAULT_SANITIZE_PATTERNS;
use crate::error::ConfigError;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

/// Carrier format used for trace context injection and extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationFormat {
    /// `traceparent` / `tracestate` / `baggage`
    #[default]
    W3c,
    /// Single `b3` header
    B3,
    /// Single `b3` header on extraction; both single and multi headers on injection
    B3Multi,
}

/// Breaker tuning for one protected component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    pub max_failures: u32,
    #[serde(with = "duration_ms", alias = "reset_timeout_ms")]
    pub reset_timeout: Duration,
}

/// Configuration for the whole telemetry core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Resource
    pub service_name: String,
    pub service_version: String,
    pub environment: String,

    // Sampling and span bounds
    pub sample_rate: f64,
    pub force_sampling: bool,
    pub max_attributes_per_span: usize,
    pub max_events_per_span: usize,
    pub max_links_per_span: usize,

    // Export pipeline
    #[serde(with = "duration_ms", alias = "flush_interval_ms")]
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub async_export: bool,
    #[serde(with = "duration_ms", alias = "export_timeout_ms")]
    pub export_timeout: Duration,
    /// Capacity of the finished-span queue in front of the exporters
    pub max_queue_size: usize,

    // Propagation
    pub propagation_format: PropagationFormat,
    pub enable_baggage: bool,

    // Redaction
    pub sanitize_attributes: Vec<String>,
    pub enable_sanitization: bool,

    // Logger
    pub log_level: LogLevel,
    pub log_spans: bool,
    pub log_queue_size: usize,

    // Error tracker
    pub error_max_entries: usize,
    #[serde(with = "duration_ms", alias = "error_max_age_ms")]
    pub error_max_age: Duration,
    pub error_queue_size: usize,

    // Degradation coordinator
    pub breaker_max_failures: u32,
    #[serde(with = "duration_ms", alias = "breaker_reset_timeout_ms")]
    pub breaker_reset_timeout: Duration,
    /// Per-component overrides of the two values above
    pub breakers: BTreeMap<String, BreakerSettings>,
    pub fallback_enabled: bool,
    pub fallback_max_entries: usize,
    /// Breakers whose return to closed clears backup mode
    pub backup_exit_components: Vec<String>,

    // Resource sampler
    #[serde(with = "duration_ms", alias = "sampler_interval_ms")]
    pub sampler_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "backoffice".to_string(),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            environment: env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "development".to_string()),
            sample_rate: 1.0,
            force_sampling: false,
            max_attributes_per_span: 128,
            max_events_per_span: 128,
            max_links_per_span: 32,
            flush_interval: Duration::from_secs(5),
            batch_size: 100,
            async_export: true,
            export_timeout: Duration::from_secs(10),
            max_queue_size: 2048,
            propagation_format: PropagationFormat::W3c,
            enable_baggage: true,
            sanitize_attributes: DEFAULT_SANITIZE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            enable_sanitization: true,
            log_level: LogLevel::Info,
            log_spans: false,
            log_queue_size: 4096,
            error_max_entries: 1000,
            error_max_age: Duration::from_secs(24 * 60 * 60),
            error_queue_size: 1024,
            breaker_max_failures: 5,
            breaker_reset_timeout: Duration::from_secs(30),
            breakers: BTreeMap::new(),
            fallback_enabled: true,
            fallback_max_entries: 1000,
            backup_exit_components: vec!["health".to_string(), "metrics".to_string()],
            sampler_interval: Duration::from_secs(10),
        }
    }
}

impl TelemetryConfig {
    /// Create a new builder for TelemetryConfig
    pub fn builder() -> TelemetryConfigBuilder {
        TelemetryConfigBuilder::default()
    }

    /// Breaker settings for `component`, falling back to the global values.
    pub fn breaker_settings(&self, component: &str) -> BreakerSettings {
        self.breakers
            .get(component)
            .copied()
            .unwrap_or(BreakerSettings {
                max_failures: self.breaker_max_failures,
                reset_timeout: self.breaker_reset_timeout,
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::EmptyServiceName);
        }

        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::SampleRate(self.sample_rate));
        }

        let positive = [
            ("batch_size", self.batch_size),
            ("max_queue_size", self.max_queue_size),
            ("log_queue_size", self.log_queue_size),
            ("error_max_entries", self.error_max_entries),
            ("error_queue_size", self.error_queue_size),
            ("fallback_max_entries", self.fallback_max_entries),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let durations = [
            ("flush_interval", self.flush_interval),
            ("export_timeout", self.export_timeout),
            ("sampler_interval", self.sampler_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.breaker_max_failures == 0 {
            return Err(ConfigError::Zero("breaker_max_failures"));
        }
        if self.breakers.values().any(|b| b.max_failures == 0) {
            return Err(ConfigError::Zero("breakers.max_failures"));
        }

        Ok(())
    }
}

/// Builder for TelemetryConfig
#[derive(Default)]
pub struct TelemetryConfigBuilder {
    service_name: Option<String>,
    service_version: Option<String>,
    environment: Option<String>,
    sample_rate: Option<f64>,
    force_sampling: Option<bool>,
    max_attributes_per_span: Option<usize>,
    max_events_per_span: Option<usize>,
    max_links_per_span: Option<usize>,
    flush_interval: Option<Duration>,
    batch_size: Option<usize>,
    async_export: Option<bool>,
    export_timeout: Option<Duration>,
    max_queue_size: Option<usize>,
    propagation_format: Option<PropagationFormat>,
    enable_baggage: Option<bool>,
    sanitize_attributes: Option<Vec<String>>,
    enable_sanitization: Option<bool>,
    log_level: Option<LogLevel>,
    log_spans: Option<bool>,
    log_queue_size: Option<usize>,
    error_max_entries: Option<usize>,
    error_max_age: Option<Duration>,
    error_queue_size: Option<usize>,
    breaker_max_failures: Option<u32>,
    breaker_reset_timeout: Option<Duration>,
    breakers: BTreeMap<String, BreakerSettings>,
    fallback_enabled: Option<bool>,
    fallback_max_entries: Option<usize>,
    backup_exit_components: Option<Vec<String>>,
    sampler_interval: Option<Duration>,
}

impl TelemetryConfigBuilder {
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.environment = Some(env.into());
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn force_sampling(mut self, force: bool) -> Self {
        self.force_sampling = Some(force);
        self
    }

    pub fn max_attributes_per_span(mut self, max: usize) -> Self {
        self.max_attributes_per_span = Some(max);
        self
    }

    pub fn max_events_per_span(mut self, max: usize) -> Self {
        self.max_events_per_span = Some(max);
        self
    }

    pub fn max_links_per_span(mut self, max: usize) -> Self {
        self.max_links_per_span = Some(max);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn async_export(mut self, enabled: bool) -> Self {
        self.async_export = Some(enabled);
        self
    }

    pub fn export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = Some(timeout);
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = Some(size);
        self
    }

    pub fn propagation_format(mut self, format: PropagationFormat) -> Self {
        self.propagation_format = Some(format);
        self
    }

    pub fn enable_baggage(mut self, enabled: bool) -> Self {
        self.enable_baggage = Some(enabled);
        self
    }

    pub fn sanitize_attributes<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sanitize_attributes = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn enable_sanitization(mut self, enabled: bool) -> Self {
        self.enable_sanitization = Some(enabled);
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = Some(level);
        self
    }

    pub fn log_spans(mut self, enabled: bool) -> Self {
        self.log_spans = Some(enabled);
        self
    }

    pub fn log_queue_size(mut self, size: usize) -> Self {
        self.log_queue_size = Some(size);
        self
    }

    pub fn error_max_entries(mut self, max: usize) -> Self {
        self.error_max_entries = Some(max);
        self
    }

    pub fn error_max_age(mut self, age: Duration) -> Self {
        self.error_max_age = Some(age);
        self
    }

    pub fn error_queue_size(mut self, size: usize) -> Self {
        self.error_queue_size = Some(size);
        self
    }

    pub fn breaker_max_failures(mut self, max: u32) -> Self {
        self.breaker_max_failures = Some(max);
        self
    }

    pub fn breaker_reset_timeout(mut self, timeout: Duration) -> Self {
        self.breaker_reset_timeout = Some(timeout);
        self
    }

    /// Override breaker tuning for a single component.
    pub fn breaker(
        mut self,
        component: impl Into<String>,
        max_failures: u32,
        reset_timeout: Duration,
    ) -> Self {
        self.breakers.insert(
            component.into(),
            BreakerSettings {
                max_failures,
                reset_timeout,
            },
        );
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.fallback_enabled = Some(enabled);
        self
    }

    pub fn fallback_max_entries(mut self, max: usize) -> Self {
        self.fallback_max_entries = Some(max);
        self
    }

    pub fn backup_exit_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backup_exit_components = Some(components.into_iter().map(Into::into).collect());
        self
    }

    pub fn sampler_interval(mut self, interval: Duration) -> Self {
        self.sampler_interval = Some(interval);
        self
    }

    pub fn build(self) -> TelemetryConfig {
        let default = TelemetryConfig::default();
        TelemetryConfig {
            service_name: self.service_name.unwrap_or(default.service_name),
            service_version: self.service_version.unwrap_or(default.service_version),
            environment: self.environment.unwrap_or(default.environment),
            sample_rate: self.sample_rate.unwrap_or(default.sample_rate),
            force_sampling: self.force_sampling.unwrap_or(default.force_sampling),
            max_attributes_per_span: self
                .max_attributes_per_span
                .unwrap_or(default.max_attributes_per_span),
            max_events_per_span: self
                .max_events_per_span
                .unwrap_or(default.max_events_per_span),
            max_links_per_span: self
                .max_links_per_span
                .unwrap_or(default.max_links_per_span),
            flush_interval: self.flush_interval.unwrap_or(default.flush_interval),
            batch_size: self.batch_size.unwrap_or(default.batch_size),
            async_export: self.async_export.unwrap_or(default.async_export),
            export_timeout: self.export_timeout.unwrap_or(default.export_timeout),
            max_queue_size: self.max_queue_size.unwrap_or(default.max_queue_size),
            propagation_format: self
                .propagation_format
                .unwrap_or(default.propagation_format),
            enable_baggage: self.enable_baggage.unwrap_or(default.enable_baggage),
            sanitize_attributes: self
                .sanitize_attributes
                .unwrap_or(default.sanitize_attributes),
            enable_sanitization: self
                .enable_sanitization
                .unwrap_or(default.enable_sanitization),
            log_level: self.log_level.unwrap_or(default.log_level),
            log_spans: self.log_spans.unwrap_or(default.log_spans),
            log_queue_size: self.log_queue_size.unwrap_or(default.log_queue_size),
            error_max_entries: self.error_max_entries.unwrap_or(default.error_max_entries),
            error_max_age: self.error_max_age.unwrap_or(default.error_max_age),
            error_queue_size: self.error_queue_size.unwrap_or(default.error_queue_size),
            breaker_max_failures: self
                .breaker_max_failures
                .unwrap_or(default.breaker_max_failures),
            breaker_reset_timeout: self
                .breaker_reset_timeout
                .unwrap_or(default.breaker_reset_timeout),
            breakers: self.breakers,
            fallback_enabled: self.fallback_enabled.unwrap_or(default.fallback_enabled),
            fallback_max_entries: self
                .fallback_max_entries
                .unwrap_or(default.fallback_max_entries),
            backup_exit_components: self
                .backup_exit_components
                .unwrap_or(default.backup_exit_components),
            sampler_interval: self.sampler_interval.unwrap_or(default.sampler_interval),
        }
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.sample_rate, 1.0);
        assert_eq!(config.max_attributes_per_span, 128);
        assert_eq!(config.max_links_per_span, 32);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.export_timeout, Duration::from_secs(10));
        assert_eq!(config.propagation_format, PropagationFormat::W3c);
        assert_eq!(config.sanitize_attributes.len(), 7);
        assert_eq!(config.error_max_age, Duration::from_secs(86_400));
        assert_eq!(config.backup_exit_components, vec!["health", "metrics"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = TelemetryConfig::builder()
            .service_name("billing")
            .sample_rate(0.25)
            .propagation_format(PropagationFormat::B3)
            .breaker("metrics", 3, Duration::from_millis(50))
            .build();

        assert_eq!(config.service_name, "billing");
        assert_eq!(config.sample_rate, 0.25);
        assert_eq!(config.batch_size, 100);
        assert_eq!(
            config.breaker_settings("metrics"),
            BreakerSettings {
                max_failures: 3,
                reset_timeout: Duration::from_millis(50)
            }
        );
        assert_eq!(config.breaker_settings("tracing").max_failures, 5);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TelemetryConfig::builder().sample_rate(1.5).build();
        assert_eq!(config.validate(), Err(ConfigError::SampleRate(1.5)));

        let config = TelemetryConfig::builder().service_name("  ").build();
        assert_eq!(config.validate(), Err(ConfigError::EmptyServiceName));

        let config = TelemetryConfig::builder().batch_size(0).build();
        assert_eq!(config.validate(), Err(ConfigError::Zero("batch_size")));

        let config = TelemetryConfig::builder().sample_rate(f64::NAN).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_with_millis() {
        let config: TelemetryConfig = serde_json::from_str(
            r#"{
                "service_name": "orders",
                "flush_interval_ms": 250,
                "propagation_format": "b3_multi",
                "log_level": "warn",
                "breakers": {"health": {"max_failures": 2, "reset_timeout": 1000}}
            }"#,
        )
        .unwrap();

        assert_eq!(config.service_name, "orders");
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.propagation_format, PropagationFormat::B3Multi);
        assert_eq!(config.log_level, LogLevel::Warn);
        assert_eq!(config.breaker_settings("health").max_failures, 2);
        assert_eq!(config.batch_size, 100);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["flush_interval"], 250);
        assert_eq!(json["export_timeout"], 10_000);
    }
}
