//! Health checking for the back-office services.
//!
//! - [`engine`]: probe registry, concurrent execution under per-probe
//!   timeouts and the composite report
//! - [`handlers`]: axum handlers for `/health`, `/health/detailed`,
//!   `/health/checks/:name`, `/livez` and `/readyz`
//!
//! # Composite status
//!
//! The overall status is `unhealthy` if any critical probe is unhealthy or
//! every probe is unhealthy, `degraded` if any probe is not healthy, and
//! `healthy` otherwise. An engine with no probes is healthy.

pub mod engine;
pub mod handlers;

pub use engine::{
    BasicHealth, BuildInfo, DependencyInfo, HealthEngine, HealthReport, HealthSummary,
    Readiness, SystemInfo,
};

use crate::attributes::{AttributeValue, Attributes};
use crate::context::TelemetryContext;
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Error type returned by probes.
pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// Health status of a probe or of the whole service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational
    Healthy,
    /// Operational with reduced functionality
    Degraded,
    /// Not operational
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Returns true if the status is healthy or degraded
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Returns the HTTP status code for this health status
    pub fn http_status(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Combines two health statuses, returning the worst status
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
    #[serde(default)]
    pub details: Attributes,
    /// Time from the start of the run call to the result
    #[serde(rename = "duration_ms", with = "crate::config::duration_ms")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: Attributes::new(),
            duration: Duration::ZERO,
            timestamp: Utc::now(),
        }
    }

    pub fn healthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(HealthStatus::Unhealthy, message)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// A user-supplied check. Implementations must be safe to run concurrently
/// and should honour the deadline of `ctx`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, ctx: &TelemetryContext) -> Result<CheckResult, ProbeError>;
}

/// Adapts an async closure into a [`HealthProbe`].
pub struct FnProbe<F> {
    f: F,
}

/// Builds a probe from `|ctx| async move { ... }`.
pub fn probe_fn<F, Fut>(f: F) -> FnProbe<F>
where
    F: Fn(TelemetryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CheckResult, ProbeError>> + Send + 'static,
{
    FnProbe { f }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn(TelemetryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CheckResult, ProbeError>> + Send + 'static,
{
    async fn check(&self, ctx: &TelemetryContext) -> Result<CheckResult, ProbeError> {
        (self.f)(ctx.clone()).await
    }
}

/// Tag marking a probe as an external dependency in the detailed report.
pub const DEPENDENCY_TAG: &str = "dependency";

/// A registered probe and its policy.
#[derive(Clone)]
pub struct ProbeConfig {
    pub name: String,
    pub probe: Arc<dyn HealthProbe>,
    pub timeout: Duration,
    /// Period of the background scheduler for this probe
    pub interval: Duration,
    pub critical: bool,
    /// Reports on the telemetry core itself. An internal probe can degrade
    /// the composite status but never counts toward the all-unhealthy rule.
    pub internal: bool,
    pub enabled: bool,
    pub tags: BTreeSet<String>,
    pub description: String,
}

impl std::fmt::Debug for ProbeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeConfig")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("interval", &self.interval)
            .field("critical", &self.critical)
            .field("internal", &self.internal)
            .field("enabled", &self.enabled)
            .field("tags", &self.tags)
            .finish()
    }
}

impl ProbeConfig {
    /// A critical, enabled probe with a 5 s timeout and a 30 s interval.
    pub fn new(name: impl Into<String>, probe: impl HealthProbe + 'static) -> Self {
        Self {
            name: name.into(),
            probe: Arc::new(probe),
            timeout: Duration::from_secs(5),
            interval: Duration::from_secs(30),
            critical: true,
            internal: false,
            enabled: true,
            tags: BTreeSet::new(),
            description: String::new(),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_dependency(&self) -> bool {
        self.tags.contains(DEPENDENCY_TAG)
    }
}

/// Composite status over `(critical, status)` pairs.
pub fn composite_status<I>(results: I) -> HealthStatus
where
    I: IntoIterator<Item = (bool, HealthStatus)>,
{
    let mut total = 0usize;
    let mut unhealthy = 0usize;
    let mut overall = HealthStatus::Healthy;
    for (critical, status) in results {
        total += 1;
        if status == HealthStatus::Unhealthy {
            if critical {
                return HealthStatus::Unhealthy;
            }
            unhealthy += 1;
        }
        if status != HealthStatus::Healthy {
            overall = HealthStatus::Degraded;
        }
    }
    if total > 0 && unhealthy == total {
        HealthStatus::Unhealthy
    } else {
        overall
    }
}
