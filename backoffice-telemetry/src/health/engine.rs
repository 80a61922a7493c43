//! Probe registry and execution.
//!
//! Each probe runs in its own task under a child context bounded by the
//! probe timeout, so a hung or panicking probe never blocks the others.

use super::{composite_status, CheckResult, HealthStatus, ProbeConfig};
use crate::context::TelemetryContext;
use crate::error_tracker::panic_message;
use crate::metrics::sampler::ProcessSnapshot;
use crate::metrics::TelemetryCollector;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Granularity of the background probe scheduler.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
    pub crate_version: String,
}

impl BuildInfo {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            git_commit: None,
            build_time: None,
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_git_commit(mut self, commit: impl Into<String>) -> Self {
        self.git_commit = Some(commit.into());
        self
    }

    pub fn with_build_time(mut self, time: impl Into<String>) -> Self {
        self.build_time = Some(time.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub pid: u32,
    pub threads: u64,
    pub memory_bytes: u64,
    pub cpus: usize,
    pub os: String,
    pub arch: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let process = ProcessSnapshot::current_process();
        Self {
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            pid: std::process::id(),
            threads: process.threads,
            memory_bytes: process.resident_memory_bytes,
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub critical_failures: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyInfo {
    pub status: HealthStatus,
    pub critical: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Body of `/health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasicHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Body of `/health/detailed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub build_info: BuildInfo,
    pub system_info: SystemInfo,
    pub checks: BTreeMap<String, CheckResult>,
    pub summary: HealthSummary,
    /// Seconds since the engine was created
    pub uptime: u64,
    pub dependencies: BTreeMap<String, DependencyInfo>,
}

/// Body of `/readyz`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub checks: BTreeMap<String, CheckResult>,
}

/// Runs registered probes and composes their results.
pub struct HealthEngine {
    probes: RwLock<BTreeMap<String, ProbeConfig>>,
    last_results: RwLock<HashMap<String, (Instant, CheckResult)>>,
    collector: RwLock<Option<Arc<dyn TelemetryCollector>>>,
    build_info: BuildInfo,
    started: Instant,
}

impl std::fmt::Debug for HealthEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthEngine")
            .field("probes", &self.names())
            .field("version", &self.build_info.version)
            .finish()
    }
}

impl HealthEngine {
    pub fn new(build_info: BuildInfo) -> Self {
        Self {
            probes: RwLock::new(BTreeMap::new()),
            last_results: RwLock::new(HashMap::new()),
            collector: RwLock::new(None),
            build_info,
            started: Instant::now(),
        }
    }

    pub fn version(&self) -> &str {
        &self.build_info.version
    }

    /// Reports every result to `collector` as a health-check observation.
    pub fn set_collector(&self, collector: Arc<dyn TelemetryCollector>) {
        *self.collector.write().unwrap_or_else(|e| e.into_inner()) = Some(collector);
    }

    /// Registers a probe. A probe with the same name is replaced.
    pub fn add(&self, config: ProbeConfig) {
        let name = config.name.clone();
        let previous = self
            .probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), config);
        if previous.is_some() {
            warn!(check = %name, "health check replaced by a probe with the same name");
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        self.last_results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.probes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn probe(&self, name: &str) -> Option<ProbeConfig> {
        self.probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn enabled_probes(&self) -> Vec<ProbeConfig> {
        self.probes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    /// Runs one probe. `None` if no probe has that name.
    pub async fn run(&self, name: &str, ctx: &TelemetryContext) -> Option<CheckResult> {
        let config = self.probe(name)?;
        Some(self.execute(config, ctx).await)
    }

    /// Runs every enabled probe concurrently.
    pub async fn run_all(&self, ctx: &TelemetryContext) -> BTreeMap<String, CheckResult> {
        let probes = self.enabled_probes();
        let runs = probes.into_iter().map(|config| async move {
            let name = config.name.clone();
            (name, self.execute(config, ctx).await)
        });
        join_all(runs).await.into_iter().collect()
    }

    /// The latest result of a probe from any run, including scheduled ones.
    pub fn last_result(&self, name: &str) -> Option<CheckResult> {
        self.last_results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|(_, result)| result.clone())
    }

    async fn execute(&self, config: ProbeConfig, ctx: &TelemetryContext) -> CheckResult {
        let started = Instant::now();
        if !config.enabled {
            let mut result = CheckResult::healthy("Check disabled");
            result.duration = started.elapsed();
            return result;
        }

        // A parent deadline earlier than the probe timeout wins.
        let budget = ctx
            .remaining()
            .map_or(config.timeout, |left| left.min(config.timeout));
        let probe_ctx = ctx.with_timeout(config.timeout);
        let probe = Arc::clone(&config.probe);
        let task_ctx = probe_ctx.clone();
        let mut task = tokio::spawn(async move { probe.check(&task_ctx).await });

        let mut result = tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => CheckResult::unhealthy(e.to_string()),
                Err(e) if e.is_panic() => {
                    let payload = e.into_panic();
                    CheckResult::unhealthy(panic_message(payload.as_ref()))
                }
                Err(e) => CheckResult::unhealthy(format!("check aborted: {e}")),
            },
            _ = probe_ctx.cancelled() => {
                task.abort();
                if ctx.cancellation_token().is_cancelled() {
                    CheckResult::unhealthy("check cancelled")
                } else {
                    CheckResult::unhealthy(format!("check timed out after {budget:?}"))
                }
            }
        };
        result.duration = started.elapsed();
        result.timestamp = Utc::now();

        if result.status != HealthStatus::Healthy {
            warn!(
                check = %config.name,
                status = %result.status,
                message = %result.message,
                "health check not healthy"
            );
        }
        self.record(&config.name, &result);
        result
    }

    fn record(&self, name: &str, result: &CheckResult) {
        self.last_results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), (Instant::now(), result.clone()));

        let collector = self
            .collector
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(collector) = collector {
            if let Err(e) = collector.record_health_check(name, result.status, result.duration) {
                debug!(check = %name, error = %e, "health check observation not recorded");
            }
        }
    }

    fn status_of(&self, checks: &BTreeMap<String, CheckResult>) -> HealthStatus {
        let probes = self.probes.read().unwrap_or_else(|e| e.into_inner());
        let mut internal_degraded = false;
        let status = composite_status(checks.iter().filter_map(|(name, result)| {
            let probe = probes.get(name);
            if probe.is_some_and(|p| p.internal) {
                internal_degraded |= result.status != HealthStatus::Healthy;
                return None;
            }
            Some((probe.map(|p| p.critical).unwrap_or(false), result.status))
        }));
        if internal_degraded {
            status.combine(&HealthStatus::Degraded)
        } else {
            status
        }
    }

    /// Composite status of a fresh run.
    pub async fn status(&self, ctx: &TelemetryContext) -> BasicHealth {
        let checks = self.run_all(ctx).await;
        BasicHealth {
            status: self.status_of(&checks),
            timestamp: Utc::now(),
            version: self.build_info.version.clone(),
        }
    }

    pub async fn report(&self, ctx: &TelemetryContext) -> HealthReport {
        let checks = self.run_all(ctx).await;
        let status = self.status_of(&checks);

        let (summary, dependencies) = {
            let probes = self.probes.read().unwrap_or_else(|e| e.into_inner());
            let mut summary = HealthSummary {
                total: checks.len(),
                ..Default::default()
            };
            let mut dependencies = BTreeMap::new();
            for (name, result) in &checks {
                let probe = probes.get(name);
                let critical = probe.map(|p| p.critical).unwrap_or(false);
                match result.status {
                    HealthStatus::Healthy => summary.healthy += 1,
                    HealthStatus::Degraded => summary.degraded += 1,
                    HealthStatus::Unhealthy => {
                        summary.unhealthy += 1;
                        if critical {
                            summary.critical_failures += 1;
                        }
                    }
                }
                if let Some(probe) = probe.filter(|p| p.is_dependency()) {
                    dependencies.insert(
                        name.clone(),
                        DependencyInfo {
                            status: result.status,
                            critical,
                            description: probe.description.clone(),
                        },
                    );
                }
            }
            (summary, dependencies)
        };

        HealthReport {
            status,
            timestamp: Utc::now(),
            version: self.build_info.version.clone(),
            build_info: self.build_info.clone(),
            system_info: SystemInfo::collect(),
            checks,
            summary,
            uptime: self.started.elapsed().as_secs(),
            dependencies,
        }
    }

    /// Ready iff every enabled critical probe is healthy.
    pub async fn readiness(&self, ctx: &TelemetryContext) -> Readiness {
        let critical: Vec<ProbeConfig> = self
            .enabled_probes()
            .into_iter()
            .filter(|p| p.critical)
            .collect();
        let runs = critical.into_iter().map(|config| async move {
            let name = config.name.clone();
            (name, self.execute(config, ctx).await)
        });
        let checks: BTreeMap<String, CheckResult> = join_all(runs).await.into_iter().collect();
        Readiness {
            ready: checks.values().all(|r| r.status == HealthStatus::Healthy),
            checks,
        }
    }

    /// Runs each enabled probe on its own interval until `token` is
    /// cancelled. Results are available through [`last_result`].
    ///
    /// [`last_result`]: HealthEngine::last_result
    pub fn spawn_scheduler(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("health scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let due = self.due_probes(Instant::now());
                        if due.is_empty() {
                            continue;
                        }
                        let ctx = TelemetryContext::new().child();
                        let engine = &self;
                        join_all(due.into_iter().map(|config| {
                            let ctx = &ctx;
                            async move { engine.execute(config, ctx).await }
                        }))
                        .await;
                    }
                }
            }
        })
    }

    fn due_probes(&self, now: Instant) -> Vec<ProbeConfig> {
        let last = self.last_results.read().unwrap_or_else(|e| e.into_inner());
        self.enabled_probes()
            .into_iter()
            .filter(|p| match last.get(&p.name) {
                Some((at, _)) => now.duration_since(*at) >= p.interval,
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectorError;
    use crate::health::{probe_fn, ProbeError, DEPENDENCY_TAG};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn fixed(status: HealthStatus) -> impl crate::health::HealthProbe {
        probe_fn(move |_ctx| async move { Ok(CheckResult::new(status, "fixed")) })
    }

    fn engine() -> HealthEngine {
        HealthEngine::new(BuildInfo::new("1.2.3"))
    }

    #[tokio::test]
    async fn test_empty_engine_is_healthy() {
        let engine = engine();
        let health = engine.status(&TelemetryContext::new()).await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.version, "1.2.3");
        assert!(engine.readiness(&TelemetryContext::new()).await.ready);
    }

    #[tokio::test]
    async fn test_unknown_probe() {
        assert!(engine().run("missing", &TelemetryContext::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_probe() {
        let engine = engine();
        engine.add(ProbeConfig::new("db", fixed(HealthStatus::Unhealthy)).enabled(false));

        let result = engine.run("db", &TelemetryContext::new()).await.unwrap();
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.message, "Check disabled");
        assert!(engine.run_all(&TelemetryContext::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unhealthy() {
        let engine = engine();
        engine.add(
            ProbeConfig::new(
                "slow",
                probe_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(CheckResult::healthy("late"))
                }),
            )
            .timeout(Duration::from_millis(100)),
        );

        let result = engine.run("slow", &TelemetryContext::new()).await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert!(result.message.starts_with("check timed out after"));
        assert!(result.duration >= Duration::from_millis(100));
        assert!(result.duration < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_deadline_is_reported() {
        let engine = engine();
        engine.add(
            ProbeConfig::new(
                "slow",
                probe_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(CheckResult::healthy("late"))
                }),
            )
            .timeout(Duration::from_secs(5)),
        );

        let ctx = TelemetryContext::new().with_timeout(Duration::from_millis(50));
        let result = engine.run("slow", &ctx).await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message, "check timed out after 50ms");
        assert!(result.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let engine = engine();
        engine.add(ProbeConfig::new(
            "hang",
            probe_fn(|_ctx| async {
                std::future::pending::<()>().await;
                Ok(CheckResult::healthy("never"))
            }),
        ));

        let ctx = TelemetryContext::new();
        ctx.cancel();
        let result = engine.run("hang", &ctx).await.unwrap();
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.message, "check cancelled");
    }

    #[tokio::test]
    async fn test_error_and_panic_become_unhealthy() {
        let engine = engine();
        engine.add(ProbeConfig::new(
            "err",
            probe_fn(|_ctx| async {
                Err::<CheckResult, ProbeError>("connection refused".into())
            }),
        ));
        engine.add(ProbeConfig::new(
            "boom",
            probe_fn(|_ctx| async {
                if true {
                    panic!("probe exploded");
                }
                Ok(CheckResult::healthy("unreachable"))
            }),
        ));

        let results = engine.run_all(&TelemetryContext::new()).await;
        assert_eq!(results["err"].status, HealthStatus::Unhealthy);
        assert_eq!(results["err"].message, "connection refused");
        assert_eq!(results["boom"].status, HealthStatus::Unhealthy);
        assert_eq!(results["boom"].message, "probe exploded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_run_concurrently() {
        let engine = engine();
        for name in ["a", "b", "c"] {
            engine.add(ProbeConfig::new(
                name,
                probe_fn(|_ctx| async {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(CheckResult::healthy("ok"))
                }),
            ));
        }

        let started = Instant::now();
        let results = engine.run_all(&TelemetryContext::new()).await;
        assert_eq!(results.len(), 3);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_flipping_critical_probe() {
        let engine = engine();
        let db_down = Arc::new(AtomicBool::new(false));
        let flag = db_down.clone();
        engine.add(ProbeConfig::new(
            "db",
            probe_fn(move |_ctx| {
                let down = flag.load(Ordering::SeqCst);
                async move {
                    Ok(if down {
                        CheckResult::unhealthy("down")
                    } else {
                        CheckResult::healthy("up")
                    })
                }
            }),
        ));
        engine.add(ProbeConfig::new("cache", fixed(HealthStatus::Degraded)).critical(false));
        engine.add(ProbeConfig::new("ext", fixed(HealthStatus::Healthy)).critical(false));

        let ctx = TelemetryContext::new();
        assert_eq!(engine.status(&ctx).await.status, HealthStatus::Degraded);
        assert!(engine.readiness(&ctx).await.ready);

        db_down.store(true, Ordering::SeqCst);
        assert_eq!(engine.status(&ctx).await.status, HealthStatus::Unhealthy);
        assert!(!engine.readiness(&ctx).await.ready);
    }

    #[tokio::test]
    async fn test_internal_probe_stays_out_of_all_unhealthy_rule() {
        let engine = engine();
        engine.add(
            ProbeConfig::new("pipeline", fixed(HealthStatus::Healthy))
                .critical(false)
                .internal(true),
        );
        engine.add(ProbeConfig::new("queue", fixed(HealthStatus::Unhealthy)).critical(false));

        let ctx = TelemetryContext::new();
        assert_eq!(engine.status(&ctx).await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_degraded_internal_probe_degrades_composite() {
        let engine = engine();
        engine.add(
            ProbeConfig::new("pipeline", fixed(HealthStatus::Degraded))
                .critical(false)
                .internal(true),
        );
        engine.add(ProbeConfig::new("db", fixed(HealthStatus::Healthy)));

        let ctx = TelemetryContext::new();
        assert_eq!(engine.status(&ctx).await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_report_contents() {
        let engine = engine();
        engine.add(
            ProbeConfig::new("postgres", fixed(HealthStatus::Healthy))
                .tag(DEPENDENCY_TAG)
                .description("orders database"),
        );
        engine.add(ProbeConfig::new("queue", fixed(HealthStatus::Unhealthy)).critical(false));

        let report = engine.report(&TelemetryContext::new()).await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.unhealthy, 1);
        assert_eq!(report.summary.critical_failures, 0);
        assert_eq!(report.dependencies.len(), 1);
        assert_eq!(report.dependencies["postgres"].description, "orders database");
        assert_eq!(report.system_info.pid, std::process::id());
        assert_eq!(report.build_info.version, "1.2.3");
    }

    #[tokio::test]
    async fn test_replace_and_remove() {
        let engine = engine();
        engine.add(ProbeConfig::new("db", fixed(HealthStatus::Unhealthy)));
        engine.add(ProbeConfig::new("db", fixed(HealthStatus::Healthy)));
        assert_eq!(engine.names(), vec!["db"]);
        assert_eq!(
            engine.run("db", &TelemetryContext::new()).await.unwrap().status,
            HealthStatus::Healthy
        );

        assert!(engine.remove("db"));
        assert!(!engine.remove("db"));
    }

    #[derive(Default)]
    struct RecordingCollector {
        checks: Mutex<Vec<(String, HealthStatus)>>,
    }

    impl TelemetryCollector for RecordingCollector {
        fn record_http_request(&self, _: &str, _: &str, _: u16, _: Duration) -> Result<(), CollectorError> {
            Ok(())
        }
        fn record_db_query(&self, _: &str, _: &str, _: Duration, _: bool) -> Result<(), CollectorError> {
            Ok(())
        }
        fn record_cache_operation(&self, _: &str, _: bool, _: Duration) -> Result<(), CollectorError> {
            Ok(())
        }
        fn record_business_event(&self, _: &str, _: f64) -> Result<(), CollectorError> {
            Ok(())
        }
        fn record_error(&self, _: &str, _: &str) -> Result<(), CollectorError> {
            Ok(())
        }
        fn record_health_check(
            &self,
            check: &str,
            status: HealthStatus,
            _duration: Duration,
        ) -> Result<(), CollectorError> {
            self.checks.lock().unwrap().push((check.to_string(), status));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_results_reach_collector() {
        let engine = engine();
        let collector = Arc::new(RecordingCollector::default());
        engine.set_collector(collector.clone());
        engine.add(ProbeConfig::new("db", fixed(HealthStatus::Degraded)));

        engine.run("db", &TelemetryContext::new()).await;
        assert_eq!(
            *collector.checks.lock().unwrap(),
            vec![("db".to_string(), HealthStatus::Degraded)]
        );
        assert_eq!(
            engine.last_result("db").unwrap().status,
            HealthStatus::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_honours_interval() {
        let engine = Arc::new(engine());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        engine.add(
            ProbeConfig::new(
                "tick",
                probe_fn(move |_ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(CheckResult::healthy("ok")) }
                }),
            )
            .interval(Duration::from_secs(10)),
        );

        let token = CancellationToken::new();
        let handle = engine.clone().spawn_scheduler(token.clone());
        tokio::time::sleep(Duration::from_millis(25_500)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
