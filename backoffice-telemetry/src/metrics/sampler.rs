//! Periodic process resource sampler.
//!
//! Reads process facts from `/proc/self` on Linux and system memory through
//! `sysinfo`, and records them into a fixed set of gauges. On other platforms
//! the process gauges stay at zero.

use super::registry::{Gauge, Histogram, Registry};
use crate::error::MetricsError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Clock ticks per second assumed when converting `/proc/self/stat` times.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// One reading of process and host resource usage.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ProcessSnapshot {
    pub resident_memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    pub threads: u64,
    pub open_fds: u64,
    /// User plus system CPU time consumed so far
    pub cpu_seconds: f64,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
}

impl ProcessSnapshot {
    /// Reads process facts only. System memory fields are left at zero.
    pub fn current_process() -> Self {
        let mut snapshot = Self::default();
        read_proc_self(&mut snapshot);
        snapshot
    }
}

#[cfg(target_os = "linux")]
fn read_proc_self(snapshot: &mut ProcessSnapshot) {
    use std::fs;

    if let Ok(stat) = fs::read_to_string("/proc/self/stat") {
        // Fields after the parenthesised command name; utime and stime are
        // fields 14 and 15 of the full line.
        if let Some(rest) = stat.rfind(')').map(|idx| &stat[idx + 1..]) {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            if let (Some(utime), Some(stime)) = (parts.get(11), parts.get(12)) {
                if let (Ok(utime), Ok(stime)) = (utime.parse::<u64>(), stime.parse::<u64>()) {
                    snapshot.cpu_seconds = (utime + stime) as f64 / CLOCK_TICKS_PER_SEC;
                }
            }
        }
    }

    if let Ok(status) = fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            let mut parts = line.split_whitespace();
            let key = parts.next();
            let value = parts.next().and_then(|v| v.parse::<u64>().ok());
            match (key, value) {
                (Some("VmRSS:"), Some(kb)) => snapshot.resident_memory_bytes = kb * 1024,
                (Some("VmSize:"), Some(kb)) => snapshot.virtual_memory_bytes = kb * 1024,
                (Some("Threads:"), Some(n)) => snapshot.threads = n,
                _ => {}
            }
        }
    }

    if let Ok(entries) = fs::read_dir("/proc/self/fd") {
        snapshot.open_fds = entries.count() as u64;
    }
}

#[cfg(not(target_os = "linux"))]
fn read_proc_self(_snapshot: &mut ProcessSnapshot) {}

/// Records resource gauges on a fixed interval.
pub struct ResourceSampler {
    resident_memory: Gauge,
    virtual_memory: Gauge,
    threads: Gauge,
    open_fds: Gauge,
    system_memory_used: Gauge,
    system_memory_total: Gauge,
    cpu_usage: Gauge,
    uptime: Gauge,
    duration: Histogram,
    system: Mutex<System>,
    last_cpu: Mutex<Option<(Instant, f64)>>,
    started: Instant,
    interval: Duration,
}

impl ResourceSampler {
    pub fn new(registry: &Registry, interval: Duration) -> Result<Self, MetricsError> {
        let mut system = System::new_all();
        system.refresh_memory();

        Ok(Self {
            resident_memory: registry.gauge(
                "process_resident_memory_bytes",
                "Resident memory size in bytes",
                &[],
            )?,
            virtual_memory: registry.gauge(
                "process_virtual_memory_bytes",
                "Virtual memory size in bytes",
                &[],
            )?,
            threads: registry.gauge("process_threads", "Number of OS threads", &[])?,
            open_fds: registry.gauge("process_open_fds", "Number of open file descriptors", &[])?,
            system_memory_used: registry.gauge(
                "system_memory_used_bytes",
                "Host memory in use in bytes",
                &[],
            )?,
            system_memory_total: registry.gauge(
                "system_memory_total_bytes",
                "Host memory in bytes",
                &[],
            )?,
            cpu_usage: registry.gauge(
                "process_cpu_usage_ratio",
                "Process CPU time per wall-clock second since the previous sample",
                &[],
            )?,
            uptime: registry.gauge("process_uptime_seconds", "Seconds since the sampler started", &[])?,
            duration: registry.histogram(
                "telemetry_sampler_duration_seconds",
                "Time spent taking one resource sample",
                &[],
                &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
            )?,
            system: Mutex::new(system),
            last_cpu: Mutex::new(None),
            started: Instant::now(),
            interval,
        })
    }

    /// Takes one sample and returns what was recorded.
    pub fn sample(&self) -> ProcessSnapshot {
        let timer = self.duration.with_labels(&[]).start_timer();

        let mut snapshot = ProcessSnapshot::current_process();
        {
            let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
            system.refresh_memory();
            snapshot.system_memory_used_bytes = system.used_memory();
            snapshot.system_memory_total_bytes = system.total_memory();
        }

        self.resident_memory.set(snapshot.resident_memory_bytes as f64);
        self.virtual_memory.set(snapshot.virtual_memory_bytes as f64);
        self.threads.set(snapshot.threads as f64);
        self.open_fds.set(snapshot.open_fds as f64);
        self.system_memory_used
            .set(snapshot.system_memory_used_bytes as f64);
        self.system_memory_total
            .set(snapshot.system_memory_total_bytes as f64);
        self.uptime.set(self.started.elapsed().as_secs_f64());

        let now = Instant::now();
        let mut last = self.last_cpu.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, cpu)) = *last {
            let wall = now.duration_since(at).as_secs_f64();
            if wall > 0.0 {
                self.cpu_usage
                    .set(((snapshot.cpu_seconds - cpu) / wall).max(0.0));
            }
        }
        *last = Some((now, snapshot.cpu_seconds));
        drop(last);

        drop(timer);
        snapshot
    }

    /// Runs [`sample`](Self::sample) every interval until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("resource sampler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.sample();
                    }
                }
            }
        })
    }
}
