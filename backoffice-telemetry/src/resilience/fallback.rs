//! In-memory fallback for observations whose primary path failed.

use crate::error::CollectorError;
use crate::error_tracker::ErrorEvent;
use crate::health::HealthStatus;
use crate::metrics::TelemetryCollector;
use crate::tracer::SpanData;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub const HTTP_REQUESTS: &str = "http_requests";
pub const DB_QUERIES: &str = "db_queries";
pub const CACHE_OPERATIONS: &str = "cache_operations";
pub const BUSINESS_EVENTS: &str = "business_events";
pub const ERRORS: &str = "errors";
pub const HEALTH_CHECKS: &str = "health_checks";
pub const SPANS: &str = "spans";
pub const ERROR_EVENTS: &str = "error_events";

/// One stored observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackRecord {
    HttpRequest {
        method: String,
        route: String,
        status: u16,
        #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
        duration: Duration,
    },
    DbQuery {
        operation: String,
        table: String,
        #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
        duration: Duration,
        success: bool,
    },
    CacheOperation {
        operation: String,
        hit: bool,
        #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
        duration: Duration,
    },
    BusinessEvent {
        event: String,
        value: f64,
    },
    Error {
        error_type: String,
        component: String,
    },
    HealthCheck {
        check: String,
        status: HealthStatus,
        #[serde(with = "crate::config::duration_ms", rename = "duration_ms")]
        duration: Duration,
    },
    Span(Box<SpanData>),
    ErrorEvent(Box<ErrorEvent>),
}

impl FallbackRecord {
    /// Key the record is stored under.
    pub fn key(&self) -> &'static str {
        match self {
            FallbackRecord::HttpRequest { .. } => HTTP_REQUESTS,
            FallbackRecord::DbQuery { .. } => DB_QUERIES,
            FallbackRecord::CacheOperation { .. } => CACHE_OPERATIONS,
            FallbackRecord::BusinessEvent { .. } => BUSINESS_EVENTS,
            FallbackRecord::Error { .. } => ERRORS,
            FallbackRecord::HealthCheck { .. } => HEALTH_CHECKS,
            FallbackRecord::Span(_) => SPANS,
            FallbackRecord::ErrorEvent(_) => ERROR_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackEntry {
    pub timestamp: DateTime<Utc>,
    pub record: FallbackRecord,
}

/// Keeps the last `max_entries` records per key, oldest evicted first.
#[derive(Debug)]
pub struct FallbackSink {
    max_entries: usize,
    entries: Mutex<BTreeMap<&'static str, VecDeque<FallbackEntry>>>,
}

impl Default for FallbackSink {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl FallbackSink {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn record(&self, record: FallbackRecord) {
        let entry = FallbackEntry {
            timestamp: Utc::now(),
            record,
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let queue = entries.entry(entry.record.key()).or_default();
        if queue.len() >= self.max_entries {
            queue.pop_front();
        }
        queue.push_back(entry);
    }

    pub fn record_spans(&self, spans: &[SpanData]) {
        for span in spans {
            self.record(FallbackRecord::Span(Box::new(span.clone())));
        }
    }

    pub fn record_error_events(&self, events: &[ErrorEvent]) {
        for event in events {
            self.record(FallbackRecord::ErrorEvent(Box::new(event.clone())));
        }
    }

    /// Oldest first.
    pub fn entries(&self, key: &str) -> Vec<FallbackEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map_or(0, VecDeque::len)
    }

    pub fn total_len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Removes and returns every stored entry, keyed.
    pub fn drain(&self) -> BTreeMap<&'static str, Vec<FallbackEntry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *entries)
            .into_iter()
            .map(|(key, queue)| (key, queue.into_iter().collect()))
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl TelemetryCollector for FallbackSink {
    fn record_http_request(
        &self,
        method: &str,
        route: &str,
        status: u16,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.record(FallbackRecord::HttpRequest {
            method: method.to_string(),
            route: route.to_string(),
            status,
            duration,
        });
        Ok(())
    }

    fn record_db_query(
        &self,
        operation: &str,
        table: &str,
        duration: Duration,
        success: bool,
    ) -> Result<(), CollectorError> {
        self.record(FallbackRecord::DbQuery {
            operation: operation.to_string(),
            table: table.to_string(),
            duration,
            success,
        });
        Ok(())
    }

    fn record_cache_operation(
        &self,
        operation: &str,
        hit: bool,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.record(FallbackRecord::CacheOperation {
            operation: operation.to_string(),
            hit,
            duration,
        });
        Ok(())
    }

    fn record_business_event(&self, event: &str, value: f64) -> Result<(), CollectorError> {
        self.record(FallbackRecord::BusinessEvent {
            event: event.to_string(),
            value,
        });
        Ok(())
    }

    fn record_error(&self, error_type: &str, component: &str) -> Result<(), CollectorError> {
        self.record(FallbackRecord::Error {
            error_type: error_type.to_string(),
            component: component.to_string(),
        });
        Ok(())
    }

    fn record_health_check(
        &self,
        check: &str,
        status: HealthStatus,
        duration: Duration,
    ) -> Result<(), CollectorError> {
        self.record(FallbackRecord::HealthCheck {
            check: check.to_string(),
            status,
            duration,
        });
        Ok(())
    }
}
