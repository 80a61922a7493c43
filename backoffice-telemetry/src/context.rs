//! Request-scoped context carried through every telemetry call.
//!
//! A [`TelemetryContext`] is an immutable value: every `with_*` method returns
//! a new context and leaves the receiver untouched. Besides the correlation
//! identifiers and baggage it carries a cancellation token and an optional
//! deadline, which probes, exporters and span finishing honour.
//!
//! Contexts cross `.await` points through a task-local scope:
//!
//! ```rust,no_run
//! use backoffice_telemetry::context::{self, TelemetryContext};
//!
//! # async fn example() {
//! let ctx = TelemetryContext::new().with_request_id("req-1");
//! context::scope(ctx, async {
//!     assert_eq!(context::current().request_id(), "req-1");
//! })
//! .await;
//! # }
//! ```

use crate::tracer::SpanContext;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::task_local;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Maximum number of baggage entries on one context.
pub const MAX_BAGGAGE_ENTRIES: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct TelemetryContext {
    correlation_id: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    request_id: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    baggage: BTreeMap<String, String>,
    span_context: Option<SpanContext>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

macro_rules! id_accessors {
    ($($field:ident => $with:ident),+ $(,)?) => {
        $(
            pub fn $with(&self, value: impl Into<String>) -> Self {
                let mut next = self.clone();
                next.$field = Some(value.into());
                next
            }

            pub fn $field(&self) -> &str {
                self.$field.as_deref().unwrap_or("")
            }
        )+
    };
}

impl TelemetryContext {
    pub fn new() -> Self {
        Self::default()
    }

    id_accessors! {
        correlation_id => with_correlation_id,
        request_id => with_request_id,
        user_id => with_user_id,
        session_id => with_session_id,
    }

    /// Replaces the trace id. An attached span context from another trace is
    /// dropped.
    pub fn with_trace_id(&self, value: impl Into<String>) -> Self {
        let value = value.into();
        let mut next = self.clone();
        if next
            .span_context
            .as_ref()
            .is_some_and(|sc| sc.trace_id.to_string() != value)
        {
            next.span_context = None;
        }
        next.trace_id = Some(value);
        next
    }

    pub fn trace_id(&self) -> &str {
        self.trace_id.as_deref().unwrap_or("")
    }

    /// Replaces the span id. An attached span context for another span is
    /// dropped.
    pub fn with_span_id(&self, value: impl Into<String>) -> Self {
        let value = value.into();
        let mut next = self.clone();
        if next
            .span_context
            .as_ref()
            .is_some_and(|sc| sc.span_id.to_string() != value)
        {
            next.span_context = None;
        }
        next.span_id = Some(value);
        next
    }

    pub fn span_id(&self) -> &str {
        self.span_id.as_deref().unwrap_or("")
    }

    /// Adds a baggage entry. Once the map holds [`MAX_BAGGAGE_ENTRIES`] keys,
    /// new keys are ignored; existing keys can still be updated.
    pub fn with_baggage(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let mut next = self.clone();
        if next.baggage.len() < MAX_BAGGAGE_ENTRIES || next.baggage.contains_key(&key) {
            next.baggage.insert(key, value.into());
        }
        next
    }

    pub fn baggage(&self) -> &BTreeMap<String, String> {
        &self.baggage
    }

    /// Attaches a span context and mirrors its ids into `trace_id`/`span_id`.
    pub fn with_span_context(&self, span_context: SpanContext) -> Self {
        let mut next = self.clone();
        next.trace_id = Some(span_context.trace_id.to_string());
        next.span_id = Some(span_context.span_id.to_string());
        next.span_context = Some(span_context);
        next
    }

    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span_context.as_ref()
    }

    /// A context sharing every identifier whose cancellation is a child of
    /// this one: cancelling the parent cancels the child, not the reverse.
    pub fn child(&self) -> Self {
        let mut next = self.clone();
        next.token = self.token.child_token();
        next
    }

    /// A child context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut next = self.child();
        let deadline = Instant::now() + timeout;
        next.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        next
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once the token is cancelled or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}

task_local! {
    static CURRENT_CONTEXT: TelemetryContext;
}

/// Runs `fut` with `ctx` as the task-local current context.
pub async fn scope<F>(ctx: TelemetryContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The current task-local context, or an empty one outside any scope.
pub fn current() -> TelemetryContext {
    try_current().unwrap_or_default()
}

pub fn try_current() -> Option<TelemetryContext> {
    CURRENT_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}
