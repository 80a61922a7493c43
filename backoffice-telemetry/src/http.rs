//! The HTTP surface: `/metrics`, the health endpoints and the request
//! middleware.
//!
//! ```no_run
//! use axum::{routing::get, Router};
//! use backoffice_telemetry::{config::TelemetryConfig, http, Telemetry};
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = Arc::new(Telemetry::init(TelemetryConfig::default())?);
//! let app: Router = Router::new()
//!     .route("/orders", get(|| async { "[]" }))
//!     .layer(axum::middleware::from_fn_with_state(
//!         Arc::clone(&telemetry),
//!         http::telemetry_middleware,
//!     ))
//!     .merge(telemetry.router());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

use crate::attrs;
use crate::context::{self, TelemetryContext};
use crate::error::MetricsError;
use crate::health;
use crate::logging::LogLevel;
use crate::metrics::{encode_text, Histogram, Registry, TelemetryCollector, TEXT_CONTENT_TYPE};
use crate::telemetry::Telemetry;
use crate::tracer::span::StatusCode as SpanStatusCode;
use crate::tracer::{SpanKind, StartOptions};
use axum::{
    body::HttpBody,
    extract::{MatchedPath, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Route label for requests no route matched. The raw path stays on the span
/// as `http.target`.
pub const UNMATCHED_ROUTE: &str = "unmatched";

const RESPONSE_SIZE_BUCKETS: &[f64] = &[
    100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0, 10_000_000.0,
];

/// Request metrics the collector does not cover.
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    response_size: Histogram,
}

impl HttpMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        Ok(Self {
            response_size: registry.histogram(
                "http_response_size_bytes",
                "HTTP response size in bytes",
                &["method", "route"],
                RESPONSE_SIZE_BUCKETS,
            )?,
        })
    }
}

/// `/metrics` plus the health router, behind [`telemetry_middleware`].
pub fn router(telemetry: Arc<Telemetry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::clone(&telemetry))
        .merge(health::handlers::router(Arc::clone(telemetry.health())))
        .layer(middleware::from_fn_with_state(telemetry, telemetry_middleware))
}

/// GET /metrics
pub async fn metrics_handler(State(telemetry): State<Arc<Telemetry>>) -> Response {
    match encode_text(telemetry.registry()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "metrics exposition failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Traces, measures and logs one request.
///
/// The inbound trace context is continued when present. The handler runs
/// with the request context as the task-local current context, and the
/// response carries `x-trace-id`, `x-span-id` and `x-request-id`.
pub async fn telemetry_middleware(
    State(telemetry): State<Arc<Telemetry>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let headers = request.headers();
    let request_id = header_str(headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut base = TelemetryContext::new().with_request_id(request_id.clone());
    if let Some(user_id) = header_str(headers, USER_ID_HEADER) {
        base = base.with_user_id(user_id);
    }

    let tracer = telemetry.tracer();
    let remote = tracer.extract(headers);
    let mut options = StartOptions::new()
        .remote_parent(remote)
        .attribute("http.method", method.as_str())
        .attribute("http.route", route.as_str())
        .attribute("http.target", request.uri().to_string());
    if let Some(agent) = header_str(headers, header::USER_AGENT.as_str()) {
        options = options.attribute("http.user_agent", agent);
    }
    let (ctx, span) = tracer.start(
        &base,
        &format!("{method} {route}"),
        SpanKind::Server,
        options,
    );

    let mut response = context::scope(ctx.clone(), next.run(request)).await;
    let duration = start.elapsed();
    let status = response.status();

    span.set_attribute("http.status_code", status.as_u16());
    if status.is_server_error() {
        span.set_status(SpanStatusCode::Error, format!("HTTP {}", status.as_u16()));
    } else {
        span.set_status(SpanStatusCode::Ok, "");
    }
    span.finish();

    if let Err(e) =
        telemetry
            .coordinator()
            .record_http_request(&method, &route, status.as_u16(), duration)
    {
        debug!(error = %e, "http request metric not recorded");
    }
    let size = header_str(response.headers(), header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| response.body().size_hint().exact());
    if let Some(size) = size {
        telemetry
            .http_metrics()
            .response_size
            .with_labels(&[method.as_str(), route.as_str()])
            .observe(size as f64);
    }

    let level = if status.is_server_error() {
        LogLevel::Error
    } else if status.is_client_error() {
        LogLevel::Warn
    } else {
        LogLevel::Debug
    };
    telemetry.logger().log(
        &ctx,
        level,
        "request completed",
        attrs! {
            "http.method" => method.as_str(),
            "http.route" => route.as_str(),
            "http.status_code" => status.as_u16(),
            "duration_ms" => duration.as_millis() as u64,
        },
    );

    let headers = response.headers_mut();
    set_header(headers, TRACE_ID_HEADER, &span.trace_id().to_string());
    set_header(headers, SPAN_ID_HEADER, &span.span_id().to_string());
    set_header(headers, REQUEST_ID_HEADER, &request_id);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::logging::MemorySink;
    use crate::tracer::InMemoryExporter;
    use axum::body::Body;
    use tower::ServiceExt;

    fn telemetry(spans: Arc<InMemoryExporter>) -> Arc<Telemetry> {
        Arc::new(
            Telemetry::builder(TelemetryConfig::builder().service_name("orders").build())
                .log_sink(Arc::new(MemorySink::new()))
                .span_exporter(spans)
                .build()
                .unwrap(),
        )
    }

    fn app(telemetry: &Arc<Telemetry>) -> Router {
        Router::new()
            .route("/orders/:id", get(|| async { "order" }))
            .route(
                "/boom",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .layer(middleware::from_fn_with_state(
                Arc::clone(telemetry),
                telemetry_middleware,
            ))
    }

    #[tokio::test]
    async fn test_continues_inbound_trace_and_echoes_ids() {
        let spans = Arc::new(InMemoryExporter::new());
        let telemetry = telemetry(spans.clone());
        let request = Request::builder()
            .uri("/orders/42")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(Body::empty())
            .unwrap();

        let response = app(&telemetry).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[TRACE_ID_HEADER],
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert!(response.headers().contains_key(SPAN_ID_HEADER));
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        telemetry.tracer().force_flush().await;
        let exported = spans.spans();
        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].name, "GET /orders/:id");
        assert_eq!(exported[0].kind, SpanKind::Server);
        assert_eq!(
            exported[0].parent_span_id.map(|id| id.to_string()).as_deref(),
            Some("00f067aa0ba902b7")
        );
    }

    #[tokio::test]
    async fn test_server_error_marks_span_and_counts_request() {
        let spans = Arc::new(InMemoryExporter::new());
        let telemetry = telemetry(spans.clone());
        let request = Request::builder().uri("/boom").body(Body::empty()).unwrap();

        let response = app(&telemetry).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        telemetry.tracer().force_flush().await;
        assert_eq!(spans.spans()[0].status.code, SpanStatusCode::Error);

        let body = encode_text(telemetry.registry()).unwrap();
        assert!(body.contains(r#"http_requests_total{method="GET",route="/boom",status="500"} 1"#));
    }

    #[tokio::test]
    async fn test_unmatched_paths_share_one_route_label() {
        let telemetry = telemetry(Arc::new(InMemoryExporter::new()));
        let app = app(&telemetry);
        for i in 0..50 {
            let request = Request::builder()
                .uri(format!("/scan/{i}"))
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }

        let body = encode_text(telemetry.registry()).unwrap();
        assert!(body.contains(r#"http_requests_total{method="GET",route="unmatched",status="404"} 50"#));
        assert!(!body.contains("/scan/"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_content_type() {
        let telemetry = telemetry(Arc::new(InMemoryExporter::new()));
        let response = telemetry
            .router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], TEXT_CONTENT_TYPE);
    }
}
