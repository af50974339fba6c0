//! Request tracking middleware.

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::metrics::METRICS;

/// Header carrying the request ID, in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

type MiddlewareFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

type MiddlewareFn = fn(Request, Next) -> MiddlewareFuture;

pub type MiddlewareLayer = axum::middleware::FromFnLayer<MiddlewareFn, (), (Request,)>;

/// Request ID extension, available to handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Tags every request with an ID (the client's, or a fresh UUID) and runs it
/// inside a span carrying that ID.
pub fn request_id_layer() -> MiddlewareLayer {
    axum::middleware::from_fn(request_id_middleware_fn)
}

fn request_id_middleware_fn(mut request: Request, next: Next) -> MiddlewareFuture {
    Box::pin(async move {
        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        request
            .extensions_mut()
            .insert(RequestId(request_id.clone()));

        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            method = %request.method(),
            uri = %request.uri(),
        );

        let mut response = next.run(request).instrument(span).await;

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    })
}

/// Records request counts, in-flight requests and time to response head.
pub fn metrics_layer() -> MiddlewareLayer {
    axum::middleware::from_fn(metrics_middleware_fn)
}

fn metrics_middleware_fn(request: Request, next: Next) -> MiddlewareFuture {
    Box::pin(async move {
        let start = Instant::now();
        let method = request.method().to_string();
        let path = request.uri().path().to_string();

        METRICS.http_active_connections.inc();
        let response = next.run(request).await;
        METRICS.http_active_connections.dec();

        let duration = start.elapsed().as_secs_f64();
        let status = response.status().as_u16();
        METRICS.record_http_request(&method, &path, status, duration);

        tracing::debug!(
            method = %method,
            path = %path,
            status = %status,
            duration_ms = %format!("{:.2}", duration * 1000.0),
            "request completed"
        );

        response
    })
}

/// `GET /metrics`.
pub async fn metrics_handler() -> Response {
    match METRICS.encode() {
        Ok(output) => (
            [(
                header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            output,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, Body::from("failed to encode metrics")).into_response()
        }
    }
}
