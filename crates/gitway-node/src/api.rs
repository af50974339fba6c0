//! HTTP front end.
//!
//! ## Endpoints
//!
//! - `GET /health`
//! - `GET /metrics`
//! - `GET /<repo>.git/info/refs?service=git-upload-pack|git-receive-pack`
//! - `POST /<repo>.git/git-upload-pack`, `POST /<repo>.git/git-receive-pack`
//! - `POST /<repo>.git/ssh-upload-pack`, `POST /<repo>.git/ssh-receive-pack`

use crate::auth::{AuthError, Authorizer};
use crate::config::Config;
use crate::observability::{metrics_handler, metrics_layer, request_id_layer, METRICS};
use crate::operation::{Route, RouteError};
use crate::relay;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use gitway_backend::{ConnectionCache, SidechannelRegistry};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Body of a 503 when the backend cannot be reached.
pub const UNAVAILABLE_MESSAGE: &str =
    "The git server is not available at this time. Please contact your administrator.";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authorizer: Arc<dyn Authorizer>,
    /// Backend connections, shared by every request.
    pub connections: Arc<ConnectionCache>,
    pub sidechannels: Arc<SidechannelRegistry>,
    /// Cancelled on shutdown; in-flight request bodies stop reading.
    pub shutdown: CancellationToken,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("too many requests")]
    TooManyRequests,
    #[error("{}", UNAVAILABLE_MESSAGE)]
    Unavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RouteError> for ApiError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NotFound => ApiError::NotFound,
            RouteError::Forbidden(msg) => ApiError::Forbidden(msg),
            RouteError::BadRequest(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            AuthError::InvalidHeader(_) => ApiError::BadRequest(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Internal details go to the log, not to the client.
        let message = match &self {
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Creates the router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/{*path}", any(git_handler))
        .layer(metrics_layer())
        .layer(request_id_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn git_handler(State(state): State<AppState>, request: Request) -> Response {
    let method = request.method().clone();
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let route = match Route::select(
        &method,
        request.uri().path(),
        request.uri().query(),
        content_type,
    ) {
        Ok(route) => route,
        Err(err) => {
            tracing::debug!(error = %err, path = %request.uri().path(), "not a git request");
            return ApiError::from(err).into_response();
        }
    };

    let operation = route.operation;
    let response = match handle(&state, route, request).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    METRICS.record_git_request(operation.name(), method.as_str(), response.status().as_u16());
    response
}

async fn handle(state: &AppState, route: Route, request: Request) -> Result<Response, ApiError> {
    let ctx = state
        .authorizer
        .authorize(&route.repo_path, request.headers())
        .await?;
    relay::serve(state, route, ctx, request).await
}
