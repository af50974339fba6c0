//! Observability for the proxy: structured logging, Prometheus metrics and
//! the HTTP middleware that ties requests to both.

mod logging;
mod metrics;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::{normalize_path, MetricsState, METRICS};
pub use middleware::{
    metrics_handler, metrics_layer, request_id_layer, MiddlewareLayer, RequestId,
    REQUEST_ID_HEADER,
};
