//! Prometheus metrics collection.
//!
//! HTTP traffic is recorded by the middleware; git operations record their
//! outcome, relayed bytes and busy answers from the relay.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Arc;

/// HTTP request labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HttpLabels {
    pub method: String,
    /// Path with the repository replaced by a placeholder.
    pub path: String,
    pub status: u16,
}

/// Git operation labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GitLabels {
    /// `info-refs-upload-pack`, `git-receive-pack`, `ssh-upload-pack`, ...
    pub operation: String,
    pub method: String,
    pub status: u16,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ByteLabels {
    pub operation: String,
    /// `in` for request bytes, `out` for response bytes.
    pub direction: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FetchLabels {
    /// Whether the request negotiated a shallow fetch.
    pub shallow: String,
}

/// Global metrics state.
pub static METRICS: Lazy<MetricsState> = Lazy::new(MetricsState::new);

/// Metrics state container.
#[derive(Clone)]
pub struct MetricsState {
    pub registry: Arc<RwLock<Registry>>,
    pub http_requests_total: Family<HttpLabels, Counter>,
    /// Seconds until the response head was ready.
    pub http_request_duration_seconds: Family<HttpLabels, Histogram>,
    pub http_active_connections: Gauge,
    pub git_requests_total: Family<GitLabels, Counter>,
    pub git_bytes_total: Family<ByteLabels, Counter>,
    pub busy_responses_total: Family<OperationLabels, Counter>,
    pub upload_pack_requests_total: Family<FetchLabels, Counter>,
    /// Backend connections in the process-wide cache.
    pub backend_connections: Gauge,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsState {
    /// Creates a registry with every metric registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests_total = Family::<HttpLabels, Counter>::default();
        registry.register(
            "gitway_http_requests",
            "Total HTTP requests",
            http_requests_total.clone(),
        );

        let http_request_duration_seconds =
            Family::<HttpLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 16))
            });
        registry.register(
            "gitway_http_request_duration_seconds",
            "HTTP request duration in seconds",
            http_request_duration_seconds.clone(),
        );

        let http_active_connections = Gauge::default();
        registry.register(
            "gitway_http_active_connections",
            "Number of HTTP requests in flight",
            http_active_connections.clone(),
        );

        let git_requests_total = Family::<GitLabels, Counter>::default();
        registry.register(
            "gitway_git_requests",
            "Git operations by outcome",
            git_requests_total.clone(),
        );

        let git_bytes_total = Family::<ByteLabels, Counter>::default();
        registry.register(
            "gitway_git_bytes",
            "Bytes relayed for git operations",
            git_bytes_total.clone(),
        );

        let busy_responses_total = Family::<OperationLabels, Counter>::default();
        registry.register(
            "gitway_busy_responses",
            "Busy messages sent because the backend was overloaded",
            busy_responses_total.clone(),
        );

        let upload_pack_requests_total = Family::<FetchLabels, Counter>::default();
        registry.register(
            "gitway_upload_pack_requests",
            "Upload-pack requests by fetch depth",
            upload_pack_requests_total.clone(),
        );

        let backend_connections = Gauge::default();
        registry.register(
            "gitway_backend_connections",
            "Cached backend connections",
            backend_connections.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests_total,
            http_request_duration_seconds,
            http_active_connections,
            git_requests_total,
            git_bytes_total,
            busy_responses_total,
            upload_pack_requests_total,
            backend_connections,
        }
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let labels = HttpLabels {
            method: method.to_string(),
            path: normalize_path(path),
            status,
        };
        self.http_requests_total.get_or_create(&labels).inc();
        self.http_request_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_git_request(&self, operation: &str, method: &str, status: u16) {
        self.git_requests_total
            .get_or_create(&GitLabels {
                operation: operation.to_string(),
                method: method.to_string(),
                status,
            })
            .inc();
    }

    /// Adds the byte counts of one finished relay.
    pub fn record_transfer(&self, operation: &str, bytes_in: u64, bytes_out: u64) {
        for (direction, bytes) in [("in", bytes_in), ("out", bytes_out)] {
            self.git_bytes_total
                .get_or_create(&ByteLabels {
                    operation: operation.to_string(),
                    direction: direction.to_string(),
                })
                .inc_by(bytes);
        }
    }

    pub fn record_busy(&self, operation: &str) {
        self.busy_responses_total
            .get_or_create(&OperationLabels {
                operation: operation.to_string(),
            })
            .inc();
    }

    pub fn record_upload_pack(&self, shallow: bool) {
        self.upload_pack_requests_total
            .get_or_create(&FetchLabels {
                shallow: shallow.to_string(),
            })
            .inc();
    }

    /// Encodes all metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = self.registry.read();
        prometheus_client::encoding::text::encode(&mut buffer, &registry)?;
        Ok(buffer)
    }
}

/// Replaces the repository part of a git path with `:repo` so label
/// cardinality does not grow with the number of repositories.
pub fn normalize_path(path: &str) -> String {
    match path.find(".git/") {
        Some(end) => format!("/:repo{}", &path[end..]),
        None => path.to_string(),
    }
}
