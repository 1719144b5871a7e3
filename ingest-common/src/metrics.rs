use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const MESSAGES_RECEIVED: &str = "ingest_messages_received_total";
pub const MESSAGES_DUPLICATE: &str = "ingest_messages_duplicate_total";
pub const MESSAGES_MALFORMED: &str = "ingest_messages_malformed_total";
pub const MESSAGES_DELETED: &str = "ingest_messages_deleted_total";
pub const MESSAGES_DELETE_FAILED: &str = "ingest_messages_delete_failed_total";
pub const RECORDS_REJECTED: &str = "ingest_records_rejected_total";
pub const POINTS_BUFFERED: &str = "ingest_points_buffered_total";
pub const POINTS_WRITTEN: &str = "ingest_points_written_total";
pub const FLUSH_FAILURES: &str = "ingest_flush_failures_total";
pub const FLUSH_DURATION: &str = "ingest_flush_duration_seconds";
pub const POLL_ERRORS: &str = "ingest_poll_errors_total";
pub const DEDUP_ERRORS: &str = "ingest_dedup_errors_total";
pub const BUFFER_DEPTH: &str = "ingest_buffer_depth";
pub const QUEUE_DEPTH: &str = "ingest_queue_depth";

/// Install the process wide Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Record request count and latency per matched route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
