use std::future::ready;
use std::sync::Arc;

use axum::{routing, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use ingest_common::health::HealthRegistry;
use ingest_common::metrics;
use ingest_common::sink::TimeSeriesSink;

use crate::pipeline::Pipeline;

use super::{ingest, points, query};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub sink: Arc<dyn TimeSeriesSink>,
    pub liveness: HealthRegistry,
    /// Measurement queried by `/query`.
    pub measurement: String,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let liveness = state.liveness.clone();

    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => ready(recorder_handle.render()),
                None => ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/ingest", routing::post(ingest::ingest_once))
        .route("/buffer", routing::get(ingest::buffer))
        .route("/points", routing::post(points::write).delete(points::delete))
        .route("/query", routing::get(query::query))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "telemetry ingest worker"
}
