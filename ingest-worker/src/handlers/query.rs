use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use ingest_common::query::{AggregateWindow, QueryResult, RangeQuery};

use crate::error::ApiError;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct RangeQueryParams {
    pub start: String,
    pub stop: String,
    pub machine_id: Option<String>,
    /// Displayed span: `1hr`, `6hr`, `1day`, `3day` or `5day`.
    pub time: Option<String>,
}

pub(super) fn parse_time(name: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidInput(format!("invalid {}: {}", name, e)))
}

pub async fn query(
    State(state): State<AppState>,
    Query(params): Query<RangeQueryParams>,
) -> Result<Json<QueryResult>, ApiError> {
    let window = match params.time.as_deref() {
        Some(time) => time.parse().unwrap_or_default(),
        None => AggregateWindow::default(),
    };

    let query = RangeQuery {
        measurement: state.measurement.clone(),
        start: parse_time("start", &params.start)?,
        stop: parse_time("stop", &params.stop)?,
        machine_id: params.machine_id.filter(|m| !m.is_empty()),
        window,
    };

    Ok(Json(state.sink.query(&query).await?))
}
