use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::ApiError;
use crate::worker::CycleReport;

use super::AppState;

#[derive(Debug, Serialize)]
pub struct BufferDepth {
    pub depth: usize,
}

/// Run one poll cycle on demand. Points end up in the buffer like any other cycle.
pub async fn ingest_once(State(state): State<AppState>) -> Result<Json<CycleReport>, ApiError> {
    let report = state.pipeline.ingest_once().await?;

    Ok(Json(report))
}

pub async fn buffer(State(state): State<AppState>) -> Json<BufferDepth> {
    Json(BufferDepth {
        depth: state.pipeline.buffer_depth(),
    })
}
