use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use ingest_common::point::PointError;
use ingest_common::sink::SinkError;
use ingest_common::source::SourceError;

/// Enumeration of errors that end a poll cycle early.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to receive from the queue: {0}")]
    ReceiveError(#[source] SourceError),
    #[error("failed to delete processed messages: {0}")]
    DeleteError(#[source] SourceError),
}

/// Enumeration of errors related to starting and stopping the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("a pipeline task panicked: {0}")]
    TaskPanicked(#[from] tokio::task::JoinError),
}

/// Errors answered by the HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    InvalidPoint(#[from] PointError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidInput(_) | ApiError::InvalidPoint(_) => StatusCode::BAD_REQUEST,
            ApiError::Sink(_) | ApiError::Worker(_) => {
                error!("request failed: {}", self);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (
            status,
            Json(ErrorBody {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
