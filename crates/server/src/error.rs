use ammlook_indexer::IndexerError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    InternalError(String),
}

impl From<IndexerError> for ChartError {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::Malformed(reason) => Self::BadRequest(reason),
            other => Self::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ChartError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::InternalError(msg) => {
                error!("chart query failed: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
