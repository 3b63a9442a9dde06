use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

use crate::models::ErrorResponse;
use crate::sessions::UploadStatus;

/// errors surfaced by the upload pipeline and the storage mutation endpoints
#[derive(Debug, Error)]
pub enum AppError {
    #[error("chunk index {index} is outside 0..{total}")]
    InvalidChunkIndex { index: i64, total: u32 },

    #[error("unknown upload: {0}")]
    UnknownUpload(String),

    #[error("upload {upload_id} is missing chunks {missing:?}")]
    IncompleteUpload { upload_id: String, missing: Vec<u32> },

    #[error("destination conflict: {0}")]
    DestinationConflict(String),

    #[error("assembly failed: {0}")]
    AssemblyIoFailure(String),

    #[error("upload {0} was cancelled during assembly")]
    CancelledDuringAssembly(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("upload {upload_id} is already {status}")]
    AlreadyTerminal {
        upload_id: String,
        status: UploadStatus,
    },

    #[error("upload {0} was started with different metadata")]
    MetadataMismatch(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("chunk exceeds maximum size of {0} bytes")]
    ChunkTooLarge(usize),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidChunkIndex { .. } | AppError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::UnknownUpload(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::IncompleteUpload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::DestinationConflict(_)
            | AppError::AlreadyTerminal { .. }
            | AppError::CancelledDuringAssembly(_)
            | AppError::MetadataMismatch(_) => StatusCode::CONFLICT,
            AppError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ChunkTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::AssemblyIoFailure(_) | AppError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        (
            status,
            Json(ErrorResponse {
                success: false,
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
