use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    response::Json,
};
use bytes::Bytes;

use crate::error::AppError;
use crate::models::{
    AssemblyJobsResponse, AssemblyStatusResponse, CancelUploadRequest, ChunkUploadResponse,
    CleanupChunksRequest, MessageResponse, ProtectResponse,
};
use crate::sessions::{CancelOutcome, UploadStatus};
use crate::state::{AppState, IncomingChunk};

// receive one chunk of a multipart upload
pub async fn upload_chunk(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, AppError> {
    let mut file_id = None;
    let mut chunk_num = None;
    let mut total_chunks = None;
    let mut filename = None;
    let mut dest_path = String::new();
    let mut checksum = None;
    let mut data: Option<Bytes> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!("Failed to read multipart field: {}", e);
        AppError::InvalidRequest(format!("Failed to read multipart field: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "chunk" {
            let bytes = field.bytes().await.map_err(|e| {
                tracing::warn!("Failed to read chunk bytes: {}", e);
                AppError::InvalidRequest(format!("Failed to read chunk data: {}", e))
            })?;
            data = Some(bytes);
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::InvalidRequest(format!("Failed to read field {}: {}", name, e)))?;
        match name.as_str() {
            "file_id" => file_id = Some(value),
            "chunk_num" => chunk_num = Some(value),
            "total_chunks" => total_chunks = Some(value),
            "filename" => filename = Some(value),
            "dest_path" => dest_path = value,
            "checksum" => checksum = Some(value),
            other => tracing::trace!("Ignoring multipart field {}", other),
        }
    }

    let file_id = file_id
        .ok_or_else(|| AppError::InvalidRequest("file_id is required".to_string()))?;
    let index = chunk_num
        .as_deref()
        .and_then(|v| v.trim().parse::<i64>().ok())
        .ok_or_else(|| AppError::InvalidRequest("Invalid chunk parameters".to_string()))?;
    let total = total_chunks
        .as_deref()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .ok_or_else(|| AppError::InvalidRequest("Invalid chunk parameters".to_string()))?;
    let filename = filename
        .ok_or_else(|| AppError::InvalidRequest("Filename is required".to_string()))?;
    let data = data
        .ok_or_else(|| AppError::InvalidRequest("No chunk data received".to_string()))?;

    tracing::trace!("Received chunk {} of {} for upload {}", index, total, file_id);

    let receipt = state
        .receive_chunk(IncomingChunk {
            upload_id: file_id.clone(),
            index,
            total_chunks: total,
            filename,
            dest_path,
            data,
            checksum,
        })
        .await?;

    Ok(Json(ChunkUploadResponse {
        success: true,
        file_id,
        chunk_num: receipt.index,
        received_chunks: receipt.received,
        total_chunks: receipt.total,
        assembly_queued: receipt.assembly_queued,
    }))
}

// stop an in-progress upload
pub async fn cancel_upload(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CancelUploadRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let label = request.filename.as_deref().unwrap_or(&request.file_id);
    let message = match state.cancel_upload(&request.file_id)? {
        CancelOutcome::Cancelled => format!("Upload of {} cancelled", label),
        CancelOutcome::Requested => format!(
            "Upload of {} is assembling; it will stop at the next chunk",
            label
        ),
    };
    Ok(Json(MessageResponse {
        success: true,
        message,
    }))
}

// drop one upload's fragments right away
pub async fn cleanup_chunks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CleanupChunksRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    state.cleanup_upload(&request.file_id).await?;
    Ok(Json(MessageResponse {
        success: true,
        message: format!("Chunks for {} removed", request.file_id),
    }))
}

// status of a single upload
pub async fn assembly_status(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Json<AssemblyStatusResponse>, AppError> {
    let session = state
        .sessions
        .get(&file_id)
        .ok_or_else(|| AppError::UnknownUpload(file_id.clone()))?;
    Ok(Json(AssemblyStatusResponse::from(&session)))
}

// every upload that reached assembly
pub async fn assembly_jobs(State(state): State<Arc<AppState>>) -> Json<AssemblyJobsResponse> {
    let mut jobs: Vec<AssemblyStatusResponse> = state
        .sessions
        .list()
        .iter()
        .filter(|s| s.completion_claimed())
        .map(AssemblyStatusResponse::from)
        .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let active = jobs
        .iter()
        .filter(|j| j.status == UploadStatus::Assembling)
        .count();
    Json(AssemblyJobsResponse {
        total: jobs.len(),
        active,
        jobs,
    })
}

// keep the janitor away from an upload
pub async fn protect_assembly(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Result<Json<ProtectResponse>, AppError> {
    let status = state.sessions.protect(&file_id)?;
    let protected = !status.is_terminal();
    if protected {
        tracing::debug!("🛡️ Upload {} protected ({})", file_id, status);
    } else {
        tracing::debug!("Upload {} already {}, nothing to protect", file_id, status);
    }
    Ok(Json(ProtectResponse {
        success: true,
        file_id,
        status,
        protected,
    }))
}
