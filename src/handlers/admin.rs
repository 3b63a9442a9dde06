use std::sync::Arc;

use axum::{extract::State, response::Json};

use crate::error::AppError;
use crate::janitor::SweepMode;
use crate::models::{ChunkStatsResponse, CleanupResponse};
use crate::sessions::UploadStatus;
use crate::state::AppState;

// run the janitor now
pub async fn cleanup_all_chunks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupResponse>, AppError> {
    tracing::info!("🧹 Manual chunk cleanup requested");
    let report = state.janitor.sweep(SweepMode::Manual).await?;

    Ok(Json(CleanupResponse {
        success: report.failures.is_empty(),
        sessions_removed: report.sessions_removed,
        orphans_removed: report.orphans_removed,
        fragments_released: report.fragments_released,
        skipped_protected: report.skipped_protected,
        failures: report.failures,
    }))
}

// session and scratch overview
pub async fn chunk_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ChunkStatsResponse>, AppError> {
    let sessions = state.sessions.list();
    let count = |status: UploadStatus| sessions.iter().filter(|s| s.status == status).count();
    let scratch_dirs = state.chunks.scan().await?.len();
    let mut protected_ids: Vec<String> = sessions
        .iter()
        .filter(|s| s.protected)
        .map(|s| s.id.clone())
        .collect();
    protected_ids.sort();

    Ok(Json(ChunkStatsResponse {
        total_sessions: sessions.len(),
        pending: count(UploadStatus::Pending),
        uploading: count(UploadStatus::Uploading),
        assembling: count(UploadStatus::Assembling),
        completed: count(UploadStatus::Completed),
        error: count(UploadStatus::Error),
        cancelled: count(UploadStatus::Cancelled),
        protected: protected_ids.len(),
        protected_ids,
        scratch_dirs,
        queue_depth: state.queue.depth(),
        assemblies_queued_total: state.queue.enqueued_total(),
    }))
}
