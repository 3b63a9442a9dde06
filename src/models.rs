use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::changes::{MonitorMode, StorageSnapshot};
use crate::sessions::{UploadSession, UploadStatus};

// generic error response
#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

// generic success response
#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

// acknowledgement for one stored chunk
#[derive(Serialize, Deserialize, Debug)]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub file_id: String,
    pub chunk_num: u32,
    pub received_chunks: u32,
    pub total_chunks: u32,
    /// true once every chunk is in and assembly has been handed off
    pub assembly_queued: bool,
}

// body for cancel_upload
#[derive(Deserialize, Debug)]
pub struct CancelUploadRequest {
    pub file_id: String,
    #[serde(default)]
    pub filename: Option<String>,
}

// body for cleanup_chunks
#[derive(Deserialize, Debug)]
pub struct CleanupChunksRequest {
    pub file_id: String,
}

// status of one upload as seen by clients
#[derive(Serialize, Deserialize, Debug)]
pub struct AssemblyStatusResponse {
    pub file_id: String,
    pub filename: String,
    pub dest_path: String,
    pub status: UploadStatus,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub protected: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<&UploadSession> for AssemblyStatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            file_id: session.id.clone(),
            filename: session.filename.clone(),
            dest_path: session.dest_path.clone(),
            status: session.status,
            received_chunks: session.received_chunks.len() as u32,
            total_chunks: session.total_chunks,
            protected: session.protected,
            created_at: session.created_at,
            completed_at: session.completed_at,
            error_message: session.error_message.clone(),
        }
    }
}

// every upload that reached assembly, for resuming tracking on page load
#[derive(Serialize, Deserialize, Debug)]
pub struct AssemblyJobsResponse {
    pub jobs: Vec<AssemblyStatusResponse>,
    pub total: usize,
    pub active: usize,
}

// response for protect_assembly
#[derive(Serialize, Deserialize, Debug)]
pub struct ProtectResponse {
    pub success: bool,
    pub file_id: String,
    pub status: UploadStatus,
    pub protected: bool,
}

// result of a manual janitor run
#[derive(Serialize, Debug)]
pub struct CleanupResponse {
    pub success: bool,
    pub sessions_removed: usize,
    pub orphans_removed: usize,
    pub fragments_released: usize,
    pub skipped_protected: usize,
    pub failures: Vec<String>,
}

// scratch-space overview for operators
#[derive(Serialize, Debug)]
pub struct ChunkStatsResponse {
    pub total_sessions: usize,
    pub pending: usize,
    pub uploading: usize,
    pub assembling: usize,
    pub completed: usize,
    pub error: usize,
    pub cancelled: usize,
    pub protected: usize,
    pub protected_ids: Vec<String>,
    pub scratch_dirs: usize,
    pub queue_depth: usize,
    pub assemblies_queued_total: u64,
}

// query for storage_stats_poll
#[derive(Deserialize, Debug, Default)]
pub struct PollQuery {
    pub last_check: Option<f64>,
    pub last_files: Option<u64>,
    pub last_dirs: Option<u64>,
}

// current snapshot plus live client count
#[derive(Serialize, Debug)]
pub struct StorageStatsResponse {
    #[serde(flatten)]
    pub snapshot: StorageSnapshot,
    pub connected_clients: usize,
}

// state of the change monitor
#[derive(Serialize, Debug)]
pub struct MonitoringStatusResponse {
    pub monitoring_active: bool,
    pub mode: MonitorMode,
    pub connected_clients: usize,
    pub total_connections: u64,
    pub total_checks: u64,
    pub changes_detected: u64,
    pub last_check: f64,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_uploads: usize,
}

// request to delete a file or directory
#[derive(Deserialize, Debug)]
pub struct DeleteRequest {
    pub path: String,
}

// request to create a directory
#[derive(Deserialize, Debug)]
pub struct MkdirRequest {
    #[serde(default)]
    pub path: String,
    pub name: String,
}

// request to rename an entry in place
#[derive(Deserialize, Debug)]
pub struct RenameRequest {
    pub path: String,
    pub new_name: String,
}

// response for storage mutations
#[derive(Serialize, Deserialize, Debug)]
pub struct MutationResponse {
    pub success: bool,
    pub path: String,
}
