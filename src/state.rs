use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::assembly::{self, Assembler, AssemblyQueue};
use crate::changes::ChangeDetector;
use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::error::AppError;
use crate::janitor::{Janitor, JanitorPolicy};
use crate::live::Broadcaster;
use crate::retry::RetryPolicy;
use crate::sessions::{CancelOutcome, ChunkOutcome, SessionRegistry, UploadStatus};
use crate::utils::{check_destination, display_rel_path, normalize_dest_path, sha256_hex, validate_filename, PathLocks};

// per-client backlog on push streams before a client is told to resync
const LIVE_BACKLOG: usize = 50;

/// one chunk as received from a client
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub upload_id: String,
    pub index: i64,
    pub total_chunks: u32,
    pub filename: String,
    pub dest_path: String,
    pub data: Bytes,
    /// optional sha256 hex of `data`
    pub checksum: Option<String>,
}

/// what happened to a received chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub index: u32,
    pub received: u32,
    pub total: u32,
    pub assembly_queued: bool,
}

/// shared application state
pub struct AppState {
    pub config: Config,
    pub files_dir: PathBuf,
    pub chunks: Arc<ChunkStore>,
    pub sessions: Arc<SessionRegistry>,
    pub queue: AssemblyQueue,
    pub assembler: Arc<Assembler>,
    pub janitor: Arc<Janitor>,
    pub detector: Arc<ChangeDetector>,
    pub broadcaster: Arc<Broadcaster>,
    pub path_locks: Arc<PathLocks>,
}

impl AppState {
    /// build the state for `config`, creating the storage and scratch roots
    pub fn new(config: Config) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&config.files_dir)?;
        let files_dir = std::fs::canonicalize(&config.files_dir)?;
        let chunks = Arc::new(ChunkStore::new(&config.chunks_dir)?);
        let sessions = Arc::new(SessionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(LIVE_BACKLOG, config.keepalive_interval));
        let detector = Arc::new(ChangeDetector::new(
            &files_dir,
            [chunks.root().to_path_buf()],
            broadcaster.clone(),
        )?);
        let path_locks = Arc::new(PathLocks::new());
        let retry = RetryPolicy::with_attempts(config.delete_retry_attempts);

        let queue = AssemblyQueue::new(config.assembly_queue_capacity);
        let assembler = Arc::new(Assembler::new(
            files_dir.clone(),
            chunks.clone(),
            sessions.clone(),
            detector.clone(),
            path_locks.clone(),
            retry,
        ));
        let janitor = Arc::new(Janitor::new(
            sessions.clone(),
            chunks.clone(),
            JanitorPolicy {
                stale_after: config.stale_upload_after,
                result_retention: config.result_retention,
            },
            retry,
        ));

        Ok(Self {
            config,
            files_dir,
            chunks,
            sessions,
            queue,
            assembler,
            janitor,
            detector,
            broadcaster,
            path_locks,
        })
    }

    /// pick up uploads left in scratch by a previous run
    pub async fn recover(&self) -> Result<(usize, usize), AppError> {
        assembly::recover(&self.chunks, &self.sessions, &self.queue).await
    }

    /// start assembly workers, the janitor and the change monitor
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = assembly::spawn_workers(
            self.assembler.clone(),
            &self.queue,
            self.config.assembly_workers,
        );
        handles.push(self.janitor.clone().spawn(self.config.janitor_interval));
        handles.push(
            self.detector
                .clone()
                .spawn_monitor(self.config.snapshot_interval, self.config.watch_debounce),
        );
        handles
    }

    /// store one chunk and, when it completes the upload, queue assembly
    pub async fn receive_chunk(&self, chunk: IncomingChunk) -> Result<ChunkReceipt, AppError> {
        if chunk.upload_id.trim().is_empty() {
            return Err(AppError::InvalidRequest("file_id is required".to_string()));
        }
        let filename = validate_filename(&chunk.filename)?.to_string();
        let dest_dir = normalize_dest_path(&chunk.dest_path)?;
        let dest_path = display_rel_path(&dest_dir);

        if chunk.total_chunks == 0 {
            return Err(AppError::InvalidRequest(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        if chunk.index < 0 || chunk.index >= chunk.total_chunks as i64 {
            return Err(AppError::InvalidChunkIndex {
                index: chunk.index,
                total: chunk.total_chunks,
            });
        }
        let index = chunk.index as u32;

        if chunk.data.len() > self.config.max_chunk_size {
            return Err(AppError::ChunkTooLarge(self.config.max_chunk_size));
        }
        if let Some(expected) = chunk.checksum.as_deref().filter(|c| !c.is_empty()) {
            let actual = sha256_hex(&chunk.data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(AppError::InvalidRequest(format!(
                    "checksum mismatch for chunk {}",
                    index
                )));
            }
        }

        let (session, created) = self.sessions.start_or_get(
            &chunk.upload_id,
            &filename,
            &dest_path,
            chunk.total_chunks,
        )?;
        if created {
            // refuse early when the target can never be written
            if let Err(e) = check_destination(&self.files_dir, &dest_dir, &filename) {
                self.sessions.remove(&session.id);
                return Err(e);
            }
            if let Err(e) = self.chunks.write_metadata(&session.metadata()).await {
                self.sessions.remove(&session.id);
                return Err(e);
            }
            tracing::info!("📤 Upload started: {} -> /{} ({} chunks)", filename, dest_path, chunk.total_chunks);
        }

        if session.status.is_terminal() {
            return Err(AppError::AlreadyTerminal {
                upload_id: session.id,
                status: session.status,
            });
        }
        if session.status == UploadStatus::Assembling {
            return Ok(ChunkReceipt {
                index,
                received: session.received_chunks.len() as u32,
                total: session.total_chunks,
                assembly_queued: true,
            });
        }

        self.chunks.put(&session.id, index, chunk.data).await?;

        match self.sessions.mark_received(&session.id, index)? {
            ChunkOutcome::AlreadyAssembling => Ok(ChunkReceipt {
                index,
                received: session.total_chunks,
                total: session.total_chunks,
                assembly_queued: true,
            }),
            ChunkOutcome::Recorded {
                received,
                total,
                complete,
            } => {
                tracing::debug!("Chunk {}/{} stored for {}", received, total, session.id);
                let mut assembly_queued = false;
                if complete {
                    if self.sessions.claim_completion(&session.id)? {
                        if let Err(e) = self.queue.enqueue(&session.id) {
                            if let Err(status_err) = self.sessions.set_status(
                                &session.id,
                                UploadStatus::Error,
                                Some(e.to_string()),
                            ) {
                                tracing::warn!("Could not mark {} failed: {}", session.id, status_err);
                            }
                            return Err(e);
                        }
                        tracing::info!("📦 All {} chunks of {} received, queued for assembly", total, filename);
                    }
                    assembly_queued = true;
                }
                Ok(ChunkReceipt {
                    index,
                    received,
                    total,
                    assembly_queued,
                })
            }
        }
    }

    /// stop an upload. fragments stay until the janitor or an explicit cleanup
    pub fn cancel_upload(&self, upload_id: &str) -> Result<CancelOutcome, AppError> {
        let outcome = self.sessions.cancel(upload_id)?;
        match outcome {
            CancelOutcome::Cancelled => tracing::info!("🚫 Upload {} cancelled", upload_id),
            CancelOutcome::Requested => {
                tracing::info!("🚫 Cancel requested for {} while assembling", upload_id)
            }
        }
        Ok(outcome)
    }

    /// drop one upload's record and fragments right away. unknown ids are a
    /// no-op; uploads still moving or protected are refused
    pub async fn cleanup_upload(&self, upload_id: &str) -> Result<(), AppError> {
        if let Some(session) = self.sessions.get(upload_id) {
            if session.status == UploadStatus::Assembling {
                return Err(AppError::Busy(format!("upload {} is being assembled", upload_id)));
            }
            if session.protected {
                return Err(AppError::Busy(format!("upload {} is protected", upload_id)));
            }
            if session.status == UploadStatus::Uploading {
                return Err(AppError::Busy(format!(
                    "upload {} is still receiving chunks, cancel it first",
                    upload_id
                )));
            }
            let removed = self.sessions.remove_if(upload_id, |s| {
                !s.protected && !matches!(s.status, UploadStatus::Assembling | UploadStatus::Uploading)
            });
            if removed.is_none() && self.sessions.contains(upload_id) {
                return Err(AppError::Busy(format!("upload {} changed state, retry", upload_id)));
            }
        }
        self.chunks.delete(upload_id).await?;
        tracing::debug!("Cleaned up fragments for {}", upload_id);
        Ok(())
    }

    /// refresh the change detector after a mutation this process made
    pub async fn storage_changed(&self) {
        if let Err(e) = self.detector.refresh().await {
            tracing::warn!("Storage refresh failed: {}", e);
        }
    }
}
