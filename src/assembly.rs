//! Background assembly of completed uploads.
//!
//! Request handlers only enqueue; a fixed pool of workers drains the queue,
//! concatenates the fragments in index order into a temporary file next to the
//! destination and renames it into place. The destination never shows a
//! partially written file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::changes::{ChangeDetector, PART_FILE_PREFIX, PART_FILE_SUFFIX};
use crate::chunk_store::ChunkStore;
use crate::error::AppError;
use crate::retry::RetryPolicy;
use crate::sessions::{SessionRegistry, UploadSession, UploadStatus};
use crate::utils::{check_destination, normalize_dest_path, PathLocks};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyJob {
    pub upload_id: String,
}

/// bounded queue between request handlers and assembly workers
pub struct AssemblyQueue {
    tx: mpsc::Sender<AssemblyJob>,
    rx: Arc<Mutex<mpsc::Receiver<AssemblyJob>>>,
    enqueued: AtomicU64,
}

impl AssemblyQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            enqueued: AtomicU64::new(0),
        }
    }

    /// hand a job to the workers without blocking the caller. when the queue
    /// is full the send is parked on a task until a worker frees a slot
    pub fn enqueue(&self, upload_id: &str) -> Result<(), AppError> {
        let job = AssemblyJob {
            upload_id: upload_id.to_string(),
        };
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!("Assembly queue full, parking job for {}", job.upload_id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let id = job.upload_id.clone();
                    if tx.send(job).await.is_err() {
                        tracing::error!("Assembly queue closed before {} could be queued", id);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(AppError::Busy("assembly queue is not running".to_string()));
            }
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Queued assembly for {}", upload_id);
        Ok(())
    }

    /// jobs accepted since startup
    pub fn enqueued_total(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// jobs waiting for a worker
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<AssemblyJob>>> {
        self.rx.clone()
    }
}

/// where a finished upload ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
}

pub struct Assembler {
    files_dir: PathBuf,
    chunks: Arc<ChunkStore>,
    sessions: Arc<SessionRegistry>,
    detector: Arc<ChangeDetector>,
    path_locks: Arc<PathLocks>,
    delete_retry: RetryPolicy,
}

impl Assembler {
    pub fn new(
        files_dir: PathBuf,
        chunks: Arc<ChunkStore>,
        sessions: Arc<SessionRegistry>,
        detector: Arc<ChangeDetector>,
        path_locks: Arc<PathLocks>,
        delete_retry: RetryPolicy,
    ) -> Self {
        Self {
            files_dir,
            chunks,
            sessions,
            detector,
            path_locks,
            delete_retry,
        }
    }

    /// run one job to a terminal state. the session is protected from the
    /// janitor for the whole run and released afterwards
    pub async fn process(&self, job: AssemblyJob) {
        let id = job.upload_id;
        let Some(session) = self.sessions.get(&id) else {
            tracing::warn!("Assembly job for unknown upload {}, skipping", id);
            return;
        };
        if session.status != UploadStatus::Assembling {
            tracing::warn!("Upload {} is {}, not assembling; skipping", id, session.status);
            return;
        }
        if self.sessions.protect(&id).is_err() {
            return;
        }

        tracing::info!("🔧 Assembling {} ({} chunks)", session.filename, session.total_chunks);
        let result = self.assemble(&session).await;

        // settle fragments and the snapshot before reporting completion, so a
        // client that sees `completed` also sees the file
        if result.is_ok() {
            self.release_fragments(&id).await;
            if let Err(e) = self.detector.refresh().await {
                tracing::warn!("Storage refresh after assembly failed: {}", e);
            }
        }
        let _ = self.sessions.unprotect(&id);

        match result {
            Ok(file) => {
                if let Err(e) = self.sessions.set_status(&id, UploadStatus::Completed, None) {
                    tracing::warn!("Could not mark {} completed: {}", id, e);
                }
                tracing::info!("✅ Assembled {:?} ({} bytes)", file.path, file.size);
            }
            // fragments of a failed upload stay put for the janitor
            Err(e) => {
                let message = match &e {
                    AppError::CancelledDuringAssembly(_) => "cancelled during assembly".to_string(),
                    other => other.to_string(),
                };
                tracing::error!("❌ Assembly of {} failed: {}", id, message);
                if let Err(e) = self.sessions.set_status(&id, UploadStatus::Error, Some(message)) {
                    tracing::warn!("Could not mark {} failed: {}", id, e);
                }
            }
        }
    }

    async fn release_fragments(&self, id: &str) {
        let chunks = self.chunks.clone();
        let outcome = self
            .delete_retry
            .start()
            .run(|| {
                let chunks = chunks.clone();
                let id = id.to_string();
                async move { chunks.delete(&id).await }
            })
            .await;
        if let Err((e, attempts)) = outcome {
            tracing::warn!(
                "Could not remove fragments of {} after {} attempts: {}",
                id,
                attempts,
                e
            );
        }
    }

    /// concatenate the fragments of `session` into its destination
    pub async fn assemble(&self, session: &UploadSession) -> Result<AssembledFile, AppError> {
        let dest_dir = normalize_dest_path(&session.dest_path)?;
        let target = check_destination(&self.files_dir, &dest_dir, &session.filename)?;
        let records = self.chunks.read_all(&session.id, session.total_chunks).await?;
        let expected: u64 = records.iter().map(|r| r.byte_length).sum();

        let target_dir = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.files_dir.clone());
        fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| AppError::DestinationConflict(format!("cannot create {:?}: {}", target_dir, e)))?;

        let part = target_dir.join(format!(
            "{}{}{}",
            PART_FILE_PREFIX,
            uuid::Uuid::new_v4().simple(),
            PART_FILE_SUFFIX
        ));

        let written = match self.write_part(session, &records, &part).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                return Err(e);
            }
        };
        if written != expected {
            let _ = fs::remove_file(&part).await;
            return Err(AppError::AssemblyIoFailure(format!(
                "size mismatch: wrote {} bytes, expected {}",
                written, expected
            )));
        }

        // from here on a cancel request is ignored
        let _guard = self.path_locks.lock(&target).await;
        if target.is_dir() {
            let _ = fs::remove_file(&part).await;
            return Err(AppError::DestinationConflict(format!(
                "{:?} became a directory",
                target
            )));
        }
        if let Err(e) = fs::rename(&part, &target).await {
            let _ = fs::remove_file(&part).await;
            return Err(AppError::AssemblyIoFailure(format!("rename failed: {}", e)));
        }

        Ok(AssembledFile {
            path: target,
            size: written,
        })
    }

    async fn write_part(
        &self,
        session: &UploadSession,
        records: &[crate::chunk_store::ChunkRecord],
        part: &Path,
    ) -> Result<u64, AppError> {
        let file = fs::File::create(part)
            .await
            .map_err(|e| io_failure("create temporary file", e))?;
        let mut out = BufWriter::new(file);
        let mut written = 0u64;

        for record in records {
            if self.sessions.cancel_requested(&session.id) {
                return Err(AppError::CancelledDuringAssembly(session.id.clone()));
            }
            let mut chunk = fs::File::open(&record.storage_location)
                .await
                .map_err(|e| io_failure(&format!("open chunk {}", record.index), e))?;
            let copied = tokio::io::copy(&mut chunk, &mut out)
                .await
                .map_err(|e| io_failure(&format!("copy chunk {}", record.index), e))?;
            if copied != record.byte_length {
                return Err(AppError::AssemblyIoFailure(format!(
                    "chunk {} changed size during assembly ({} != {})",
                    record.index, copied, record.byte_length
                )));
            }
            written += copied;
        }

        out.flush().await.map_err(|e| io_failure("flush", e))?;
        let file = out.into_inner();
        file.sync_all().await.map_err(|e| io_failure("sync", e))?;

        let on_disk = file
            .metadata()
            .await
            .map_err(|e| io_failure("stat", e))?
            .len();
        if on_disk != written {
            return Err(AppError::AssemblyIoFailure(format!(
                "size mismatch: {} bytes on disk, {} written",
                on_disk, written
            )));
        }
        Ok(written)
    }
}

fn io_failure(step: &str, e: std::io::Error) -> AppError {
    AppError::AssemblyIoFailure(format!("{}: {}", step, e))
}

/// start `count` workers sharing one queue
pub fn spawn_workers(assembler: Arc<Assembler>, queue: &AssemblyQueue, count: usize) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| {
            let assembler = assembler.clone();
            let rx = queue.receiver();
            tokio::spawn(async move {
                tracing::debug!("Assembly worker {} started", worker);
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => assembler.process(job).await,
                        None => break,
                    }
                }
                tracing::debug!("Assembly worker {} stopped", worker);
            })
        })
        .collect()
}

/// rebuild sessions from scratch metadata after a restart and re-queue the
/// ones that already have every chunk. returns (recovered, queued)
pub async fn recover(
    chunks: &ChunkStore,
    sessions: &SessionRegistry,
    queue: &AssemblyQueue,
) -> Result<(usize, usize), AppError> {
    let mut recovered = 0;
    let mut queued = 0;

    for entry in chunks.scan().await? {
        let Some(metadata) = entry.metadata else {
            continue;
        };
        if chunks.dir_for(&metadata.upload_id) != entry.dir {
            tracing::warn!("Scratch directory {:?} does not match its metadata, skipping", entry.dir);
            continue;
        }
        let received = crate::chunk_store::list_indices(&entry.dir).await?;
        let session = UploadSession::from_metadata(&metadata, received);
        let complete = session.is_complete();
        if !sessions.insert_recovered(session) {
            continue;
        }
        recovered += 1;

        if complete && sessions.claim_completion(&metadata.upload_id)? {
            queue.enqueue(&metadata.upload_id)?;
            queued += 1;
        }
    }

    if recovered > 0 {
        tracing::info!("♻️ Recovered {} uploads from scratch, {} queued for assembly", recovered, queued);
    }
    Ok((recovered, queued))
}
