//! In-memory registry of upload sessions.
//!
//! Every mutation of a session happens inside a single `DashMap` entry guard
//! that is never held across an `.await`, so recording a chunk and claiming
//! completion can't interleave with another request for the same upload.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::chunk_store::UploadMetadata;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Assembling,
    Completed,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Error | UploadStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Assembling => "assembling",
            UploadStatus::Completed => "completed",
            UploadStatus::Error => "error",
            UploadStatus::Cancelled => "cancelled",
        }
    }

    // statuses only move forward; terminal states are never left
    fn can_move_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Pending, Cancelled)
                | (Uploading, Assembling)
                | (Uploading, Cancelled)
                | (Uploading, Error)
                | (Assembling, Completed)
                | (Assembling, Error)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// one logical file being uploaded in chunks
#[derive(Debug, Clone, Serialize)]
pub struct UploadSession {
    pub id: String,
    pub filename: String,
    /// normalized destination directory, forward slashes, `""` for the root
    pub dest_path: String,
    pub total_chunks: u32,
    pub received_chunks: BTreeSet<u32>,
    pub status: UploadStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub protected: bool,
    #[serde(skip)]
    completion_claimed: bool,
    #[serde(skip)]
    cancel_requested: bool,
}

impl UploadSession {
    pub fn new(id: &str, filename: &str, dest_path: &str, total_chunks: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            filename: filename.to_string(),
            dest_path: dest_path.to_string(),
            total_chunks,
            received_chunks: BTreeSet::new(),
            status: UploadStatus::Pending,
            error_message: None,
            created_at: now,
            last_activity: now,
            completed_at: None,
            protected: false,
            completion_claimed: false,
            cancel_requested: false,
        }
    }

    /// rebuild a session from what was persisted next to its fragments
    pub fn from_metadata(metadata: &UploadMetadata, received: impl IntoIterator<Item = u32>) -> Self {
        let mut session = Self::new(
            &metadata.upload_id,
            &metadata.filename,
            &metadata.dest_path,
            metadata.total_chunks,
        );
        session.created_at = metadata.created_at;
        session.received_chunks = received
            .into_iter()
            .filter(|i| *i < metadata.total_chunks)
            .collect();
        if !session.received_chunks.is_empty() {
            session.status = UploadStatus::Uploading;
        }
        session
    }

    pub fn metadata(&self) -> UploadMetadata {
        UploadMetadata {
            upload_id: self.id.clone(),
            filename: self.filename.clone(),
            dest_path: self.dest_path.clone(),
            total_chunks: self.total_chunks,
            created_at: self.created_at,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() as u64 == self.total_chunks as u64
    }

    pub fn completion_claimed(&self) -> bool {
        self.completion_claimed
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    /// chunk indices not yet received
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .collect()
    }

    fn already_terminal(&self) -> AppError {
        AppError::AlreadyTerminal {
            upload_id: self.id.clone(),
            status: self.status,
        }
    }
}

/// what recording a chunk did to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// chunk recorded; `complete` is true once every index is present
    Recorded {
        received: u32,
        total: u32,
        complete: bool,
    },
    /// the session was already handed to assembly; the chunk is ignored
    AlreadyAssembling,
}

/// result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// session moved to cancelled
    Cancelled,
    /// assembly is running; it will stop at the next chunk boundary
    Requested,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, UploadSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// look up an upload or create it on its first chunk.
    /// returns the session and whether it was just created
    pub fn start_or_get(
        &self,
        id: &str,
        filename: &str,
        dest_path: &str,
        total_chunks: u32,
    ) -> Result<(UploadSession, bool), AppError> {
        if total_chunks == 0 {
            return Err(AppError::InvalidRequest(
                "total_chunks must be at least 1".to_string(),
            ));
        }
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                let session = entry.get();
                if session.filename != filename
                    || session.dest_path != dest_path
                    || session.total_chunks != total_chunks
                {
                    return Err(AppError::MetadataMismatch(id.to_string()));
                }
                Ok((session.clone(), false))
            }
            Entry::Vacant(entry) => {
                let session = UploadSession::new(id, filename, dest_path, total_chunks);
                tracing::debug!(
                    "New upload session {} for {} ({} chunks)",
                    id,
                    filename,
                    total_chunks
                );
                Ok((entry.insert(session).clone(), true))
            }
        }
    }

    /// put back a session rebuilt at startup; an existing entry wins
    pub fn insert_recovered(&self, session: UploadSession) -> bool {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(session);
                true
            }
        }
    }

    /// add `index` to the received set
    pub fn mark_received(&self, id: &str, index: u32) -> Result<ChunkOutcome, AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;

        if session.status.is_terminal() {
            return Err(session.already_terminal());
        }
        if session.status == UploadStatus::Assembling || session.completion_claimed {
            return Ok(ChunkOutcome::AlreadyAssembling);
        }
        if index >= session.total_chunks {
            return Err(AppError::InvalidChunkIndex {
                index: index as i64,
                total: session.total_chunks,
            });
        }

        session.received_chunks.insert(index);
        session.last_activity = Utc::now();
        if session.status == UploadStatus::Pending {
            session.status = UploadStatus::Uploading;
        }

        Ok(ChunkOutcome::Recorded {
            received: session.received_chunks.len() as u32,
            total: session.total_chunks,
            complete: session.is_complete(),
        })
    }

    pub fn is_complete(&self, id: &str) -> Result<bool, AppError> {
        self.sessions
            .get(id)
            .map(|s| s.is_complete())
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))
    }

    /// claim the right to enqueue assembly. true for exactly one caller per
    /// session, and only once every chunk is present
    pub fn claim_completion(&self, id: &str) -> Result<bool, AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;

        if session.completion_claimed || !session.is_complete() {
            return Ok(false);
        }
        if session.status != UploadStatus::Uploading {
            return Ok(false);
        }
        session.completion_claimed = true;
        session.status = UploadStatus::Assembling;
        Ok(true)
    }

    pub fn set_status(
        &self,
        id: &str,
        status: UploadStatus,
        error_message: Option<String>,
    ) -> Result<(), AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;

        if session.status == status {
            return Ok(());
        }
        if !session.status.can_move_to(status) {
            if session.status.is_terminal() {
                return Err(session.already_terminal());
            }
            return Err(AppError::InvalidRequest(format!(
                "upload {} cannot move from {} to {}",
                id, session.status, status
            )));
        }

        session.status = status;
        if error_message.is_some() {
            session.error_message = error_message;
        }
        if status.is_terminal() {
            session.completed_at = Some(Utc::now());
            session.protected = false;
        }
        Ok(())
    }

    /// shield a live session from the janitor. finished sessions have
    /// nothing left to protect and are returned unchanged
    pub fn protect(&self, id: &str) -> Result<UploadStatus, AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;
        if !session.status.is_terminal() {
            session.protected = true;
        }
        Ok(session.status)
    }

    pub fn unprotect(&self, id: &str) -> Result<(), AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;
        session.protected = false;
        Ok(())
    }

    pub fn cancel(&self, id: &str) -> Result<CancelOutcome, AppError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AppError::UnknownUpload(id.to_string()))?;

        match session.status {
            UploadStatus::Pending | UploadStatus::Uploading => {
                session.status = UploadStatus::Cancelled;
                session.completed_at = Some(Utc::now());
                session.protected = false;
                Ok(CancelOutcome::Cancelled)
            }
            UploadStatus::Assembling => {
                session.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            _ => Err(session.already_terminal()),
        }
    }

    pub fn cancel_requested(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|s| s.cancel_requested)
            .unwrap_or(false)
    }

    pub fn get(&self, id: &str) -> Option<UploadSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<UploadSession> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn remove(&self, id: &str) -> Option<UploadSession> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// remove a session only if `eligible` still holds under the entry lock
    pub fn remove_if<F>(&self, id: &str, eligible: F) -> Option<UploadSession>
    where
        F: FnOnce(&UploadSession) -> bool,
    {
        self.sessions.remove_if(id, |_, s| eligible(s)).map(|(_, s)| s)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn any_assembling(&self) -> bool {
        self.sessions
            .iter()
            .any(|s| s.status == UploadStatus::Assembling)
    }

    pub fn count_by_status(&self, status: UploadStatus) -> usize {
        self.sessions.iter().filter(|s| s.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
