//! Scratch storage for chunk fragments.
//!
//! Each upload gets a directory under the scratch root named by the SHA-256 of
//! its upload id, so nothing a client sends ends up in a filesystem path. A
//! directory holds one file per chunk index plus a `.metadata` JSON record that
//! lets a restarted process pick the upload back up.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::AppError;
use crate::utils::sha256_hex;

const METADATA_FILE: &str = ".metadata";

/// one stored byte range of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub upload_id: String,
    pub index: u32,
    pub byte_length: u64,
    pub storage_location: PathBuf,
}

/// what gets persisted next to the fragments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub upload_id: String,
    pub filename: String,
    pub dest_path: String,
    pub total_chunks: u32,
    pub created_at: DateTime<Utc>,
}

/// a scratch directory found on disk
#[derive(Debug, Clone)]
pub struct ScratchEntry {
    pub dir: PathBuf,
    pub metadata: Option<UploadMetadata>,
    pub modified: Option<SystemTime>,
}

pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// scratch directory for an upload id
    pub fn dir_for(&self, upload_id: &str) -> PathBuf {
        self.root.join(sha256_hex(upload_id.as_bytes()))
    }

    fn chunk_path(&self, upload_id: &str, index: u32) -> PathBuf {
        self.dir_for(upload_id).join(index.to_string())
    }

    pub async fn write_metadata(&self, metadata: &UploadMetadata) -> Result<(), AppError> {
        let dir = self.dir_for(&metadata.upload_id);
        fs::create_dir_all(&dir).await?;
        let data = serde_json::to_vec(metadata)
            .map_err(|e| AppError::InvalidRequest(format!("Unserializable metadata: {}", e)))?;
        write_atomic(&dir, METADATA_FILE, &data).await?;
        Ok(())
    }

    /// store the bytes of one chunk; re-sending an index replaces it.
    /// the scratch directory comes from `write_metadata`, so a chunk for an
    /// upload that was already cleaned up is refused instead of re-creating it
    pub async fn put(&self, upload_id: &str, index: u32, data: Bytes) -> Result<ChunkRecord, AppError> {
        let dir = self.dir_for(upload_id);
        let name = index.to_string();
        match write_atomic(&dir, &name, &data).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::UnknownUpload(upload_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        tracing::trace!("Stored chunk {} for upload {} ({} bytes)", index, upload_id, data.len());
        Ok(ChunkRecord {
            upload_id: upload_id.to_string(),
            index,
            byte_length: data.len() as u64,
            storage_location: dir.join(name),
        })
    }

    /// indices present on disk, ascending
    pub async fn list(&self, upload_id: &str) -> Result<Vec<u32>, AppError> {
        list_indices(&self.dir_for(upload_id)).await
    }

    /// ordered records for `0..total_chunks`, failing if any index is missing.
    /// the assembly worker streams each record's bytes in this order
    pub async fn read_all(&self, upload_id: &str, total_chunks: u32) -> Result<Vec<ChunkRecord>, AppError> {
        let mut records = Vec::with_capacity(total_chunks as usize);
        let mut missing = Vec::new();
        for index in 0..total_chunks {
            let path = self.chunk_path(upload_id, index);
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => records.push(ChunkRecord {
                    upload_id: upload_id.to_string(),
                    index,
                    byte_length: meta.len(),
                    storage_location: path,
                }),
                Ok(_) => missing.push(index),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => missing.push(index),
                Err(e) => return Err(e.into()),
            }
        }
        if !missing.is_empty() {
            return Err(AppError::IncompleteUpload {
                upload_id: upload_id.to_string(),
                missing,
            });
        }
        Ok(records)
    }

    /// remove every fragment of an upload; deleting an unknown id is fine
    pub async fn delete(&self, upload_id: &str) -> Result<(), std::io::Error> {
        remove_dir_if_exists(&self.dir_for(upload_id)).await
    }

    pub async fn remove_dir(&self, dir: &Path) -> Result<(), std::io::Error> {
        if dir.parent() != Some(self.root.as_path()) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{:?} is not a scratch directory", dir),
            ));
        }
        remove_dir_if_exists(dir).await
    }

    /// every scratch directory with whatever metadata could be read
    pub async fn scan(&self) -> Result<Vec<ScratchEntry>, std::io::Error> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_dir() {
                continue;
            }
            let dir = entry.path();
            let modified = entry.metadata().await.ok().and_then(|m| m.modified().ok());
            let metadata = match fs::read(dir.join(METADATA_FILE)).await {
                Ok(raw) => match serde_json::from_slice::<UploadMetadata>(&raw) {
                    Ok(meta) => Some(meta),
                    Err(e) => {
                        tracing::warn!("Unreadable upload metadata in {:?}: {}", dir, e);
                        None
                    }
                },
                Err(_) => None,
            };
            found.push(ScratchEntry {
                dir,
                metadata,
                modified,
            });
        }
        Ok(found)
    }
}

pub(crate) async fn list_indices(dir: &Path) -> Result<Vec<u32>, AppError> {
    let mut indices = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

// write to a temp name then rename, so readers never see a half-written file
async fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<(), std::io::Error> {
    let tmp = dir.join(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()));
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, dir.join(name)).await
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), std::io::Error> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
