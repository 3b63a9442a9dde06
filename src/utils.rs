use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::AppError;

/// validate a client-supplied filename; only path separators, NUL and dot-only names are refused
pub fn validate_filename(filename: &str) -> Result<&str, AppError> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidRequest("Filename is required".to_string()));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(AppError::InvalidRequest(format!("Invalid filename: {}", filename)));
    }
    if trimmed.contains(['/', '\\', '\0']) {
        return Err(AppError::InvalidRequest(format!("Invalid filename: {}", filename)));
    }
    Ok(trimmed)
}

/// normalize a destination directory relative to the storage root.
/// `""`, `"."` and `"/"` all mean the root. any `..` segment is refused
pub fn normalize_dest_path(dest_path: &str) -> Result<PathBuf, AppError> {
    let mut normalized = PathBuf::new();
    for segment in dest_path.split(['/', '\\']) {
        match segment.trim() {
            "" | "." => continue,
            ".." => {
                return Err(AppError::DestinationConflict(format!(
                    "destination escapes the storage root: {}",
                    dest_path
                )))
            }
            s if s.contains('\0') => {
                return Err(AppError::DestinationConflict(format!(
                    "invalid destination: {}",
                    dest_path
                )))
            }
            s => normalized.push(s),
        }
    }
    Ok(normalized)
}

/// forward-slash form of a normalized relative path, used on the wire and in metadata
pub fn display_rel_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// sha256 hex, used for scratch directory names and the tree fingerprint
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// check that `dest_dir/filename` can hold a regular file: no existing directory
/// at the target and no regular file where an intermediate directory should be
pub fn check_destination(root: &Path, dest_dir: &Path, filename: &str) -> Result<PathBuf, AppError> {
    let mut cursor = root.to_path_buf();
    for component in dest_dir.components() {
        cursor.push(component);
        if cursor.exists() && !cursor.is_dir() {
            return Err(AppError::DestinationConflict(format!(
                "{} is a file, expected a directory",
                display_rel_path(cursor.strip_prefix(root).unwrap_or(&cursor))
            )));
        }
    }
    let target = cursor.join(filename);
    if target.is_dir() {
        return Err(AppError::DestinationConflict(format!(
            "{} is a directory",
            display_rel_path(target.strip_prefix(root).unwrap_or(&target))
        )));
    }
    Ok(target)
}

/// serializes writers targeting the same path (assembly rename, delete, rename).
/// an entry lives only while someone holds or waits for its lock
#[derive(Default)]
pub struct PathLocks {
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &Path) -> PathGuard {
        let lock = self
            .locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        PathGuard {
            path: path.to_path_buf(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// held lock on one path; dropping it releases the lock and forgets the
/// entry when nobody else is waiting for it
pub struct PathGuard {
    path: PathBuf,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // waiters hold their own clone, so a count of one means only the map
        self.locks
            .remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// wait for ctrl-c or sigterm
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("🛑 Shutdown signal received, draining connections");
}
