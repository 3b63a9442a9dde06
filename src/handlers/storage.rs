use std::path::PathBuf;
use std::sync::Arc;

use axum::{extract::State, response::Json};
use tokio::fs;

use crate::error::AppError;
use crate::models::{DeleteRequest, MkdirRequest, MutationResponse, RenameRequest};
use crate::state::AppState;
use crate::utils::{display_rel_path, normalize_dest_path, validate_filename};

// resolve a client path to something strictly below the storage root
fn resolve_entry(state: &AppState, path: &str) -> Result<(PathBuf, PathBuf), AppError> {
    let rel = normalize_dest_path(path)
        .map_err(|_| AppError::InvalidRequest(format!("Invalid path: {}", path)))?;
    if rel.as_os_str().is_empty() {
        return Err(AppError::InvalidRequest(
            "The storage root cannot be modified".to_string(),
        ));
    }
    let full = state.files_dir.join(&rel);
    if full.starts_with(state.chunks.root()) {
        return Err(AppError::NotFound(display_rel_path(&rel)));
    }
    Ok((rel, full))
}

// delete a file or a whole directory
pub async fn delete_entry(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    let (rel, full) = resolve_entry(&state, &request.path)?;
    let guard = state.path_locks.lock(&full).await;

    let meta = match fs::symlink_metadata(&full).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(display_rel_path(&rel)))
        }
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(&full).await?;
    } else {
        fs::remove_file(&full).await?;
    }
    drop(guard);

    tracing::info!("🗑️  Deleted {}", display_rel_path(&rel));
    state.storage_changed().await;
    Ok(Json(MutationResponse {
        success: true,
        path: display_rel_path(&rel),
    }))
}

// create a directory
pub async fn make_directory(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MkdirRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    let name = validate_filename(&request.name)?;
    let parent = normalize_dest_path(&request.path)
        .map_err(|_| AppError::InvalidRequest(format!("Invalid path: {}", request.path)))?;
    let rel = parent.join(name);
    let full = state.files_dir.join(&rel);

    let guard = state.path_locks.lock(&full).await;
    if fs::symlink_metadata(&full).await.is_ok() {
        return Err(AppError::DestinationConflict(format!(
            "{} already exists",
            display_rel_path(&rel)
        )));
    }
    if !state.files_dir.join(&parent).is_dir() {
        return Err(AppError::NotFound(display_rel_path(&parent)));
    }
    fs::create_dir(&full).await?;
    drop(guard);

    tracing::info!("📁 Created directory {}", display_rel_path(&rel));
    state.storage_changed().await;
    Ok(Json(MutationResponse {
        success: true,
        path: display_rel_path(&rel),
    }))
}

// rename an entry within its directory
pub async fn rename_entry(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<MutationResponse>, AppError> {
    let (rel, full) = resolve_entry(&state, &request.path)?;
    let new_name = validate_filename(&request.new_name)?;
    let new_rel = rel
        .parent()
        .map(|p| p.join(new_name))
        .unwrap_or_else(|| PathBuf::from(new_name));
    let new_full = state.files_dir.join(&new_rel);

    // lock both ends in a fixed order so two renames can't deadlock
    let (first, second) = if full <= new_full {
        (&full, &new_full)
    } else {
        (&new_full, &full)
    };
    let first_guard = state.path_locks.lock(first).await;
    let second_guard = if first != second {
        Some(state.path_locks.lock(second).await)
    } else {
        None
    };

    if fs::symlink_metadata(&full).await.is_err() {
        return Err(AppError::NotFound(display_rel_path(&rel)));
    }
    if full != new_full && fs::symlink_metadata(&new_full).await.is_ok() {
        return Err(AppError::DestinationConflict(format!(
            "{} already exists",
            display_rel_path(&new_rel)
        )));
    }
    fs::rename(&full, &new_full).await?;
    drop(second_guard);
    drop(first_guard);

    tracing::info!(
        "✏️  Renamed {} -> {}",
        display_rel_path(&rel),
        display_rel_path(&new_rel)
    );
    state.storage_changed().await;
    Ok(Json(MutationResponse {
        success: true,
        path: display_rel_path(&new_rel),
    }))
}
