#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use driftbox::config::Config;
use driftbox::sessions::{UploadSession, UploadStatus};
use driftbox::state::{AppState, IncomingChunk};

pub fn test_config(root: &Path) -> Config {
    Config {
        files_dir: root.join("files"),
        chunks_dir: root.join("scratch"),
        max_chunk_size: 1024 * 1024,
        keepalive_interval: Duration::from_millis(50),
        delete_retry_attempts: 2,
        ..Config::default()
    }
}

pub fn test_state(root: &Path) -> Arc<AppState> {
    Arc::new(AppState::new(test_config(root)).unwrap())
}

pub fn state_with(config: Config) -> Arc<AppState> {
    Arc::new(AppState::new(config).unwrap())
}

pub fn chunk(id: &str, index: i64, total: u32, filename: &str, dest: &str, data: &[u8]) -> IncomingChunk {
    IncomingChunk {
        upload_id: id.to_string(),
        index,
        total_chunks: total,
        filename: filename.to_string(),
        dest_path: dest.to_string(),
        data: Bytes::copy_from_slice(data),
        checksum: None,
    }
}

/// poll the registry until the upload reaches a terminal status
pub async fn wait_terminal(state: &AppState, id: &str) -> UploadSession {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(session) = state.sessions.get(id) {
                if session.status.is_terminal() {
                    return session;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload never finished")
}

pub async fn wait_status(state: &AppState, id: &str, status: UploadStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while state.sessions.get(id).map(|s| s.status) != Some(status) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status never reached");
}
