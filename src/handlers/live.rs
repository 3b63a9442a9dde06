use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::header,
    response::{
        sse::{Event, Sse},
        IntoResponse, Json,
    },
};
use futures_util::StreamExt;

use crate::changes::MonitorMode;
use crate::live::{poll, PollResponse};
use crate::models::{MonitoringStatusResponse, PollQuery, StorageStatsResponse};
use crate::state::AppState;

// push stream of storage changes
pub async fn storage_stats_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = state
        .broadcaster
        .open_stream(&state.detector)
        .map(|message| match Event::default().json_data(&message) {
            Ok(event) => Ok::<_, Infallible>(event),
            Err(e) => {
                tracing::warn!("Failed to encode live message: {}", e);
                Ok(Event::default().comment("encode error"))
            }
        });

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    )
}

// pull-mode reconciliation for clients without a stream
pub async fn storage_stats_poll(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Json<PollResponse> {
    let current = state.detector.current();
    let response = poll(&current, query.last_files, query.last_dirs);
    tracing::trace!(
        "Poll since {:?}: changed={} ({} files, {} dirs)",
        query.last_check,
        response.changed,
        current.file_count,
        current.dir_count
    );
    Json(response)
}

// current snapshot
pub async fn storage_stats(State(state): State<Arc<AppState>>) -> Json<StorageStatsResponse> {
    Json(StorageStatsResponse {
        snapshot: state.detector.current().as_ref().clone(),
        connected_clients: state.broadcaster.client_count(),
    })
}

// state of the change monitor
pub async fn monitoring_status(State(state): State<Arc<AppState>>) -> Json<MonitoringStatusResponse> {
    let mode = state.detector.mode();
    Json(MonitoringStatusResponse {
        monitoring_active: mode != MonitorMode::Idle,
        mode,
        connected_clients: state.broadcaster.client_count(),
        total_connections: state.broadcaster.total_connections(),
        total_checks: state.detector.total_checks(),
        changes_detected: state.detector.changes_seen(),
        last_check: state.detector.last_checked(),
    })
}
