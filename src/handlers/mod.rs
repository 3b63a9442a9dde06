//! HTTP handlers for the api listener.

pub mod admin;
pub mod live;
pub mod storage;
pub mod uploads;

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

// health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let active_uploads = state
        .sessions
        .list()
        .iter()
        .filter(|s| !s.status.is_terminal())
        .count();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        active_uploads,
    })
}
