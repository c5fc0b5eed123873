//! Health check handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::config::GenerationMode;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service name.
    pub service: String,
    /// Service version.
    pub version: String,
    /// Active generation mode.
    pub generation_mode: String,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let generation_mode = match state.settlement.mode() {
        GenerationMode::Sync => "sync",
        GenerationMode::Async => "async",
    };
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "avatarbank".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        generation_mode: generation_mode.to_string(),
    })
}
