//! Health Routes
//!
//! - GET /health - Liveness plus a snapshot of relay connections

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::api::state::AppState;
use crate::websocket::RegistryStats;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub connections: RegistryStats,
}

/// GET /health
///
/// No authentication; always 200 while the process is serving.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        uptime_seconds: state.uptime_seconds(),
        connections: state.registry().stats().await,
    })
}
