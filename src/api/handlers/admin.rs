use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backend: &'static str,
    pub files: u64,
    pub processing_enabled: bool,
    pub in_flight: usize,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<HealthResponse>>, ApiError> {
    let files = state.db.count_files()?;

    Ok(JSend::success(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: state.content.backend().kind(),
        files,
        processing_enabled: state.scheduler.is_some(),
        in_flight: state
            .scheduler
            .as_ref()
            .map(|s| s.in_flight_count())
            .unwrap_or(0),
    }))
}
