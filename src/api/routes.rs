use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

/// Multipart framing on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = (state.config.max_upload_size as usize).saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // Files
        .route(
            "/files",
            get(handlers::list_files)
                .post(handlers::create_file)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/files/:digest",
            get(handlers::get_file).delete(handlers::delete_file),
        )
        .route("/files/:digest/exists", get(handlers::file_exists))
        .route("/files/:digest/metadata", get(handlers::file_metadata))
        // Processing
        .route("/files/:digest/process", post(handlers::process_file))
        .route("/files/:digest/status", get(handlers::file_status))
        // Drive consent
        .route("/auth/drive", get(handlers::drive_consent))
        .route("/auth/drive/callback", get(handlers::drive_callback))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
