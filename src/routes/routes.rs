//! Defines routes for the gallery API.
//!
//! ## Structure
//! - **API endpoints**
//!   - `POST   /api/upload` — store the raw body under `x-vercel-filename`
//!   - `GET    /api/files`  — list blobs (supports prefix, limit, cursor)
//!   - `DELETE /api/delete` — delete the blob at `{url}`
//!   - `POST   /api/rename` — copy `{url}` to `{newFilename}`, then delete it
//!
//! - **Blob serving** (local backend only)
//!   - `GET    /blobs/{*key}` — stream a payload
//!
//! Anything else falls through to the static frontend directory.

use crate::{
    handlers::{
        blob_handlers::{delete_file, get_blob, list_files, rename_file, upload_file},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use std::path::Path;
use tower_http::{services::ServeDir, trace::TraceLayer};

/// Limit for JSON request bodies. Uploads stream and are not affected.
pub const JSON_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Build the API router. The router carries `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/upload", post(upload_file))
        .route("/api/files", get(list_files))
        .route("/api/delete", delete(delete_file))
        .route("/api/rename", post(rename_file))
        .route("/blobs/{*key}", get(get_blob))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
}

/// The full application: API routes, static frontend fallback, request tracing.
pub fn app(state: AppState, static_dir: &Path) -> Router {
    routes()
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
