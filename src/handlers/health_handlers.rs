//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that asks the storage backend to check itself

use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

/// `GET /healthz`
///
/// Very small liveness probe — always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            backend: None,
            error: None,
        }),
    )
}

/// `GET /readyz`
///
/// Runs the backend's readiness check (SQLite + disk for the local backend,
/// a one-item listing for Vercel Blob). HTTP 200 when it passes, HTTP 503
/// otherwise.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let backend = Some(state.store.name());
    match state.store.check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                backend,
                error: None,
            }),
        ),
        Err(err) => {
            tracing::warn!("readiness check failed: {}", err);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "error",
                    backend,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}
