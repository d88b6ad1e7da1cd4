// src/api/mod.rs
//
// =============================================================================
// REELFORGE: HTTP API (v 0.1 ) -- Component G
// =============================================================================
//
// The REST surface of §6.2, assembled as an axum `Router`. Tracing and CORS
// are layered on with tower-http the same way the rest of the ecosystem
// wires them; request-level policy (validation, auth-free by design per the
// Non-goals) stays in `handlers`.

pub mod dto;
pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::routing::{delete, get, post};
use axum::Router;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tower_http::timeout::TimeoutLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs/submit", post(handlers::submit_job))
        .route("/api/jobs/list", get(handlers::list_jobs))
        .route("/api/jobs/:id/status", get(handlers::get_job_status))
        .route("/api/jobs/:id", delete(handlers::cancel_job))
        .route("/api/jobs/:id/download", get(handlers::download_artifact))
        .route("/api/system/status", get(handlers::system_status))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}
