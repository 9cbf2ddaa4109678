//! Thin HTTP surface of the api role: admit jobs, answer polls, delete tracks.

pub mod tracks;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::infra::app_state::AppState;

pub mod routes {
    pub const HEALTH: &str = "/health";
    pub const TRACK_JOBS: &str = "/api/tracks/jobs";
    pub const TRACK_JOB: &str = "/api/tracks/jobs/{id}";
    pub const TRACK: &str = "/api/tracks/{id}";
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(routes::HEALTH, get(health))
        .merge(tracks::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
