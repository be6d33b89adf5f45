//! Liveness endpoints served next to the Slack listener.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

async fn home() -> impl IntoResponse {
    "Bot is alive and running!"
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Build the liveness router.
pub fn build_router() -> Router {
    Router::new()
        .route("/", get(home))
        .route("/health", get(health))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
}
