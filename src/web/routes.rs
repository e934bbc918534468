use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            .route("/query", post(handlers::api::query))
            .route("/insights", post(handlers::api::insights))
            .route("/chart", post(handlers::api::chart))
            .route("/health", get(handlers::api::health))
            .route("/schema", get(handlers::api::schema)),
    )
}
