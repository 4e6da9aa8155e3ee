//! Control API route definitions.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::AppState;

/// Build the control API router.
///
/// CORS is permissive to simplify local tooling; the server itself only
/// ever binds to loopback, and clients must not expose the port externally.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/agents",
            get(handlers::list_agents).post(handlers::create_agent),
        )
        .route(
            "/api/agents/{name}/message",
            post(handlers::message_agent),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
