pub mod api;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

pub use api::ApiHandlers;

/// REST routes of the public server
pub fn api_router(handlers: Arc<ApiHandlers>) -> Router {
    Router::new()
        .route("/health", get(ApiHandlers::health))
        .route(
            "/api/meetings",
            post(ApiHandlers::join_meeting).get(ApiHandlers::list_meetings),
        )
        .route(
            "/api/meetings/:id",
            get(ApiHandlers::get_meeting).delete(ApiHandlers::leave_meeting),
        )
        .route("/api/workers/ready", post(ApiHandlers::worker_ready))
        .with_state(handlers)
}
