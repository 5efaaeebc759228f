use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::middleware::metrics_middleware;
use super::{control, handlers, relay, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Car-facing endpoints
        .route("/instructions", get(relay::list_instructions))
        .route("/next-instruction", get(relay::next_instruction))
        .route("/ready", post(relay::ready))
        .route("/checkpoint", post(relay::checkpoint))
        // Operator endpoints
        .route("/api/status", get(control::status))
        .route("/api/start-race", post(control::start_race))
        .route("/api/stop", post(control::stop))
        .route("/api/reset", post(control::reset))
        .route("/api/test-connectivity", get(control::test_connectivity))
        .route("/api/config", get(handlers::get_config))
        // Live events
        .route("/ws", get(ws::ws_handler))
        // Health and metrics
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
