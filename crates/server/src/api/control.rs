//! Operator endpoints under `/api`.

use axum::{extract::State, Json};
use std::sync::Arc;

use relay_core::{ActionResponse, ConnectivityReport, RelayStats};

use crate::state::AppState;

pub async fn status(State(state): State<Arc<AppState>>) -> Json<RelayStats> {
    Json(state.service().stats())
}

/// Ready signal bounded by the configured start timeout. Always answers 200;
/// the outcome is in the `success` flag.
pub async fn start_race(State(state): State<Arc<AppState>>) -> Json<ActionResponse> {
    Json(state.service().start_race().await)
}

pub async fn stop(State(state): State<Arc<AppState>>) -> Json<ActionResponse> {
    state.service().stop().await;
    Json(ActionResponse::ok("Service stopped"))
}

pub async fn reset(State(state): State<Arc<AppState>>) -> Json<ActionResponse> {
    state.service().reset().await;
    Json(ActionResponse::ok("Service reset"))
}

pub async fn test_connectivity(State(state): State<Arc<AppState>>) -> Json<ConnectivityReport> {
    Json(state.service().test_connectivity().await)
}
