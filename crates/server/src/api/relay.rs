//! Car-facing endpoints: instruction retrieval, ready signal and checkpoints.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::warn;

use relay_core::{ActionResponse, Checkpoint, Instruction, RelayError};

use crate::state::AppState;

/// Map a relay failure to the HTTP status it is reported with.
pub(crate) fn error_status(error: &RelayError) -> StatusCode {
    match error {
        RelayError::Status(_) => StatusCode::CONFLICT,
        RelayError::Invalid(_) => StatusCode::BAD_REQUEST,
        RelayError::Broker(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: RelayError) -> (StatusCode, Json<ActionResponse>) {
    (
        error_status(&error),
        Json(ActionResponse::failed(error.to_string())),
    )
}

/// All instructions decoded since the last reset.
pub async fn list_instructions(State(state): State<Arc<AppState>>) -> Json<Vec<Instruction>> {
    Json(state.service().instructions())
}

/// The next instruction not yet handed out, or `null`.
pub async fn next_instruction(State(state): State<Arc<AppState>>) -> Json<Option<Instruction>> {
    Json(state.service().next_instruction())
}

/// Produce the ready signal and start consuming.
pub async fn ready(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ActionResponse>) {
    match state.service().send_ready().await {
        Ok(_) => (StatusCode::OK, Json(ActionResponse::ok("Ready message sent"))),
        Err(e) => {
            warn!("Ready request failed: {}", e);
            failure(e)
        }
    }
}

/// Release the checkpoint's step and forward it to the checkpoint topic.
pub async fn checkpoint(
    State(state): State<Arc<AppState>>,
    Json(checkpoint): Json<Checkpoint>,
) -> (StatusCode, Json<ActionResponse>) {
    let step = checkpoint.step.clone();
    match state.service().submit_checkpoint(checkpoint).await {
        Ok(delivery) => (
            StatusCode::OK,
            Json(ActionResponse::ok(format!(
                "Checkpoint {} forwarded (offset {})",
                step, delivery.offset
            ))),
        ),
        Err(e) => {
            warn!("Checkpoint {} rejected: {}", step, e);
            failure(e)
        }
    }
}
