//! Callback endpoint for hypervisor agents.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::admin::callbacks::{self, CallbackRequest};
use crate::AppState;

use super::error::ApiError;

/// POST /agent/callback
///
/// Runs with the system membership; the agent token was checked by
/// the route's middleware.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CallbackRequest>,
) -> Result<StatusCode, ApiError> {
    let member = state.system_member();
    let mut tx = state.db.begin().await?;
    callbacks::handle(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}
