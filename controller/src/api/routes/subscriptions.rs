//! Subscription admin endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::api::server::ApiState;
use crate::api::types::ApiError;

/// Reset a subscription's cursor to the head of its topic
pub async fn reset(
    State(state): State<ApiState>,
    Path((module, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.reconciler.reset_subscription(&module, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
