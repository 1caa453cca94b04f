//! Publish RPC
//!
//! Called by runners while executing a verb. Caller identity is part of the
//! body; the request key and trace context come from the authenticated call
//! headers.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::api::server::ApiState;
use crate::api::types::{ApiError, request_context_from_headers};

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Verb that published the event, `module.verb`
    pub caller: String,
    /// Event payload, base64
    pub payload: String,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub event: String,
}

pub async fn publish(
    State(state): State<ApiState>,
    Path((module, topic)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let ctx = request_context_from_headers(&headers)?;
    let payload = BASE64
        .decode(&body.payload)
        .map_err(|e| ApiError::bad_request("INVALID_PAYLOAD", format!("Bad base64 payload: {e}")))?;

    let key = state
        .publisher
        .publish(&module, &topic, &body.caller, &payload, &ctx)
        .await?;

    Ok(Json(PublishResponse {
        event: key.to_string(),
    }))
}
