//! Deployment lifecycle endpoints
//!
//! Activation and teardown run through the reconciler; the log-ingest
//! endpoint lets runners forward log entries emitted by verb code into the
//! console timeline.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::api::server::ApiState;
use crate::api::types::{ApiError, request_context_from_headers};
use crate::data::sqlite::repositories::{deployments, timeline};
use crate::model::keys::DeploymentKey;
use crate::model::schema::ModuleSchema;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub schema: ModuleSchema,
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateDeploymentResponse {
    pub key: String,
}

pub async fn create(
    State(state): State<ApiState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<CreateDeploymentResponse>), ApiError> {
    let key = state
        .reconciler
        .activate(&body.schema, body.endpoint.as_deref())
        .await?;
    state.routes.invalidate(&body.schema.name);
    Ok((
        StatusCode::CREATED,
        Json(CreateDeploymentResponse {
            key: key.to_string(),
        }),
    ))
}

pub async fn delete(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = DeploymentKey::parse(&key)
        .map_err(|e| ApiError::bad_request("INVALID_KEY", e.to_string()))?;
    state.reconciler.deactivate(&key).await?;
    state.routes.invalidate(&key.module);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct DeploymentSummary {
    pub key: String,
    pub module: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

pub async fn list(
    State(state): State<ApiState>,
) -> Result<Json<Vec<DeploymentSummary>>, ApiError> {
    let rows = deployments::list_deployments(&state.pool).await?;
    Ok(Json(
        rows.into_iter()
            .map(|d| DeploymentSummary {
                key: d.key.to_string(),
                module: d.module,
                endpoint: d.endpoint,
                active: d.active,
                created_at: d.created_at,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct IngestLogRequest {
    pub level: timeline::LogLevel,
    pub message: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

pub async fn ingest_log(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<IngestLogRequest>,
) -> Result<StatusCode, ApiError> {
    let key = DeploymentKey::parse(&key)
        .map_err(|e| ApiError::bad_request("INVALID_KEY", e.to_string()))?;
    let ctx = request_context_from_headers(&headers)?;

    let mut conn = state
        .pool
        .acquire()
        .await
        .map_err(crate::data::DataError::from)?;
    timeline::insert_log_event(
        &mut conn,
        &timeline::LogEntry {
            deployment_key: key.to_string(),
            request_key: ctx.request_key.map(|k| k.to_string()),
            level: body.level,
            message: body.message,
            attributes: body.attributes,
            error: body.error,
        },
    )
    .await?;
    Ok(StatusCode::ACCEPTED)
}
