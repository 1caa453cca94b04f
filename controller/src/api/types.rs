//! Shared API types
//!
//! Error responses and the request-context extraction used by the publish
//! and log-ingest endpoints.

use axum::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::data::DataError;
use crate::domain::deployments::ReconcileError;
use crate::domain::pubsub::PublishError;
use crate::model::context::{RequestContext, TraceContext};
use crate::model::keys::RequestKey;

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound { code: String, message: String },
    Conflict { code: String, message: String },
    ServiceUnavailable { message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<DataError> for ApiError {
    fn from(e: DataError) -> Self {
        match &e {
            DataError::NotFound(what) => Self::NotFound {
                code: "NOT_FOUND".to_string(),
                message: format!("{what} not found"),
            },
            DataError::Conflict(message) => Self::Conflict {
                code: "CONFLICT".to_string(),
                message: message.clone(),
            },
            DataError::Payload(message) => Self::BadRequest {
                code: "PAYLOAD".to_string(),
                message: message.clone(),
            },
            DataError::Transient(_) => {
                tracing::warn!(error = %e, "Transient store error");
                Self::ServiceUnavailable {
                    message: "Store temporarily unavailable".to_string(),
                }
            }
            _ => {
                tracing::error!(error = %e, "Store error");
                Self::Internal {
                    message: "Database operation failed".to_string(),
                }
            }
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::NoRequestContext => {
                Self::bad_request("NO_REQUEST_CONTEXT", "Missing x-request-key header")
            }
            PublishError::TopicNotFound { module, topic } => {
                Self::not_found("TOPIC_NOT_FOUND", format!("Unknown topic {module}.{topic}"))
            }
            PublishError::Codec(e) => Self::bad_request("PAYLOAD", e.to_string()),
            PublishError::Data(e) => e.into(),
        }
    }
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::TopicNotFound { .. } => {
                Self::bad_request("TOPIC_NOT_FOUND", e.to_string())
            }
            ReconcileError::SubscriptionNotFound { .. } | ReconcileError::DeploymentNotFound => {
                Self::not_found("NOT_FOUND", e.to_string())
            }
            ReconcileError::EmptyTopic { .. } => Self::bad_request("EMPTY_TOPIC", e.to_string()),
            ReconcileError::Schema(e) => Self::bad_request("INVALID_SCHEMA", e.to_string()),
            ReconcileError::Key(e) => Self::bad_request("INVALID_NAME", e.to_string()),
            ReconcileError::Data(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match self {
            Self::BadRequest { code, message } => {
                (StatusCode::BAD_REQUEST, "bad_request", code, message)
            }
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, "not_found", code, message),
            Self::Conflict { code, message } => (StatusCode::CONFLICT, "conflict", code, message),
            Self::ServiceUnavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "SERVICE_UNAVAILABLE".to_string(),
                message,
            ),
            Self::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "INTERNAL".to_string(),
                message,
            ),
        };
        (
            status,
            Json(serde_json::json!({
                "error": error_type,
                "code": code,
                "message": message
            })),
        )
            .into_response()
    }
}

/// Build the ambient request context from call headers.
///
/// A malformed `x-request-key` is a client error; missing is legal here and
/// rejected (or not) by the operation itself.
pub fn request_context_from_headers(headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let request_key = match headers.get("x-request-key").and_then(|v| v.to_str().ok()) {
        Some(raw) => Some(RequestKey::parse(raw).map_err(|e| {
            ApiError::bad_request("INVALID_REQUEST_KEY", format!("Bad x-request-key: {e}"))
        })?),
        None => None,
    };

    let trace = headers
        .get("traceparent")
        .and_then(|v| v.to_str().ok())
        .map(|traceparent| TraceContext {
            traceparent: traceparent.to_string(),
            tracestate: headers
                .get("tracestate")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
        });

    Ok(RequestContext { request_key, trace })
}
