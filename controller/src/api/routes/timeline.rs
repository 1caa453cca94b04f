//! Console timeline endpoints
//!
//! One-shot filtered query plus an SSE stream that re-polls the store and
//! pushes deltas until the client disconnects. Streaming uses wall-clock
//! watermarks: each poll asks for events strictly newer than the previous
//! poll time.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};

use crate::api::server::ApiState;
use crate::api::types::ApiError;
use crate::core::constants::{STREAM_MIN_INTERVAL_MS, TIMELINE_DEFAULT_LIMIT, TIMELINE_MAX_LIMIT};
use crate::data::sqlite::repositories::timeline::{
    EventType, LogLevel, Order, TimelineEvent, TimelineFilters, query_timeline,
};
use crate::utils::time::{now_ms, parse_rfc3339_ms};

fn default_limit() -> u32 {
    TIMELINE_DEFAULT_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct TimelineQueryRequest {
    #[serde(flatten)]
    pub filters: TimelineFilters,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub order: Order,
}

#[derive(Debug, Serialize)]
pub struct TimelineQueryResponse {
    pub events: Vec<TimelineEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
}

pub async fn query(
    State(state): State<ApiState>,
    Json(body): Json<TimelineQueryRequest>,
) -> Result<Json<TimelineQueryResponse>, ApiError> {
    if body.limit == 0 || body.limit > TIMELINE_MAX_LIMIT {
        return Err(ApiError::bad_request(
            "INVALID_LIMIT",
            format!("Limit must be between 1 and {TIMELINE_MAX_LIMIT}"),
        ));
    }

    let (events, cursor) = query_timeline(&state.pool, &body.filters, body.limit, body.order).await?;
    Ok(Json(TimelineQueryResponse { events, cursor }))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated deployment keys
    pub deployments: Option<String>,
    /// Comma-separated request keys
    pub requests: Option<String>,
    /// Comma-separated event types
    pub event_types: Option<String>,
    /// Minimum log level name (trace, debug, info, warn, error)
    pub min_log_level: Option<String>,
    /// Only stream events newer than this RFC 3339 timestamp
    pub newer_than: Option<String>,
    pub limit: Option<u32>,
    pub update_interval_ms: Option<u64>,
}

fn parse_log_level(s: &str) -> Option<LogLevel> {
    match s {
        "trace" => Some(LogLevel::Trace),
        "debug" => Some(LogLevel::Debug),
        "info" => Some(LogLevel::Info),
        "warn" => Some(LogLevel::Warn),
        "error" => Some(LogLevel::Error),
        _ => None,
    }
}

fn csv(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl StreamQuery {
    fn filters(&self) -> Result<TimelineFilters, ApiError> {
        let event_types = csv(&self.event_types)
            .iter()
            .map(|t| {
                EventType::parse(t).ok_or_else(|| {
                    ApiError::bad_request("INVALID_EVENT_TYPE", format!("Unknown event type {t:?}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let min_log_level = match &self.min_log_level {
            Some(raw) => Some(parse_log_level(raw).ok_or_else(|| {
                ApiError::bad_request("INVALID_LOG_LEVEL", format!("Unknown log level {raw:?}"))
            })?),
            None => None,
        };
        let newer_than = match &self.newer_than {
            Some(raw) => Some(parse_rfc3339_ms(raw).ok_or_else(|| {
                ApiError::bad_request("INVALID_TIMESTAMP", format!("Bad RFC 3339 timestamp {raw:?}"))
            })?),
            None => None,
        };
        Ok(TimelineFilters {
            deployments: csv(&self.deployments),
            requests: csv(&self.requests),
            event_types,
            min_log_level,
            newer_than,
            ..Default::default()
        })
    }
}

pub async fn stream(
    State(state): State<ApiState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let base_filters = query.filters()?;
    let limit = query.limit.unwrap_or(TIMELINE_DEFAULT_LIMIT);
    if limit == 0 || limit > TIMELINE_MAX_LIMIT {
        return Err(ApiError::bad_request(
            "INVALID_LIMIT",
            format!("Limit must be between 1 and {TIMELINE_MAX_LIMIT}"),
        ));
    }
    let interval = Duration::from_millis(
        query
            .update_interval_ms
            .unwrap_or(STREAM_MIN_INTERVAL_MS)
            .max(STREAM_MIN_INTERVAL_MS),
    );

    let pool = state.pool.clone();
    let mut shutdown_rx = state.shutdown_rx.clone();

    let stream = async_stream::stream! {
        let mut last_poll = base_filters.newer_than.unwrap_or_else(now_ms);
        loop {
            let this_poll = now_ms();
            let filters = TimelineFilters {
                newer_than: Some(last_poll),
                ..base_filters.clone()
            };

            match query_timeline(&pool, &filters, limit, Order::Asc).await {
                Ok((events, _)) => {
                    for event in events {
                        match serde_json::to_string(&event) {
                            Ok(data) => yield Ok(Event::default().event("timeline").data(data)),
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to serialize timeline event");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Timeline stream poll failed");
                }
            }
            last_poll = this_poll;

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        yield Ok(Event::default().event("terminate").data("shutdown"));
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    ))
}
