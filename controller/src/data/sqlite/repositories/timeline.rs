//! Console timeline projection
//!
//! An append-only `events` log, distinct from `topic_events`: call outcomes,
//! verb log entries, and deployment lifecycle. Rows carry a discriminator
//! column plus nullable variant columns; reads hydrate the sum type from the
//! discriminator. Queries page id-descending by default with a cursor equal
//! to the id of the last returned event.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};

use crate::data::error::DataError;
use crate::model::schema::VerbRef;
use crate::utils::time::now_ms;

/// Timeline event discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Call,
    Log,
    DeploymentCreated,
    DeploymentUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Log => "log",
            Self::DeploymentCreated => "deployment_created",
            Self::DeploymentUpdated => "deployment_updated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(Self::Call),
            "log" => Some(Self::Log),
            "deployment_created" => Some(Self::DeploymentCreated),
            "deployment_updated" => Some(Self::DeploymentUpdated),
            _ => None,
        }
    }
}

/// Log severity, ordered so filters can express "warn and above"
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Trace),
            1 => Some(Self::Debug),
            2 => Some(Self::Info),
            3 => Some(Self::Warn),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// A call outcome recorded by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEntry {
    pub deployment_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_verb: Option<VerbRef>,
    pub dest_verb: VerbRef,
    pub duration_ms: i64,
    pub request: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A log line emitted by verb code, ingested from runners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub deployment_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A deployment lifecycle change recorded by the reconciler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub deployment_key: String,
    pub module_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced_deployment: Option<String>,
}

/// One hydrated timeline event
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub id: i64,
    pub time_stamp: i64,
    #[serde(flatten)]
    pub entry: TimelineEntry,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "entry", rename_all = "snake_case")]
pub enum TimelineEntry {
    Call(CallEntry),
    Log(LogEntry),
    DeploymentCreated(DeploymentEntry),
    DeploymentUpdated(DeploymentEntry),
}

pub async fn insert_call_event(
    conn: &mut SqliteConnection,
    entry: &CallEntry,
) -> Result<i64, DataError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events
            (time_stamp, event_type, deployment_key, request_key, source_module, source_verb,
             dest_module, dest_verb, duration_ms, request, response, error)
        VALUES (?, 'call', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(now_ms())
    .bind(&entry.deployment_key)
    .bind(entry.request_key.as_deref())
    .bind(entry.source_verb.as_ref().map(|v| v.module.as_str()))
    .bind(entry.source_verb.as_ref().map(|v| v.name.as_str()))
    .bind(&entry.dest_verb.module)
    .bind(&entry.dest_verb.name)
    .bind(entry.duration_ms)
    .bind(&entry.request)
    .bind(entry.response.as_deref())
    .bind(entry.error.as_deref())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_log_event(
    conn: &mut SqliteConnection,
    entry: &LogEntry,
) -> Result<i64, DataError> {
    let attributes = serde_json::Value::Object(entry.attributes.clone()).to_string();
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events
            (time_stamp, event_type, deployment_key, request_key, log_level, message, attributes, error)
        VALUES (?, 'log', ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(now_ms())
    .bind(&entry.deployment_key)
    .bind(entry.request_key.as_deref())
    .bind(entry.level.as_i64())
    .bind(&entry.message)
    .bind(attributes)
    .bind(entry.error.as_deref())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

pub async fn insert_deployment_event(
    conn: &mut SqliteConnection,
    event_type: EventType,
    entry: &DeploymentEntry,
) -> Result<i64, DataError> {
    debug_assert!(matches!(
        event_type,
        EventType::DeploymentCreated | EventType::DeploymentUpdated
    ));
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events (time_stamp, event_type, deployment_key, module_name, replaced_deployment)
        VALUES (?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(now_ms())
    .bind(event_type.as_str())
    .bind(&entry.deployment_key)
    .bind(&entry.module_name)
    .bind(entry.replaced_deployment.as_deref())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Filter on call dimensions
#[derive(Debug, Clone, Deserialize)]
pub struct CallFilter {
    #[serde(default)]
    pub source_module: Option<String>,
    pub dest_module: String,
    #[serde(default)]
    pub dest_verb: Option<String>,
}

/// Result ordering; id-descending is the console default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

/// Timeline query filters; all are conjunctive, empty vecs mean "any"
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineFilters {
    #[serde(default)]
    pub deployments: Vec<String>,
    #[serde(default)]
    pub requests: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<EventType>,
    /// Keep log events at or above this level; other event types pass
    #[serde(default)]
    pub min_log_level: Option<LogLevel>,
    /// Exclusive lower bound on time_stamp (ms)
    #[serde(default)]
    pub newer_than: Option<i64>,
    /// Exclusive upper bound on time_stamp (ms)
    #[serde(default)]
    pub older_than: Option<i64>,
    /// Exclusive lower bound on event id
    #[serde(default)]
    pub id_higher_than: Option<i64>,
    /// Exclusive upper bound on event id
    #[serde(default)]
    pub id_lower_than: Option<i64>,
    #[serde(default)]
    pub call: Option<CallFilter>,
}

enum Param {
    Int(i64),
    Text(String),
}

fn build_where(filters: &TimelineFilters) -> (String, Vec<Param>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Param> = Vec::new();

    if !filters.deployments.is_empty() {
        let marks = vec!["?"; filters.deployments.len()].join(", ");
        clauses.push(format!("deployment_key IN ({marks})"));
        params.extend(filters.deployments.iter().cloned().map(Param::Text));
    }
    if !filters.requests.is_empty() {
        let marks = vec!["?"; filters.requests.len()].join(", ");
        clauses.push(format!("request_key IN ({marks})"));
        params.extend(filters.requests.iter().cloned().map(Param::Text));
    }
    if !filters.event_types.is_empty() {
        let marks = vec!["?"; filters.event_types.len()].join(", ");
        clauses.push(format!("event_type IN ({marks})"));
        params.extend(
            filters
                .event_types
                .iter()
                .map(|t| Param::Text(t.as_str().to_string())),
        );
    }
    if let Some(level) = filters.min_log_level {
        clauses.push("(event_type <> 'log' OR log_level >= ?)".to_string());
        params.push(Param::Int(level.as_i64()));
    }
    if let Some(t) = filters.newer_than {
        clauses.push("time_stamp > ?".to_string());
        params.push(Param::Int(t));
    }
    if let Some(t) = filters.older_than {
        clauses.push("time_stamp < ?".to_string());
        params.push(Param::Int(t));
    }
    if let Some(id) = filters.id_higher_than {
        clauses.push("id > ?".to_string());
        params.push(Param::Int(id));
    }
    if let Some(id) = filters.id_lower_than {
        clauses.push("id < ?".to_string());
        params.push(Param::Int(id));
    }
    if let Some(call) = &filters.call {
        clauses.push("event_type = 'call'".to_string());
        clauses.push("dest_module = ?".to_string());
        params.push(Param::Text(call.dest_module.clone()));
        if let Some(source) = &call.source_module {
            clauses.push("source_module = ?".to_string());
            params.push(Param::Text(source.clone()));
        }
        if let Some(verb) = &call.dest_verb {
            clauses.push("dest_verb = ?".to_string());
            params.push(Param::Text(verb.clone()));
        }
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), params)
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    time_stamp: i64,
    event_type: String,
    deployment_key: String,
    request_key: Option<String>,
    source_module: Option<String>,
    source_verb: Option<String>,
    dest_module: Option<String>,
    dest_verb: Option<String>,
    duration_ms: Option<i64>,
    request: Option<String>,
    response: Option<String>,
    error: Option<String>,
    log_level: Option<i64>,
    message: Option<String>,
    attributes: Option<String>,
    module_name: Option<String>,
    replaced_deployment: Option<String>,
}

impl EventRow {
    fn hydrate(self) -> Result<TimelineEvent, DataError> {
        let corrupt = |what: &str| DataError::Internal(format!("corrupt timeline row: {what}"));
        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| corrupt("unknown event_type"))?;

        let entry = match event_type {
            EventType::Call => TimelineEntry::Call(CallEntry {
                deployment_key: self.deployment_key,
                request_key: self.request_key,
                source_verb: match (self.source_module, self.source_verb) {
                    (Some(module), Some(verb)) => Some(VerbRef::new(module, verb)),
                    _ => None,
                },
                dest_verb: VerbRef::new(
                    self.dest_module.ok_or_else(|| corrupt("dest_module"))?,
                    self.dest_verb.ok_or_else(|| corrupt("dest_verb"))?,
                ),
                duration_ms: self.duration_ms.unwrap_or(0),
                request: self.request.unwrap_or_default(),
                response: self.response,
                error: self.error,
            }),
            EventType::Log => TimelineEntry::Log(LogEntry {
                deployment_key: self.deployment_key,
                request_key: self.request_key,
                level: LogLevel::from_i64(self.log_level.unwrap_or(2))
                    .ok_or_else(|| corrupt("log_level"))?,
                message: self.message.unwrap_or_default(),
                attributes: self
                    .attributes
                    .and_then(|a| serde_json::from_str(&a).ok())
                    .unwrap_or_default(),
                error: self.error,
            }),
            EventType::DeploymentCreated | EventType::DeploymentUpdated => {
                let entry = DeploymentEntry {
                    deployment_key: self.deployment_key,
                    module_name: self.module_name.unwrap_or_default(),
                    replaced_deployment: self.replaced_deployment,
                };
                if event_type == EventType::DeploymentCreated {
                    TimelineEntry::DeploymentCreated(entry)
                } else {
                    TimelineEntry::DeploymentUpdated(entry)
                }
            }
        };

        Ok(TimelineEvent {
            id: self.id,
            time_stamp: self.time_stamp,
            entry,
        })
    }
}

/// Query the timeline.
///
/// Fetches `limit + 1` rows; when more results exist past the page the
/// returned cursor echoes the id of the last event in the page.
pub async fn query_timeline(
    pool: &SqlitePool,
    filters: &TimelineFilters,
    limit: u32,
    order: Order,
) -> Result<(Vec<TimelineEvent>, Option<i64>), DataError> {
    let (where_clause, params) = build_where(filters);
    let direction = match order {
        Order::Asc => "ASC",
        Order::Desc => "DESC",
    };
    let sql = format!(
        r#"
        SELECT id, time_stamp, event_type, deployment_key, request_key,
               source_module, source_verb, dest_module, dest_verb, duration_ms,
               request, response, error, log_level, message, attributes,
               module_name, replaced_deployment
        FROM events
        {where_clause}
        ORDER BY id {direction}
        LIMIT ?
        "#
    );

    let mut query = sqlx::query_as::<_, EventRow>(&sql);
    for param in &params {
        query = match param {
            Param::Int(v) => query.bind(*v),
            Param::Text(v) => query.bind(v.clone()),
        };
    }
    let rows = query.bind(limit as i64 + 1).fetch_all(pool).await?;

    let more = rows.len() > limit as usize;
    let events = rows
        .into_iter()
        .take(limit as usize)
        .map(EventRow::hydrate)
        .collect::<Result<Vec<_>, _>>()?;
    let cursor = if more {
        events.last().map(|e| e.id)
    } else {
        None
    };

    Ok((events, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::test_pool;

    fn call_entry(deployment: &str, dest: VerbRef, request_key: Option<&str>) -> CallEntry {
        CallEntry {
            deployment_key: deployment.to_string(),
            request_key: request_key.map(|s| s.to_string()),
            source_verb: None,
            dest_verb: dest,
            duration_ms: 5,
            request: "{}".to_string(),
            response: Some("{}".to_string()),
            error: None,
        }
    }

    fn log_entry(deployment: &str, level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            deployment_key: deployment.to_string(),
            request_key: None,
            level,
            message: message.to_string(),
            attributes: serde_json::Map::new(),
            error: None,
        }
    }

    async fn seed(pool: &SqlitePool) {
        let mut conn = pool.acquire().await.unwrap();
        insert_deployment_event(
            &mut conn,
            EventType::DeploymentCreated,
            &DeploymentEntry {
                deployment_key: "dep-billing-a".to_string(),
                module_name: "billing".to_string(),
                replaced_deployment: None,
            },
        )
        .await
        .unwrap();
        insert_call_event(
            &mut conn,
            &call_entry(
                "dep-billing-a",
                VerbRef::new("billing", "send_email"),
                Some("req-r1"),
            ),
        )
        .await
        .unwrap();
        insert_log_event(&mut conn, &log_entry("dep-billing-a", LogLevel::Debug, "starting"))
            .await
            .unwrap();
        insert_log_event(&mut conn, &log_entry("dep-shipping-b", LogLevel::Error, "boom"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_query_desc_default_and_hydration() {
        let pool = test_pool().await;
        seed(&pool).await;

        let (events, cursor) =
            query_timeline(&pool, &TimelineFilters::default(), 10, Order::Desc)
                .await
                .unwrap();
        assert_eq!(events.len(), 4);
        assert!(cursor.is_none());
        // id-descending: last inserted first
        assert!(events.windows(2).all(|w| w[0].id > w[1].id));
        assert!(matches!(events[3].entry, TimelineEntry::DeploymentCreated(_)));
    }

    #[tokio::test]
    async fn test_cursor_echoes_last_id_when_more() {
        let pool = test_pool().await;
        seed(&pool).await;

        let (events, cursor) =
            query_timeline(&pool, &TimelineFilters::default(), 2, Order::Desc)
                .await
                .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(cursor, Some(events[1].id));

        // Follow the cursor
        let filters = TimelineFilters {
            id_lower_than: cursor,
            ..Default::default()
        };
        let (rest, cursor) = query_timeline(&pool, &filters, 2, Order::Desc).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn test_filter_by_type_and_deployment() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filters = TimelineFilters {
            event_types: vec![EventType::Log],
            deployments: vec!["dep-billing-a".to_string()],
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].entry {
            TimelineEntry::Log(log) => assert_eq!(log.message, "starting"),
            other => panic!("expected log, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_filter_by_request() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filters = TimelineFilters {
            requests: vec!["req-r1".to_string()],
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].entry, TimelineEntry::Call(_)));
    }

    #[tokio::test]
    async fn test_min_log_level_keeps_other_types() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filters = TimelineFilters {
            min_log_level: Some(LogLevel::Warn),
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        // debug log filtered out; error log, call, deployment event stay
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| match &e.entry {
            TimelineEntry::Log(l) => l.level >= LogLevel::Warn,
            _ => true,
        }));
    }

    #[tokio::test]
    async fn test_call_filter_dimensions() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filters = TimelineFilters {
            call: Some(CallFilter {
                source_module: None,
                dest_module: "billing".to_string(),
                dest_verb: Some("send_email".to_string()),
            }),
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        assert_eq!(events.len(), 1);

        let filters = TimelineFilters {
            call: Some(CallFilter {
                source_module: None,
                dest_module: "shipping".to_string(),
                dest_verb: None,
            }),
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_ascending_order() {
        let pool = test_pool().await;
        seed(&pool).await;

        let (events, _) = query_timeline(&pool, &TimelineFilters::default(), 10, Order::Asc)
            .await
            .unwrap();
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_newer_than_excludes_old_rows() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filters = TimelineFilters {
            newer_than: Some(now_ms() + 60_000),
            ..Default::default()
        };
        let (events, _) = query_timeline(&pool, &filters, 10, Order::Desc).await.unwrap();
        assert!(events.is_empty());
    }
}
