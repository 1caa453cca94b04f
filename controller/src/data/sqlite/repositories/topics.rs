//! Topic repository: topics and the append-only event journal
//!
//! `append_event` is the only writer of `topic_events`; rows are immutable
//! after insert and the topic head only ever advances.

use sqlx::SqliteConnection;

use crate::data::error::DataError;
use crate::data::types::TopicRow;
use crate::model::keys::TopicEventKey;
use crate::utils::time::now_ms;

/// Create the topic if it doesn't exist, returning its id either way.
/// Callers hold the enclosing write transaction, which serializes races on
/// the `(module, name)` uniqueness.
pub async fn upsert_topic(
    conn: &mut SqliteConnection,
    module: &str,
    name: &str,
) -> Result<i64, DataError> {
    if let Some(topic) = get_topic(&mut *conn, module, name).await? {
        return Ok(topic.id);
    }

    let key = format!("top-{}-{}", module, name);
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO topics (key, module, name, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(&key)
    .bind(module)
    .bind(name)
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

/// Get a topic by module and name
pub async fn get_topic(
    conn: &mut SqliteConnection,
    module: &str,
    name: &str,
) -> Result<Option<TopicRow>, DataError> {
    let row = sqlx::query_as::<_, (i64, String, String, Option<i64>)>(
        "SELECT id, module, name, head FROM topics WHERE module = ? AND name = ?",
    )
    .bind(module)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|(id, module, name, head)| TopicRow {
        id,
        module,
        name,
        head,
    }))
}

/// Head event id of a topic, None while the topic has no events
pub async fn topic_head(conn: &mut SqliteConnection, topic_id: i64) -> Result<Option<i64>, DataError> {
    let head: Option<i64> = sqlx::query_scalar("SELECT head FROM topics WHERE id = ?")
        .bind(topic_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(head)
}

/// Append an event to a topic and advance the head to it.
///
/// Returns the new event's row id. The caller owns the transaction; the
/// append and the head advance commit together.
#[allow(clippy::too_many_arguments)]
pub async fn append_event(
    conn: &mut SqliteConnection,
    module: &str,
    topic: &str,
    caller: &str,
    payload: &[u8],
    request_key: Option<&str>,
    trace_context: Option<&str>,
) -> Result<(i64, TopicEventKey), DataError> {
    let Some(topic_row) = get_topic(&mut *conn, module, topic).await? else {
        return Err(DataError::NotFound("topic"));
    };

    let key = TopicEventKey::new(module, topic)
        .map_err(|e| DataError::Payload(format!("invalid topic name: {e}")))?;

    let event_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO topic_events (key, topic_id, caller, payload, request_key, trace_context, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(key.to_string())
    .bind(topic_row.id)
    .bind(caller)
    .bind(payload)
    .bind(request_key)
    .bind(trace_context)
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE topics SET head = ? WHERE id = ?")
        .bind(event_id)
        .bind(topic_row.id)
        .execute(&mut *conn)
        .await?;

    Ok((event_id, key))
}
