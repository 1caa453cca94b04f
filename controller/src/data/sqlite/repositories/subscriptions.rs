//! Subscription repository: cursors, subscribers, and the consumption gate
//!
//! The `topic_event_consumptions` primary key is what makes delivery
//! exactly-once-per-claim: while a consumption row exists for a
//! subscription, no other transaction can claim another event for it.

use sqlx::SqliteConnection;

use crate::data::error::DataError;
use crate::data::types::{NextEvent, SubscriberRow, SubscriptionRow};
use crate::model::keys::{SubscriberKey, SubscriptionKey};
use crate::model::schema::VerbRef;
use crate::utils::time::now_ms;

/// Insert or update a subscription. Returns `(id, inserted)`.
///
/// The key is deterministic, so redeploying a module converges on the same
/// row; only the owning deployment changes. The cursor is never touched on
/// update.
pub async fn upsert_subscription(
    conn: &mut SqliteConnection,
    key: &SubscriptionKey,
    deployment_key: &str,
    topic_id: i64,
) -> Result<(i64, bool), DataError> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM subscriptions WHERE key = ?")
        .bind(key.to_string())
        .fetch_optional(&mut *conn)
        .await?;

    let now = now_ms();
    if let Some(id) = existing {
        sqlx::query(
            "UPDATE subscriptions SET deployment_key = ?, topic_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(deployment_key)
        .bind(topic_id)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        return Ok((id, false));
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO subscriptions (key, module, name, deployment_key, topic_id, cursor, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, NULL, ?, ?)
        RETURNING id
        "#,
    )
    .bind(key.to_string())
    .bind(&key.module)
    .bind(&key.name)
    .bind(deployment_key)
    .bind(topic_id)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok((id, true))
}

/// Get a subscription by module and name
pub async fn get_subscription(
    conn: &mut SqliteConnection,
    module: &str,
    name: &str,
) -> Result<SubscriptionRow, DataError> {
    let row = sqlx::query_as::<_, (i64, String, i64, String, Option<i64>)>(
        "SELECT id, key, topic_id, deployment_key, cursor FROM subscriptions WHERE module = ? AND name = ?",
    )
    .bind(module)
    .bind(name)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(DataError::NotFound("subscription"))?;

    hydrate_subscription(row)
}

fn hydrate_subscription(
    (id, key, topic_id, deployment_key, cursor): (i64, String, i64, String, Option<i64>),
) -> Result<SubscriptionRow, DataError> {
    let key = SubscriptionKey::parse(&key)
        .map_err(|e| DataError::Internal(format!("corrupt subscription key: {e}")))?;
    Ok(SubscriptionRow {
        id,
        key,
        topic_id,
        deployment_key,
        cursor,
    })
}

/// Subscriptions whose topic head has moved past their cursor (or that have
/// no cursor yet and a non-empty topic).
///
/// Callers must hold the enclosing write transaction: on SQLite the writer
/// lock is what isolates concurrent controllers for the duration of a
/// progressor pass.
pub async fn subscriptions_needing_update(
    conn: &mut SqliteConnection,
) -> Result<Vec<SubscriptionRow>, DataError> {
    let rows = sqlx::query_as::<_, (i64, String, i64, String, Option<i64>)>(
        r#"
        SELECT s.id, s.key, s.topic_id, s.deployment_key, s.cursor
        FROM subscriptions s
        JOIN topics t ON t.id = s.topic_id
        WHERE t.head IS NOT NULL
          AND (s.cursor IS NULL OR s.cursor < t.head)
        ORDER BY s.id
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(hydrate_subscription).collect()
}

/// The next event the subscription should consume, if any.
///
/// A null cursor means the subscription is new and starts at the topic head
/// rather than replaying the backlog. `ready` is false while the event is
/// younger than `consumption_delay_ms`, leaving time for concurrent
/// publishes to become visible in id order.
pub async fn next_event_for_subscription(
    conn: &mut SqliteConnection,
    sub: &SubscriptionRow,
    consumption_delay_ms: i64,
) -> Result<Option<NextEvent>, DataError> {
    let row = match sub.cursor {
        Some(cursor) => {
            sqlx::query_as::<_, (i64, Vec<u8>, String, Option<String>, Option<String>, i64)>(
                r#"
                SELECT id, payload, caller, request_key, trace_context, created_at
                FROM topic_events
                WHERE topic_id = ? AND id > ?
                ORDER BY id
                LIMIT 1
                "#,
            )
            .bind(sub.topic_id)
            .bind(cursor)
            .fetch_optional(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as::<_, (i64, Vec<u8>, String, Option<String>, Option<String>, i64)>(
                r#"
                SELECT e.id, e.payload, e.caller, e.request_key, e.trace_context, e.created_at
                FROM topic_events e
                JOIN topics t ON t.id = e.topic_id
                WHERE t.id = ? AND e.id = t.head
                "#,
            )
            .bind(sub.topic_id)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    Ok(row.map(
        |(event_id, payload, caller, request_key, trace_context, created_at)| NextEvent {
            event_id,
            payload,
            caller,
            request_key,
            trace_context,
            ready: now_ms() - created_at >= consumption_delay_ms,
        },
    ))
}

/// A uniformly random live subscriber of the subscription
pub async fn random_subscriber(
    conn: &mut SqliteConnection,
    subscription_id: i64,
) -> Result<Option<SubscriberRow>, DataError> {
    type Row = (
        i64,
        String,
        String,
        String,
        i64,
        i64,
        i64,
        Option<String>,
        Option<String>,
    );
    let row = sqlx::query_as::<_, Row>(
        r#"
        SELECT id, key, sink_module, sink_verb, retry_attempts, backoff_ms, max_backoff_ms,
               catch_module, catch_verb
        FROM subscribers
        WHERE subscription_id = ?
        ORDER BY RANDOM()
        LIMIT 1
        "#,
    )
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(hydrate_subscriber).transpose()
}

fn hydrate_subscriber(
    (id, key, sink_module, sink_verb, retry_attempts, backoff_ms, max_backoff_ms, catch_module, catch_verb): (
        i64,
        String,
        String,
        String,
        i64,
        i64,
        i64,
        Option<String>,
        Option<String>,
    ),
) -> Result<SubscriberRow, DataError> {
    let key = SubscriberKey::parse(&key)
        .map_err(|e| DataError::Internal(format!("corrupt subscriber key: {e}")))?;
    let catch = match (catch_module, catch_verb) {
        (Some(module), Some(verb)) => Some(VerbRef::new(module, verb)),
        _ => None,
    };
    Ok(SubscriberRow {
        id,
        key,
        sink: VerbRef::new(sink_module, sink_verb),
        retry_attempts,
        backoff_ms,
        max_backoff_ms,
        catch,
    })
}

/// Register a subscriber on a subscription
#[allow(clippy::too_many_arguments)]
pub async fn insert_subscriber(
    conn: &mut SqliteConnection,
    key: &SubscriberKey,
    subscription_id: i64,
    deployment_key: &str,
    sink: &VerbRef,
    retry_attempts: i64,
    backoff_ms: i64,
    max_backoff_ms: i64,
    catch: Option<&VerbRef>,
) -> Result<(), DataError> {
    sqlx::query(
        r#"
        INSERT INTO subscribers
            (key, subscription_id, deployment_key, sink_module, sink_verb,
             retry_attempts, backoff_ms, max_backoff_ms, catch_module, catch_verb, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(key.to_string())
    .bind(subscription_id)
    .bind(deployment_key)
    .bind(&sink.module)
    .bind(&sink.name)
    .bind(retry_attempts)
    .bind(backoff_ms)
    .bind(max_backoff_ms)
    .bind(catch.map(|c| c.module.as_str()))
    .bind(catch.map(|c| c.name.as_str()))
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Claim the event for this subscription. Fails with `Conflict` when a
/// delivery is already in flight.
pub async fn begin_consuming(
    conn: &mut SqliteConnection,
    subscription_id: i64,
    event_id: i64,
) -> Result<(), DataError> {
    sqlx::query(
        "INSERT INTO topic_event_consumptions (subscription_id, event_id, started_at) VALUES (?, ?, ?)",
    )
    .bind(subscription_id)
    .bind(event_id)
    .bind(now_ms())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Advance the cursor to the in-flight event and release the gate.
///
/// No-op when there is no consumption row (the cursor already advanced, e.g.
/// at retry exhaustion). The cursor can only move forward.
pub async fn complete_event_for_subscription(
    conn: &mut SqliteConnection,
    subscription_id: i64,
) -> Result<bool, DataError> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET cursor = (SELECT event_id FROM topic_event_consumptions WHERE subscription_id = ?),
            updated_at = ?
        WHERE id = ?
          AND EXISTS (SELECT 1 FROM topic_event_consumptions WHERE subscription_id = ?)
        "#,
    )
    .bind(subscription_id)
    .bind(now_ms())
    .bind(subscription_id)
    .bind(subscription_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM topic_event_consumptions WHERE subscription_id = ?")
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Force the cursor to a specific event id (subscription reset)
pub async fn set_cursor(
    conn: &mut SqliteConnection,
    subscription_id: i64,
    event_id: i64,
) -> Result<(), DataError> {
    sqlx::query("UPDATE subscriptions SET cursor = ?, updated_at = ? WHERE id = ?")
        .bind(event_id)
        .bind(now_ms())
        .bind(subscription_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Remove all subscribers owned by a deployment, returning their keys
pub async fn delete_subscribers_for_deployment(
    conn: &mut SqliteConnection,
    deployment_key: &str,
) -> Result<Vec<String>, DataError> {
    let keys: Vec<String> =
        sqlx::query_scalar("DELETE FROM subscribers WHERE deployment_key = ? RETURNING key")
            .bind(deployment_key)
            .fetch_all(&mut *conn)
            .await?;
    Ok(keys)
}

/// Remove all subscriptions owned by a deployment, returning their keys
pub async fn delete_subscriptions_for_deployment(
    conn: &mut SqliteConnection,
    deployment_key: &str,
) -> Result<Vec<String>, DataError> {
    let keys: Vec<String> =
        sqlx::query_scalar("DELETE FROM subscriptions WHERE deployment_key = ? RETURNING key")
            .bind(deployment_key)
            .fetch_all(&mut *conn)
            .await?;
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::repositories::topics;
    use crate::data::sqlite::test_pool;

    async fn seed(conn: &mut SqliteConnection) -> (i64, i64) {
        let topic_id = topics::upsert_topic(conn, "billing", "invoices").await.unwrap();
        let key = SubscriptionKey::new("billing", "new_invoices").unwrap();
        let (sub_id, inserted) = upsert_subscription(conn, &key, "dep-billing-x", topic_id)
            .await
            .unwrap();
        assert!(inserted);
        (topic_id, sub_id)
    }

    async fn publish(conn: &mut SqliteConnection, payload: &[u8]) -> i64 {
        topics::append_event(conn, "billing", "invoices", "billing.create", payload, None, None)
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn test_upsert_subscription_converges() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (topic_id, sub_id) = seed(&mut conn).await;

        let key = SubscriptionKey::new("billing", "new_invoices").unwrap();
        let (again, inserted) = upsert_subscription(&mut conn, &key, "dep-billing-y", topic_id)
            .await
            .unwrap();
        assert_eq!(again, sub_id);
        assert!(!inserted);

        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        assert_eq!(sub.deployment_key, "dep-billing-y");
    }

    #[tokio::test]
    async fn test_needing_update_requires_head_past_cursor() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;

        // Empty topic: nothing to do even with a null cursor
        assert!(subscriptions_needing_update(&mut conn).await.unwrap().is_empty());

        let first = publish(&mut conn, b"a").await;
        let subs = subscriptions_needing_update(&mut conn).await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id, sub_id);

        // Cursor at head: caught up
        set_cursor(&mut conn, sub_id, first).await.unwrap();
        assert!(subscriptions_needing_update(&mut conn).await.unwrap().is_empty());

        publish(&mut conn, b"b").await;
        assert_eq!(subscriptions_needing_update(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_next_event_null_cursor_starts_at_head() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        seed(&mut conn).await;

        publish(&mut conn, b"a").await;
        publish(&mut conn, b"b").await;
        let head = publish(&mut conn, b"c").await;

        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        let next = next_event_for_subscription(&mut conn, &sub, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.event_id, head);
        assert_eq!(next.payload, b"c");
    }

    #[tokio::test]
    async fn test_next_event_strict_id_order() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;

        let first = publish(&mut conn, b"a").await;
        let second = publish(&mut conn, b"b").await;
        publish(&mut conn, b"c").await;

        set_cursor(&mut conn, sub_id, first).await.unwrap();
        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        let next = next_event_for_subscription(&mut conn, &sub, 0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.event_id, second);
        assert_eq!(next.payload, b"b");
    }

    #[tokio::test]
    async fn test_next_event_consumption_delay() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        seed(&mut conn).await;
        publish(&mut conn, b"a").await;

        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        // A freshly appended event is not ready under a 1 minute delay
        let next = next_event_for_subscription(&mut conn, &sub, 60_000)
            .await
            .unwrap()
            .unwrap();
        assert!(!next.ready);

        let next = next_event_for_subscription(&mut conn, &sub, 0)
            .await
            .unwrap()
            .unwrap();
        assert!(next.ready);
    }

    #[tokio::test]
    async fn test_begin_consuming_is_exclusive() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;
        let first = publish(&mut conn, b"a").await;
        let second = publish(&mut conn, b"b").await;

        begin_consuming(&mut conn, sub_id, first).await.unwrap();
        let err = begin_consuming(&mut conn, sub_id, second).await.unwrap_err();
        assert!(matches!(err, DataError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_complete_advances_cursor_and_releases_gate() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;
        let first = publish(&mut conn, b"a").await;

        begin_consuming(&mut conn, sub_id, first).await.unwrap();
        assert!(complete_event_for_subscription(&mut conn, sub_id).await.unwrap());

        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        assert_eq!(sub.cursor, Some(first));

        // Gate released: the next event can be claimed
        let second = publish(&mut conn, b"b").await;
        begin_consuming(&mut conn, sub_id, second).await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_without_consumption_is_noop() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;
        publish(&mut conn, b"a").await;

        assert!(!complete_event_for_subscription(&mut conn, sub_id).await.unwrap());
        let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
        assert_eq!(sub.cursor, None);
    }

    #[tokio::test]
    async fn test_random_subscriber_none_registered() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;
        assert!(random_subscriber(&mut conn, sub_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscriber_roundtrip_with_catch() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;

        let key = SubscriberKey::new("billing", "new_invoices", "send_email").unwrap();
        let sink = VerbRef::new("billing", "send_email");
        let catch = VerbRef::new("billing", "email_failed");
        insert_subscriber(
            &mut conn, &key, sub_id, "dep-billing-x", &sink, 2, 100, 1000, Some(&catch),
        )
        .await
        .unwrap();

        let subscriber = random_subscriber(&mut conn, sub_id).await.unwrap().unwrap();
        assert_eq!(subscriber.sink, sink);
        assert_eq!(subscriber.retry_attempts, 2);
        assert_eq!(subscriber.backoff_ms, 100);
        assert_eq!(subscriber.max_backoff_ms, 1000);
        assert_eq!(subscriber.catch, Some(catch));
    }

    #[tokio::test]
    async fn test_deployment_teardown_removes_rows() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;

        let key = SubscriberKey::new("billing", "new_invoices", "send_email").unwrap();
        let sink = VerbRef::new("billing", "send_email");
        insert_subscriber(&mut conn, &key, sub_id, "dep-billing-x", &sink, 0, 1000, 3600_000, None)
            .await
            .unwrap();

        let subscribers = delete_subscribers_for_deployment(&mut conn, "dep-billing-x")
            .await
            .unwrap();
        assert_eq!(subscribers.len(), 1);
        let subscriptions = delete_subscriptions_for_deployment(&mut conn, "dep-billing-x")
            .await
            .unwrap();
        assert_eq!(subscriptions, vec!["sub-billing-new_invoices".to_string()]);

        assert!(get_subscription(&mut conn, "billing", "new_invoices").await.is_err());
    }

    #[tokio::test]
    async fn test_cursor_monotonic_across_completions() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let (_, sub_id) = seed(&mut conn).await;

        let mut last_cursor = None;
        for payload in [b"a".as_ref(), b"b".as_ref(), b"c".as_ref()] {
            let id = publish(&mut conn, payload).await;
            begin_consuming(&mut conn, sub_id, id).await.unwrap();
            complete_event_for_subscription(&mut conn, sub_id).await.unwrap();
            let sub = get_subscription(&mut conn, "billing", "new_invoices").await.unwrap();
            assert!(sub.cursor > last_cursor);
            last_cursor = sub.cursor;
        }
    }
}
