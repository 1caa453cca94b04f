//! Async-call queue repository
//!
//! Calls are claimed with time-bounded leases. Every finalize is fenced on
//! the lease id: after a lease expires and the reaper returns the row to
//! `pending`, the original holder's finalize matches zero rows and its
//! side effects are skipped.

use sqlx::{SqliteConnection, SqlitePool};

use crate::data::error::DataError;
use crate::data::types::{AsyncCallState, CreateAsyncCall, LeasedCall};
use crate::model::keys::AsyncCallKey;
use crate::model::origin::AsyncOrigin;
use crate::model::schema::VerbRef;
use crate::utils::time::now_ms;

/// Enqueue a new async call, returning its row id
pub async fn create_async_call(
    conn: &mut SqliteConnection,
    params: &CreateAsyncCall,
) -> Result<i64, DataError> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO async_calls
            (key, verb_module, verb_name, origin, state, request, remaining_attempts,
             backoff_ms, max_backoff_ms, scheduled_at, parent_request_key, trace_context,
             catch_module, catch_verb, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(AsyncCallKey::new().to_string())
    .bind(&params.verb.module)
    .bind(&params.verb.name)
    .bind(params.origin.to_string())
    .bind(&params.request)
    .bind(params.remaining_attempts)
    .bind(params.backoff_ms)
    .bind(params.max_backoff_ms)
    .bind(params.scheduled_at)
    .bind(params.parent_request_key.as_deref())
    .bind(params.trace_context.as_deref())
    .bind(params.catch_verb.as_ref().map(|c| c.module.as_str()))
    .bind(params.catch_verb.as_ref().map(|c| c.name.as_str()))
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    id: i64,
    verb_module: String,
    verb_name: String,
    origin: String,
    request: Vec<u8>,
    remaining_attempts: i64,
    backoff_ms: i64,
    max_backoff_ms: i64,
    lease_id: String,
    parent_request_key: Option<String>,
    trace_context: Option<String>,
    catch_module: Option<String>,
    catch_verb: Option<String>,
}

impl LeasedRow {
    fn hydrate(self) -> Result<LeasedCall, DataError> {
        let origin: AsyncOrigin = self
            .origin
            .parse()
            .map_err(|e| DataError::Internal(format!("corrupt async call origin: {e}")))?;
        let catch_verb = match (self.catch_module, self.catch_verb) {
            (Some(module), Some(verb)) => Some(VerbRef::new(module, verb)),
            _ => None,
        };
        Ok(LeasedCall {
            id: self.id,
            verb: VerbRef::new(self.verb_module, self.verb_name),
            origin,
            request: self.request,
            remaining_attempts: self.remaining_attempts,
            backoff_ms: self.backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            lease_id: self.lease_id,
            parent_request_key: self.parent_request_key,
            trace_context: self.trace_context,
            catch_verb,
        })
    }
}

/// Atomically claim up to `limit` due pending calls.
///
/// FIFO by `scheduled_at` with id as the tie-breaker. The UPDATE both
/// selects and marks in one statement, so a row can only ever be handed to
/// one claimant.
pub async fn lease_due_async_calls(
    conn: &mut SqliteConnection,
    limit: i64,
    lease_ttl_ms: i64,
) -> Result<Vec<LeasedCall>, DataError> {
    let lease_id = uuid::Uuid::new_v4().to_string();
    let now = now_ms();

    let rows = sqlx::query_as::<_, LeasedRow>(
        r#"
        UPDATE async_calls
        SET state = 'leased', lease_id = ?, lease_expiry = ?
        WHERE id IN (
            SELECT id FROM async_calls
            WHERE state = 'pending' AND scheduled_at <= ?
            ORDER BY scheduled_at, id
            LIMIT ?
        )
        RETURNING id, verb_module, verb_name, origin, request, remaining_attempts,
                  backoff_ms, max_backoff_ms, lease_id, parent_request_key, trace_context,
                  catch_module, catch_verb
        "#,
    )
    .bind(&lease_id)
    .bind(now + lease_ttl_ms)
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(LeasedRow::hydrate).collect()
}

/// Mark a leased call successful. Returns false when the lease is stale.
pub async fn finalize_success(
    conn: &mut SqliteConnection,
    id: i64,
    lease_id: &str,
    response: &[u8],
) -> Result<bool, DataError> {
    let result = sqlx::query(
        r#"
        UPDATE async_calls
        SET state = 'success', response = ?, error = NULL, lease_id = NULL, lease_expiry = NULL
        WHERE id = ? AND lease_id = ? AND state = 'leased'
        "#,
    )
    .bind(response)
    .bind(id)
    .bind(lease_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Return a failed call to the queue with one fewer attempt remaining.
/// Returns false when the lease is stale.
pub async fn finalize_retry(
    conn: &mut SqliteConnection,
    id: i64,
    lease_id: &str,
    error: &str,
    next_backoff_ms: i64,
    scheduled_at: i64,
) -> Result<bool, DataError> {
    let result = sqlx::query(
        r#"
        UPDATE async_calls
        SET state = 'pending', remaining_attempts = remaining_attempts - 1,
            backoff_ms = ?, scheduled_at = ?, error = ?,
            lease_id = NULL, lease_expiry = NULL
        WHERE id = ? AND lease_id = ? AND state = 'leased' AND remaining_attempts > 0
        "#,
    )
    .bind(next_backoff_ms)
    .bind(scheduled_at)
    .bind(error)
    .bind(id)
    .bind(lease_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a leased call to a terminal failure state (`failed` or `caught`).
/// Returns false when the lease is stale.
pub async fn finalize_terminal(
    conn: &mut SqliteConnection,
    id: i64,
    lease_id: &str,
    state: AsyncCallState,
    error: &str,
) -> Result<bool, DataError> {
    debug_assert!(matches!(
        state,
        AsyncCallState::Failed | AsyncCallState::Caught
    ));
    let result = sqlx::query(
        r#"
        UPDATE async_calls
        SET state = ?, error = ?, lease_id = NULL, lease_expiry = NULL
        WHERE id = ? AND lease_id = ? AND state = 'leased'
        "#,
    )
    .bind(state.as_str())
    .bind(error)
    .bind(id)
    .bind(lease_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Return expired leases to the queue without touching the attempt counter.
/// The work-loss window of a crashed controller is bounded by the lease TTL.
pub async fn reap_expired_leases(pool: &SqlitePool) -> Result<u64, DataError> {
    let result = sqlx::query(
        r#"
        UPDATE async_calls
        SET state = 'pending', lease_id = NULL, lease_expiry = NULL
        WHERE state = 'leased' AND lease_expiry < ?
        "#,
    )
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Number of pending calls (queue-depth gauge / backpressure input)
pub async fn pending_queue_depth(conn: &mut SqliteConnection) -> Result<i64, DataError> {
    let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM async_calls WHERE state = 'pending'")
        .fetch_one(&mut *conn)
        .await?;
    Ok(depth)
}

/// Point-in-time view of one call (console and tests)
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub state: AsyncCallState,
    pub remaining_attempts: i64,
    pub backoff_ms: i64,
    pub scheduled_at: i64,
    pub lease_id: Option<String>,
    pub error: Option<String>,
}

pub async fn get_call(conn: &mut SqliteConnection, id: i64) -> Result<CallSnapshot, DataError> {
    let (state, remaining_attempts, backoff_ms, scheduled_at, lease_id, error) =
        sqlx::query_as::<_, (String, i64, i64, i64, Option<String>, Option<String>)>(
            r#"
            SELECT state, remaining_attempts, backoff_ms, scheduled_at, lease_id, error
            FROM async_calls WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(DataError::NotFound("async call"))?;

    let state = AsyncCallState::parse(&state)
        .ok_or_else(|| DataError::Internal(format!("corrupt async call state {state:?}")))?;
    Ok(CallSnapshot {
        state,
        remaining_attempts,
        backoff_ms,
        scheduled_at,
        lease_id,
        error,
    })
}
