//! Async-call executor
//!
//! Runs on every controller with bounded concurrency. Each pass leases a
//! batch of due calls, invokes the sink verbs through the runner router, and
//! finalizes each call under its lease. A pub/sub call that reaches a
//! terminal state always advances its subscription cursor, whether it
//! succeeded, failed, or was handed to a catch verb: a poisoned event must
//! not block the topic.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use crate::data::error::DataError;
use crate::data::sqlite::repositories::{async_calls, deployments, subscriptions, timeline};
use crate::data::types::{AsyncCallState, CreateAsyncCall, LeasedCall};
use crate::domain::asynccall::backoff::{loop_retry_delay, next_backoff_ms};
use crate::domain::encryption::{KeySpace, PayloadCodec};
use crate::domain::observability;
use crate::domain::routing::{InvokeError, InvokeRequest, RouteTable, VerbInvoker};
use crate::model::context::TraceContext;
use crate::model::origin::AsyncOrigin;
use crate::model::schema::{RetryParams, VerbRef};
use crate::utils::time::now_ms;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Delay between passes when the queue is empty
    pub interval: Duration,
    /// Calls leased per pass
    pub batch_size: i64,
    /// How long a lease protects a call before the reaper reclaims it
    pub lease_ttl: Duration,
    /// Concurrent invocations per controller
    pub workers: usize,
    /// Per-invocation deadline
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            batch_size: 16,
            lease_ttl: Duration::from_secs(60),
            workers: 8,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Request handed to a catch verb after its sink's retries are exhausted
#[derive(Debug, Serialize, Deserialize)]
pub struct CatchRequest {
    /// The sink verb that exhausted its retries
    pub verb: String,
    /// Original request payload, base64
    pub request: String,
    /// Final error message
    pub error: String,
}

pub struct Executor {
    pool: SqlitePool,
    invoker: Arc<dyn VerbInvoker>,
    codec: Arc<dyn PayloadCodec>,
    routes: Arc<RouteTable>,
    config: ExecutorConfig,
}

enum Outcome {
    Success(Vec<u8>),
    /// The verb ran (or could not be reached) and failed; consumes an attempt
    Failure(String),
    /// Undecryptable or malformed payload; never retried
    Poisoned(String),
}

impl Executor {
    pub fn new(
        pool: SqlitePool,
        invoker: Arc<dyn VerbInvoker>,
        codec: Arc<dyn PayloadCodec>,
        routes: Arc<RouteTable>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            invoker,
            codec,
            routes,
            config,
        })
    }

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(executor.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_errors: u32 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Executor shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match executor.pass().await {
                            Ok(executed) => {
                                consecutive_errors = 0;
                                if executed > 0 {
                                    tracing::debug!(executed, "Executed async calls");
                                }
                            }
                            Err(e) => {
                                consecutive_errors += 1;
                                tracing::warn!(error = %e, "Executor pass failed");
                                tokio::time::sleep(loop_retry_delay(consecutive_errors)).await;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Lease and execute one batch. Returns the number of calls executed.
    pub async fn pass(&self) -> Result<usize, DataError> {
        let mut tx = self.pool.begin().await?;
        let calls = async_calls::lease_due_async_calls(
            &mut tx,
            self.config.batch_size,
            self.config.lease_ttl.as_millis() as i64,
        )
        .await?;
        tx.commit().await?;

        if calls.is_empty() {
            return Ok(0);
        }

        let executed = calls.len();
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut handles = Vec::with_capacity(executed);
        for call in calls {
            let semaphore = Arc::clone(&semaphore);
            handles.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                if let Err(e) = self.execute(call).await {
                    tracing::warn!(error = %e, "Async call execution failed to finalize");
                }
            });
        }
        futures::future::join_all(handles).await;

        Ok(executed)
    }

    async fn execute(&self, call: LeasedCall) -> Result<(), DataError> {
        let started = now_ms();

        // Decrypt once; the plaintext also feeds the timeline and catch payload
        let plaintext = match self.codec.decrypt(KeySpace::Async, &call.request) {
            Ok(p) => p,
            Err(e) => {
                let outcome = Outcome::Poisoned(e.to_string());
                return self.finalize(call, outcome, Vec::new(), started).await;
            }
        };

        let outcome = match self.invoke(&call, plaintext.clone()).await {
            Ok(response) => Outcome::Success(response),
            Err(e) => {
                if let AsyncOrigin::PubSub { subscription } = &call.origin {
                    observability::propagation_failed(
                        observability::PropagationStage::Invoke,
                        subscription,
                        &e.to_string(),
                    );
                }
                Outcome::Failure(e.to_string())
            }
        };

        let origin = call.origin.clone();
        let result = self.finalize(call, outcome, plaintext, started).await;
        if let Err(e) = &result
            && let AsyncOrigin::PubSub { subscription } = &origin
        {
            observability::propagation_failed(
                observability::PropagationStage::Finalize,
                subscription,
                &e.to_string(),
            );
        }
        result
    }

    async fn invoke(&self, call: &LeasedCall, payload: Vec<u8>) -> Result<Vec<u8>, InvokeError> {
        let endpoint = self
            .routes
            .resolve(&call.verb.module)
            .await
            .map_err(|e| InvokeError::Unreachable(e.to_string()))?
            .ok_or_else(|| InvokeError::NoRoute(call.verb.module.clone()))?;

        let trace = call
            .trace_context
            .as_deref()
            .and_then(TraceContext::from_json);

        self.invoker
            .invoke(InvokeRequest {
                verb: call.verb.clone(),
                endpoint,
                payload,
                request_key: call.parent_request_key.clone(),
                trace,
                timeout: self.config.call_timeout,
            })
            .await
    }

    /// Record the outcome under the call's lease. All state transitions and
    /// their side effects (cursor advance, catch creation, timeline) commit
    /// in one transaction; a stale lease skips everything.
    async fn finalize(
        &self,
        call: LeasedCall,
        outcome: Outcome,
        plaintext: Vec<u8>,
        started: i64,
    ) -> Result<(), DataError> {
        let duration_ms = now_ms() - started;
        let mut tx = self.pool.begin().await?;

        let (owned, state, response, error) = match outcome {
            Outcome::Success(response) => {
                let owned =
                    async_calls::finalize_success(&mut tx, call.id, &call.lease_id, &response)
                        .await?;
                if owned && let AsyncOrigin::PubSub { subscription } = &call.origin {
                    complete_subscription(&mut tx, subscription).await?;
                }
                (owned, AsyncCallState::Success, Some(response), None)
            }
            Outcome::Failure(message) if call.remaining_attempts > 0 => {
                let delay = call.backoff_ms;
                let next = next_backoff_ms(call.backoff_ms, call.max_backoff_ms);
                let owned = async_calls::finalize_retry(
                    &mut tx,
                    call.id,
                    &call.lease_id,
                    &message,
                    next,
                    now_ms() + delay,
                )
                .await?;
                (owned, AsyncCallState::Pending, None, Some(message))
            }
            Outcome::Failure(message) => {
                // Retries exhausted: hand off to the catch verb or fail,
                // either way the topic keeps moving
                let catchable = call
                    .catch_verb
                    .as_ref()
                    .filter(|catch| **catch != call.verb)
                    .cloned();
                let state = if catchable.is_some() {
                    AsyncCallState::Caught
                } else {
                    AsyncCallState::Failed
                };
                let owned = async_calls::finalize_terminal(
                    &mut tx,
                    call.id,
                    &call.lease_id,
                    state,
                    &message,
                )
                .await?;
                if owned {
                    if let Some(catch) = catchable {
                        self.create_catch_call(&mut tx, &call, &catch, &plaintext, &message)
                            .await?;
                    }
                    if let AsyncOrigin::PubSub { subscription } = &call.origin {
                        complete_subscription(&mut tx, subscription).await?;
                    }
                }
                (owned, state, None, Some(message))
            }
            Outcome::Poisoned(message) => {
                // Non-retryable: the payload can never be delivered
                let owned = async_calls::finalize_terminal(
                    &mut tx,
                    call.id,
                    &call.lease_id,
                    AsyncCallState::Failed,
                    &message,
                )
                .await?;
                if owned && let AsyncOrigin::PubSub { subscription } = &call.origin {
                    complete_subscription(&mut tx, subscription).await?;
                }
                (owned, AsyncCallState::Failed, None, Some(message))
            }
        };

        if !owned {
            // Another controller reclaimed the lease after expiry; its
            // finalize wins and ours must leave no side effects
            tracing::debug!(call_id = call.id, "Stale lease, skipping finalize");
            return Ok(());
        }

        let deployment_key = deployment_key_for_module(&mut tx, &call.verb.module).await?;
        timeline::insert_call_event(
            &mut tx,
            &timeline::CallEntry {
                deployment_key,
                request_key: call.parent_request_key.clone(),
                source_verb: None,
                dest_verb: call.verb.clone(),
                duration_ms,
                request: String::from_utf8_lossy(&plaintext).into_owned(),
                response: response.map(|r| String::from_utf8_lossy(&r).into_owned()),
                error,
            },
        )
        .await?;

        tx.commit().await?;
        observability::async_call_completed(&call.verb, state.as_str(), duration_ms);
        Ok(())
    }

    /// Enqueue the catch-verb call. The catch call inherits the origin so
    /// its terminal states resolve the same way, carries the catch verb's
    /// own retry policy, and never has a further catch.
    async fn create_catch_call(
        &self,
        conn: &mut SqliteConnection,
        call: &LeasedCall,
        catch: &VerbRef,
        plaintext: &[u8],
        error: &str,
    ) -> Result<(), DataError> {
        let retry = catch_retry_params(conn, catch).await?;

        let request = serde_json::to_vec(&CatchRequest {
            verb: call.verb.to_string(),
            request: BASE64.encode(plaintext),
            error: error.to_string(),
        })
        .map_err(|e| DataError::Payload(format!("unserializable catch request: {e}")))?;
        let sealed = self
            .codec
            .encrypt(KeySpace::Async, &request)
            .map_err(|e| DataError::Payload(e.to_string()))?;

        let id = async_calls::create_async_call(
            conn,
            &CreateAsyncCall {
                verb: catch.clone(),
                origin: call.origin.clone(),
                request: sealed,
                remaining_attempts: retry.count as i64,
                backoff_ms: retry.min_backoff.as_millis() as i64,
                max_backoff_ms: retry.max_backoff.as_millis() as i64,
                scheduled_at: now_ms(),
                parent_request_key: call.parent_request_key.clone(),
                trace_context: call.trace_context.clone(),
                catch_verb: None,
            },
        )
        .await?;
        observability::async_call_created(catch, &call.origin.to_string(), retry.count as i64);
        tracing::debug!(call_id = call.id, catch_call_id = id, catch = %catch, "Catch call created");
        Ok(())
    }
}

/// Advance the subscription past its in-flight event. Missing subscription
/// (torn down mid-flight) and missing consumption row are both fine.
async fn complete_subscription(
    conn: &mut SqliteConnection,
    subscription: &crate::model::keys::SubscriptionKey,
) -> Result<(), DataError> {
    match subscriptions::get_subscription(conn, &subscription.module, &subscription.name).await {
        Ok(sub) => {
            subscriptions::complete_event_for_subscription(conn, sub.id).await?;
            Ok(())
        }
        Err(DataError::NotFound(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Retry policy of a catch verb, read from its module's active deployment
async fn catch_retry_params(
    conn: &mut SqliteConnection,
    catch: &VerbRef,
) -> Result<RetryParams, DataError> {
    match deployments::get_active_for_module(conn, &catch.module).await? {
        Some(deployment) => deployment
            .schema
            .retry_params_of(&catch.name)
            .map_err(|e| DataError::Payload(e.to_string())),
        None => Ok(RetryParams::default()),
    }
}

async fn deployment_key_for_module(
    conn: &mut SqliteConnection,
    module: &str,
) -> Result<String, DataError> {
    Ok(deployments::get_active_for_module(conn, module)
        .await?
        .map(|d| d.key.to_string())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::data::sqlite::repositories::timeline::{Order, TimelineFilters, query_timeline};
    use crate::data::sqlite::repositories::topics;
    use crate::data::sqlite::test_pool;
    use crate::domain::encryption::PassthroughCodec;
    use crate::domain::pubsub::{Progressor, ProgressorConfig};
    use crate::model::keys::{DeploymentKey, SubscriberKey, SubscriptionKey};
    use crate::model::schema::ModuleSchema;

    /// Scripted invoker: pops one outcome per invocation and records calls
    struct FakeInvoker {
        script: Mutex<VecDeque<Result<Vec<u8>, String>>>,
        calls: Mutex<Vec<(VerbRef, Vec<u8>, Option<String>)>>,
    }

    impl FakeInvoker {
        fn new(script: Vec<Result<Vec<u8>, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(VerbRef, Vec<u8>, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VerbInvoker for FakeInvoker {
        async fn invoke(&self, request: InvokeRequest) -> Result<Vec<u8>, InvokeError> {
            self.calls.lock().unwrap().push((
                request.verb.clone(),
                request.payload.clone(),
                request.request_key.clone(),
            ));
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(response)) => Ok(response),
                Some(Err(message)) => Err(InvokeError::Failed(message)),
                None => panic!("unscripted invocation of {}", request.verb),
            }
        }
    }

    fn executor_config() -> ExecutorConfig {
        ExecutorConfig {
            interval: Duration::from_millis(10),
            batch_size: 16,
            lease_ttl: Duration::from_secs(60),
            workers: 4,
            call_timeout: Duration::from_secs(1),
        }
    }

    struct Harness {
        pool: SqlitePool,
        progressor: Arc<Progressor>,
        invoker: Arc<FakeInvoker>,
        executor: Arc<Executor>,
        sub_id: i64,
    }

    /// Topic + subscription + subscriber + deployed module, ready to publish
    async fn harness(
        retry_attempts: i64,
        backoff_ms: i64,
        max_backoff_ms: i64,
        catch: Option<VerbRef>,
        script: Vec<Result<Vec<u8>, String>>,
    ) -> Harness {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let schema: ModuleSchema = serde_json::from_value(serde_json::json!({
            "name": "billing",
            "decls": [
                {"type": "topic", "name": "invoices"},
                {"type": "verb", "name": "send_email", "metadata": []},
                {"type": "verb", "name": "email_failed", "metadata": []}
            ]
        }))
        .unwrap();
        let dep = DeploymentKey::new("billing").unwrap();
        deployments::create_deployment(&mut conn, &dep, &schema, Some("http://runner:8893"))
            .await
            .unwrap();

        let topic_id = topics::upsert_topic(&mut conn, "billing", "invoices").await.unwrap();
        let sub_key = SubscriptionKey::new("billing", "new_invoices").unwrap();
        let (sub_id, _) =
            subscriptions::upsert_subscription(&mut conn, &sub_key, dep.to_string().as_str(), topic_id)
                .await
                .unwrap();
        let sbr = SubscriberKey::new("billing", "new_invoices", "send_email").unwrap();
        subscriptions::insert_subscriber(
            &mut conn,
            &sbr,
            sub_id,
            dep.to_string().as_str(),
            &VerbRef::new("billing", "send_email"),
            retry_attempts,
            backoff_ms,
            max_backoff_ms,
            catch.as_ref(),
        )
        .await
        .unwrap();
        drop(conn);

        let codec: Arc<dyn PayloadCodec> = Arc::new(PassthroughCodec);
        let invoker = FakeInvoker::new(script);
        let routes = RouteTable::new(pool.clone());
        let executor = Executor::new(
            pool.clone(),
            invoker.clone(),
            codec,
            routes,
            executor_config(),
        );
        let progressor = Progressor::new(
            pool.clone(),
            ProgressorConfig {
                interval: Duration::from_millis(10),
                consumption_delay_ms: 0,
                queue_high_water: 1024,
            },
        );

        Harness {
            pool,
            progressor,
            invoker,
            executor,
            sub_id,
        }
    }

    async fn publish(pool: &SqlitePool, payload: &[u8]) {
        let mut conn = pool.acquire().await.unwrap();
        topics::append_event(
            &mut conn,
            "billing",
            "invoices",
            "billing.create",
            payload,
            Some("req-origin"),
            None,
        )
        .await
        .unwrap();
    }

    async fn cursor_of(pool: &SqlitePool, sub_id: i64) -> Option<i64> {
        sqlx::query_scalar("SELECT cursor FROM subscriptions WHERE id = ?")
            .bind(sub_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    async fn run_until_idle(h: &Harness) {
        // Drive progressor + executor until neither makes progress. Retry
        // backoffs in tests are single-digit milliseconds.
        for _ in 0..50 {
            let progressed = h.progressor.pass().await.unwrap();
            let executed = h.executor.pass().await.unwrap();
            if progressed == 0 && executed == 0 {
                let pending: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM async_calls WHERE state IN ('pending', 'leased')",
                )
                .fetch_one(&h.pool)
                .await
                .unwrap();
                if pending == 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipeline did not settle");
    }

    #[tokio::test]
    async fn test_basic_delivery_advances_cursor() {
        let h = harness(0, 1000, 10_000, None, vec![Ok(b"ok".to_vec())]).await;
        publish(&h.pool, b"A").await;

        run_until_idle(&h).await;

        let calls = h.invoker.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, VerbRef::new("billing", "send_email"));
        assert_eq!(calls[0].1, b"A");
        assert_eq!(calls[0].2.as_deref(), Some("req-origin"));

        assert!(cursor_of(&h.pool, h.sub_id).await.is_some());
        let (state,): (String,) = sqlx::query_as("SELECT state FROM async_calls")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(state, "success");

        // Call outcome lands in the timeline
        let (events, _) = query_timeline(&h.pool, &TimelineFilters::default(), 10, Order::Desc)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].entry {
            timeline::TimelineEntry::Call(call) => {
                assert_eq!(call.dest_verb, VerbRef::new("billing", "send_email"));
                assert_eq!(call.request, "A");
                assert_eq!(call.response.as_deref(), Some("ok"));
                assert!(call.error.is_none());
                assert!(call.deployment_key.starts_with("dep-billing-"));
            }
            other => panic!("expected call event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let h = harness(
            2,
            1,
            8,
            None,
            vec![
                Err("boom 1".to_string()),
                Err("boom 2".to_string()),
                Ok(b"ok".to_vec()),
            ],
        )
        .await;
        publish(&h.pool, b"A").await;

        run_until_idle(&h).await;

        // Three invocations of the same payload, then success
        let calls = h.invoker.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, payload, _)| payload == b"A"));

        let (state, attempts, backoff): (String, i64, i64) =
            sqlx::query_as("SELECT state, remaining_attempts, backoff_ms FROM async_calls")
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(state, "success");
        assert_eq!(attempts, 0);
        // Doubled once per failure: 1 -> 2 -> 4
        assert_eq!(backoff, 4);

        // Cursor advanced exactly once
        assert!(cursor_of(&h.pool, h.sub_id).await.is_some());
        let consumptions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM topic_event_consumptions")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(consumptions, 0);
    }

    #[tokio::test]
    async fn test_backoff_schedule_spacing() {
        let h = harness(1, 50, 1000, None, vec![Err("boom".to_string())]).await;
        publish(&h.pool, b"A").await;

        h.progressor.pass().await.unwrap();
        let before = now_ms();
        h.executor.pass().await.unwrap();

        // Rescheduled at least min_backoff into the future
        let (state, scheduled_at): (String, i64) =
            sqlx::query_as("SELECT state, scheduled_at FROM async_calls")
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(state, "pending");
        assert!(scheduled_at >= before + 50);

        // Not due yet: the next pass leases nothing
        assert_eq!(h.executor.pass().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_with_catch() {
        let h = harness(
            1,
            1,
            8,
            Some(VerbRef::new("billing", "email_failed")),
            vec![
                Err("boom 1".to_string()),
                Err("boom".to_string()),
                Ok(b"caught ok".to_vec()),
            ],
        )
        .await;
        publish(&h.pool, b"A").await;

        run_until_idle(&h).await;

        let calls = h.invoker.calls();
        assert_eq!(calls.len(), 3);
        // Sink invoked twice, then the catch verb once
        assert_eq!(calls[0].0, VerbRef::new("billing", "send_email"));
        assert_eq!(calls[1].0, VerbRef::new("billing", "send_email"));
        assert_eq!(calls[2].0, VerbRef::new("billing", "email_failed"));

        // Catch request carries the original payload and final error
        let catch_request: CatchRequest = serde_json::from_slice(&calls[2].1).unwrap();
        assert_eq!(catch_request.verb, "billing.send_email");
        assert_eq!(BASE64.decode(&catch_request.request).unwrap(), b"A");
        assert!(catch_request.error.contains("boom"));

        let states: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT state, catch_verb FROM async_calls ORDER BY id")
                .fetch_all(&h.pool)
                .await
                .unwrap();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].0, "caught");
        // The catch call has no further catch
        assert_eq!(states[1].0, "success");
        assert_eq!(states[1].1, None);

        assert!(cursor_of(&h.pool, h.sub_id).await.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_without_catch_fails_and_advances() {
        let h = harness(0, 1, 8, None, vec![Err("boom".to_string())]).await;
        publish(&h.pool, b"A").await;

        run_until_idle(&h).await;

        assert_eq!(h.invoker.calls().len(), 1);
        let (state, error): (String, Option<String>) =
            sqlx::query_as("SELECT state, error FROM async_calls")
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(state, "failed");
        assert!(error.unwrap().contains("boom"));

        // A poisoned event does not block the topic
        assert!(cursor_of(&h.pool, h.sub_id).await.is_some());
    }

    #[tokio::test]
    async fn test_delivery_in_publish_order() {
        let h = harness(
            0,
            1,
            8,
            None,
            vec![Ok(b"1".to_vec()), Ok(b"2".to_vec()), Ok(b"3".to_vec())],
        )
        .await;
        // Claim the first event before a backlog builds so the null cursor
        // starts at event one
        publish(&h.pool, b"A").await;
        h.progressor.pass().await.unwrap();
        publish(&h.pool, b"B").await;
        publish(&h.pool, b"C").await;

        run_until_idle(&h).await;

        let payloads: Vec<Vec<u8>> =
            h.invoker.calls().into_iter().map(|(_, payload, _)| payload).collect();
        assert_eq!(payloads, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[tokio::test]
    async fn test_no_route_consumes_attempt() {
        let h = harness(0, 1, 8, None, vec![]).await;
        // Tear the deployment down so routing fails
        sqlx::query("UPDATE deployments SET active = 0")
            .execute(&h.pool)
            .await
            .unwrap();
        publish(&h.pool, b"A").await;

        run_until_idle(&h).await;

        assert!(h.invoker.calls().is_empty());
        let (state, error): (String, Option<String>) =
            sqlx::query_as("SELECT state, error FROM async_calls")
                .fetch_one(&h.pool)
                .await
                .unwrap();
        assert_eq!(state, "failed");
        assert!(error.unwrap().contains("no route"));
    }

    #[tokio::test]
    async fn test_start_observes_shutdown() {
        let h = harness(0, 1, 8, None, vec![]).await;
        let (tx, rx) = watch::channel(false);
        let handle = h.executor.start(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
