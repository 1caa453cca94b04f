//! Subscription progressor
//!
//! Runs on every controller. Each pass opens one transaction, scans for
//! subscriptions whose topic head has moved past their cursor, claims the
//! next event per subscription through the consumption gate, and enqueues an
//! async call for a randomly chosen subscriber. All claims in a pass commit
//! atomically.
//!
//! One event per subscription per pass: throughput scales by shortening the
//! pass interval, fairness comes for free.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::data::error::DataError;
use crate::data::sqlite::repositories::{async_calls, subscriptions};
use crate::data::types::CreateAsyncCall;
use crate::domain::asynccall::backoff::loop_retry_delay;
use crate::domain::observability::{self, PropagationStage};
use crate::model::origin::AsyncOrigin;
use crate::utils::time::now_ms;

#[derive(Debug, Clone)]
pub struct ProgressorConfig {
    /// Delay between passes
    pub interval: Duration,
    /// Events younger than this are not claimed yet, so out-of-order
    /// publishes from concurrent transactions have time to become visible
    pub consumption_delay_ms: i64,
    /// Skip the pass entirely while the pending queue is deeper than this
    pub queue_high_water: i64,
}

impl Default for ProgressorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            consumption_delay_ms: 200,
            queue_high_water: 1024,
        }
    }
}

pub struct Progressor {
    pool: SqlitePool,
    config: ProgressorConfig,
}

impl Progressor {
    pub fn new(pool: SqlitePool, config: ProgressorConfig) -> Arc<Self> {
        Arc::new(Self { pool, config })
    }

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let progressor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(progressor.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut consecutive_errors: u32 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Progressor shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match progressor.pass().await {
                            Ok(progressed) => {
                                consecutive_errors = 0;
                                if progressed > 0 {
                                    tracing::debug!(progressed, "Progressed subscriptions");
                                }
                            }
                            Err(e) => {
                                consecutive_errors += 1;
                                tracing::warn!(error = %e, "Progressor pass failed");
                                tokio::time::sleep(loop_retry_delay(consecutive_errors)).await;
                            }
                        }
                    }
                }
            }
        })
    }

    /// One progressor pass. Returns how many subscriptions were advanced.
    pub async fn pass(&self) -> Result<usize, DataError> {
        let mut tx = self.pool.begin().await?;

        // Backpressure: don't grow the queue past the high-water mark
        let depth = async_calls::pending_queue_depth(&mut tx).await?;
        observability::queue_depth(depth);
        if depth >= self.config.queue_high_water {
            tracing::debug!(depth, "Async call queue above high water, skipping pass");
            return Ok(0);
        }

        // The enclosing write transaction isolates this pass from other
        // controllers until commit
        let subs = subscriptions::subscriptions_needing_update(&mut tx).await?;

        let mut progressed = 0;
        for sub in subs {
            let next = match subscriptions::next_event_for_subscription(
                &mut tx,
                &sub,
                self.config.consumption_delay_ms,
            )
            .await
            {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    observability::propagation_failed(
                        PropagationStage::GetNext,
                        &sub.key,
                        &e.to_string(),
                    );
                    return Err(e);
                }
            };
            if !next.ready {
                tracing::trace!(subscription = %sub.key, "Event too new, skipping");
                continue;
            }

            // A subscription with no subscribers must not consume events:
            // it would reset to head later when subscribers appear
            let Some(subscriber) = subscriptions::random_subscriber(&mut tx, sub.id).await? else {
                tracing::trace!(subscription = %sub.key, "No subscriber");
                continue;
            };

            match subscriptions::begin_consuming(&mut tx, sub.id, next.event_id).await {
                Ok(()) => {}
                Err(DataError::Conflict(_)) => {
                    // A delivery is already in flight; the winner advances
                    // the cursor and the next pass picks this event up
                    tracing::trace!(subscription = %sub.key, "Already consuming");
                    continue;
                }
                Err(e) => {
                    observability::propagation_failed(
                        PropagationStage::BeginConsuming,
                        &sub.key,
                        &e.to_string(),
                    );
                    return Err(e);
                }
            }

            let params = CreateAsyncCall {
                verb: subscriber.sink.clone(),
                origin: AsyncOrigin::PubSub {
                    subscription: sub.key.clone(),
                },
                // Already encrypted at publish time
                request: next.payload,
                remaining_attempts: subscriber.retry_attempts,
                backoff_ms: subscriber.backoff_ms,
                max_backoff_ms: subscriber.max_backoff_ms,
                scheduled_at: now_ms(),
                parent_request_key: next.request_key,
                trace_context: next.trace_context,
                catch_verb: subscriber.catch.clone(),
            };
            if let Err(e) = async_calls::create_async_call(&mut tx, &params).await {
                observability::propagation_failed(
                    PropagationStage::CreateAsyncCall,
                    &sub.key,
                    &e.to_string(),
                );
                return Err(e);
            }
            observability::async_call_created(
                &subscriber.sink,
                &params.origin.to_string(),
                subscriber.retry_attempts,
            );
            observability::sink_called(&sub.key, &subscriber.sink);
            progressed += 1;
        }

        tx.commit().await?;
        Ok(progressed)
    }
}
