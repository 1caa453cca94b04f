//! Lease reaper
//!
//! A controller that dies mid-invocation leaves its calls `leased` until the
//! lease expires. This sweeper returns them to `pending` so another
//! controller picks them up; the attempt counter is untouched, so a crash
//! never burns a retry.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::data::sqlite::repositories::async_calls;

pub struct LeaseReaper {
    pool: SqlitePool,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(pool: SqlitePool, interval: Duration) -> Arc<Self> {
        Arc::new(Self { pool, interval })
    }

    pub fn start(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!("Lease reaper shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match async_calls::reap_expired_leases(&reaper.pool).await {
                            Ok(0) => {}
                            Ok(reaped) => {
                                tracing::info!(reaped, "Returned expired async call leases");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Lease reaping failed");
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::sqlite::repositories::async_calls::{
        create_async_call, get_call, lease_due_async_calls,
    };
    use crate::data::sqlite::test_pool;
    use crate::data::types::{AsyncCallState, CreateAsyncCall};
    use crate::model::origin::AsyncOrigin;
    use crate::model::schema::VerbRef;
    use crate::utils::time::now_ms;

    #[tokio::test]
    async fn test_reaper_task_recovers_crashed_lease() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = create_async_call(
            &mut conn,
            &CreateAsyncCall {
                verb: VerbRef::new("billing", "send_email"),
                origin: AsyncOrigin::Cron {
                    job: "hourly_report".to_string(),
                },
                request: b"r".to_vec(),
                remaining_attempts: 1,
                backoff_ms: 100,
                max_backoff_ms: 1000,
                scheduled_at: now_ms(),
                parent_request_key: None,
                trace_context: None,
                catch_verb: None,
            },
        )
        .await
        .unwrap();

        // Crashed holder: lease already expired
        lease_due_async_calls(&mut conn, 1, -1).await.unwrap();
        drop(conn);

        let reaper = LeaseReaper::new(pool.clone(), Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = reaper.start(rx);

        // Wait for the sweep to flip the call back to pending
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let mut conn = pool.acquire().await.unwrap();
            let snapshot = get_call(&mut conn, id).await.unwrap();
            drop(conn);
            if snapshot.state == AsyncCallState::Pending {
                assert_eq!(snapshot.remaining_attempts, 1);
                break;
            }
            assert!(std::time::Instant::now() < deadline, "lease never reaped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
