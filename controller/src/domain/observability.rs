//! Structured observability events
//!
//! Counters and gauges are emitted as structured `tracing` events with
//! stable field names so downstream collectors can aggregate them. Every
//! pub/sub propagation failure is tagged with the stage it failed at.

use std::fmt;

use crate::model::keys::SubscriptionKey;
use crate::model::schema::VerbRef;

/// Where in the event-to-async-call pipeline a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStage {
    GetNext,
    BeginConsuming,
    CreateAsyncCall,
    Invoke,
    Finalize,
}

impl PropagationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetNext => "get_next",
            Self::BeginConsuming => "begin_consuming",
            Self::CreateAsyncCall => "create_async_call",
            Self::Invoke => "invoke",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PropagationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn published(module: &str, topic: &str, caller: &str, ok: bool) {
    if ok {
        tracing::debug!(counter = "pubsub_published", module, topic, caller, "Event published");
    } else {
        tracing::warn!(counter = "pubsub_publish_failed", module, topic, caller, "Publish failed");
    }
}

pub fn propagation_failed(stage: PropagationStage, subscription: &SubscriptionKey, error: &str) {
    tracing::warn!(
        counter = "pubsub_propagation_failed",
        stage = stage.as_str(),
        subscription = %subscription,
        error,
        "Subscription propagation failed"
    );
}

pub fn sink_called(subscription: &SubscriptionKey, sink: &VerbRef) {
    tracing::debug!(
        counter = "pubsub_sink_called",
        subscription = %subscription,
        sink = %sink,
        "Event handed to sink"
    );
}

pub fn async_call_created(verb: &VerbRef, origin: &str, remaining_attempts: i64) {
    tracing::debug!(
        counter = "async_call_created",
        verb = %verb,
        origin,
        remaining_attempts,
        "Async call enqueued"
    );
}

pub fn async_call_completed(verb: &VerbRef, state: &str, duration_ms: i64) {
    tracing::debug!(
        counter = "async_call_completed",
        verb = %verb,
        state,
        duration_ms,
        "Async call finalized"
    );
}

pub fn queue_depth(depth: i64) {
    tracing::debug!(gauge = "async_call_queue_depth", depth, "Queue depth sampled");
}
