//! Shared row types for the store
//!
//! Repositories hydrate these from raw rows; domain code only ever sees
//! typed keys and enums, never column tuples.

use serde::{Deserialize, Serialize};

use crate::model::{
    AsyncOrigin, DeploymentKey, ModuleSchema, SubscriberKey, SubscriptionKey, VerbRef,
};

/// A topic row (the head is the id of the latest event, if any)
#[derive(Debug, Clone)]
pub struct TopicRow {
    pub id: i64,
    pub module: String,
    pub name: String,
    pub head: Option<i64>,
}

/// A subscription with its cursor into the topic journal
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub id: i64,
    pub key: SubscriptionKey,
    pub topic_id: i64,
    pub deployment_key: String,
    pub cursor: Option<i64>,
}

/// A subscriber (sink verb + retry policy) registered on a subscription
#[derive(Debug, Clone)]
pub struct SubscriberRow {
    pub id: i64,
    pub key: SubscriberKey,
    pub sink: VerbRef,
    pub retry_attempts: i64,
    pub backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub catch: Option<VerbRef>,
}

/// The next unconsumed event of a subscription's topic
#[derive(Debug, Clone)]
pub struct NextEvent {
    pub event_id: i64,
    pub payload: Vec<u8>,
    pub caller: String,
    pub request_key: Option<String>,
    pub trace_context: Option<String>,
    /// False while the event is younger than the consumption delay
    pub ready: bool,
}

/// Async call lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncCallState {
    Pending,
    Leased,
    Success,
    Failed,
    Caught,
}

impl AsyncCallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Caught => "caught",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "leased" => Some(Self::Leased),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "caught" => Some(Self::Caught),
            _ => None,
        }
    }

    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Caught)
    }
}

/// Parameters for enqueuing a new async call
#[derive(Debug, Clone)]
pub struct CreateAsyncCall {
    pub verb: VerbRef,
    pub origin: AsyncOrigin,
    /// Already encrypted under the async key space
    pub request: Vec<u8>,
    pub remaining_attempts: i64,
    pub backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub scheduled_at: i64,
    pub parent_request_key: Option<String>,
    pub trace_context: Option<String>,
    pub catch_verb: Option<VerbRef>,
}

/// A leased async call as handed to the executor
#[derive(Debug, Clone)]
pub struct LeasedCall {
    pub id: i64,
    pub verb: VerbRef,
    pub origin: AsyncOrigin,
    pub request: Vec<u8>,
    pub remaining_attempts: i64,
    pub backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub lease_id: String,
    pub parent_request_key: Option<String>,
    pub trace_context: Option<String>,
    pub catch_verb: Option<VerbRef>,
}

/// A deployment row with its parsed module schema
#[derive(Debug, Clone)]
pub struct DeploymentRow {
    pub id: i64,
    pub key: DeploymentKey,
    pub module: String,
    pub schema: ModuleSchema,
    pub endpoint: Option<String>,
    pub active: bool,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for s in [
            AsyncCallState::Pending,
            AsyncCallState::Leased,
            AsyncCallState::Success,
            AsyncCallState::Failed,
            AsyncCallState::Caught,
        ] {
            assert_eq!(AsyncCallState::parse(s.as_str()), Some(s));
        }
        assert_eq!(AsyncCallState::parse("stuck"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AsyncCallState::Pending.is_terminal());
        assert!(!AsyncCallState::Leased.is_terminal());
        assert!(AsyncCallState::Success.is_terminal());
        assert!(AsyncCallState::Failed.is_terminal());
        assert!(AsyncCallState::Caught.is_terminal());
    }
}
