//! Request and trace context propagation
//!
//! Publishes and async invocations carry the originating request key and
//! the W3C trace context so a subscriber's logs and downstream calls stay
//! correlated with the request that published the event. Contexts are
//! explicit values here; the API layer builds them from headers.

use serde::{Deserialize, Serialize};

use super::keys::RequestKey;

/// W3C trace context captured at publish time, stored as JSON alongside the
/// event and restored when the sink verb is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl TraceContext {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(s: &str) -> Option<Self> {
        serde_json::from_str(s).ok()
    }
}

/// Ambient context of an inbound call
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_key: Option<RequestKey>,
    pub trace: Option<TraceContext>,
}

impl RequestContext {
    pub fn new(request_key: RequestKey) -> Self {
        Self {
            request_key: Some(request_key),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}
