//! Async-call origins
//!
//! Every async call records what scheduled it. The origin is stored as a
//! compact string (`pubsub:sub-billing-invoices`, `cron:hourly_report`,
//! `fsm:payment_flow`) so the executor can recover origin-specific
//! completion behavior after a lease handoff.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keys::SubscriptionKey;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid async call origin {0:?}")]
pub struct OriginError(String);

/// What created an async call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AsyncOrigin {
    /// Delivery of a topic event to a subscription
    PubSub { subscription: SubscriptionKey },
    /// A scheduled cron job
    Cron { job: String },
    /// A finite-state-machine transition
    Fsm { instance: String },
}

impl fmt::Display for AsyncOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PubSub { subscription } => write!(f, "pubsub:{}", subscription),
            Self::Cron { job } => write!(f, "cron:{}", job),
            Self::Fsm { instance } => write!(f, "fsm:{}", instance),
        }
    }
}

impl FromStr for AsyncOrigin {
    type Err = OriginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s.split_once(':').ok_or_else(|| OriginError(s.into()))?;
        match kind {
            "pubsub" => {
                let subscription =
                    SubscriptionKey::parse(rest).map_err(|_| OriginError(s.into()))?;
                Ok(Self::PubSub { subscription })
            }
            "cron" if !rest.is_empty() => Ok(Self::Cron { job: rest.into() }),
            "fsm" if !rest.is_empty() => Ok(Self::Fsm {
                instance: rest.into(),
            }),
            _ => Err(OriginError(s.into())),
        }
    }
}

impl TryFrom<String> for AsyncOrigin {
    type Error = OriginError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AsyncOrigin> for String {
    fn from(o: AsyncOrigin) -> Self {
        o.to_string()
    }
}
