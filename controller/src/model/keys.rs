//! Typed opaque keys
//!
//! Every addressable entity has a string key with a kind prefix, the
//! identifying name parts, and (for non-deterministic kinds) a random
//! cuid2 suffix:
//!
//! ```text
//! dep-billing-x3f9qkzt01me48rw2b7ydnsv
//! sub-billing-invoices        (deterministic: derived from module + name)
//! ```
//!
//! Name parts are `[a-z0-9_]`, so `-` is always a safe separator. Keys
//! serialize as plain strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("expected {expected} key, got {got:?}")]
    WrongKind { expected: &'static str, got: String },

    #[error("malformed key {0:?}")]
    Malformed(String),

    #[error("invalid key part {0:?}")]
    InvalidPart(String),
}

fn new_suffix() -> String {
    cuid2::create_id()
}

fn check_part(part: &str) -> Result<(), KeyError> {
    if part.is_empty()
        || !part
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(KeyError::InvalidPart(part.to_string()));
    }
    Ok(())
}

fn split_key<'a>(
    kind: &'static str,
    arity: usize,
    s: &'a str,
) -> Result<Vec<&'a str>, KeyError> {
    let mut parts = s.split('-');
    let prefix = parts.next().unwrap_or_default();
    if prefix != kind {
        return Err(KeyError::WrongKind {
            expected: kind,
            got: s.to_string(),
        });
    }
    let rest: Vec<&str> = parts.collect();
    if rest.len() != arity || rest.iter().any(|p| p.is_empty()) {
        return Err(KeyError::Malformed(s.to_string()));
    }
    Ok(rest)
}

macro_rules! string_serde {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.encode())
            }
        }

        impl FromStr for $ty {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
                ser.serialize_str(&self.encode())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
                let s = String::deserialize(de)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Key of a deployment: `dep-<module>-<suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentKey {
    pub module: String,
    suffix: String,
}

impl DeploymentKey {
    pub fn new(module: &str) -> Result<Self, KeyError> {
        check_part(module)?;
        Ok(Self {
            module: module.to_string(),
            suffix: new_suffix(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("dep", 2, s)?;
        check_part(parts[0])?;
        Ok(Self {
            module: parts[0].to_string(),
            suffix: parts[1].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("dep-{}-{}", self.module, self.suffix)
    }
}
string_serde!(DeploymentKey);

/// Key correlating all invocations spawned by one inbound request: `req-<suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    suffix: String,
}

impl RequestKey {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            suffix: new_suffix(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("req", 1, s)?;
        Ok(Self {
            suffix: parts[0].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("req-{}", self.suffix)
    }
}
string_serde!(RequestKey);

/// Key of an event appended to a topic: `evt-<module>-<topic>-<suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicEventKey {
    pub module: String,
    pub topic: String,
    suffix: String,
}

impl TopicEventKey {
    pub fn new(module: &str, topic: &str) -> Result<Self, KeyError> {
        check_part(module)?;
        check_part(topic)?;
        Ok(Self {
            module: module.to_string(),
            topic: topic.to_string(),
            suffix: new_suffix(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("evt", 3, s)?;
        check_part(parts[0])?;
        check_part(parts[1])?;
        Ok(Self {
            module: parts[0].to_string(),
            topic: parts[1].to_string(),
            suffix: parts[2].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("evt-{}-{}-{}", self.module, self.topic, self.suffix)
    }
}
string_serde!(TopicEventKey);

/// Key of a subscription: `sub-<module>-<name>`
///
/// Deterministic (no suffix) so that repeated deployments of the same module
/// upsert the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub module: String,
    pub name: String,
}

impl SubscriptionKey {
    pub fn new(module: &str, name: &str) -> Result<Self, KeyError> {
        check_part(module)?;
        check_part(name)?;
        Ok(Self {
            module: module.to_string(),
            name: name.to_string(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("sub", 2, s)?;
        check_part(parts[0])?;
        check_part(parts[1])?;
        Ok(Self {
            module: parts[0].to_string(),
            name: parts[1].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("sub-{}-{}", self.module, self.name)
    }
}
string_serde!(SubscriptionKey);

/// Key of a subscriber: `sbr-<module>-<subscription>-<verb>-<suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    pub module: String,
    pub subscription: String,
    pub verb: String,
    suffix: String,
}

impl SubscriberKey {
    pub fn new(module: &str, subscription: &str, verb: &str) -> Result<Self, KeyError> {
        check_part(module)?;
        check_part(subscription)?;
        check_part(verb)?;
        Ok(Self {
            module: module.to_string(),
            subscription: subscription.to_string(),
            verb: verb.to_string(),
            suffix: new_suffix(),
        })
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("sbr", 4, s)?;
        check_part(parts[0])?;
        check_part(parts[1])?;
        check_part(parts[2])?;
        Ok(Self {
            module: parts[0].to_string(),
            subscription: parts[1].to_string(),
            verb: parts[2].to_string(),
            suffix: parts[3].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!(
            "sbr-{}-{}-{}-{}",
            self.module, self.subscription, self.verb, self.suffix
        )
    }
}
string_serde!(SubscriberKey);

/// Key of a durable async call: `call-<suffix>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AsyncCallKey {
    suffix: String,
}

impl AsyncCallKey {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            suffix: new_suffix(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        let parts = split_key("call", 1, s)?;
        Ok(Self {
            suffix: parts[0].to_string(),
        })
    }

    fn encode(&self) -> String {
        format!("call-{}", self.suffix)
    }
}
string_serde!(AsyncCallKey);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_key_roundtrip() {
        let key = DeploymentKey::new("billing").unwrap();
        let parsed = DeploymentKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.module, "billing");
    }

    #[test]
    fn test_request_key_roundtrip() {
        let key = RequestKey::new();
        assert_eq!(RequestKey::parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_topic_event_key_roundtrip() {
        let key = TopicEventKey::new("billing", "invoices").unwrap();
        let parsed = TopicEventKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.topic, "invoices");
    }

    #[test]
    fn test_subscription_key_deterministic() {
        let a = SubscriptionKey::new("billing", "invoices").unwrap();
        let b = SubscriptionKey::new("billing", "invoices").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "sub-billing-invoices");
    }

    #[test]
    fn test_subscriber_key_roundtrip() {
        let key = SubscriberKey::new("billing", "invoices", "send_email").unwrap();
        let parsed = SubscriberKey::parse(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.verb, "send_email");
    }

    #[test]
    fn test_async_call_key_unique() {
        assert_ne!(AsyncCallKey::new(), AsyncCallKey::new());
    }

    #[test]
    fn test_parse_wrong_prefix() {
        assert!(matches!(
            DeploymentKey::parse("sub-billing-invoices"),
            Err(KeyError::WrongKind { expected: "dep", .. })
        ));
    }

    #[test]
    fn test_parse_wrong_arity() {
        assert!(matches!(
            SubscriptionKey::parse("sub-billing"),
            Err(KeyError::Malformed(_))
        ));
        assert!(matches!(
            SubscriptionKey::parse("sub-billing-invoices-extra"),
            Err(KeyError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_parts_rejected() {
        assert!(DeploymentKey::new("Billing").is_err());
        assert!(DeploymentKey::new("bill ing").is_err());
        assert!(DeploymentKey::new("").is_err());
        assert!(SubscriptionKey::parse("sub-Billing-invoices").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let key = SubscriptionKey::new("billing", "invoices").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"sub-billing-invoices\"");
        let back: SubscriptionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
