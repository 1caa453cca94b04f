//! Deployed module schemas
//!
//! The controller receives module schemas as already-structured JSON when a
//! deployment is activated; parsing and validating source-level schemas is
//! the build engine's job. The declarations here are the subset the async
//! work plane consumes: topics, subscriptions, and verbs with subscriber and
//! retry metadata.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::time::{format_duration, parse_duration};

/// Reference to a topic declared by some module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRef {
    pub module: String,
    pub name: String,
}

/// Reference to a verb declared by some module, rendered as `module.verb`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VerbRef {
    pub module: String,
    pub name: String,
}

impl VerbRef {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for VerbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

impl FromStr for VerbRef {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() => Ok(Self {
                module: module.to_string(),
                name: name.to_string(),
            }),
            _ => Err(SchemaError::InvalidVerbRef(s.to_string())),
        }
    }
}

impl TryFrom<String> for VerbRef {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VerbRef> for String {
    fn from(v: VerbRef) -> Self {
        v.to_string()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid verb reference {0:?}, expected module.verb")]
    InvalidVerbRef(String),

    #[error("invalid retry duration {0:?}")]
    InvalidDuration(String),

    #[error("verb {verb} declares itself as its own catch verb")]
    CatchIsSink { verb: String },
}

/// A declaration inside a module schema
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decl {
    Topic { name: String },
    Subscription { name: String, topic: TopicRef },
    Verb { name: String, metadata: Vec<Metadata> },
}

/// Metadata attached to a verb declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Metadata {
    /// The verb consumes events from the named subscription
    Subscriber { subscription: String },
    /// Retry policy for async invocations of the verb
    Retry {
        #[serde(default)]
        count: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_backoff: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_backoff: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        catch: Option<VerbRef>,
    },
}

/// Schema of one deployable module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSchema {
    pub name: String,
    #[serde(default)]
    pub decls: Vec<Decl>,
}

impl ModuleSchema {
    /// Topics declared by this module
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Topic { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Subscriptions declared by this module
    pub fn subscriptions(&self) -> impl Iterator<Item = (&str, &TopicRef)> {
        self.decls.iter().filter_map(|d| match d {
            Decl::Subscription { name, topic } => Some((name.as_str(), topic)),
            _ => None,
        })
    }

    /// Verbs subscribing to the named subscription, with their retry policy
    pub fn subscribers_of(
        &self,
        subscription: &str,
    ) -> Result<Vec<(&str, RetryParams)>, SchemaError> {
        let mut out = Vec::new();
        for decl in &self.decls {
            let Decl::Verb { name, metadata } = decl else {
                continue;
            };
            let subscribes = metadata.iter().any(
                |m| matches!(m, Metadata::Subscriber { subscription: s } if s == subscription),
            );
            if subscribes {
                out.push((name.as_str(), retry_params(metadata)?));
            }
        }
        Ok(out)
    }

    /// Whether any verb in the module subscribes to the named subscription
    pub fn has_subscribers(&self, subscription: &str) -> bool {
        self.decls.iter().any(|d| {
            matches!(d, Decl::Verb { metadata, .. } if metadata.iter().any(
                |m| matches!(m, Metadata::Subscriber { subscription: s } if s == subscription),
            ))
        })
    }

    /// Retry policy of the named verb, defaults if the verb has no retry
    /// metadata or is not declared at all
    pub fn retry_params_of(&self, verb: &str) -> Result<RetryParams, SchemaError> {
        for decl in &self.decls {
            if let Decl::Verb { name, metadata } = decl
                && name == verb
            {
                return retry_params(metadata);
            }
        }
        Ok(RetryParams::default())
    }
}

fn retry_params(metadata: &[Metadata]) -> Result<RetryParams, SchemaError> {
    for m in metadata {
        if let Metadata::Retry {
            count,
            min_backoff,
            max_backoff,
            catch,
        } = m
        {
            return RetryParams::parse(*count, min_backoff.as_deref(), max_backoff.as_deref())
                .map(|p| RetryParams {
                    catch: catch.clone(),
                    ..p
                });
        }
    }
    Ok(RetryParams::default())
}

/// Parsed retry policy of a subscriber or async verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryParams {
    /// Retries after the initial attempt
    pub count: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub catch: Option<VerbRef>,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            count: 0,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
            catch: None,
        }
    }
}

impl RetryParams {
    pub fn parse(
        count: u32,
        min_backoff: Option<&str>,
        max_backoff: Option<&str>,
    ) -> Result<Self, SchemaError> {
        let defaults = Self::default();
        let min = match min_backoff {
            Some(s) => parse_duration(s).ok_or_else(|| SchemaError::InvalidDuration(s.into()))?,
            None => defaults.min_backoff,
        };
        let max = match max_backoff {
            Some(s) => parse_duration(s).ok_or_else(|| SchemaError::InvalidDuration(s.into()))?,
            None => defaults.max_backoff,
        };
        Ok(Self {
            count,
            min_backoff: min,
            max_backoff: max.max(min),
            catch: None,
        })
    }

    pub fn min_backoff_str(&self) -> String {
        format_duration(self.min_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ModuleSchema {
        serde_json::from_value(serde_json::json!({
            "name": "billing",
            "decls": [
                {"type": "topic", "name": "invoices"},
                {"type": "subscription", "name": "new_invoices",
                 "topic": {"module": "billing", "name": "invoices"}},
                {"type": "verb", "name": "send_email", "metadata": [
                    {"type": "subscriber", "subscription": "new_invoices"},
                    {"type": "retry", "count": 2, "min_backoff": "100ms",
                     "max_backoff": "1s", "catch": "billing.email_failed"}
                ]},
                {"type": "verb", "name": "email_failed", "metadata": []}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_topics_and_subscriptions() {
        let s = schema();
        assert_eq!(s.topics().collect::<Vec<_>>(), vec!["invoices"]);
        let subs: Vec<_> = s.subscriptions().collect();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].0, "new_invoices");
        assert_eq!(subs[0].1.module, "billing");
    }

    #[test]
    fn test_subscribers_of() {
        let s = schema();
        let subscribers = s.subscribers_of("new_invoices").unwrap();
        assert_eq!(subscribers.len(), 1);
        let (verb, retry) = &subscribers[0];
        assert_eq!(*verb, "send_email");
        assert_eq!(retry.count, 2);
        assert_eq!(retry.min_backoff, Duration::from_millis(100));
        assert_eq!(retry.max_backoff, Duration::from_secs(1));
        assert_eq!(retry.catch, Some(VerbRef::new("billing", "email_failed")));
    }

    #[test]
    fn test_has_subscribers() {
        let s = schema();
        assert!(s.has_subscribers("new_invoices"));
        assert!(!s.has_subscribers("other"));
    }

    #[test]
    fn test_retry_params_of_verb_without_metadata() {
        let s = schema();
        let retry = s.retry_params_of("email_failed").unwrap();
        assert_eq!(retry, RetryParams::default());
    }

    #[test]
    fn test_retry_defaults() {
        let p = RetryParams::parse(0, None, None).unwrap();
        assert_eq!(p.count, 0);
        assert_eq!(p.min_backoff, Duration::from_secs(1));
        assert_eq!(p.max_backoff, Duration::from_secs(3600));
        assert!(p.catch.is_none());
    }

    #[test]
    fn test_retry_max_clamped_to_min() {
        let p = RetryParams::parse(1, Some("10s"), Some("1s")).unwrap();
        assert_eq!(p.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_retry_invalid_duration() {
        assert_eq!(
            RetryParams::parse(1, Some("fast"), None),
            Err(SchemaError::InvalidDuration("fast".into()))
        );
    }

    #[test]
    fn test_verb_ref_parse() {
        let v: VerbRef = "billing.send_email".parse().unwrap();
        assert_eq!(v, VerbRef::new("billing", "send_email"));
        assert!("billing".parse::<VerbRef>().is_err());
        assert!(".send_email".parse::<VerbRef>().is_err());
    }
}
