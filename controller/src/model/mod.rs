//! Domain model shared across the controller
//!
//! - `keys` - typed opaque keys for every addressable entity
//! - `schema` - deployed module schemas (topics, subscriptions, verbs)
//! - `origin` - async-call origin sum type
//! - `context` - request key and trace context propagation

pub mod context;
pub mod keys;
pub mod origin;
pub mod schema;

pub use context::{RequestContext, TraceContext};
pub use keys::{
    AsyncCallKey, DeploymentKey, KeyError, RequestKey, SubscriberKey, SubscriptionKey,
    TopicEventKey,
};
pub use origin::AsyncOrigin;
pub use schema::{Decl, Metadata, ModuleSchema, RetryParams, TopicRef, VerbRef};
