//! Data storage layer
//!
//! - `sqlite` - the shared relational store (journal, cursors, queue,
//!   deployments, timeline) every controller coordinates through
//! - `types` - row types shared between repositories and domain logic
//! - `error` - store-boundary error taxonomy

pub mod error;
pub mod sqlite;
pub mod types;

pub use error::DataError;
pub use sqlite::SqliteService;
pub use types::{
    AsyncCallState, CreateAsyncCall, DeploymentRow, LeasedCall, NextEvent, SubscriberRow,
    SubscriptionRow, TopicRow,
};
