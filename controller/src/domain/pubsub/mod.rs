//! Pub/sub: the event-to-async-call pipeline
//!
//! - `publisher` - appends published events to the topic journal
//! - `progressor` - advances subscription cursors by claiming events and
//!   enqueuing async calls for subscribers

pub mod progressor;
pub mod publisher;

pub use progressor::{Progressor, ProgressorConfig};
pub use publisher::{PublishError, Publisher};
