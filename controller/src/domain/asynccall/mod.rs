//! Durable async calls
//!
//! - `executor` - leases due calls, invokes sink verbs, applies retry and
//!   catch semantics, records outcomes
//! - `reaper` - returns expired leases to the queue
//! - `backoff` - backoff laws

pub mod backoff;
pub mod executor;
pub mod reaper;

pub use executor::{Executor, ExecutorConfig};
pub use reaper::LeaseReaper;
