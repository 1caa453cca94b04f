//! Store repositories
//!
//! Free async functions over `&mut SqliteConnection` so operations compose
//! inside a caller-owned transaction; read-only helpers that never need
//! transactional context take the pool instead.

pub mod async_calls;
pub mod deployments;
pub mod subscriptions;
pub mod timeline;
pub mod topics;
