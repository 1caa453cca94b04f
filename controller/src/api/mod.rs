//! HTTP API surface
//!
//! Publish RPC for runners, deployment lifecycle, subscription admin, and
//! the console timeline (query + SSE stream).

pub mod routes;
pub mod server;
pub mod types;

pub use server::{ApiServer, ApiState};
pub use types::ApiError;
