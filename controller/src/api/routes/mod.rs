//! API route handlers

pub mod deployments;
pub mod health;
pub mod publish;
pub mod subscriptions;
pub mod timeline;
