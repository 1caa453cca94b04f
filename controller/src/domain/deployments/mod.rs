//! Deployment lifecycle hooks

pub mod reconciler;

pub use reconciler::{ReconcileError, Reconciler};
