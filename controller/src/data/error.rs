//! Store-boundary error taxonomy
//!
//! Driver errors are translated into these kinds at the repository boundary;
//! domain logic never inspects a raw `sqlx::Error`. `NotFound` and
//! `Conflict` are part of normal operation (missing lookups, lost claim
//! races) and callers decide whether to surface or swallow them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient database error: {0}")]
    Transient(String),

    #[error("payload error: {0}")]
    Payload(String),

    #[error("database error: {0}")]
    Internal(String),

    #[error("migration {version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },
}

impl DataError {
    /// Whether retrying the same operation later can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<sqlx::Error> for DataError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::NotFound("row"),
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation => Self::Conflict(db.message().to_string()),
                sqlx::error::ErrorKind::ForeignKeyViolation => {
                    Self::Conflict(db.message().to_string())
                }
                _ => Self::Internal(db.message().to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Transient(e.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
