//! Store error types.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// Failures of the redb-backed store.
///
/// Everything except [`StateError::Duplicate`] is an infrastructure failure
/// that callers treat as transient.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("failed to encode record: {0}")]
    Encode(String),

    /// A stored record or key no longer decodes.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A unique index already maps `key` to another record.
    #[error("{index} already holds '{key}'")]
    Duplicate { index: String, key: String },
}

impl StateError {
    pub(crate) fn duplicate(index: impl Into<String>, key: impl Into<String>) -> Self {
        StateError::Duplicate {
            index: index.into(),
            key: key.into(),
        }
    }
}
