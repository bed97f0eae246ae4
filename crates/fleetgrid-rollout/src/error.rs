//! Rollout error types.

use fleetgrid_filter::FilterError;
use fleetgrid_state::{RolloutStatus, StateError};
use thiserror::Error;

/// Caller-facing classification of a [`RolloutError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected input; nothing was applied.
    Validation,
    NotFound,
    /// The request is valid but clashes with current state.
    Conflict,
    /// The store failed; retrying later may succeed.
    Transient,
}

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rollout {id} cannot move from {from:?} to {to:?}")]
    IllegalTransition {
        id: u64,
        from: RolloutStatus,
        to: RolloutStatus,
    },

    #[error("invalid filter: {0}")]
    Filter(FilterError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type RolloutResult<T> = Result<T, RolloutError>;

impl RolloutError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        RolloutError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RolloutError::Validation(_) | RolloutError::Filter(_) => ErrorKind::Validation,
            RolloutError::NotFound { .. } => ErrorKind::NotFound,
            RolloutError::Conflict(_)
            | RolloutError::IllegalTransition { .. }
            | RolloutError::State(StateError::Duplicate { .. }) => ErrorKind::Conflict,
            RolloutError::State(_) => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<FilterError> for RolloutError {
    fn from(e: FilterError) -> Self {
        match e {
            FilterError::Store(state) => RolloutError::State(state),
            other => RolloutError::Filter(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(RolloutError::Validation("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(RolloutError::not_found("rollout", 4).kind(), ErrorKind::NotFound);
        assert_eq!(
            RolloutError::IllegalTransition {
                id: 1,
                from: RolloutStatus::Running,
                to: RolloutStatus::Starting,
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert!(RolloutError::State(StateError::Read("io".into())).is_transient());

        let clash = RolloutError::State(StateError::Duplicate {
            index: "active action slot (7)".into(),
            key: "dev-1".into(),
        });
        assert_eq!(clash.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn filter_store_failures_stay_transient() {
        let syntax: RolloutError = FilterError::Syntax {
            position: 3,
            message: "expected value".into(),
        }
        .into();
        assert_eq!(syntax.kind(), ErrorKind::Validation);

        let store: RolloutError = FilterError::Store(StateError::Read("io".into())).into();
        assert_eq!(store.kind(), ErrorKind::Transient);
    }
}
