use fleetgrid_state::StateError;
use thiserror::Error;

pub type FilterResult<T> = Result<T, FilterError>;

#[derive(Debug, Error)]
pub enum FilterError {
    /// The expression is not well-formed. `position` is a byte offset.
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("unsupported field '{field}'")]
    UnsupportedField { field: String },

    #[error("invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StateError),
}

impl FilterError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        FilterError::Syntax {
            position,
            message: message.into(),
        }
    }
}
