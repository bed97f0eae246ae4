//! Scheduler error types.

use thiserror::Error;

/// Errors that abort a whole scheduler pass.
///
/// Failures of a single rollout or target are logged and counted in the
/// pass report instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("rollout error: {0}")]
    Rollout(#[from] fleetgrid_rollout::RolloutError),

    #[error("filter error: {0}")]
    Filter(#[from] fleetgrid_filter::FilterError),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),

    #[error("runtime error: {0}")]
    Runtime(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
