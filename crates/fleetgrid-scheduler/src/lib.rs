//! fleetgrid-scheduler: background passes that keep rollouts moving.
//!
//! Two independent loops, each with its own cadence:
//!
//! ```text
//! RolloutScheduler (tick_interval)
//!   ├── ActionManager::expire_stale   (action timeouts)
//!   └── per running rollout, on a JoinSet bounded by a Semaphore
//!       └── RolloutManager::try_advance (until no more progress)
//!
//! AutoAssigner (auto_assign_interval)
//!   └── per filter with an auto-assign distribution set
//!       └── ActionManager::auto_assign (per matching target)
//! ```

pub mod auto_assign;
pub mod error;
pub mod scheduler;

pub use auto_assign::{AutoAssignReport, AutoAssigner};
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{RolloutScheduler, TickReport};
