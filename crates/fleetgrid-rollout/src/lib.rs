//! fleetgrid campaigns: staged rollouts of distribution sets to device fleets.
//!
//! A rollout evaluates a target filter once, freezes the matching devices
//! into ordered groups and then moves through them one group at a time,
//! gated by each group's success and error thresholds. Devices see the
//! rollout only as actions: one active assignment per target, with an
//! append-only status log.
//!
//! # Components
//!
//! - **`partition`**: splitting devices into groups (equal or percentage)
//! - **`condition`**: group thresholds and verdicts
//! - **`action`**: the per-device action state machine
//! - **`controller`**: the rollout state machine (create, start, advance, stop)
//! - **`filter_query`**: saved filters with optional auto-assignment
//! - **`inventory`**: targets and distribution sets
//! - **`events`**: post-commit change notifications

pub mod action;
pub mod condition;
pub mod controller;
pub mod error;
pub mod events;
pub mod filter_query;
pub mod inventory;
pub mod locks;
pub mod partition;

#[cfg(test)]
mod testing;

pub use action::{ActionManager, ActionReport, ExpiryReport, ReportOutcome};
pub use condition::{GroupTally, GroupVerdict, evaluate_group};
pub use controller::{AdvanceOutcome, CreateRollout, CreatedRollout, RolloutManager};
pub use error::{ErrorKind, RolloutError, RolloutResult};
pub use events::{EventBus, FleetEvent};
pub use filter_query::{FilterQueryManager, FilterQueryUpdate};
pub use inventory::{Inventory, NewDistributionSet, NewTarget};
pub use locks::KeyedLocks;
pub use partition::{GroupDefinition, GroupSpec, PlannedGroup, RoundingRule, group_sizes, partition};
