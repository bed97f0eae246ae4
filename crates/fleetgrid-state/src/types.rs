//! Domain types for the fleetgrid store.
//!
//! These types represent the persisted state of targets, distribution sets,
//! saved filters, rollouts, rollout groups, actions and their audit logs.
//! Entities reference each other by id only; all types are serialized
//! to/from JSON for storage in redb tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Controller identifier of a target (unique, chosen by the device).
pub type ControllerId = String;

pub type DistributionSetId = u64;
pub type FilterQueryId = u64;
pub type RolloutId = u64;
pub type RolloutGroupId = u64;
pub type ActionId = u64;

// ── Target ────────────────────────────────────────────────────────

/// A managed device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub controller_id: ControllerId,
    pub name: String,
    pub description: Option<String>,
    /// Last address the device polled from.
    pub address: Option<String>,
    pub created_at: u64,
    pub last_modified_at: u64,
    /// Unix timestamp of the last controller poll, if the device ever polled.
    pub last_contact_at: Option<u64>,
    pub update_status: TargetUpdateStatus,
    /// Free-form attributes reported by the device.
    pub attributes: BTreeMap<String, String>,
    /// Locked targets receive no new assignments.
    pub update_locked: bool,
    /// Distribution set of the latest assignment.
    pub assigned_ds: Option<DistributionSetId>,
    /// Distribution set the device last reported as installed.
    pub installed_ds: Option<DistributionSetId>,
}

impl Target {
    /// A freshly registered target with no history.
    pub fn new(controller_id: &str, name: &str, now: u64) -> Self {
        Self {
            controller_id: controller_id.to_string(),
            name: name.to_string(),
            description: None,
            address: None,
            created_at: now,
            last_modified_at: now,
            last_contact_at: None,
            update_status: TargetUpdateStatus::Unknown,
            attributes: BTreeMap::new(),
            update_locked: false,
            assigned_ds: None,
            installed_ds: None,
        }
    }
}

/// Update status as last derived from the target's actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetUpdateStatus {
    Unknown,
    Registered,
    Pending,
    InSync,
    Error,
}

impl TargetUpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetUpdateStatus::Unknown => "UNKNOWN",
            TargetUpdateStatus::Registered => "REGISTERED",
            TargetUpdateStatus::Pending => "PENDING",
            TargetUpdateStatus::InSync => "IN_SYNC",
            TargetUpdateStatus::Error => "ERROR",
        }
    }
}

// ── Distribution set ──────────────────────────────────────────────

/// An immutable bundle of software modules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributionSet {
    pub id: DistributionSetId,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub modules: Vec<SoftwareModule>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SoftwareModule {
    /// Module type, e.g. "os" or "application".
    pub kind: String,
    pub name: String,
    pub version: String,
}

// ── Target filter query ───────────────────────────────────────────

/// A named, persisted filter expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetFilterQuery {
    pub id: FilterQueryId,
    pub name: String,
    pub query: String,
    /// Distribution set assigned automatically to every matching target.
    pub auto_assign_ds: Option<DistributionSetId>,
    pub created_at: u64,
    pub last_modified_at: u64,
}

// ── Rollout ───────────────────────────────────────────────────────

/// One update campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rollout {
    pub id: RolloutId,
    pub name: String,
    pub description: Option<String>,
    /// Filter expression, evaluated once at creation.
    pub target_filter: String,
    pub distribution_set_id: DistributionSetId,
    pub total_targets: u64,
    pub status: RolloutStatus,
    /// Index of the group currently (or last) running.
    pub current_group: Option<u32>,
    pub group_count: u32,
    /// Soft-deleted rollouts are hidden from listings.
    pub deleted: bool,
    pub created_at: u64,
    pub last_modified_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Creating,
    Ready,
    Starting,
    Running,
    Paused,
    Finished,
    Error,
    Stopped,
}

impl RolloutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutStatus::Finished | RolloutStatus::Error | RolloutStatus::Stopped
        )
    }

    /// Whether the rollout life-cycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RolloutStatus) -> bool {
        use RolloutStatus::*;
        matches!(
            (self, next),
            (Creating, Ready)
                | (Ready, Starting)
                | (Ready, Stopped)
                | (Starting, Running)
                | (Starting, Finished)
                | (Starting, Stopped)
                | (Running, Paused)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Creating => "CREATING",
            RolloutStatus::Ready => "READY",
            RolloutStatus::Starting => "STARTING",
            RolloutStatus::Running => "RUNNING",
            RolloutStatus::Paused => "PAUSED",
            RolloutStatus::Finished => "FINISHED",
            RolloutStatus::Error => "ERROR",
            RolloutStatus::Stopped => "STOPPED",
        }
    }
}

/// One audited rollout state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutTransition {
    pub rollout_id: RolloutId,
    pub seq: u64,
    pub from: Option<RolloutStatus>,
    pub to: RolloutStatus,
    pub reason: String,
    pub occurred_at: u64,
}

// ── Rollout group ─────────────────────────────────────────────────

/// One ordered phase of a rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutGroup {
    pub id: RolloutGroupId,
    pub rollout_id: RolloutId,
    /// Position in rollout order, starting at 0.
    pub index: u32,
    pub name: String,
    /// Share of the rollout's targets (explicit groups) or `None` for
    /// equal-split groups.
    pub percentage: Option<u32>,
    pub total_targets: u64,
    pub success_condition: GroupCondition,
    pub success_action: SuccessAction,
    pub error_condition: Option<GroupCondition>,
    pub error_action: ErrorAction,
    pub status: RolloutGroupStatus,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutGroupStatus {
    Scheduled,
    Running,
    Finished,
    Error,
}

impl RolloutGroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutGroupStatus::Finished | RolloutGroupStatus::Error)
    }
}

/// A count or percentage threshold on a group's action outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCondition {
    pub kind: ThresholdKind,
    pub value: u32,
}

impl GroupCondition {
    pub fn percent(value: u32) -> Self {
        Self {
            kind: ThresholdKind::Percent,
            value,
        }
    }

    pub fn count(value: u32) -> Self {
        Self {
            kind: ThresholdKind::Count,
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThresholdKind {
    Count,
    Percent,
}

/// What happens when a group's success condition is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessAction {
    #[default]
    NextGroup,
}

/// What happens when a group's error condition is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Pause the rollout; later groups stay scheduled.
    #[default]
    Pause,
    /// End the rollout in `Error`.
    Abort,
    /// Record the failure and carry on with the next group.
    Ignore,
}

// ── Action ────────────────────────────────────────────────────────

/// One assignment of a distribution set to a target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: ActionId,
    pub controller_id: ControllerId,
    pub distribution_set_id: DistributionSetId,
    pub origin: ActionOrigin,
    /// Projection of the status log, written together with each entry.
    pub status: ActionStatusKind,
    pub active: bool,
    pub created_at: u64,
    pub last_modified_at: u64,
}

impl Action {
    pub fn rollout_group_id(&self) -> Option<RolloutGroupId> {
        match self.origin {
            ActionOrigin::Rollout { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}

/// Where an action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionOrigin {
    Rollout {
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
    },
    Direct,
    AutoAssign {
        filter_id: FilterQueryId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatusKind {
    Created,
    Running,
    Finished,
    Error,
    Canceling,
    Canceled,
}

impl ActionStatusKind {
    /// Terminal for the device: no further outcome is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatusKind::Finished | ActionStatusKind::Error | ActionStatusKind::Canceled
        )
    }

    pub fn can_transition_to(&self, next: ActionStatusKind) -> bool {
        use ActionStatusKind::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Error)
                | (Created, Canceling)
                | (Running, Running)
                | (Running, Finished)
                | (Running, Error)
                | (Running, Canceling)
                | (Canceling, Canceled)
        )
    }
}

/// One append-only entry in an action's status log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStatusEntry {
    pub action_id: ActionId,
    pub seq: u64,
    pub status: ActionStatusKind,
    pub occurred_at: u64,
    pub messages: Vec<String>,
}

/// Derive an action's status by replaying its log.
///
/// Returns `None` for an empty log.
pub fn replay_status(entries: &[ActionStatusEntry]) -> Option<ActionStatusKind> {
    let mut ordered: Vec<&ActionStatusEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.seq);
    ordered.last().map(|e| e.status)
}

// ── Paging ────────────────────────────────────────────────────────

/// Offset/limit window over a key-ordered result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Everything, in one page.
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset.saturating_add(self.limit),
            limit: self.limit,
        }
    }
}

/// A page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub content: Vec<T>,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            total: self.total,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Key range over the targets table (keyed by controller id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    All,
    Exact(String),
    Prefix(String),
}
