//! redb table definitions for the fleetgrid store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types, or an empty slice for pure index tables). Numeric ids are
//! zero-padded to 20 digits so key order equals numeric order; composite
//! keys follow `{parent}:{child}` to allow prefix scans.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Targets keyed by [`target_key`].
pub const TARGETS: JsonTable = TableDefinition::new("targets");

/// Distribution sets keyed by `{id}`.
pub const DISTRIBUTION_SETS: JsonTable = TableDefinition::new("distribution_sets");

/// Saved filters keyed by `{id}`.
pub const FILTER_QUERIES: JsonTable = TableDefinition::new("filter_queries");

/// Unique filter names: `{name}` → filter id.
pub const FILTER_QUERY_NAMES: JsonTable = TableDefinition::new("filter_query_names");

/// Rollouts keyed by `{id}`.
pub const ROLLOUTS: JsonTable = TableDefinition::new("rollouts");

/// Unique rollout names: `{name}` → rollout id.
pub const ROLLOUT_NAMES: JsonTable = TableDefinition::new("rollout_names");

/// Rollout audit trail keyed by `{rollout_id}:{seq}`.
pub const ROLLOUT_HISTORY: JsonTable = TableDefinition::new("rollout_history");

/// Rollout groups keyed by `{id}`.
pub const ROLLOUT_GROUPS: JsonTable = TableDefinition::new("rollout_groups");

/// Group order: `{rollout_id}:{index}` → group id.
pub const ROLLOUT_GROUP_ORDER: JsonTable = TableDefinition::new("rollout_group_order");

/// Membership: `{rollout_id}:{controller_id}` → group id.
pub const ROLLOUT_TARGETS: JsonTable = TableDefinition::new("rollout_targets");

/// Membership by group: `{group_id}:{controller_id}` (index only).
pub const GROUP_TARGETS: JsonTable = TableDefinition::new("group_targets");

/// Actions keyed by `{id}`.
pub const ACTIONS: JsonTable = TableDefinition::new("actions");

/// The single active action per target: `{controller_id}` → action id.
pub const ACTIVE_ACTIONS: JsonTable = TableDefinition::new("active_actions");

/// Superseded actions awaiting device feedback: `{action_id}` (index only).
pub const CANCELING_ACTIONS: JsonTable = TableDefinition::new("canceling_actions");

/// Actions by target: `{controller_id}:{action_id}` (index only).
pub const TARGET_ACTIONS: JsonTable = TableDefinition::new("target_actions");

/// Actions by group: `{group_id}:{action_id}` (index only).
pub const GROUP_ACTIONS: JsonTable = TableDefinition::new("group_actions");

/// Action status log keyed by `{action_id}:{seq}`.
pub const ACTION_STATUS: JsonTable = TableDefinition::new("action_status");

/// Id sequences keyed by entity name.
pub const SEQUENCES: JsonTable = TableDefinition::new("sequences");

pub(crate) const ALL_TABLES: [JsonTable; 18] = [
    TARGETS,
    DISTRIBUTION_SETS,
    FILTER_QUERIES,
    FILTER_QUERY_NAMES,
    ROLLOUTS,
    ROLLOUT_NAMES,
    ROLLOUT_HISTORY,
    ROLLOUT_GROUPS,
    ROLLOUT_GROUP_ORDER,
    ROLLOUT_TARGETS,
    GROUP_TARGETS,
    ACTIONS,
    ACTIVE_ACTIONS,
    CANCELING_ACTIONS,
    TARGET_ACTIONS,
    GROUP_ACTIONS,
    ACTION_STATUS,
    SEQUENCES,
];

/// Zero-padded key for a numeric id.
pub fn id_key(id: u64) -> String {
    format!("{id:020}")
}

/// Key of a target row. Controller ids are unique ignoring case.
pub fn target_key(controller_id: &str) -> String {
    controller_id.to_lowercase()
}

/// `{parent}:{child}` composite key.
pub fn child_key(parent: &str, child: &str) -> String {
    format!("{parent}:{child}")
}
