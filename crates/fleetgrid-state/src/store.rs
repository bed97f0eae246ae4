//! StateStore: redb-backed persistence for fleetgrid.
//!
//! All mutations go through [`StateStore::write`]: the closure receives a
//! [`WriteScope`] over one redb write transaction, and the transaction is
//! committed only when the closure returns `Ok`. Reads go through
//! [`StateStore::read`] and see one consistent snapshot.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableHandle, WriteTransaction};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;
use crate::view::{JsonRead, StoreView, get_json};

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in ALL_TABLES {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` against a read snapshot.
    pub fn read<T, E>(&self, f: impl FnOnce(&ReadScope) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self
            .db
            .begin_read()
            .map_err(map_err!(Transaction))
            .map_err(E::from)?;
        f(&ReadScope { txn })
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`; any `Err` aborts every write made
    /// through the scope.
    pub fn write<T, E>(&self, f: impl FnOnce(&mut WriteScope) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self
            .db
            .begin_write()
            .map_err(map_err!(Transaction))
            .map_err(E::from)?;
        let mut scope = WriteScope { txn };
        match f(&mut scope) {
            Ok(value) => {
                scope
                    .txn
                    .commit()
                    .map_err(map_err!(Transaction))
                    .map_err(E::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = scope.txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }
}

/// A read-only snapshot.
pub struct ReadScope {
    txn: ReadTransaction,
}

impl StoreView for ReadScope {
    fn table(&self, def: JsonTable) -> StateResult<impl JsonRead + '_> {
        self.txn.open_table(def).map_err(map_err!(Table))
    }
}

/// An open write transaction. Reads through [`StoreView`] observe the
/// transaction's own writes.
pub struct WriteScope {
    txn: WriteTransaction,
}

impl StoreView for WriteScope {
    fn table(&self, def: JsonTable) -> StateResult<impl JsonRead + '_> {
        self.txn.open_table(def).map_err(map_err!(Table))
    }
}

impl WriteScope {
    fn put_json<V: Serialize>(&self, def: JsonTable, key: &str, value: &V) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Encode))?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    fn put_index(&self, def: JsonTable, key: &str) -> StateResult<()> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let empty: &[u8] = &[];
        table.insert(key, empty).map_err(map_err!(Write))?;
        Ok(())
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        Ok(existed)
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn remove_prefix(&self, def: JsonTable, prefix: &str) -> StateResult<usize> {
        let keys = crate::view::prefix_keys(&self.table(def)?, prefix)?;
        let mut table = self.txn.open_table(def).map_err(map_err!(Table))?;
        for key in &keys {
            table.remove(key.as_str()).map_err(map_err!(Write))?;
        }
        Ok(keys.len())
    }

    /// Highest `seq` under `{parent}:`, or 0.
    fn last_seq(&self, def: JsonTable, parent: &str) -> StateResult<u64> {
        let table = self.table(def)?;
        let lower = format!("{parent}:");
        let upper = format!("{parent};");
        let last = table
            .range(lower.as_str()..upper.as_str())
            .map_err(map_err!(Read))?
            .next_back();
        match last {
            Some(entry) => {
                let (key, _) = entry.map_err(map_err!(Read))?;
                key.value()[lower.len()..]
                    .parse::<u64>()
                    .map_err(map_err!(Corrupt))
            }
            None => Ok(0),
        }
    }

    fn insert_unique_name(&self, def: JsonTable, name: &str, id: u64) -> StateResult<()> {
        let taken: Option<u64> = get_json(&self.table(def)?, name)?;
        if taken.is_some_and(|existing| existing != id) {
            return Err(StateError::duplicate(def.name(), name));
        }
        self.put_json(def, name, &id)
    }

    /// Allocate the next id of `sequence`, starting at 1.
    pub fn next_id(&mut self, sequence: &str) -> StateResult<u64> {
        let current: u64 = get_json(&self.table(SEQUENCES)?, sequence)?.unwrap_or(0);
        let next = current + 1;
        self.put_json(SEQUENCES, sequence, &next)?;
        Ok(next)
    }

    // ── Targets ────────────────────────────────────────────────────

    pub fn put_target(&mut self, target: &Target) -> StateResult<()> {
        self.put_json(TARGETS, &target_key(&target.controller_id), target)
    }

    // ── Distribution sets ──────────────────────────────────────────

    pub fn put_distribution_set(&mut self, ds: &DistributionSet) -> StateResult<()> {
        self.put_json(DISTRIBUTION_SETS, &id_key(ds.id), ds)
    }

    // ── Filter queries ─────────────────────────────────────────────

    /// Insert or update a saved filter, keeping the name index in step.
    ///
    /// Fails with [`StateError::Duplicate`] when another filter holds the name.
    pub fn put_filter_query(&mut self, query: &TargetFilterQuery) -> StateResult<()> {
        let previous = self.get_filter_query(query.id)?;
        self.insert_unique_name(FILTER_QUERY_NAMES, &query.name, query.id)?;
        if let Some(previous) = previous
            && previous.name != query.name
        {
            self.remove(FILTER_QUERY_NAMES, &previous.name)?;
        }
        self.put_json(FILTER_QUERIES, &id_key(query.id), query)
    }

    /// Returns true if the filter existed.
    pub fn delete_filter_query(&mut self, id: FilterQueryId) -> StateResult<bool> {
        let Some(query) = self.get_filter_query(id)? else {
            return Ok(false);
        };
        self.remove(FILTER_QUERY_NAMES, &query.name)?;
        self.remove(FILTER_QUERIES, &id_key(id))
    }

    // ── Rollouts ───────────────────────────────────────────────────

    pub fn put_rollout(&mut self, rollout: &Rollout) -> StateResult<()> {
        self.put_json(ROLLOUTS, &id_key(rollout.id), rollout)
    }

    pub fn reserve_rollout_name(&mut self, name: &str, id: RolloutId) -> StateResult<()> {
        self.insert_unique_name(ROLLOUT_NAMES, name, id)
    }

    pub fn release_rollout_name(&mut self, name: &str) -> StateResult<bool> {
        self.remove(ROLLOUT_NAMES, name)
    }

    /// Remove a rollout with its groups, membership and history.
    pub fn delete_rollout_hard(&mut self, id: RolloutId) -> StateResult<bool> {
        let Some(rollout) = self.get_rollout(id)? else {
            return Ok(false);
        };
        let groups = self.groups_for_rollout(id)?;
        let rollout_prefix = child_key(&id_key(id), "");

        for group in &groups {
            let group_prefix = child_key(&id_key(group.id), "");
            self.remove_prefix(GROUP_TARGETS, &group_prefix)?;
            self.remove_prefix(GROUP_ACTIONS, &group_prefix)?;
            self.remove(ROLLOUT_GROUPS, &id_key(group.id))?;
        }
        self.remove_prefix(ROLLOUT_GROUP_ORDER, &rollout_prefix)?;
        self.remove_prefix(ROLLOUT_TARGETS, &rollout_prefix)?;
        self.remove_prefix(ROLLOUT_HISTORY, &rollout_prefix)?;

        // Only release the name if it still points at this rollout.
        if self.rollout_id_by_name(&rollout.name)? == Some(id) {
            self.remove(ROLLOUT_NAMES, &rollout.name)?;
        }
        self.remove(ROLLOUTS, &id_key(id))?;
        debug!(rollout_id = id, groups = groups.len(), "rollout deleted");
        Ok(true)
    }

    /// Append one entry to a rollout's audit trail.
    pub fn append_rollout_transition(
        &mut self,
        rollout_id: RolloutId,
        from: Option<RolloutStatus>,
        to: RolloutStatus,
        reason: &str,
        now: u64,
    ) -> StateResult<RolloutTransition> {
        let parent = id_key(rollout_id);
        let seq = self.last_seq(ROLLOUT_HISTORY, &parent)? + 1;
        let transition = RolloutTransition {
            rollout_id,
            seq,
            from,
            to,
            reason: reason.to_string(),
            occurred_at: now,
        };
        self.put_json(ROLLOUT_HISTORY, &child_key(&parent, &id_key(seq)), &transition)?;
        Ok(transition)
    }

    // ── Rollout groups ─────────────────────────────────────────────

    pub fn put_group(&mut self, group: &RolloutGroup) -> StateResult<()> {
        let order_key = child_key(&id_key(group.rollout_id), &format!("{:010}", group.index));
        self.put_json(ROLLOUT_GROUP_ORDER, &order_key, &group.id)?;
        self.put_json(ROLLOUT_GROUPS, &id_key(group.id), group)
    }

    /// Record `controller_id` as a member of `group_id`.
    ///
    /// A target belongs to at most one group per rollout; a second insert
    /// fails with [`StateError::Duplicate`].
    pub fn add_member(
        &mut self,
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        controller_id: &str,
    ) -> StateResult<()> {
        if self.rollout_group_of(rollout_id, controller_id)?.is_some() {
            return Err(StateError::duplicate(
                format!("rollout {rollout_id} membership"),
                controller_id,
            ));
        }
        self.put_json(
            ROLLOUT_TARGETS,
            &child_key(&id_key(rollout_id), controller_id),
            &group_id,
        )?;
        self.put_index(GROUP_TARGETS, &child_key(&id_key(group_id), controller_id))
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Insert or update an action row and its lookup indexes.
    pub fn put_action(&mut self, action: &Action) -> StateResult<()> {
        let key = id_key(action.id);
        self.put_index(TARGET_ACTIONS, &child_key(&action.controller_id, &key))?;
        if let Some(group_id) = action.rollout_group_id() {
            self.put_index(GROUP_ACTIONS, &child_key(&id_key(group_id), &key))?;
        }
        self.put_json(ACTIONS, &key, action)
    }

    /// Append a status entry and update the action's projected status in the
    /// same transaction.
    pub fn append_action_status(
        &mut self,
        action: &mut Action,
        status: ActionStatusKind,
        messages: Vec<String>,
        now: u64,
    ) -> StateResult<ActionStatusEntry> {
        let parent = id_key(action.id);
        let seq = self.last_seq(ACTION_STATUS, &parent)? + 1;
        let entry = ActionStatusEntry {
            action_id: action.id,
            seq,
            status,
            occurred_at: now,
            messages,
        };
        self.put_json(ACTION_STATUS, &child_key(&parent, &id_key(seq)), &entry)?;

        action.status = status;
        action.last_modified_at = now;
        self.put_json(ACTIONS, &parent, action)?;
        Ok(entry)
    }

    /// Make `action_id` the target's active action.
    ///
    /// Fails with [`StateError::Duplicate`] while a different action is active.
    pub fn set_active_action(&mut self, controller_id: &str, action_id: ActionId) -> StateResult<()> {
        if let Some(existing) = self.active_action_id(controller_id)?
            && existing != action_id
        {
            return Err(StateError::duplicate(
                format!("active action slot ({existing})"),
                controller_id,
            ));
        }
        self.put_json(ACTIVE_ACTIONS, controller_id, &action_id)
    }

    /// Clear the active slot if it still holds `action_id`.
    pub fn clear_active_action(&mut self, controller_id: &str, action_id: ActionId) -> StateResult<bool> {
        if self.active_action_id(controller_id)? != Some(action_id) {
            return Ok(false);
        }
        self.remove(ACTIVE_ACTIONS, controller_id)
    }

    pub fn mark_canceling(&mut self, action_id: ActionId) -> StateResult<()> {
        self.put_index(CANCELING_ACTIONS, &id_key(action_id))
    }

    pub fn clear_canceling(&mut self, action_id: ActionId) -> StateResult<bool> {
        self.remove(CANCELING_ACTIONS, &id_key(action_id))
    }
}
