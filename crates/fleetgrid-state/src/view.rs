//! Read access shared by read and write transactions.

use redb::ReadableTable;
use serde::de::DeserializeOwned;

use crate::error::StateResult;
use crate::tables::*;
use crate::types::*;

/// Any readable `&str → &[u8]` table, read-only or writable.
pub trait JsonRead: ReadableTable<&'static str, &'static [u8]> {}

impl<T: ReadableTable<&'static str, &'static [u8]>> JsonRead for T {}

/// Typed reads over one transaction.
///
/// Implemented by [`ReadScope`](crate::ReadScope) (snapshot reads) and
/// [`WriteScope`](crate::WriteScope) (reads that see the transaction's own
/// uncommitted writes).
pub trait StoreView {
    /// Open a table inside this transaction.
    fn table(&self, def: JsonTable) -> StateResult<impl JsonRead + '_>;

    // ── Targets ────────────────────────────────────────────────────

    fn get_target(&self, controller_id: &str) -> StateResult<Option<Target>> {
        get_json(&self.table(TARGETS)?, &target_key(controller_id))
    }

    /// Walk targets in key order within `range`, keeping those accepted by
    /// `matcher`. Only the requested page is materialized; `total` counts
    /// every match.
    fn scan_targets(
        &self,
        range: &KeyRange,
        matcher: &dyn Fn(&Target) -> bool,
        page: PageRequest,
    ) -> StateResult<Page<Target>> {
        let table = self.table(TARGETS)?;
        let mut collector = PageCollector::new(page);

        match range {
            KeyRange::Exact(id) => {
                if let Some(target) = get_json::<Target>(&table, &target_key(id))?
                    && matcher(&target)
                {
                    collector.offer(target);
                }
            }
            KeyRange::Prefix(prefix) => {
                let prefix = target_key(prefix);
                for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                    let (key, value) = entry.map_err(map_err!(Read))?;
                    if !key.value().starts_with(prefix.as_str()) {
                        break;
                    }
                    let target: Target = decode(value.value())?;
                    if matcher(&target) {
                        collector.offer(target);
                    }
                }
            }
            KeyRange::All => {
                for entry in table.iter().map_err(map_err!(Read))? {
                    let (_, value) = entry.map_err(map_err!(Read))?;
                    let target: Target = decode(value.value())?;
                    if matcher(&target) {
                        collector.offer(target);
                    }
                }
            }
        }

        Ok(collector.finish())
    }

    fn list_targets(&self, page: PageRequest) -> StateResult<Page<Target>> {
        self.scan_targets(&KeyRange::All, &|_| true, page)
    }

    // ── Distribution sets ──────────────────────────────────────────

    fn get_distribution_set(&self, id: DistributionSetId) -> StateResult<Option<DistributionSet>> {
        get_json(&self.table(DISTRIBUTION_SETS)?, &id_key(id))
    }

    fn list_distribution_sets(&self, page: PageRequest) -> StateResult<Page<DistributionSet>> {
        scan_values(&self.table(DISTRIBUTION_SETS)?, &|_| true, page)
    }

    // ── Filter queries ─────────────────────────────────────────────

    fn get_filter_query(&self, id: FilterQueryId) -> StateResult<Option<TargetFilterQuery>> {
        get_json(&self.table(FILTER_QUERIES)?, &id_key(id))
    }

    fn filter_query_id_by_name(&self, name: &str) -> StateResult<Option<FilterQueryId>> {
        get_json(&self.table(FILTER_QUERY_NAMES)?, name)
    }

    fn scan_filter_queries(
        &self,
        matcher: &dyn Fn(&TargetFilterQuery) -> bool,
        page: PageRequest,
    ) -> StateResult<Page<TargetFilterQuery>> {
        scan_values(&self.table(FILTER_QUERIES)?, matcher, page)
    }

    fn count_filter_queries(&self) -> StateResult<u64> {
        use redb::ReadableTableMetadata;
        let table = self.table(FILTER_QUERIES)?;
        table.len().map_err(map_err!(Read))
    }

    // ── Rollouts ───────────────────────────────────────────────────

    fn get_rollout(&self, id: RolloutId) -> StateResult<Option<Rollout>> {
        get_json(&self.table(ROLLOUTS)?, &id_key(id))
    }

    fn rollout_id_by_name(&self, name: &str) -> StateResult<Option<RolloutId>> {
        get_json(&self.table(ROLLOUT_NAMES)?, name)
    }

    fn scan_rollouts(
        &self,
        matcher: &dyn Fn(&Rollout) -> bool,
        page: PageRequest,
    ) -> StateResult<Page<Rollout>> {
        scan_values(&self.table(ROLLOUTS)?, matcher, page)
    }

    fn rollout_history(&self, id: RolloutId) -> StateResult<Vec<RolloutTransition>> {
        let table = self.table(ROLLOUT_HISTORY)?;
        let prefix = child_key(&id_key(id), "");
        Ok(scan_prefix(&table, &prefix)?
            .into_iter()
            .map(|(_, t)| t)
            .collect())
    }

    // ── Rollout groups ─────────────────────────────────────────────

    fn get_group(&self, id: RolloutGroupId) -> StateResult<Option<RolloutGroup>> {
        get_json(&self.table(ROLLOUT_GROUPS)?, &id_key(id))
    }

    /// Groups of a rollout in rollout order.
    fn groups_for_rollout(&self, rollout_id: RolloutId) -> StateResult<Vec<RolloutGroup>> {
        let order = self.table(ROLLOUT_GROUP_ORDER)?;
        let groups = self.table(ROLLOUT_GROUPS)?;
        let prefix = child_key(&id_key(rollout_id), "");
        let mut result = Vec::new();
        for (_, group_id) in scan_prefix::<RolloutGroupId>(&order, &prefix)? {
            if let Some(group) = get_json::<RolloutGroup>(&groups, &id_key(group_id))? {
                result.push(group);
            }
        }
        Ok(result)
    }

    /// The group a target belongs to within a rollout.
    fn rollout_group_of(
        &self,
        rollout_id: RolloutId,
        controller_id: &str,
    ) -> StateResult<Option<RolloutGroupId>> {
        get_json(
            &self.table(ROLLOUT_TARGETS)?,
            &child_key(&id_key(rollout_id), controller_id),
        )
    }

    /// Member controller ids of a group, in id order.
    fn group_members(&self, group_id: RolloutGroupId, page: PageRequest) -> StateResult<Page<ControllerId>> {
        let table = self.table(GROUP_TARGETS)?;
        let prefix = child_key(&id_key(group_id), "");
        let mut collector = PageCollector::new(page);
        for key in prefix_keys(&table, &prefix)? {
            collector.offer(key[prefix.len()..].to_string());
        }
        Ok(collector.finish())
    }

    // ── Actions ────────────────────────────────────────────────────

    fn get_action(&self, id: ActionId) -> StateResult<Option<Action>> {
        get_json(&self.table(ACTIONS)?, &id_key(id))
    }

    fn active_action_id(&self, controller_id: &str) -> StateResult<Option<ActionId>> {
        get_json(&self.table(ACTIVE_ACTIONS)?, controller_id)
    }

    fn active_action_for(&self, controller_id: &str) -> StateResult<Option<Action>> {
        match self.active_action_id(controller_id)? {
            Some(id) => self.get_action(id),
            None => Ok(None),
        }
    }

    /// Every `(controller_id, action_id)` pair with an active action.
    fn active_action_ids(&self) -> StateResult<Vec<(ControllerId, ActionId)>> {
        scan_prefix(&self.table(ACTIVE_ACTIONS)?, "")
    }

    fn canceling_action_ids(&self) -> StateResult<Vec<ActionId>> {
        let keys = prefix_keys(&self.table(CANCELING_ACTIONS)?, "")?;
        Ok(keys.iter().filter_map(|k| k.parse().ok()).collect())
    }

    /// All actions of a target, oldest first.
    fn actions_for_target(&self, controller_id: &str) -> StateResult<Vec<Action>> {
        let index = self.table(TARGET_ACTIONS)?;
        let prefix = child_key(controller_id, "");
        let ids: Vec<ActionId> = prefix_keys(&index, &prefix)?
            .iter()
            .map(|k| &k[prefix.len()..])
            // Skip keys of other targets whose id extends this one (`a:b`).
            .filter(|suffix| !suffix.contains(':'))
            .filter_map(|suffix| suffix.parse().ok())
            .collect();
        self.actions_by_id(&ids)
    }

    /// All actions created for a rollout group.
    fn group_actions(&self, group_id: RolloutGroupId) -> StateResult<Vec<Action>> {
        let index = self.table(GROUP_ACTIONS)?;
        let prefix = child_key(&id_key(group_id), "");
        let ids: Vec<ActionId> = prefix_keys(&index, &prefix)?
            .iter()
            .filter_map(|k| k[prefix.len()..].parse().ok())
            .collect();
        self.actions_by_id(&ids)
    }

    fn actions_by_id(&self, ids: &[ActionId]) -> StateResult<Vec<Action>> {
        let table = self.table(ACTIONS)?;
        let mut actions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(action) = get_json::<Action>(&table, &id_key(*id))? {
                actions.push(action);
            }
        }
        Ok(actions)
    }

    /// The append-only status log of an action, in order.
    fn action_history(&self, action_id: ActionId) -> StateResult<Vec<ActionStatusEntry>> {
        let table = self.table(ACTION_STATUS)?;
        let prefix = child_key(&id_key(action_id), "");
        Ok(scan_prefix(&table, &prefix)?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }
}

// ── Helpers ────────────────────────────────────────────────────────

pub(crate) fn decode<V: DeserializeOwned>(bytes: &[u8]) -> StateResult<V> {
    serde_json::from_slice(bytes).map_err(map_err!(Corrupt))
}

pub(crate) fn get_json<V: DeserializeOwned>(table: &impl JsonRead, key: &str) -> StateResult<Option<V>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Decode every entry whose key starts with `prefix`, in key order.
pub(crate) fn scan_prefix<V: DeserializeOwned>(
    table: &impl JsonRead,
    prefix: &str,
) -> StateResult<Vec<(String, V)>> {
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        results.push((key.to_string(), decode(value.value())?));
    }
    Ok(results)
}

/// Keys starting with `prefix`, in key order.
pub(crate) fn prefix_keys(table: &impl JsonRead, prefix: &str) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}

fn scan_values<V: DeserializeOwned>(
    table: &impl JsonRead,
    matcher: &dyn Fn(&V) -> bool,
    page: PageRequest,
) -> StateResult<Page<V>> {
    let mut collector = PageCollector::new(page);
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let item: V = decode(value.value())?;
        if matcher(&item) {
            collector.offer(item);
        }
    }
    Ok(collector.finish())
}

/// Keeps the items of one page while counting every offered item.
struct PageCollector<T> {
    page: PageRequest,
    seen: usize,
    content: Vec<T>,
}

impl<T> PageCollector<T> {
    fn new(page: PageRequest) -> Self {
        Self {
            page,
            seen: 0,
            content: Vec::new(),
        }
    }

    fn offer(&mut self, item: T) {
        if self.seen >= self.page.offset && self.content.len() < self.page.limit {
            self.content.push(item);
        }
        self.seen += 1;
    }

    fn finish(self) -> Page<T> {
        Page {
            content: self.content,
            total: self.seen,
        }
    }
}
