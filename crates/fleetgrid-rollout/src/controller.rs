//! Rollout controller: drives the rollout state machine.
//!
//! A rollout is planned once at creation (filter evaluated, devices
//! partitioned, memberships frozen) and then advanced group by group. Every
//! step re-reads the rollout inside the write transaction that applies it,
//! so a stale caller can never run two groups at once. Per-rollout locks
//! additionally serialize the scheduler against user commands.

use fleet_core::{RolloutConfig, epoch_secs};
use fleetgrid_filter::{FilterEngine, Schema, TargetQuery, parse};
use fleetgrid_state::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::action::{ActionManager, cancel_in, create_action_in};
use crate::condition::{GroupTally, GroupVerdict, evaluate_group};
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventBus, FleetEvent};
use crate::locks::KeyedLocks;
use crate::partition::{GroupSpec, PlannedGroup, RoundingRule, partition};

/// Request to create a rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRollout {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_filter: String,
    pub distribution_set_id: DistributionSetId,
    pub groups: GroupSpec,
}

/// A freshly created rollout with its planned groups.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRollout {
    pub rollout: Rollout,
    pub groups: Vec<RolloutGroup>,
}

/// What one [`RolloutManager::advance`] step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// The rollout is not running.
    Idle,
    /// The current group is still open.
    Waiting,
    /// The current group finished and group `next` was started.
    GroupFinished { next: u32 },
    /// The current group failed; `action` was applied.
    GroupFailed { action: ErrorAction },
    Finished,
    Errored,
    /// Another caller holds the rollout.
    Skipped,
}

#[derive(Clone)]
pub struct RolloutManager {
    store: StateStore,
    filter: FilterEngine,
    actions: ActionManager,
    events: EventBus,
    locks: KeyedLocks<RolloutId>,
    config: RolloutConfig,
}

impl RolloutManager {
    pub fn new(store: StateStore, actions: ActionManager, events: EventBus, config: RolloutConfig) -> Self {
        Self {
            filter: FilterEngine::new(store.clone()),
            store,
            actions,
            events,
            locks: KeyedLocks::new(),
            config,
        }
    }

    pub fn actions(&self) -> &ActionManager {
        &self.actions
    }

    // ── Creation ───────────────────────────────────────────────────

    /// Evaluate the filter, partition the matching devices and persist the
    /// rollout in `Ready`.
    pub async fn create(&self, request: CreateRollout) -> RolloutResult<CreatedRollout> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(RolloutError::Validation("rollout name must not be empty".into()));
        }
        request.groups.validate(self.config.max_groups)?;
        let predicate = self.filter.verify(&request.target_filter)?;
        let query = TargetQuery::plan(&predicate)?;

        let devices = self.store.read(|view| -> RolloutResult<Vec<ControllerId>> {
            if view.get_distribution_set(request.distribution_set_id)?.is_none() {
                return Err(RolloutError::not_found("distribution set", request.distribution_set_id));
            }
            if view.rollout_id_by_name(&name)?.is_some() {
                return Err(duplicate_name(&name));
            }
            let matched = query.scan(view, PageRequest::all())?;
            Ok(matched
                .content
                .into_iter()
                .filter(|t| !t.update_locked)
                .map(|t| t.controller_id)
                .collect())
        })?;

        let rule = RoundingRule::from(self.config.rounding);
        let planned = partition(devices, &request.groups, rule, self.config.max_groups)?;
        let now = epoch_secs();
        let mut events = Vec::new();

        let created = self.store.write(|scope| -> RolloutResult<CreatedRollout> {
            if scope.get_distribution_set(request.distribution_set_id)?.is_none() {
                return Err(RolloutError::not_found("distribution set", request.distribution_set_id));
            }
            let id = scope.next_id("rollouts")?;
            scope.reserve_rollout_name(&name, id).map_err(|e| match e {
                StateError::Duplicate { .. } => duplicate_name(&name),
                other => other.into(),
            })?;

            let total: usize = planned.iter().map(|g| g.members.len()).sum();
            let mut rollout = Rollout {
                id,
                name: name.clone(),
                description: request.description.clone(),
                target_filter: predicate.to_string(),
                distribution_set_id: request.distribution_set_id,
                total_targets: total as u64,
                status: RolloutStatus::Creating,
                current_group: None,
                group_count: planned.len() as u32,
                deleted: false,
                created_at: now,
                last_modified_at: now,
            };
            scope.put_rollout(&rollout)?;
            scope.append_rollout_transition(id, None, RolloutStatus::Creating, "created", now)?;

            let mut groups = Vec::with_capacity(planned.len());
            for (index, plan) in planned.iter().enumerate() {
                groups.push(persist_group(scope, id, index as u32, plan)?);
            }
            events.push(FleetEvent::RolloutCreated {
                rollout_id: id,
                name: name.clone(),
                total_targets: rollout.total_targets,
            });
            let reason = format!("{} targets in {} groups", total, groups.len());
            transition_rollout(scope, &mut rollout, RolloutStatus::Ready, &reason, now, &mut events)?;
            Ok(CreatedRollout { rollout, groups })
        })?;

        self.events.publish_all(events);
        info!(
            rollout = created.rollout.id,
            name = %created.rollout.name,
            targets = created.rollout.total_targets,
            groups = created.groups.len(),
            "rollout created"
        );
        Ok(created)
    }

    // ── User commands ──────────────────────────────────────────────

    /// `Ready → Starting → Running` with the first group started, or
    /// straight to `Finished` when no targets matched.
    pub async fn start(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.command(id, |scope, rollout, now, events| {
            transition_rollout(scope, rollout, RolloutStatus::Starting, "start requested", now, events)?;
            begin_in(scope, rollout, now, events)?;
            Ok(())
        })
        .await
    }

    pub async fn pause(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.command(id, |scope, rollout, now, events| {
            transition_rollout(scope, rollout, RolloutStatus::Paused, "paused by request", now, events)
        })
        .await
    }

    /// Continue a paused rollout at the same group.
    pub async fn resume(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.command(id, |scope, rollout, now, events| {
            transition_rollout(scope, rollout, RolloutStatus::Running, "resumed by request", now, events)
        })
        .await
    }

    /// End the rollout and cancel its outstanding actions. Groups that never
    /// started stay `Scheduled`.
    pub async fn stop(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.command(id, |scope, rollout, now, events| {
            transition_rollout(scope, rollout, RolloutStatus::Stopped, "stopped by request", now, events)?;
            let canceled = cancel_rollout_actions_in(scope, rollout.id, "rollout stopped", now, events)?;
            debug!(rollout = rollout.id, canceled, "rollout actions canceled");
            Ok(())
        })
        .await
    }

    /// `Ready` rollouts are removed with their groups; finished ones are
    /// soft-deleted and release their name.
    pub async fn delete(&self, id: RolloutId) -> RolloutResult<()> {
        let _guard = self.locks.lock(&id).await;
        let mut events = Vec::new();

        self.store.write(|scope| -> RolloutResult<()> {
            let mut rollout = load_rollout(scope, id)?;
            if rollout.status == RolloutStatus::Ready {
                scope.delete_rollout_hard(id)?;
                events.push(FleetEvent::RolloutDeleted { rollout_id: id, soft: false });
                return Ok(());
            }
            if !rollout.status.is_terminal() {
                return Err(RolloutError::Conflict(format!(
                    "rollout {id} is {}; stop it before deleting",
                    rollout.status.as_str()
                )));
            }
            for group in scope.groups_for_rollout(id)? {
                if scope.group_actions(group.id)?.iter().any(|a| a.active) {
                    return Err(RolloutError::Conflict(format!(
                        "rollout {id} still has active actions in group '{}'",
                        group.name
                    )));
                }
            }
            scope.release_rollout_name(&rollout.name)?;
            rollout.deleted = true;
            rollout.last_modified_at = epoch_secs();
            scope.put_rollout(&rollout)?;
            events.push(FleetEvent::RolloutDeleted { rollout_id: id, soft: true });
            Ok(())
        })?;

        self.events.publish_all(events);
        info!(rollout = id, "rollout deleted");
        Ok(())
    }

    async fn command(
        &self,
        id: RolloutId,
        apply: impl FnOnce(&mut WriteScope, &mut Rollout, u64, &mut Vec<FleetEvent>) -> RolloutResult<()>,
    ) -> RolloutResult<Rollout> {
        let _guard = self.locks.lock(&id).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let rollout = self.store.write(|scope| -> RolloutResult<Rollout> {
            let mut rollout = load_rollout(scope, id)?;
            apply(scope, &mut rollout, now, &mut events)?;
            Ok(rollout)
        })?;

        self.events.publish_all(events);
        info!(rollout = id, status = rollout.status.as_str(), "rollout updated");
        Ok(rollout)
    }

    // ── Progression ────────────────────────────────────────────────

    /// Run one evaluation step, waiting for the rollout's lock.
    pub async fn advance(&self, id: RolloutId) -> RolloutResult<AdvanceOutcome> {
        let _guard = self.locks.lock(&id).await;
        self.advance_locked(id)
    }

    /// Like [`advance`](Self::advance), but returns `Skipped` instead of
    /// waiting when the rollout is busy.
    pub async fn try_advance(&self, id: RolloutId) -> RolloutResult<AdvanceOutcome> {
        let Some(_guard) = self.locks.try_lock(&id) else {
            return Ok(AdvanceOutcome::Skipped);
        };
        self.advance_locked(id)
    }

    fn advance_locked(&self, id: RolloutId) -> RolloutResult<AdvanceOutcome> {
        let now = epoch_secs();
        let mut events = Vec::new();
        let outcome = self
            .store
            .write(|scope| advance_in(scope, id, now, &mut events))?;
        self.events.publish_all(events);

        match outcome {
            AdvanceOutcome::Idle | AdvanceOutcome::Waiting | AdvanceOutcome::Skipped => {}
            AdvanceOutcome::GroupFailed { action } => {
                warn!(rollout = id, ?action, "rollout group failed")
            }
            other => info!(rollout = id, outcome = ?other, "rollout advanced"),
        }
        Ok(outcome)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Soft-deleted rollouts stay readable by id.
    pub fn get(&self, id: RolloutId) -> RolloutResult<Rollout> {
        self.store
            .read(|view| view.get_rollout(id))?
            .ok_or_else(|| RolloutError::not_found("rollout", id))
    }

    pub fn list(&self, page: PageRequest) -> RolloutResult<Page<Rollout>> {
        Ok(self.store.read(|view| view.scan_rollouts(&|r| !r.deleted, page))?)
    }

    /// Rollouts matching a filter expression over rollout fields.
    pub fn find(&self, expr: &str, page: PageRequest) -> RolloutResult<Page<Rollout>> {
        let filter = parse(expr, Schema::Rollout)?.compile()?;
        Ok(self
            .store
            .read(|view| view.scan_rollouts(&|r| !r.deleted && filter.matches(r), page))?)
    }

    pub fn groups(&self, id: RolloutId) -> RolloutResult<Vec<RolloutGroup>> {
        self.store.read(|view| {
            load_rollout(view, id)?;
            Ok(view.groups_for_rollout(id)?)
        })
    }

    pub fn group(&self, group_id: RolloutGroupId) -> RolloutResult<RolloutGroup> {
        self.store
            .read(|view| view.get_group(group_id))?
            .ok_or_else(|| RolloutError::not_found("rollout group", group_id))
    }

    pub fn group_targets(&self, group_id: RolloutGroupId, page: PageRequest) -> RolloutResult<Page<ControllerId>> {
        self.store.read(|view| {
            if view.get_group(group_id)?.is_none() {
                return Err(RolloutError::not_found("rollout group", group_id));
            }
            Ok(view.group_members(group_id, page)?)
        })
    }

    pub fn group_tally(&self, group_id: RolloutGroupId) -> RolloutResult<GroupTally> {
        self.store.read(|view| {
            if view.get_group(group_id)?.is_none() {
                return Err(RolloutError::not_found("rollout group", group_id));
            }
            Ok(GroupTally::from_actions(&view.group_actions(group_id)?))
        })
    }

    /// The audit trail of a rollout, oldest first.
    pub fn history(&self, id: RolloutId) -> RolloutResult<Vec<RolloutTransition>> {
        self.store.read(|view| {
            load_rollout(view, id)?;
            Ok(view.rollout_history(id)?)
        })
    }

    /// Rollouts the scheduler has to look at: running ones and any left
    /// in `Starting`.
    pub fn running_ids(&self) -> RolloutResult<Vec<RolloutId>> {
        let page = self.store.read(|view| {
            view.scan_rollouts(
                &|r| {
                    !r.deleted && matches!(r.status, RolloutStatus::Running | RolloutStatus::Starting)
                },
                PageRequest::all(),
            )
        })?;
        Ok(page.content.into_iter().map(|r| r.id).collect())
    }
}

fn duplicate_name(name: &str) -> RolloutError {
    RolloutError::Validation(format!("rollout name '{name}' is already in use"))
}

fn load_rollout(view: &impl StoreView, id: RolloutId) -> RolloutResult<Rollout> {
    match view.get_rollout(id)? {
        Some(rollout) if !rollout.deleted => Ok(rollout),
        _ => Err(RolloutError::not_found("rollout", id)),
    }
}

fn persist_group(
    scope: &mut WriteScope,
    rollout_id: RolloutId,
    index: u32,
    plan: &PlannedGroup,
) -> RolloutResult<RolloutGroup> {
    let group = RolloutGroup {
        id: scope.next_id("rollout_groups")?,
        rollout_id,
        index,
        name: plan.name.clone(),
        percentage: plan.percentage,
        total_targets: plan.members.len() as u64,
        success_condition: plan.success_condition,
        success_action: SuccessAction::NextGroup,
        error_condition: plan.error_condition,
        error_action: plan.error_action,
        status: RolloutGroupStatus::Scheduled,
        started_at: None,
        finished_at: None,
    };
    scope.put_group(&group)?;
    for member in &plan.members {
        scope.add_member(rollout_id, group.id, member)?;
    }
    Ok(group)
}

/// Apply a checked rollout transition and record it in the audit trail.
fn transition_rollout(
    scope: &mut WriteScope,
    rollout: &mut Rollout,
    to: RolloutStatus,
    reason: &str,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<()> {
    let from = rollout.status;
    if !from.can_transition_to(to) {
        return Err(RolloutError::IllegalTransition { id: rollout.id, from, to });
    }
    scope.append_rollout_transition(rollout.id, Some(from), to, reason, now)?;
    rollout.status = to;
    rollout.last_modified_at = now;
    scope.put_rollout(rollout)?;
    events.push(FleetEvent::RolloutStatusChanged {
        rollout_id: rollout.id,
        from: Some(from),
        to,
        reason: reason.to_string(),
    });
    Ok(())
}

fn set_group_status(
    scope: &mut WriteScope,
    group: &mut RolloutGroup,
    status: RolloutGroupStatus,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<()> {
    group.status = status;
    match status {
        RolloutGroupStatus::Running => group.started_at = Some(now),
        s if s.is_terminal() => group.finished_at = Some(now),
        _ => {}
    }
    scope.put_group(group)?;
    events.push(FleetEvent::GroupStatusChanged {
        rollout_id: group.rollout_id,
        group_id: group.id,
        status,
    });
    Ok(())
}

/// Create one action per eligible member and mark the group running.
fn start_group_in(
    scope: &mut WriteScope,
    rollout: &mut Rollout,
    group: &mut RolloutGroup,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<usize> {
    let members = scope.group_members(group.id, PageRequest::all())?;
    let origin = ActionOrigin::Rollout {
        rollout_id: rollout.id,
        group_id: group.id,
    };
    let mut created = 0;
    for controller_id in members.content {
        let Some(mut target) = scope.get_target(&controller_id)? else {
            continue;
        };
        if target.update_locked {
            continue;
        }
        create_action_in(scope, &mut target, rollout.distribution_set_id, origin, now, events)?;
        created += 1;
    }
    set_group_status(scope, group, RolloutGroupStatus::Running, now, events)?;
    rollout.current_group = Some(group.index);
    rollout.last_modified_at = now;
    scope.put_rollout(rollout)?;
    debug!(rollout = rollout.id, group = %group.name, actions = created, "group started");
    Ok(created)
}

/// Second half of a start: leave `Starting` with the first group running.
fn begin_in(
    scope: &mut WriteScope,
    rollout: &mut Rollout,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<AdvanceOutcome> {
    let groups = scope.groups_for_rollout(rollout.id)?;
    let mut first = match groups.into_iter().next() {
        Some(group) if rollout.total_targets > 0 => group,
        _ => {
            transition_rollout(scope, rollout, RolloutStatus::Finished, "no targets matched", now, events)?;
            return Ok(AdvanceOutcome::Finished);
        }
    };
    if first.status == RolloutGroupStatus::Scheduled {
        start_group_in(scope, rollout, &mut first, now, events)?;
    }
    transition_rollout(scope, rollout, RolloutStatus::Running, "first group started", now, events)?;
    Ok(AdvanceOutcome::Waiting)
}

/// Start the group after `index`, or finish the rollout if there is none.
fn next_group_in(
    scope: &mut WriteScope,
    rollout: &mut Rollout,
    groups: &[RolloutGroup],
    index: u32,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<AdvanceOutcome> {
    let next = index + 1;
    if let Some(group) = groups.get(next as usize) {
        let mut group = group.clone();
        start_group_in(scope, rollout, &mut group, now, events)?;
        return Ok(AdvanceOutcome::GroupFinished { next });
    }

    // Re-read: the caller's copies may predate this pass.
    let failed = scope
        .groups_for_rollout(rollout.id)?
        .iter()
        .filter(|g| g.status != RolloutGroupStatus::Finished)
        .count();
    if failed == 0 {
        transition_rollout(scope, rollout, RolloutStatus::Finished, "all groups finished", now, events)?;
        Ok(AdvanceOutcome::Finished)
    } else {
        let reason = format!("{failed} group(s) did not finish");
        transition_rollout(scope, rollout, RolloutStatus::Error, &reason, now, events)?;
        Ok(AdvanceOutcome::Errored)
    }
}

/// Cancel every active action a rollout created.
fn cancel_rollout_actions_in(
    scope: &mut WriteScope,
    rollout_id: RolloutId,
    reason: &str,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<usize> {
    let mut canceled = 0;
    for group in scope.groups_for_rollout(rollout_id)? {
        for mut action in scope.group_actions(group.id)? {
            if action.active {
                cancel_in(scope, &mut action, reason, now, events)?;
                canceled += 1;
            }
        }
    }
    Ok(canceled)
}

fn advance_in(
    scope: &mut WriteScope,
    id: RolloutId,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<AdvanceOutcome> {
    let mut rollout = load_rollout(scope, id)?;
    match rollout.status {
        RolloutStatus::Running => {}
        RolloutStatus::Starting => {
            warn!(rollout = id, "recovering rollout left in starting");
            return begin_in(scope, &mut rollout, now, events);
        }
        _ => return Ok(AdvanceOutcome::Idle),
    }

    let groups = scope.groups_for_rollout(id)?;
    let index = rollout.current_group.unwrap_or(0);
    let Some(mut group) = groups.get(index as usize).cloned() else {
        return next_group_in(scope, &mut rollout, &groups, index, now, events);
    };

    match group.status {
        RolloutGroupStatus::Running => {}
        RolloutGroupStatus::Scheduled => {
            start_group_in(scope, &mut rollout, &mut group, now, events)?;
            return Ok(AdvanceOutcome::Waiting);
        }
        // Left behind by a pause on failure, then resumed.
        RolloutGroupStatus::Finished | RolloutGroupStatus::Error => {
            return next_group_in(scope, &mut rollout, &groups, index, now, events);
        }
    }

    let tally = GroupTally::from_actions(&scope.group_actions(group.id)?);
    match evaluate_group(&group, &tally) {
        GroupVerdict::Open => Ok(AdvanceOutcome::Waiting),
        GroupVerdict::Succeeded => {
            set_group_status(scope, &mut group, RolloutGroupStatus::Finished, now, events)?;
            next_group_in(scope, &mut rollout, &groups, index, now, events)
        }
        GroupVerdict::Failed { reason } => {
            set_group_status(scope, &mut group, RolloutGroupStatus::Error, now, events)?;
            let reason = format!("group '{}': {reason}", group.name);
            match group.error_action {
                ErrorAction::Pause => {
                    transition_rollout(scope, &mut rollout, RolloutStatus::Paused, &reason, now, events)?;
                }
                ErrorAction::Abort => {
                    cancel_rollout_actions_in(scope, id, "rollout aborted", now, events)?;
                    transition_rollout(scope, &mut rollout, RolloutStatus::Error, &reason, now, events)?;
                }
                ErrorAction::Ignore => {
                    let outcome = next_group_in(scope, &mut rollout, &groups, index, now, events)?;
                    if outcome == AdvanceOutcome::Errored {
                        return Ok(outcome);
                    }
                }
            }
            Ok(AdvanceOutcome::GroupFailed {
                action: group.error_action,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::action::{ActionReport, ReportOutcome};
    use crate::error::ErrorKind;
    use crate::partition::GroupDefinition;
    use crate::testing::*;

    fn manager(store: &StateStore) -> RolloutManager {
        let events = EventBus::default();
        let actions = ActionManager::new(store.clone(), events.clone(), Duration::from_secs(3600));
        RolloutManager::new(store.clone(), actions, events, RolloutConfig::default())
    }

    fn equal_groups(groups: u32, success: u32) -> GroupSpec {
        GroupSpec::Count {
            groups,
            success_condition: GroupCondition::percent(success),
            error_condition: None,
            error_action: ErrorAction::Pause,
        }
    }

    fn request(name: &str, filter: &str, ds: DistributionSetId, groups: GroupSpec) -> CreateRollout {
        CreateRollout {
            name: name.into(),
            description: None,
            target_filter: filter.into(),
            distribution_set_id: ds,
            groups,
        }
    }

    /// Report an outcome for the first `count` active actions of a group.
    async fn report_group(
        rollouts: &RolloutManager,
        group_id: RolloutGroupId,
        outcome: ReportOutcome,
        count: usize,
    ) {
        let members = rollouts.group_targets(group_id, PageRequest::all()).unwrap();
        let mut reported = 0;
        for cid in members.content {
            if reported == count {
                break;
            }
            let Some(action) = rollouts.actions().active_action(&cid).unwrap() else {
                continue;
            };
            rollouts
                .actions()
                .report(&cid, action.id, ActionReport::new(outcome, "done"))
                .await
                .unwrap();
            reported += 1;
        }
    }

    #[tokio::test]
    async fn create_partitions_matching_targets() {
        let store = fixture();
        seed_fleet(&store, 10);
        seed_target(&store, "other-1");
        lock_target(&store, "dev-009");
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);

        let created = rollouts
            .create(request("wave", "controllerId==dev-*", ds, equal_groups(3, 100)))
            .await
            .unwrap();
        assert_eq!(created.rollout.status, RolloutStatus::Ready);
        assert_eq!(created.rollout.total_targets, 9);
        let sizes: Vec<u64> = created.groups.iter().map(|g| g.total_targets).collect();
        assert_eq!(sizes, [3, 3, 3]);
        assert!(created.groups.iter().all(|g| g.status == RolloutGroupStatus::Scheduled));

        let history = rollouts.history(created.rollout.id).unwrap();
        let statuses: Vec<_> = history.iter().map(|t| t.to).collect();
        assert_eq!(statuses, [RolloutStatus::Creating, RolloutStatus::Ready]);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let store = fixture();
        seed_fleet(&store, 4);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);

        rollouts
            .create(request("wave", "name==*", ds, equal_groups(2, 100)))
            .await
            .unwrap();
        let duplicate = rollouts
            .create(request("wave", "name==*", ds, equal_groups(2, 100)))
            .await
            .unwrap_err();
        assert_eq!(duplicate.kind(), ErrorKind::Validation);

        let syntax = rollouts
            .create(request("broken", "name==", ds, equal_groups(2, 100)))
            .await
            .unwrap_err();
        assert!(matches!(syntax, RolloutError::Filter(_)));

        let missing_ds = rollouts
            .create(request("no-ds", "name==*", 99, equal_groups(2, 100)))
            .await
            .unwrap_err();
        assert_eq!(missing_ds.kind(), ErrorKind::NotFound);

        let bad_split = GroupSpec::Explicit(vec![
            GroupDefinition {
                name: "a".into(),
                percentage: 60,
                success_condition: GroupCondition::percent(100),
                error_condition: None,
                error_action: ErrorAction::Pause,
            },
            GroupDefinition {
                name: "b".into(),
                percentage: 30,
                success_condition: GroupCondition::percent(100),
                error_condition: None,
                error_action: ErrorAction::Pause,
            },
        ]);
        let invalid = rollouts
            .create(request("split", "name==*", ds, bad_split))
            .await
            .unwrap_err();
        assert_eq!(invalid.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn start_dispatches_only_the_first_group() {
        let store = fixture();
        seed_fleet(&store, 10);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let created = rollouts
            .create(request("wave", "name==*", ds, equal_groups(2, 80)))
            .await
            .unwrap();

        let started = rollouts.start(created.rollout.id).await.unwrap();
        assert_eq!(started.status, RolloutStatus::Running);
        assert_eq!(started.current_group, Some(0));

        let groups = rollouts.groups(started.id).unwrap();
        assert_eq!(groups[0].status, RolloutGroupStatus::Running);
        assert_eq!(groups[1].status, RolloutGroupStatus::Scheduled);
        assert_eq!(rollouts.group_tally(groups[0].id).unwrap().in_flight, 5);
        assert_eq!(rollouts.group_tally(groups[1].id).unwrap(), GroupTally::default());

        // A second start is illegal.
        assert!(matches!(
            rollouts.start(started.id).await,
            Err(RolloutError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn group_progression_to_finish() {
        let store = fixture();
        seed_fleet(&store, 10);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let id = rollouts
            .create(request("wave", "name==*", ds, equal_groups(2, 80)))
            .await
            .unwrap()
            .rollout
            .id;
        rollouts.start(id).await.unwrap();
        let groups = rollouts.groups(id).unwrap();

        report_group(&rollouts, groups[0].id, ReportOutcome::Success, 3).await;
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Waiting);

        // 4 of 5 finished, 1 failed: exactly 80%.
        report_group(&rollouts, groups[0].id, ReportOutcome::Success, 1).await;
        report_group(&rollouts, groups[0].id, ReportOutcome::Failure, 1).await;
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::GroupFinished { next: 1 });

        report_group(&rollouts, groups[1].id, ReportOutcome::Success, 5).await;
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Finished);
        assert_eq!(rollouts.get(id).unwrap().status, RolloutStatus::Finished);
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Idle);

        let target = store.read(|v| v.get_target("dev-009")).unwrap().unwrap();
        assert_eq!(target.installed_ds, Some(ds));
    }

    #[tokio::test]
    async fn error_condition_pauses_then_resume_continues() {
        let store = fixture();
        seed_fleet(&store, 4);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let spec = GroupSpec::Count {
            groups: 2,
            success_condition: GroupCondition::percent(100),
            error_condition: Some(GroupCondition::count(1)),
            error_action: ErrorAction::Pause,
        };
        let id = rollouts.create(request("wave", "name==*", ds, spec)).await.unwrap().rollout.id;
        rollouts.start(id).await.unwrap();
        let groups = rollouts.groups(id).unwrap();

        report_group(&rollouts, groups[0].id, ReportOutcome::Failure, 1).await;
        assert_eq!(
            rollouts.advance(id).await.unwrap(),
            AdvanceOutcome::GroupFailed { action: ErrorAction::Pause }
        );
        assert_eq!(rollouts.get(id).unwrap().status, RolloutStatus::Paused);
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Idle);

        let resumed = rollouts.resume(id).await.unwrap();
        assert_eq!(resumed.current_group, Some(0));
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::GroupFinished { next: 1 });

        report_group(&rollouts, groups[1].id, ReportOutcome::Success, 2).await;
        // One group failed, so the rollout cannot finish cleanly.
        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Errored);
    }

    #[tokio::test]
    async fn abort_cancels_outstanding_actions() {
        let store = fixture();
        seed_fleet(&store, 6);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let spec = GroupSpec::Count {
            groups: 1,
            success_condition: GroupCondition::percent(100),
            error_condition: Some(GroupCondition::percent(50)),
            error_action: ErrorAction::Abort,
        };
        let id = rollouts.create(request("wave", "name==*", ds, spec)).await.unwrap().rollout.id;
        rollouts.start(id).await.unwrap();
        let group = rollouts.groups(id).unwrap().remove(0);

        report_group(&rollouts, group.id, ReportOutcome::Failure, 1).await;
        assert_eq!(
            rollouts.advance(id).await.unwrap(),
            AdvanceOutcome::GroupFailed { action: ErrorAction::Abort }
        );
        assert_eq!(rollouts.get(id).unwrap().status, RolloutStatus::Error);
        let tally = rollouts.group_tally(group.id).unwrap();
        assert_eq!(tally.in_flight, 0);
        assert_eq!(tally.excluded, 5);
    }

    #[tokio::test]
    async fn zero_targets_finish_on_start() {
        let store = fixture();
        seed_fleet(&store, 3);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let id = rollouts
            .create(request("empty", "controllerId==nothing-*", ds, equal_groups(2, 100)))
            .await
            .unwrap()
            .rollout
            .id;

        let started = rollouts.start(id).await.unwrap();
        assert_eq!(started.status, RolloutStatus::Finished);
        assert!(rollouts
            .groups(id)
            .unwrap()
            .iter()
            .all(|g| g.status == RolloutGroupStatus::Scheduled));
        let last = rollouts.history(id).unwrap().pop().unwrap();
        assert_eq!(last.reason, "no targets matched");
    }

    #[tokio::test]
    async fn stop_cancels_actions_and_keeps_later_groups() {
        let store = fixture();
        seed_fleet(&store, 4);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let id = rollouts
            .create(request("wave", "name==*", ds, equal_groups(2, 100)))
            .await
            .unwrap()
            .rollout
            .id;
        rollouts.start(id).await.unwrap();

        let stopped = rollouts.stop(id).await.unwrap();
        assert_eq!(stopped.status, RolloutStatus::Stopped);
        let groups = rollouts.groups(id).unwrap();
        assert_eq!(rollouts.group_tally(groups[0].id).unwrap().excluded, 2);
        assert_eq!(groups[1].status, RolloutGroupStatus::Scheduled);
        assert!(store.read(|v| v.active_action_ids()).unwrap().is_empty());
        assert!(matches!(
            rollouts.resume(id).await,
            Err(RolloutError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn delete_policy() {
        let store = fixture();
        seed_fleet(&store, 2);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);

        // Ready: removed entirely.
        let ready = rollouts
            .create(request("ready", "name==*", ds, equal_groups(1, 100)))
            .await
            .unwrap();
        rollouts.delete(ready.rollout.id).await.unwrap();
        assert!(store.read(|v| v.get_rollout(ready.rollout.id)).unwrap().is_none());
        assert!(rollouts.group(ready.groups[0].id).is_err());

        // Running: refused.
        let running = rollouts
            .create(request("running", "name==*", ds, equal_groups(1, 100)))
            .await
            .unwrap()
            .rollout
            .id;
        rollouts.start(running).await.unwrap();
        assert_eq!(
            rollouts.delete(running).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );

        // Stopped: soft-deleted, name released.
        rollouts.stop(running).await.unwrap();
        rollouts.delete(running).await.unwrap();
        assert!(rollouts.get(running).unwrap().deleted);
        assert!(rollouts.list(PageRequest::all()).unwrap().is_empty());
        rollouts
            .create(request("running", "name==*", ds, equal_groups(1, 100)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn starting_rollouts_are_recovered() {
        let store = fixture();
        seed_fleet(&store, 2);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        let id = rollouts
            .create(request("wave", "name==*", ds, equal_groups(1, 100)))
            .await
            .unwrap()
            .rollout
            .id;

        // Simulate a start cut short after entering Starting.
        store
            .write(|s| -> RolloutResult<()> {
                let mut rollout = s.get_rollout(id)?.unwrap();
                transition_rollout(s, &mut rollout, RolloutStatus::Starting, "start requested", 1, &mut Vec::new())
            })
            .unwrap();
        assert_eq!(rollouts.running_ids().unwrap(), [id]);

        assert_eq!(rollouts.advance(id).await.unwrap(), AdvanceOutcome::Waiting);
        let rollout = rollouts.get(id).unwrap();
        assert_eq!(rollout.status, RolloutStatus::Running);
        assert_eq!(rollouts.group_tally(rollouts.groups(id).unwrap()[0].id).unwrap().in_flight, 2);
    }

    #[tokio::test]
    async fn busy_rollouts_are_skipped() {
        let store = fixture();
        let rollouts = manager(&store);
        let _held = rollouts.locks.lock(&7).await;
        assert_eq!(rollouts.try_advance(7).await.unwrap(), AdvanceOutcome::Skipped);
    }

    #[tokio::test]
    async fn find_and_list() {
        let store = fixture();
        seed_fleet(&store, 2);
        let ds = seed_ds(&store, "firmware", "2.0");
        let rollouts = manager(&store);
        for name in ["eu-wave", "us-wave", "eu-canary"] {
            rollouts
                .create(request(name, "name==*", ds, equal_groups(1, 100)))
                .await
                .unwrap();
        }
        let found = rollouts.find("name==eu-*", PageRequest::all()).unwrap();
        assert_eq!(found.total, 2);
        assert_eq!(rollouts.list(PageRequest::first(1)).unwrap().total, 3);
        assert!(matches!(rollouts.get(404), Err(RolloutError::NotFound { .. })));
    }
}
