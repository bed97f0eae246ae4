//! Action state machine: assignments of a distribution set to one target.
//!
//! Every status change appends to the action's log and rewrites the
//! projected `Action::status` in the same write transaction. A target has
//! at most one active action; issuing a new one supersedes the old one in
//! the transaction that installs it:
//!
//! - a `Created` action was never retrieved and goes straight to `Canceled`,
//! - a `Running` action goes to `Canceling` and waits for device feedback
//!   (or the timeout) before it is `Canceled`.

use std::time::Duration;

use fleet_core::epoch_secs;
use fleetgrid_state::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventBus, FleetEvent};
use crate::locks::KeyedLocks;

/// What a device says about an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Progress,
    Success,
    Failure,
}

impl ReportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Progress => "progress",
            ReportOutcome::Success => "success",
            ReportOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReport {
    pub outcome: ReportOutcome,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl ActionReport {
    pub fn new(outcome: ReportOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            messages: vec![message.into()],
        }
    }
}

/// Result of one [`ActionManager::expire_stale`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Active actions moved to `Error`.
    pub timed_out: usize,
    /// Canceling actions closed as `Canceled`.
    pub canceled: usize,
}

/// Drives action life-cycles for device polls, reports and assignments.
#[derive(Clone)]
pub struct ActionManager {
    store: StateStore,
    events: EventBus,
    locks: KeyedLocks<String>,
    timeout: Duration,
}

impl ActionManager {
    pub fn new(store: StateStore, events: EventBus, timeout: Duration) -> Self {
        Self {
            store,
            events,
            locks: KeyedLocks::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // ── Assignment ─────────────────────────────────────────────────

    /// Assign `ds_id` to a target outside any rollout, superseding its
    /// current active action.
    pub async fn assign(
        &self,
        controller_id: &str,
        ds_id: DistributionSetId,
        origin: ActionOrigin,
    ) -> RolloutResult<Action> {
        if matches!(origin, ActionOrigin::Rollout { .. }) {
            return Err(RolloutError::Validation(
                "rollout actions are created by starting a rollout group".into(),
            ));
        }
        let _guard = self.locks.lock(&target_key(controller_id)).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let action = self.store.write(|scope| -> RolloutResult<Action> {
            let mut target = scope
                .get_target(controller_id)?
                .ok_or_else(|| RolloutError::not_found("target", controller_id))?;
            if scope.get_distribution_set(ds_id)?.is_none() {
                return Err(RolloutError::not_found("distribution set", ds_id));
            }
            if target.update_locked {
                return Err(RolloutError::Conflict(format!(
                    "target {controller_id} is update-locked"
                )));
            }
            create_action_in(scope, &mut target, ds_id, origin, now, &mut events)
        })?;

        self.events.publish_all(events);
        info!(action = action.id, controller_id = %action.controller_id, ds = ds_id, "action assigned");
        Ok(action)
    }

    /// Auto-assignment of `ds_id` through saved filter `filter_id`.
    ///
    /// Returns `None` without writing when the target is update-locked, when
    /// its active action already delivers `ds_id` (or, with no active action,
    /// its last assignment was `ds_id`), or when its active action belongs to
    /// a rollout. The checks and the assignment share one transaction.
    pub async fn auto_assign(
        &self,
        controller_id: &str,
        ds_id: DistributionSetId,
        filter_id: FilterQueryId,
    ) -> RolloutResult<Option<Action>> {
        let _guard = self.locks.lock(&target_key(controller_id)).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let action = self.store.write(|scope| -> RolloutResult<Option<Action>> {
            if scope.get_distribution_set(ds_id)?.is_none() {
                return Err(RolloutError::not_found("distribution set", ds_id));
            }
            let Some(mut target) = scope.get_target(controller_id)? else {
                return Ok(None);
            };
            if target.update_locked {
                return Ok(None);
            }
            let already_assigned = match scope.active_action_for(&target.controller_id)? {
                Some(active) if matches!(active.origin, ActionOrigin::Rollout { .. }) => return Ok(None),
                Some(active) => active.distribution_set_id == ds_id,
                // Canceled assignments are withdrawn from `assigned_ds`.
                None => target.assigned_ds == Some(ds_id),
            };
            if already_assigned {
                return Ok(None);
            }
            let origin = ActionOrigin::AutoAssign { filter_id };
            Ok(Some(create_action_in(scope, &mut target, ds_id, origin, now, &mut events)?))
        })?;

        self.events.publish_all(events);
        if let Some(action) = &action {
            debug!(action = action.id, controller_id = %action.controller_id, filter = filter_id, "auto-assigned");
        }
        Ok(action)
    }

    // ── Device hooks ───────────────────────────────────────────────

    /// A device poll: registers unknown targets, records contact, and
    /// hands out the active action (marking it `Running` on first retrieval).
    pub async fn poll(&self, controller_id: &str) -> RolloutResult<Option<Action>> {
        let _guard = self.locks.lock(&target_key(controller_id)).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let action = self.store.write(|scope| -> RolloutResult<Option<Action>> {
            let mut target = match scope.get_target(controller_id)? {
                Some(target) => target,
                None => {
                    events.push(FleetEvent::TargetRegistered {
                        controller_id: controller_id.to_string(),
                    });
                    Target::new(controller_id, controller_id, now)
                }
            };
            target.last_contact_at = Some(now);
            if target.update_status == TargetUpdateStatus::Unknown {
                target.update_status = TargetUpdateStatus::Registered;
            }
            scope.put_target(&target)?;

            let Some(mut action) = scope.active_action_for(&target.controller_id)? else {
                return Ok(None);
            };
            if action.status == ActionStatusKind::Created {
                transition(scope, &mut action, ActionStatusKind::Running, vec!["retrieved by device".into()], now, &mut events)?;
            }
            Ok(Some(action))
        })?;

        self.events.publish_all(events);
        Ok(action)
    }

    /// Record a device report for `action_id`.
    ///
    /// Reports on a canceling action close it as `Canceled`; reports on a
    /// closed action are kept as message-only log entries.
    pub async fn report(
        &self,
        controller_id: &str,
        action_id: ActionId,
        report: ActionReport,
    ) -> RolloutResult<ActionStatusEntry> {
        let _guard = self.locks.lock(&target_key(controller_id)).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let entry = self.store.write(|scope| -> RolloutResult<ActionStatusEntry> {
            let mut action = scope
                .get_action(action_id)?
                .ok_or_else(|| RolloutError::not_found("action", action_id))?;
            if target_key(&action.controller_id) != target_key(controller_id) {
                return Err(RolloutError::Conflict(format!(
                    "action {action_id} does not belong to target {controller_id}"
                )));
            }
            match action.status {
                ActionStatusKind::Canceling => {
                    scope.clear_canceling(action_id)?;
                    let messages = with_outcome(&report, "while canceling");
                    transition(scope, &mut action, ActionStatusKind::Canceled, messages, now, &mut events)
                }
                status if status.is_terminal() => {
                    // Late feedback: recorded, status unchanged.
                    let messages = with_outcome(&report, "after the action closed");
                    Ok(scope.append_action_status(&mut action, status, messages, now)?)
                }
                status => {
                    let messages = report.messages.clone();
                    if status == ActionStatusKind::Created {
                        // The device skipped the poll that would have marked it running.
                        transition(scope, &mut action, ActionStatusKind::Running, Vec::new(), now, &mut events)?;
                    }
                    let next = match report.outcome {
                        ReportOutcome::Progress => ActionStatusKind::Running,
                        ReportOutcome::Success => ActionStatusKind::Finished,
                        ReportOutcome::Failure => ActionStatusKind::Error,
                    };
                    close_target_side(scope, &mut action, next, now)?;
                    transition(scope, &mut action, next, messages, now, &mut events)
                }
            }
        })?;

        self.events.publish_all(events);
        debug!(action = action_id, status = ?entry.status, seq = entry.seq, "action report recorded");
        Ok(entry)
    }

    /// Cancel an active action on request.
    pub async fn cancel(&self, action_id: ActionId) -> RolloutResult<Action> {
        let controller_id = self
            .store
            .read(|view| view.get_action(action_id))?
            .ok_or_else(|| RolloutError::not_found("action", action_id))?
            .controller_id;
        let _guard = self.locks.lock(&target_key(&controller_id)).await;
        let now = epoch_secs();
        let mut events = Vec::new();

        let action = self.store.write(|scope| -> RolloutResult<Action> {
            let mut action = scope
                .get_action(action_id)?
                .ok_or_else(|| RolloutError::not_found("action", action_id))?;
            if !action.active {
                return Err(RolloutError::Conflict(format!(
                    "action {action_id} is not active ({:?})",
                    action.status
                )));
            }
            cancel_in(scope, &mut action, "canceled by request", now, &mut events)?;
            Ok(action)
        })?;

        self.events.publish_all(events);
        info!(action = action_id, status = ?action.status, "action canceled");
        Ok(action)
    }

    /// Close actions that have not changed status within the timeout window.
    pub async fn expire_stale(&self, now: u64) -> RolloutResult<ExpiryReport> {
        // Timestamps are whole seconds; a partial second rounds up.
        let window = self.timeout.as_secs() + u64::from(self.timeout.subsec_nanos() > 0);
        let is_stale = |action: &Action| now.saturating_sub(action.last_modified_at) >= window;

        let candidates: Vec<Action> = self.store.read(|view| -> StateResult<Vec<Action>> {
            let mut ids: Vec<ActionId> = view.active_action_ids()?.into_iter().map(|(_, id)| id).collect();
            ids.extend(view.canceling_action_ids()?);
            Ok(view.actions_by_id(&ids)?.into_iter().filter(|a| is_stale(a)).collect())
        })?;

        let mut report = ExpiryReport::default();
        for candidate in candidates {
            let _guard = self.locks.lock(&target_key(&candidate.controller_id)).await;
            let mut events = Vec::new();

            let closed = self.store.write(|scope| -> RolloutResult<Option<ActionStatusKind>> {
                // Re-check: a report may have landed since the snapshot.
                let Some(mut action) = scope.get_action(candidate.id)? else {
                    return Ok(None);
                };
                if action.status.is_terminal() || !is_stale(&action) {
                    return Ok(None);
                }
                let message = format!("timed out after {window}s without a terminal report");
                let next = if action.status == ActionStatusKind::Canceling {
                    scope.clear_canceling(action.id)?;
                    ActionStatusKind::Canceled
                } else {
                    close_target_side(scope, &mut action, ActionStatusKind::Error, now)?;
                    ActionStatusKind::Error
                };
                transition(scope, &mut action, next, vec![message], now, &mut events)?;
                Ok(Some(next))
            })?;

            self.events.publish_all(events);
            match closed {
                Some(ActionStatusKind::Canceled) => report.canceled += 1,
                Some(_) => report.timed_out += 1,
                None => {}
            }
        }

        if report != ExpiryReport::default() {
            warn!(timed_out = report.timed_out, canceled = report.canceled, "stale actions closed");
        }
        Ok(report)
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, action_id: ActionId) -> RolloutResult<Action> {
        self.store
            .read(|view| view.get_action(action_id))?
            .ok_or_else(|| RolloutError::not_found("action", action_id))
    }

    pub fn active_action(&self, controller_id: &str) -> RolloutResult<Option<Action>> {
        Ok(self.store.read(|view| -> StateResult<Option<Action>> {
            match view.get_target(controller_id)? {
                Some(target) => view.active_action_for(&target.controller_id),
                None => Ok(None),
            }
        })?)
    }

    /// The status log of an action, oldest first.
    pub fn history(&self, action_id: ActionId) -> RolloutResult<Vec<ActionStatusEntry>> {
        self.store.read(|view| {
            if view.get_action(action_id)?.is_none() {
                return Err(RolloutError::not_found("action", action_id));
            }
            Ok(view.action_history(action_id)?)
        })
    }

    pub fn actions_for_target(&self, controller_id: &str) -> RolloutResult<Vec<Action>> {
        self.store.read(|view| {
            let target = view
                .get_target(controller_id)?
                .ok_or_else(|| RolloutError::not_found("target", controller_id))?;
            Ok(view.actions_for_target(&target.controller_id)?)
        })
    }
}

// ── Transaction helpers ────────────────────────────────────────────
//
// Shared with rollout group start and stop, which run them inside their
// own write transactions.

/// Append a checked status transition.
pub(crate) fn transition(
    scope: &mut WriteScope,
    action: &mut Action,
    next: ActionStatusKind,
    messages: Vec<String>,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<ActionStatusEntry> {
    if !action.status.can_transition_to(next) {
        return Err(RolloutError::Conflict(format!(
            "action {} cannot move from {:?} to {:?}",
            action.id, action.status, next
        )));
    }
    let entry = scope.append_action_status(action, next, messages, now)?;
    events.push(FleetEvent::ActionStatusChanged {
        action_id: action.id,
        controller_id: action.controller_id.clone(),
        status: next,
    });
    Ok(entry)
}

/// Release the target's active slot and record the outcome on the target
/// when `next` ends the assignment.
fn close_target_side(
    scope: &mut WriteScope,
    action: &mut Action,
    next: ActionStatusKind,
    now: u64,
) -> RolloutResult<()> {
    if !next.is_terminal() {
        return Ok(());
    }
    action.active = false;
    scope.clear_active_action(&action.controller_id, action.id)?;
    if let Some(mut target) = scope.get_target(&action.controller_id)? {
        match next {
            ActionStatusKind::Finished => {
                target.update_status = TargetUpdateStatus::InSync;
                target.installed_ds = Some(action.distribution_set_id);
            }
            ActionStatusKind::Error => target.update_status = TargetUpdateStatus::Error,
            _ => {}
        }
        target.last_modified_at = now;
        scope.put_target(&target)?;
    }
    Ok(())
}

/// Report messages prefixed with the outcome the device claimed.
fn with_outcome(report: &ActionReport, context: &str) -> Vec<String> {
    let mut messages = vec![format!("device reported {} {context}", report.outcome.as_str())];
    messages.extend(report.messages.iter().cloned());
    messages
}

/// Cancel an active action: `Created` closes at once, `Running` waits in
/// `Canceling`. Frees the target's active slot either way and withdraws the
/// assignment from the target.
pub(crate) fn cancel_in(
    scope: &mut WriteScope,
    action: &mut Action,
    reason: &str,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<()> {
    let was_created = action.status == ActionStatusKind::Created;
    action.active = false;
    scope.clear_active_action(&action.controller_id, action.id)?;
    if let Some(mut target) = scope.get_target(&action.controller_id)? {
        target.assigned_ds = target.installed_ds;
        target.update_status = if target.installed_ds.is_some() {
            TargetUpdateStatus::InSync
        } else {
            TargetUpdateStatus::Registered
        };
        target.last_modified_at = now;
        scope.put_target(&target)?;
    }
    transition(scope, action, ActionStatusKind::Canceling, vec![reason.to_string()], now, events)?;
    if was_created {
        transition(scope, action, ActionStatusKind::Canceled, vec!["never retrieved by device".into()], now, events)?;
    } else {
        scope.mark_canceling(action.id)?;
    }
    Ok(())
}

/// Install a new active action for `target`, superseding the current one.
pub(crate) fn create_action_in(
    scope: &mut WriteScope,
    target: &mut Target,
    ds_id: DistributionSetId,
    origin: ActionOrigin,
    now: u64,
    events: &mut Vec<FleetEvent>,
) -> RolloutResult<Action> {
    if let Some(mut previous) = scope.active_action_for(&target.controller_id)? {
        let reason = format!("superseded by assignment of distribution set {ds_id}");
        cancel_in(scope, &mut previous, &reason, now, events)?;
    }

    let id = scope.next_id("actions")?;
    let mut action = Action {
        id,
        controller_id: target.controller_id.clone(),
        distribution_set_id: ds_id,
        origin,
        status: ActionStatusKind::Created,
        active: true,
        created_at: now,
        last_modified_at: now,
    };
    scope.put_action(&action)?;
    scope.append_action_status(&mut action, ActionStatusKind::Created, Vec::new(), now)?;
    scope.set_active_action(&target.controller_id, id)?;

    target.assigned_ds = Some(ds_id);
    target.update_status = TargetUpdateStatus::Pending;
    target.last_modified_at = now;
    scope.put_target(target)?;

    events.push(FleetEvent::ActionCreated {
        action_id: id,
        controller_id: target.controller_id.clone(),
        distribution_set_id: ds_id,
        origin,
    });
    Ok(action)
}
