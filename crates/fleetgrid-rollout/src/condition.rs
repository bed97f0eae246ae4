//! Group success/error evaluation.
//!
//! Thresholds only look at actions that reached a device outcome
//! (`Finished` or `Error`). In-flight actions keep a group open; canceled
//! actions do not count at all. "Threshold met" is `>=`.

use fleetgrid_state::{Action, ActionStatusKind, GroupCondition, RolloutGroup, ThresholdKind};
use serde::Serialize;

/// Outcome counts for one group's actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupTally {
    pub finished: u64,
    pub error: u64,
    /// `Created` or `Running`.
    pub in_flight: u64,
    /// `Canceling` or `Canceled`.
    pub excluded: u64,
}

impl GroupTally {
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a Action>) -> Self {
        let mut tally = GroupTally::default();
        for action in actions {
            match action.status {
                ActionStatusKind::Finished => tally.finished += 1,
                ActionStatusKind::Error => tally.error += 1,
                ActionStatusKind::Created | ActionStatusKind::Running => tally.in_flight += 1,
                ActionStatusKind::Canceling | ActionStatusKind::Canceled => tally.excluded += 1,
            }
        }
        tally
    }

    /// Actions with a device outcome.
    pub fn terminal(&self) -> u64 {
        self.finished + self.error
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupVerdict {
    /// Keep waiting.
    Open,
    Succeeded,
    Failed { reason: String },
}

fn threshold_met(condition: &GroupCondition, hits: u64, terminal: u64) -> bool {
    let value = u64::from(condition.value);
    match condition.kind {
        ThresholdKind::Count => hits >= value,
        ThresholdKind::Percent => terminal > 0 && hits * 100 >= value * terminal,
    }
}

/// Decide what a running group should do next.
pub fn evaluate_group(group: &RolloutGroup, tally: &GroupTally) -> GroupVerdict {
    let terminal = tally.terminal();

    if let Some(error) = &group.error_condition
        && threshold_met(error, tally.error, terminal)
    {
        return GroupVerdict::Failed {
            reason: format!(
                "error threshold reached: {} of {} actions failed",
                tally.error, terminal
            ),
        };
    }

    if tally.in_flight > 0 {
        return GroupVerdict::Open;
    }
    if terminal == 0 {
        // Nothing was dispatched, or everything was canceled.
        return GroupVerdict::Succeeded;
    }
    if threshold_met(&group.success_condition, tally.finished, terminal) {
        return GroupVerdict::Succeeded;
    }
    GroupVerdict::Failed {
        reason: format!(
            "success threshold not reached: {} of {} actions finished",
            tally.finished, terminal
        ),
    }
}
