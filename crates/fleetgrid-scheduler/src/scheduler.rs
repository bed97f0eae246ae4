//! RolloutScheduler: the periodic rollout advancement loop.
//!
//! Each tick:
//! - closes actions that exceeded the action timeout,
//! - lists rollouts that are running (or were left starting),
//! - advances each one on its own task, bounded by a semaphore.
//!
//! A rollout whose lock is held by a user command is skipped until the next
//! tick. Store failures are logged and retried next tick; they never move a
//! rollout to `Error`.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::epoch_secs;
use fleetgrid_rollout::{AdvanceOutcome, ExpiryReport, RolloutManager, RolloutResult};
use fleetgrid_state::{ErrorAction, RolloutId};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;

/// Upper bound on advancement steps for one rollout in one tick.
const MAX_STEPS_PER_TICK: usize = 64;

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub timed_out: usize,
    pub canceled: usize,
    /// Rollouts looked at.
    pub rollouts: usize,
    /// Groups that finished (or failed and were ignored) and let the next start.
    pub groups_advanced: usize,
    pub groups_failed: usize,
    /// Rollouts that reached `Finished` or `Error`.
    pub completed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickReport {
    fn record_expiry(&mut self, expiry: ExpiryReport) {
        self.timed_out += expiry.timed_out;
        self.canceled += expiry.canceled;
    }

    fn record(&mut self, outcome: AdvanceOutcome) {
        match outcome {
            AdvanceOutcome::Idle | AdvanceOutcome::Waiting => {}
            AdvanceOutcome::GroupFinished { .. } => self.groups_advanced += 1,
            AdvanceOutcome::GroupFailed { action } => {
                self.groups_failed += 1;
                if action == ErrorAction::Abort {
                    self.completed += 1;
                } else if action == ErrorAction::Ignore {
                    self.groups_advanced += 1;
                }
            }
            AdvanceOutcome::Finished | AdvanceOutcome::Errored => self.completed += 1,
            AdvanceOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Drives every running rollout forward.
pub struct RolloutScheduler {
    rollouts: RolloutManager,
    permits: Arc<Semaphore>,
}

impl RolloutScheduler {
    pub fn new(rollouts: RolloutManager, max_parallel_rollouts: usize) -> Self {
        Self {
            rollouts,
            permits: Arc::new(Semaphore::new(max_parallel_rollouts.max(1))),
        }
    }

    /// Run one pass over all running rollouts.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();

        match self.rollouts.actions().expire_stale(epoch_secs()).await {
            Ok(expiry) => report.record_expiry(expiry),
            Err(e) => {
                warn!(error = %e, "action expiry failed, retrying next tick");
                report.errors += 1;
            }
        }

        let ids = self.rollouts.running_ids()?;
        report.rollouts = ids.len();

        let mut tasks = JoinSet::new();
        for id in ids {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(anyhow::Error::from)?;
            let rollouts = self.rollouts.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (id, drive(&rollouts, id).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcomes))) => {
                    for outcome in outcomes {
                        report.record(outcome);
                    }
                }
                Ok((id, Err(e))) => {
                    // Rollout state is untouched; the next tick retries.
                    error!(rollout = id, error = %e, "rollout advancement failed");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "rollout task panicked");
                    report.errors += 1;
                }
            }
        }

        if report.groups_advanced + report.groups_failed + report.completed > 0 {
            info!(
                rollouts = report.rollouts,
                advanced = report.groups_advanced,
                failed = report.groups_failed,
                completed = report.completed,
                "scheduler tick"
            );
        } else {
            debug!(rollouts = report.rollouts, skipped = report.skipped, "scheduler tick");
        }
        Ok(report)
    }

    /// Tick every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "rollout scheduler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("rollout scheduler shutting down");
                    break;
                }
            }
        }
    }
}

/// Advance one rollout for as long as each step makes progress.
async fn drive(rollouts: &RolloutManager, id: RolloutId) -> RolloutResult<Vec<AdvanceOutcome>> {
    let mut outcomes = Vec::new();
    for _ in 0..MAX_STEPS_PER_TICK {
        let outcome = rollouts.try_advance(id).await?;
        outcomes.push(outcome);
        let progressed = matches!(
            outcome,
            AdvanceOutcome::GroupFinished { .. }
                | AdvanceOutcome::GroupFailed {
                    action: ErrorAction::Ignore
                }
        );
        if !progressed {
            break;
        }
    }
    Ok(outcomes)
}
