//! AutoAssigner: applies saved filters that carry an auto-assign
//! distribution set.
//!
//! A pass is idempotent. Update-locked targets, targets inside an active
//! rollout action and targets whose current assignment is already the
//! filter's distribution set are left alone, so running the pass twice
//! creates no second action. A canceled assignment no longer counts, so
//! devices released by a stopped rollout are picked up again.

use std::time::Duration;

use fleetgrid_filter::FilterEngine;
use fleetgrid_rollout::{ActionManager, FilterQueryManager};
use fleetgrid_state::{ControllerId, PageRequest, StateStore, StoreView, TargetFilterQuery};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;

/// Summary of one auto-assignment pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoAssignReport {
    /// Saved filters with auto-assignment enabled.
    pub queries: usize,
    /// Filters skipped because their expression or distribution set is invalid.
    pub invalid: usize,
    pub matched: usize,
    pub assigned: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct AutoAssigner {
    store: StateStore,
    queries: FilterQueryManager,
    filter: FilterEngine,
    actions: ActionManager,
    page_size: usize,
}

impl AutoAssigner {
    pub fn new(store: StateStore, actions: ActionManager, page_size: usize) -> Self {
        Self {
            queries: FilterQueryManager::new(store.clone()),
            filter: FilterEngine::new(store.clone()),
            store,
            actions,
            page_size: page_size.max(1),
        }
    }

    /// Evaluate every auto-assigning filter once.
    pub async fn run_once(&self) -> SchedulerResult<AutoAssignReport> {
        let mut report = AutoAssignReport::default();

        let mut page = PageRequest::first(self.page_size);
        loop {
            let batch = self.queries.with_auto_assign(page)?;
            for query in &batch.content {
                report.queries += 1;
                self.apply(query, &mut report).await?;
            }
            if batch.content.len() < page.limit {
                break;
            }
            page = page.next();
        }

        if report.assigned > 0 || report.errors > 0 {
            info!(
                queries = report.queries,
                assigned = report.assigned,
                errors = report.errors,
                "auto-assignment pass"
            );
        } else {
            debug!(queries = report.queries, matched = report.matched, "auto-assignment pass");
        }
        Ok(report)
    }

    async fn apply(&self, query: &TargetFilterQuery, report: &mut AutoAssignReport) -> SchedulerResult<()> {
        let Some(ds) = query.auto_assign_ds else {
            return Ok(());
        };
        if let Err(e) = self.filter.verify(&query.query) {
            warn!(filter = query.id, name = %query.name, error = %e, "skipping invalid auto-assign filter");
            report.invalid += 1;
            return Ok(());
        }
        if self.store.read(|view| view.get_distribution_set(ds))?.is_none() {
            warn!(filter = query.id, ds, "auto-assign distribution set no longer exists");
            report.invalid += 1;
            return Ok(());
        }

        // Assignment changes fields filters may match on, so collect the
        // matches before assigning anything.
        let mut candidates: Vec<ControllerId> = Vec::new();
        let mut page = PageRequest::first(self.page_size);
        loop {
            let batch = self.filter.find_targets(&query.query, page)?;
            report.matched += batch.content.len();
            for target in &batch.content {
                // Whether the target already has `ds` depends on its active
                // action, which `auto_assign` checks under the target lock.
                if target.update_locked {
                    report.skipped += 1;
                } else {
                    candidates.push(target.controller_id.clone());
                }
            }
            if batch.content.len() < page.limit {
                break;
            }
            page = page.next();
        }

        for controller_id in candidates {
            match self.actions.auto_assign(&controller_id, ds, query.id).await {
                Ok(Some(_)) => report.assigned += 1,
                Ok(None) => report.skipped += 1,
                Err(e) if e.is_transient() => return Err(e.into()),
                Err(e) => {
                    error!(controller_id = %controller_id, filter = query.id, error = %e, "auto-assignment failed");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Run a pass every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "auto-assigner started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "auto-assignment pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("auto-assigner shutting down");
                    break;
                }
            }
        }
    }
}
