//! Saved target filters and their auto-assignment settings.

use fleet_core::epoch_secs;
use fleetgrid_filter::{FilterEngine, Predicate, Schema, parse};
use fleetgrid_state::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RolloutError, RolloutResult};

/// Fields to change on a saved filter; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterQueryUpdate {
    pub name: Option<String>,
    pub query: Option<String>,
}

#[derive(Clone)]
pub struct FilterQueryManager {
    store: StateStore,
    filter: FilterEngine,
}

impl FilterQueryManager {
    pub fn new(store: StateStore) -> Self {
        Self {
            filter: FilterEngine::new(store.clone()),
            store,
        }
    }

    /// Parse a target filter without saving it.
    pub fn verify(&self, query: &str) -> RolloutResult<Predicate> {
        Ok(self.filter.verify(query)?)
    }

    pub fn create(
        &self,
        name: &str,
        query: &str,
        auto_assign_ds: Option<DistributionSetId>,
    ) -> RolloutResult<TargetFilterQuery> {
        let name = checked_name(name)?;
        self.verify(query)?;
        let now = epoch_secs();

        let created = self.store.write(|scope| -> RolloutResult<TargetFilterQuery> {
            if let Some(ds) = auto_assign_ds {
                ensure_ds(scope, ds)?;
            }
            let saved = TargetFilterQuery {
                id: scope.next_id("filter_queries")?,
                name: name.clone(),
                query: query.trim().to_string(),
                auto_assign_ds,
                created_at: now,
                last_modified_at: now,
            };
            put_unique(scope, &saved)?;
            Ok(saved)
        })?;

        info!(filter = created.id, name = %created.name, "filter query created");
        Ok(created)
    }

    pub fn update(&self, id: FilterQueryId, update: FilterQueryUpdate) -> RolloutResult<TargetFilterQuery> {
        let name = update.name.as_deref().map(checked_name).transpose()?;
        if let Some(query) = &update.query {
            self.verify(query)?;
        }

        let updated = self.modify(id, |saved| {
            if let Some(name) = name {
                saved.name = name;
            }
            if let Some(query) = update.query {
                saved.query = query.trim().to_string();
            }
        })?;
        info!(filter = id, name = %updated.name, "filter query updated");
        Ok(updated)
    }

    /// Enable auto-assignment of `ds` to every matching target.
    pub fn set_auto_assign(&self, id: FilterQueryId, ds: DistributionSetId) -> RolloutResult<TargetFilterQuery> {
        self.store.read(|view| ensure_ds(view, ds))?;
        let updated = self.modify(id, |saved| saved.auto_assign_ds = Some(ds))?;
        info!(filter = id, ds, "auto-assignment enabled");
        Ok(updated)
    }

    pub fn clear_auto_assign(&self, id: FilterQueryId) -> RolloutResult<TargetFilterQuery> {
        let updated = self.modify(id, |saved| saved.auto_assign_ds = None)?;
        info!(filter = id, "auto-assignment cleared");
        Ok(updated)
    }

    pub fn delete(&self, id: FilterQueryId) -> RolloutResult<()> {
        if !self.store.write(|scope| scope.delete_filter_query(id))? {
            return Err(RolloutError::not_found("filter query", id));
        }
        info!(filter = id, "filter query deleted");
        Ok(())
    }

    fn modify(
        &self,
        id: FilterQueryId,
        change: impl FnOnce(&mut TargetFilterQuery),
    ) -> RolloutResult<TargetFilterQuery> {
        self.store.write(|scope| {
            let mut saved = scope
                .get_filter_query(id)?
                .ok_or_else(|| RolloutError::not_found("filter query", id))?;
            change(&mut saved);
            saved.last_modified_at = epoch_secs();
            put_unique(scope, &saved)?;
            Ok(saved)
        })
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, id: FilterQueryId) -> RolloutResult<TargetFilterQuery> {
        self.store
            .read(|view| view.get_filter_query(id))?
            .ok_or_else(|| RolloutError::not_found("filter query", id))
    }

    pub fn get_by_name(&self, name: &str) -> RolloutResult<TargetFilterQuery> {
        let found = self.store.read(|view| -> StateResult<Option<TargetFilterQuery>> {
            match view.filter_query_id_by_name(name)? {
                Some(id) => view.get_filter_query(id),
                None => Ok(None),
            }
        })?;
        found.ok_or_else(|| RolloutError::not_found("filter query", name))
    }

    pub fn list(&self, page: PageRequest) -> RolloutResult<Page<TargetFilterQuery>> {
        Ok(self.store.read(|view| view.scan_filter_queries(&|_| true, page))?)
    }

    pub fn count(&self) -> RolloutResult<u64> {
        Ok(self.store.read(|view| view.count_filter_queries())?)
    }

    /// Case-insensitive substring match on the name.
    pub fn find_by_name(&self, fragment: &str, page: PageRequest) -> RolloutResult<Page<TargetFilterQuery>> {
        let needle = fragment.to_lowercase();
        Ok(self.store.read(|view| {
            view.scan_filter_queries(&|q| q.name.to_lowercase().contains(&needle), page)
        })?)
    }

    /// Saved filters matching an expression over filter-query fields.
    pub fn find(&self, expr: &str, page: PageRequest) -> RolloutResult<Page<TargetFilterQuery>> {
        let filter = parse(expr, Schema::FilterQuery)?.compile()?;
        Ok(self
            .store
            .read(|view| view.scan_filter_queries(&|q| filter.matches(q), page))?)
    }

    pub fn find_by_auto_assign_ds(
        &self,
        ds: DistributionSetId,
        page: PageRequest,
    ) -> RolloutResult<Page<TargetFilterQuery>> {
        Ok(self
            .store
            .read(|view| view.scan_filter_queries(&|q| q.auto_assign_ds == Some(ds), page))?)
    }

    /// Saved filters with auto-assignment enabled.
    pub fn with_auto_assign(&self, page: PageRequest) -> RolloutResult<Page<TargetFilterQuery>> {
        Ok(self
            .store
            .read(|view| view.scan_filter_queries(&|q| q.auto_assign_ds.is_some(), page))?)
    }
}

fn checked_name(name: &str) -> RolloutResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RolloutError::Validation("filter query name must not be empty".into()));
    }
    Ok(name.to_string())
}

fn ensure_ds(view: &impl StoreView, ds: DistributionSetId) -> RolloutResult<()> {
    match view.get_distribution_set(ds)? {
        Some(_) => Ok(()),
        None => Err(RolloutError::not_found("distribution set", ds)),
    }
}

fn put_unique(scope: &mut WriteScope, saved: &TargetFilterQuery) -> RolloutResult<()> {
    scope.put_filter_query(saved).map_err(|e| match e {
        StateError::Duplicate { .. } => {
            RolloutError::Conflict(format!("filter query name '{}' is already in use", saved.name))
        }
        other => other.into(),
    })
}
