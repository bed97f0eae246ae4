//! Target and distribution set inventory.

use std::collections::BTreeMap;

use fleet_core::epoch_secs;
use fleetgrid_filter::FilterEngine;
use fleetgrid_state::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventBus, FleetEvent};

/// Registration request for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTarget {
    pub controller_id: String,
    /// Defaults to the controller id.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl NewTarget {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            controller_id: controller_id.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDistributionSet {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub modules: Vec<SoftwareModule>,
}

#[derive(Clone)]
pub struct Inventory {
    store: StateStore,
    filter: FilterEngine,
    events: EventBus,
}

impl Inventory {
    pub fn new(store: StateStore, events: EventBus) -> Self {
        Self {
            filter: FilterEngine::new(store.clone()),
            store,
            events,
        }
    }

    /// Register a device. Registering an existing controller id returns the
    /// stored target unchanged.
    pub fn register_target(&self, new: NewTarget) -> RolloutResult<Target> {
        let controller_id = new.controller_id.trim().to_string();
        if controller_id.is_empty() {
            return Err(RolloutError::Validation("controller id must not be empty".into()));
        }
        let now = epoch_secs();

        let (target, created) = self.store.write(|scope| -> StateResult<(Target, bool)> {
            if let Some(existing) = scope.get_target(&controller_id)? {
                return Ok((existing, false));
            }
            let name = new.name.as_deref().unwrap_or(&controller_id);
            let mut target = Target::new(&controller_id, name, now);
            target.description = new.description.clone();
            target.address = new.address.clone();
            target.attributes = new.attributes.clone();
            scope.put_target(&target)?;
            Ok((target, true))
        })?;

        if created {
            self.events.publish(FleetEvent::TargetRegistered {
                controller_id: target.controller_id.clone(),
            });
            info!(controller_id = %target.controller_id, "target registered");
        }
        Ok(target)
    }

    /// Merge `attributes` into the target's attribute map.
    pub fn update_attributes(
        &self,
        controller_id: &str,
        attributes: BTreeMap<String, String>,
    ) -> RolloutResult<Target> {
        let target = self.modify_target(controller_id, |target| target.attributes.extend(attributes))?;
        debug!(controller_id = %target.controller_id, count = target.attributes.len(), "attributes updated");
        Ok(target)
    }

    /// Locked targets are skipped by rollouts and auto-assignment.
    pub fn set_update_lock(&self, controller_id: &str, locked: bool) -> RolloutResult<Target> {
        let target = self.modify_target(controller_id, |target| target.update_locked = locked)?;
        info!(controller_id = %target.controller_id, locked, "update lock changed");
        Ok(target)
    }

    fn modify_target(&self, controller_id: &str, change: impl FnOnce(&mut Target)) -> RolloutResult<Target> {
        self.store.write(|scope| {
            let mut target = scope
                .get_target(controller_id)?
                .ok_or_else(|| RolloutError::not_found("target", controller_id))?;
            change(&mut target);
            target.last_modified_at = epoch_secs();
            scope.put_target(&target)?;
            Ok(target)
        })
    }

    pub fn get_target(&self, controller_id: &str) -> RolloutResult<Target> {
        self.store
            .read(|view| view.get_target(controller_id))?
            .ok_or_else(|| RolloutError::not_found("target", controller_id))
    }

    pub fn list_targets(&self, page: PageRequest) -> RolloutResult<Page<Target>> {
        Ok(self.store.read(|view| view.list_targets(page))?)
    }

    /// Targets matching a filter expression.
    pub fn find_targets(&self, expr: &str, page: PageRequest) -> RolloutResult<Page<Target>> {
        Ok(self.filter.find_targets(expr, page)?)
    }

    pub fn count_targets(&self, expr: &str) -> RolloutResult<usize> {
        Ok(self.filter.count_targets(expr)?)
    }

    // ── Distribution sets ──────────────────────────────────────────

    /// Distribution sets cannot be changed once created.
    pub fn create_distribution_set(&self, new: NewDistributionSet) -> RolloutResult<DistributionSet> {
        let (name, version) = (new.name.trim(), new.version.trim());
        if name.is_empty() || version.is_empty() {
            return Err(RolloutError::Validation(
                "distribution set name and version must not be empty".into(),
            ));
        }
        let now = epoch_secs();
        let ds = self.store.write(|scope| -> RolloutResult<DistributionSet> {
            let taken = scope
                .list_distribution_sets(PageRequest::all())?
                .content
                .iter()
                .any(|ds| ds.name == name && ds.version == version);
            if taken {
                return Err(RolloutError::Conflict(format!(
                    "distribution set {name}:{version} already exists"
                )));
            }
            let ds = DistributionSet {
                id: scope.next_id("distribution_sets")?,
                name: name.to_string(),
                version: version.to_string(),
                description: new.description.clone(),
                modules: new.modules.clone(),
                created_at: now,
            };
            scope.put_distribution_set(&ds)?;
            Ok(ds)
        })?;
        info!(ds = ds.id, name = %ds.name, version = %ds.version, "distribution set created");
        Ok(ds)
    }

    pub fn get_distribution_set(&self, id: DistributionSetId) -> RolloutResult<DistributionSet> {
        self.store
            .read(|view| view.get_distribution_set(id))?
            .ok_or_else(|| RolloutError::not_found("distribution set", id))
    }

    pub fn list_distribution_sets(&self, page: PageRequest) -> RolloutResult<Page<DistributionSet>> {
        Ok(self.store.read(|view| view.list_distribution_sets(page))?)
    }
}
