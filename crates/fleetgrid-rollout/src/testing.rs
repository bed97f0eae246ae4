//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use fleetgrid_state::*;

pub fn fixture() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

pub fn seed_target(store: &StateStore, controller_id: &str) {
    seed_target_with(store, controller_id, &[]);
}

pub fn seed_target_with(store: &StateStore, controller_id: &str, attributes: &[(&str, &str)]) {
    let mut target = Target::new(controller_id, controller_id, 1);
    target.attributes = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();
    store.write(|s| s.put_target(&target)).unwrap();
}

/// `dev-000`, `dev-001`, ...
pub fn seed_fleet(store: &StateStore, count: usize) -> Vec<ControllerId> {
    let ids: Vec<ControllerId> = (0..count).map(|i| format!("dev-{i:03}")).collect();
    store
        .write(|s| -> StateResult<()> {
            for id in &ids {
                s.put_target(&Target::new(id, id, 1))?;
            }
            Ok(())
        })
        .unwrap();
    ids
}

pub fn seed_ds(store: &StateStore, name: &str, version: &str) -> DistributionSetId {
    store
        .write(|s| -> StateResult<DistributionSetId> {
            let id = s.next_id("distribution_sets")?;
            s.put_distribution_set(&DistributionSet {
                id,
                name: name.to_string(),
                version: version.to_string(),
                description: None,
                modules: Vec::new(),
                created_at: 1,
            })?;
            Ok(id)
        })
        .unwrap()
}

pub fn lock_target(store: &StateStore, controller_id: &str) {
    store
        .write(|s| -> StateResult<()> {
            let mut target = s.get_target(controller_id)?.unwrap();
            target.update_locked = true;
            s.put_target(&target)
        })
        .unwrap();
}
