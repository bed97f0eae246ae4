//! End-to-end rollout scenarios.
//!
//! Wires inventory, rollouts, actions and both scheduler passes over an
//! in-memory store and drives devices through their reports.

use std::time::Duration;

use fleet_core::RolloutConfig;
use fleetgrid_rollout::*;
use fleetgrid_scheduler::{AutoAssigner, RolloutScheduler};
use fleetgrid_state::*;

struct Fleet {
    store: StateStore,
    inventory: Inventory,
    queries: FilterQueryManager,
    rollouts: RolloutManager,
    scheduler: RolloutScheduler,
    assigner: AutoAssigner,
}

fn fleet_with_timeout(timeout: Duration) -> Fleet {
    let store = StateStore::open_in_memory().unwrap();
    let events = EventBus::default();
    let actions = ActionManager::new(store.clone(), events.clone(), timeout);
    let rollouts = RolloutManager::new(store.clone(), actions.clone(), events.clone(), RolloutConfig::default());
    Fleet {
        inventory: Inventory::new(store.clone(), events),
        queries: FilterQueryManager::new(store.clone()),
        scheduler: RolloutScheduler::new(rollouts.clone(), 4),
        assigner: AutoAssigner::new(store.clone(), actions, 7),
        rollouts,
        store,
    }
}

fn fleet() -> Fleet {
    fleet_with_timeout(Duration::from_secs(3600))
}

impl Fleet {
    fn register(&self, count: usize) -> Vec<ControllerId> {
        (0..count)
            .map(|i| {
                self.inventory
                    .register_target(NewTarget::new(format!("dev-{i:03}")))
                    .unwrap()
                    .controller_id
            })
            .collect()
    }

    fn distribution_set(&self, version: &str) -> DistributionSetId {
        self.inventory
            .create_distribution_set(NewDistributionSet {
                name: "firmware".into(),
                version: version.into(),
                ..NewDistributionSet::default()
            })
            .unwrap()
            .id
    }

    fn actions(&self) -> &ActionManager {
        self.rollouts.actions()
    }

    /// Make `count` devices of a group report `outcome` for their active action.
    async fn report(&self, group_id: RolloutGroupId, outcome: ReportOutcome, count: usize) {
        let members = self.rollouts.group_targets(group_id, PageRequest::all()).unwrap();
        let mut reported = 0;
        for cid in members.content {
            if reported == count {
                return;
            }
            if let Some(action) = self.actions().active_action(&cid).unwrap() {
                self.actions()
                    .report(&cid, action.id, ActionReport::new(outcome, "device report"))
                    .await
                    .unwrap();
                reported += 1;
            }
        }
        assert_eq!(reported, count, "not enough active actions in group {group_id}");
    }
}

fn halves(success: u32) -> GroupSpec {
    let half = |name: &str| GroupDefinition {
        name: name.into(),
        percentage: 50,
        success_condition: GroupCondition::percent(success),
        error_condition: None,
        error_action: ErrorAction::Pause,
    };
    GroupSpec::Explicit(vec![half("canary"), half("rest")])
}

fn single(success: u32) -> GroupSpec {
    GroupSpec::Count {
        groups: 1,
        success_condition: GroupCondition::percent(success),
        error_condition: None,
        error_action: ErrorAction::Pause,
    }
}

fn rollout(name: &str, filter: &str, ds: DistributionSetId, groups: GroupSpec) -> CreateRollout {
    CreateRollout {
        name: name.into(),
        description: None,
        target_filter: filter.into(),
        distribution_set_id: ds,
        groups,
    }
}

#[tokio::test]
async fn below_eighty_percent_pauses_the_rollout() {
    let fleet = fleet();
    fleet.register(100);
    let ds = fleet.distribution_set("2.0");
    let created = fleet
        .rollouts
        .create(rollout("wave", "name==dev-*", ds, halves(80)))
        .await
        .unwrap();
    let id = created.rollout.id;
    let (canary, rest) = (created.groups[0].id, created.groups[1].id);
    fleet.rollouts.start(id).await.unwrap();

    // 39 of 50: not yet.
    fleet.report(canary, ReportOutcome::Success, 39).await;
    fleet.report(canary, ReportOutcome::Failure, 11).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.groups_failed, 1);
    assert_eq!(fleet.rollouts.get(id).unwrap().status, RolloutStatus::Paused);
    assert_eq!(fleet.rollouts.group_tally(rest).unwrap(), GroupTally::default());
}

#[tokio::test]
async fn exactly_eighty_percent_is_enough() {
    let fleet = fleet();
    fleet.register(100);
    let ds = fleet.distribution_set("2.0");
    let created = fleet
        .rollouts
        .create(rollout("wave", "name==dev-*", ds, halves(80)))
        .await
        .unwrap();
    let id = created.rollout.id;
    let (canary, rest) = (created.groups[0].id, created.groups[1].id);
    fleet.rollouts.start(id).await.unwrap();

    fleet.report(canary, ReportOutcome::Success, 40).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.groups_advanced, 0, "10 actions are still in flight");

    fleet.report(canary, ReportOutcome::Failure, 10).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.groups_advanced, 1);
    assert_eq!(fleet.rollouts.group(canary).unwrap().status, RolloutGroupStatus::Finished);
    assert_eq!(fleet.rollouts.group_tally(rest).unwrap().in_flight, 50);
    assert_eq!(fleet.rollouts.get(id).unwrap().current_group, Some(1));

    fleet.report(rest, ReportOutcome::Success, 50).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.completed, 1);
    assert_eq!(fleet.rollouts.get(id).unwrap().status, RolloutStatus::Finished);
    assert!(fleet.rollouts.running_ids().unwrap().is_empty());
}

#[tokio::test]
async fn locked_group_members_finish_in_one_tick() {
    let fleet = fleet();
    let ids = fleet.register(4);
    let ds = fleet.distribution_set("2.0");
    let created = fleet
        .rollouts
        .create(rollout("wave", "name==dev-*", ds, halves(100)))
        .await
        .unwrap();
    // Locked after planning: the second group gets no actions at all.
    for cid in &ids[2..] {
        fleet.inventory.set_update_lock(cid, true).unwrap();
    }
    fleet.rollouts.start(created.rollout.id).await.unwrap();
    fleet.report(created.groups[0].id, ReportOutcome::Success, 2).await;

    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.groups_advanced, 1);
    assert_eq!(tick.completed, 1);
    assert_eq!(
        fleet.rollouts.get(created.rollout.id).unwrap().status,
        RolloutStatus::Finished
    );
}

#[tokio::test]
async fn zero_target_rollout_finishes_without_groups_running() {
    let fleet = fleet();
    fleet.register(3);
    let ds = fleet.distribution_set("2.0");
    let created = fleet
        .rollouts
        .create(rollout("nobody", "attribute.region==mars", ds, halves(100)))
        .await
        .unwrap();
    assert_eq!(created.rollout.total_targets, 0);

    let started = fleet.rollouts.start(created.rollout.id).await.unwrap();
    assert_eq!(started.status, RolloutStatus::Finished);
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.rollouts, 0);
    assert!(fleet
        .rollouts
        .groups(started.id)
        .unwrap()
        .iter()
        .all(|g| g.status == RolloutGroupStatus::Scheduled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_advance_never_runs_two_groups() {
    let fleet = fleet();
    fleet.register(30);
    let ds = fleet.distribution_set("2.0");
    let spec = GroupSpec::Count {
        groups: 3,
        success_condition: GroupCondition::percent(100),
        error_condition: None,
        error_action: ErrorAction::Pause,
    };
    let created = fleet.rollouts.create(rollout("wave", "name==*", ds, spec)).await.unwrap();
    let id = created.rollout.id;
    fleet.rollouts.start(id).await.unwrap();
    fleet.report(created.groups[0].id, ReportOutcome::Success, 10).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let rollouts = fleet.rollouts.clone();
        handles.push(tokio::spawn(async move { rollouts.advance(id).await.unwrap() }));
    }
    let mut started = 0;
    for handle in handles {
        if let AdvanceOutcome::GroupFinished { .. } = handle.await.unwrap() {
            started += 1;
        }
    }
    assert_eq!(started, 1);

    let groups = fleet.rollouts.groups(id).unwrap();
    assert_eq!(groups[1].status, RolloutGroupStatus::Running);
    assert_eq!(groups[2].status, RolloutGroupStatus::Scheduled);
    assert_eq!(fleet.rollouts.group_tally(groups[1].id).unwrap().in_flight, 10);
    assert_eq!(fleet.rollouts.group_tally(groups[2].id).unwrap(), GroupTally::default());
}

#[tokio::test]
async fn auto_assign_matches_unknown_devices_once() {
    let fleet = fleet();
    let ids = fleet.register(20);
    let ds = fleet.distribution_set("1.5");
    // Devices that polled are no longer UNKNOWN.
    for cid in &ids[..5] {
        fleet.actions().poll(cid).await.unwrap();
    }
    fleet
        .queries
        .create("fresh devices", "updateStatus==UNKNOWN", Some(ds))
        .unwrap();

    let first = fleet.assigner.run_once().await.unwrap();
    assert_eq!(first.queries, 1);
    assert_eq!(first.assigned, 15);

    let second = fleet.assigner.run_once().await.unwrap();
    assert_eq!(second.assigned, 0);

    for cid in &ids[5..] {
        let action = fleet.actions().active_action(cid).unwrap().unwrap();
        assert_eq!(action.origin, ActionOrigin::AutoAssign { filter_id: 1 });
        assert_eq!(action.distribution_set_id, ds);
    }
    assert!(fleet.actions().active_action(&ids[0]).unwrap().is_none());
}

#[tokio::test]
async fn auto_assign_is_idempotent_and_leaves_rollouts_alone() {
    let fleet = fleet();
    let ids = fleet.register(6);
    let rollout_ds = fleet.distribution_set("2.0");
    let auto_ds = fleet.distribution_set("1.9");
    fleet.inventory.set_update_lock(&ids[5], true).unwrap();

    let created = fleet
        .rollouts
        .create(rollout("first-two", "controllerId=in=(dev-000,dev-001)", rollout_ds, single(100)))
        .await
        .unwrap();
    fleet.rollouts.start(created.rollout.id).await.unwrap();
    fleet.queries.create("everyone", "name==*", Some(auto_ds)).unwrap();

    let first = fleet.assigner.run_once().await.unwrap();
    assert_eq!(first.matched, 6);
    assert_eq!(first.assigned, 3);
    // Two rollout members and one locked target.
    assert_eq!(first.skipped, 3);

    let second = fleet.assigner.run_once().await.unwrap();
    assert_eq!(second.assigned, 0);
    for cid in &ids[2..5] {
        assert_eq!(fleet.actions().actions_for_target(cid).unwrap().len(), 1);
    }
    let rollout_action = fleet.actions().active_action(&ids[0]).unwrap().unwrap();
    assert!(matches!(rollout_action.origin, ActionOrigin::Rollout { .. }));
}

#[tokio::test]
async fn invalid_saved_filters_are_skipped() {
    let fleet = fleet();
    fleet.register(2);
    let ds = fleet.distribution_set("1.0");
    let saved = fleet.queries.create("ok", "name==*", Some(ds)).unwrap();

    // Corrupt the stored expression behind the manager's back.
    fleet
        .store
        .write(|s| -> StateResult<()> {
            let mut query = s.get_filter_query(saved.id)?.unwrap();
            query.query = "name==(".into();
            s.put_filter_query(&query)
        })
        .unwrap();

    let report = fleet.assigner.run_once().await.unwrap();
    assert_eq!(report.invalid, 1);
    assert_eq!(report.assigned, 0);
}

#[tokio::test]
async fn rollout_start_supersedes_direct_assignments() {
    let fleet = fleet();
    let ids = fleet.register(2);
    let old = fleet.distribution_set("1.0");
    let new = fleet.distribution_set("2.0");

    let created_direct = fleet.actions().assign(&ids[0], old, ActionOrigin::Direct).await.unwrap();
    let running_direct = fleet.actions().assign(&ids[1], old, ActionOrigin::Direct).await.unwrap();
    fleet.actions().poll(&ids[1]).await.unwrap();

    let spec = single(100);
    let created = fleet.rollouts.create(rollout("upgrade", "name==*", new, spec)).await.unwrap();
    fleet.rollouts.start(created.rollout.id).await.unwrap();

    assert_eq!(
        fleet.actions().get(created_direct.id).unwrap().status,
        ActionStatusKind::Canceled
    );
    assert_eq!(
        fleet.actions().get(running_direct.id).unwrap().status,
        ActionStatusKind::Canceling
    );
    for cid in &ids {
        let active = fleet.actions().active_action(cid).unwrap().unwrap();
        assert_eq!(active.distribution_set_id, new);
    }
}

#[tokio::test]
async fn ignored_group_failure_keeps_rolling() {
    let fleet = fleet();
    fleet.register(4);
    let ds = fleet.distribution_set("2.0");
    let tolerant = |name: &str| GroupDefinition {
        name: name.into(),
        percentage: 50,
        success_condition: GroupCondition::percent(100),
        error_condition: Some(GroupCondition::count(1)),
        error_action: ErrorAction::Ignore,
    };
    let spec = GroupSpec::Explicit(vec![tolerant("canary"), tolerant("rest")]);
    let created = fleet.rollouts.create(rollout("wave", "name==*", ds, spec)).await.unwrap();
    let id = created.rollout.id;
    let (canary, rest) = (created.groups[0].id, created.groups[1].id);
    fleet.rollouts.start(id).await.unwrap();

    fleet.report(canary, ReportOutcome::Failure, 1).await;
    fleet.report(canary, ReportOutcome::Success, 1).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.groups_failed, 1);
    assert_eq!(tick.groups_advanced, 1);
    assert_eq!(fleet.rollouts.get(id).unwrap().status, RolloutStatus::Running);
    assert_eq!(fleet.rollouts.group(canary).unwrap().status, RolloutGroupStatus::Error);
    assert_eq!(fleet.rollouts.group(rest).unwrap().status, RolloutGroupStatus::Running);
    assert_eq!(fleet.rollouts.group_tally(rest).unwrap().in_flight, 2);

    // The failed group still keeps the rollout from finishing cleanly.
    fleet.report(rest, ReportOutcome::Success, 2).await;
    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.completed, 1);
    assert_eq!(fleet.rollouts.get(id).unwrap().status, RolloutStatus::Error);
}

#[tokio::test]
async fn stopped_rollout_releases_devices_to_auto_assign() {
    let fleet = fleet();
    let ids = fleet.register(2);
    let ds = fleet.distribution_set("2.0");
    let created = fleet
        .rollouts
        .create(rollout("wave", "name==*", ds, single(100)))
        .await
        .unwrap();
    fleet.rollouts.start(created.rollout.id).await.unwrap();
    // One device retrieved its action, the other never did.
    fleet.actions().poll(&ids[0]).await.unwrap();
    fleet.rollouts.stop(created.rollout.id).await.unwrap();

    for cid in &ids {
        assert!(fleet.actions().active_action(cid).unwrap().is_none());
        let target = fleet.inventory.get_target(cid).unwrap();
        assert_eq!(target.assigned_ds, None);
        assert_ne!(target.update_status, TargetUpdateStatus::Pending);
    }

    fleet.queries.create("everyone", "name==*", Some(ds)).unwrap();
    let report = fleet.assigner.run_once().await.unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.assigned, 2);
    assert_eq!(report.skipped, 0);
    for cid in &ids {
        let action = fleet.actions().active_action(cid).unwrap().unwrap();
        assert_eq!(action.origin, ActionOrigin::AutoAssign { filter_id: 1 });
        assert_eq!(action.distribution_set_id, ds);
    }
}

#[tokio::test]
async fn timed_out_actions_fail_their_group() {
    let fleet = fleet_with_timeout(Duration::ZERO);
    fleet.register(3);
    let ds = fleet.distribution_set("2.0");
    let spec = single(100);
    let created = fleet.rollouts.create(rollout("wave", "name==*", ds, spec)).await.unwrap();
    fleet.rollouts.start(created.rollout.id).await.unwrap();

    let tick = fleet.scheduler.tick().await.unwrap();
    assert_eq!(tick.timed_out, 3);
    assert_eq!(tick.groups_failed, 1);
    assert_eq!(
        fleet.rollouts.get(created.rollout.id).unwrap().status,
        RolloutStatus::Paused
    );
    let tally = fleet.rollouts.group_tally(created.groups[0].id).unwrap();
    assert_eq!(tally.error, 3);
}

#[tokio::test]
async fn scheduler_loop_stops_on_shutdown() {
    let fleet = fleet();
    let (tx, rx) = tokio::sync::watch::channel(false);
    let run = fleet.scheduler.run(Duration::from_millis(5), rx);
    let stop = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
    };
    tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, stop) })
        .await
        .unwrap();
}
