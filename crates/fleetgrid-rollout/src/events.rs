//! Outbound change notifications.
//!
//! Delivery is best effort: events are published after the transaction
//! they describe has committed, and a missing or lagging subscriber never
//! affects a state transition.

use fleetgrid_state::{
    ActionId, ActionOrigin, ActionStatusKind, ControllerId, DistributionSetId, RolloutGroupId,
    RolloutGroupStatus, RolloutId, RolloutStatus,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    TargetRegistered {
        controller_id: ControllerId,
    },
    RolloutCreated {
        rollout_id: RolloutId,
        name: String,
        total_targets: u64,
    },
    RolloutStatusChanged {
        rollout_id: RolloutId,
        from: Option<RolloutStatus>,
        to: RolloutStatus,
        reason: String,
    },
    GroupStatusChanged {
        rollout_id: RolloutId,
        group_id: RolloutGroupId,
        status: RolloutGroupStatus,
    },
    ActionCreated {
        action_id: ActionId,
        controller_id: ControllerId,
        distribution_set_id: DistributionSetId,
        origin: ActionOrigin,
    },
    ActionStatusChanged {
        action_id: ActionId,
        controller_id: ControllerId,
        status: ActionStatusKind,
    },
    RolloutDeleted {
        rollout_id: RolloutId,
        soft: bool,
    },
}

/// Fan-out of [`FleetEvent`]s to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FleetEvent) {
        // No receivers is not an error.
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = FleetEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish_all([
            FleetEvent::TargetRegistered {
                controller_id: "dev-1".into(),
            },
            FleetEvent::RolloutDeleted {
                rollout_id: 3,
                soft: true,
            },
        ]);

        assert!(matches!(rx.recv().await.unwrap(), FleetEvent::TargetRegistered { .. }));
        assert_eq!(
            rx.recv().await.unwrap(),
            FleetEvent::RolloutDeleted {
                rollout_id: 3,
                soft: true
            }
        );
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(FleetEvent::TargetRegistered {
            controller_id: "dev-1".into(),
        });
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(FleetEvent::GroupStatusChanged {
            rollout_id: 1,
            group_id: 2,
            status: RolloutGroupStatus::Running,
        })
        .unwrap();
        assert_eq!(json["event"], "group_status_changed");
        assert_eq!(json["group_id"], 2);
    }
}
