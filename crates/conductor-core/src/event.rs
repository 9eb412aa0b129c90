//! Progress events emitted while planning and executing.
//!
//! The orchestration core never talks to a UI or transport directly; it
//! publishes [`OrchestrationEvent`]s on an [`EventBus`] and any number of
//! subscribers (dashboards, loggers, tests) consume them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default capacity of the broadcast channel backing an [`EventBus`].
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events emitted during planning and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    /// A plan was created and stored.
    PlanCreated {
        plan_id: Uuid,
        subtask_count: usize,
        layer_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A layer (or executor phase) started.
    LayerStarted {
        plan_id: Uuid,
        layer: usize,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A layer (or executor phase) finished.
    LayerCompleted {
        plan_id: Uuid,
        layer: usize,
        succeeded: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A subtask was handed to a worker.
    SubtaskStarted {
        plan_id: Uuid,
        subtask_id: Uuid,
        worker_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A subtask completed and passed verification.
    SubtaskCompleted {
        plan_id: Uuid,
        subtask_id: Uuid,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A subtask failed; `blocked` dependents were blocked as a consequence.
    SubtaskFailed {
        plan_id: Uuid,
        subtask_id: Uuid,
        error: String,
        blocked: usize,
        timestamp: DateTime<Utc>,
    },

    /// A task attempt failed and will be retried after `delay_ms`.
    TaskRetrying {
        plan_id: Uuid,
        task_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The replanner produced a revised graph for a failed subtask.
    Replanned {
        plan_id: Uuid,
        subtask_id: Uuid,
        strategy: String,
        timestamp: DateTime<Utc>,
    },

    /// A plan was cancelled.
    PlanCancelled {
        plan_id: Uuid,
        skipped: usize,
        timestamp: DateTime<Utc>,
    },

    /// A plan finished executing.
    PlanFinished {
        plan_id: Uuid,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestrationEvent {
    /// The plan this event belongs to.
    pub fn plan_id(&self) -> Uuid {
        match self {
            OrchestrationEvent::PlanCreated { plan_id, .. }
            | OrchestrationEvent::LayerStarted { plan_id, .. }
            | OrchestrationEvent::LayerCompleted { plan_id, .. }
            | OrchestrationEvent::SubtaskStarted { plan_id, .. }
            | OrchestrationEvent::SubtaskCompleted { plan_id, .. }
            | OrchestrationEvent::SubtaskFailed { plan_id, .. }
            | OrchestrationEvent::TaskRetrying { plan_id, .. }
            | OrchestrationEvent::Replanned { plan_id, .. }
            | OrchestrationEvent::PlanCancelled { plan_id, .. }
            | OrchestrationEvent::PlanFinished { plan_id, .. } => *plan_id,
        }
    }
}

/// Fan-out channel for [`OrchestrationEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: OrchestrationEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let plan_id = Uuid::new_v4();

        bus.publish(OrchestrationEvent::PlanCancelled {
            plan_id,
            skipped: 2,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.plan_id(), plan_id);
        assert!(matches!(
            event,
            OrchestrationEvent::PlanCancelled { skipped: 2, .. }
        ));
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(OrchestrationEvent::PlanFinished {
            plan_id: Uuid::new_v4(),
            success: true,
            duration_ms: 1,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestrationEvent::SubtaskStarted {
            plan_id: Uuid::new_v4(),
            subtask_id: Uuid::new_v4(),
            worker_id: "legal".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "subtask_started");
        assert_eq!(json["worker_id"], "legal");
    }
}
