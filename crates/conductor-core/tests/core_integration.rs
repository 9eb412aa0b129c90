//! Integration tests for the event bus and the error taxonomy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::Utc;
use conductor_core::{ConductorError, EventBus, OrchestrationEvent};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

fn finished(plan_id: Uuid) -> OrchestrationEvent {
    OrchestrationEvent::PlanFinished {
        plan_id,
        success: true,
        duration_ms: 5,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn test_every_subscriber_sees_every_event() {
    let bus = EventBus::default();
    let mut first = bus.subscribe();
    let mut second = bus.clone().subscribe();
    assert_eq!(bus.subscriber_count(), 2);

    let plan_id = Uuid::new_v4();
    bus.publish(OrchestrationEvent::LayerStarted {
        plan_id,
        layer: 0,
        task_count: 2,
        timestamp: Utc::now(),
    });
    bus.publish(finished(plan_id));

    for rx in [&mut first, &mut second] {
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestrationEvent::LayerStarted { layer: 0, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            OrchestrationEvent::PlanFinished { success: true, .. }
        ));
    }
}

#[tokio::test]
async fn test_slow_subscriber_lags_instead_of_blocking() {
    let bus = EventBus::new(2);
    let mut rx = bus.subscribe();
    let plan_id = Uuid::new_v4();
    for _ in 0..5 {
        bus.publish(finished(plan_id));
    }

    assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
    assert_eq!(rx.recv().await.unwrap().plan_id(), plan_id);
}

#[test]
fn test_events_round_trip_through_json() {
    let event = OrchestrationEvent::SubtaskFailed {
        plan_id: Uuid::new_v4(),
        subtask_id: Uuid::new_v4(),
        error: "boom".into(),
        blocked: 3,
        timestamp: Utc::now(),
    };
    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"type\":\"subtask_failed\""));
    let back: OrchestrationEvent = serde_json::from_str(&json).unwrap();
    assert_eq!(back, event);
}

#[test]
fn test_error_messages_are_stable() {
    let id = Uuid::new_v4();
    assert_eq!(
        ConductorError::HasDependents { id, count: 2 }.to_string(),
        format!("Subtask {id} still has 2 dependent(s)")
    );
    assert_eq!(
        ConductorError::TaskTimeout(1500).to_string(),
        "Task timed out after 1500ms"
    );
    assert!(!ConductorError::PlanNotFound(id).is_retryable());
    assert!(ConductorError::SubtaskExecutionFailed("flaky upstream".into()).is_retryable());
}
