// Engine start/stop and the event loop

use chrono::Utc;
use std::time::Duration;
use steward_shared::WorkflowRepresentation;
use uuid::Uuid;

use crate::jobs::{task_name, TaskScheduler};
use crate::tests::fixtures::{two_step_workflow, TestEngine};
use crate::workflows::{event_channel, ResourceEvent, Workflow, WorkflowRepository};

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_start_registers_stored_workflows() {
    let t = TestEngine::new().await;

    let rep: WorkflowRepresentation = serde_json::from_value(two_step_workflow("preexisting")).unwrap();
    let stored = Workflow::from_representation(t.realm.id, Uuid::new_v4(), &rep, Utc::now()).unwrap();
    WorkflowRepository::create(t.store.as_ref(), &stored).await.unwrap();
    assert!(!t.scheduler.is_registered(&task_name(stored.id)).await);

    let (_publisher, events) = event_channel(8);
    t.engine.start(events).await.unwrap();
    assert!(t.scheduler.is_registered(&task_name(stored.id)).await);

    t.engine.stop().await;
}

#[tokio::test]
async fn test_published_events_bind_until_stopped() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    let bob = t.add_user("bob").await;

    let (publisher, events) = event_channel(8);
    t.engine.start(events).await.unwrap();

    publisher
        .publish(ResourceEvent::created(t.realm.id, alice.id))
        .await
        .unwrap();
    assert!(wait_for(|| async { t.binding(&alice, &wf).await.is_some() }).await);

    t.engine.stop().await;

    assert!(publisher.publish(ResourceEvent::created(t.realm.id, bob.id)).await.is_err());
    assert!(t.binding(&bob, &wf).await.is_none());
}
