// End-to-end workflow runs against the in-memory store

use chrono::Duration;
use serde_json::json;

use crate::jobs::{task_name, TaskOutcome, TaskScheduler};
use crate::tests::fixtures::{t0, two_step_workflow, TestEngine};
use crate::workflows::{EngineConfig, ExecutionMode, WorkflowRepository};

#[tokio::test]
async fn test_notify_then_disable_on_schedule() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 0);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(5));

    t.advance(Duration::days(6));
    assert_eq!(t.fire(&wf).await, Some(TaskOutcome::Continue));

    let sent = t.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message, "Hello alice");
    assert_eq!(sent[0].recipient.as_deref(), Some("alice@example.com"));

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 1);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(10));
    assert!(!binding.terminal);
    assert!(t.reload(&alice).await.unwrap().enabled);

    t.advance(Duration::days(4));
    t.fire(&wf).await;

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert!(binding.terminal);
    assert_eq!(binding.position, 2);
    assert!(!t.reload(&alice).await.unwrap().enabled);
    assert_eq!(t.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_paused_workflow_resumes_from_stored_position() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(3));
    let paused = t.set_enabled(&wf, false).await;
    assert!(!t.scheduler.is_registered(&task_name(wf.id)).await);

    t.advance(Duration::days(17));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert!(report.paused);
    assert!(t.notifier.sent().is_empty());

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 0);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(5));

    t.set_enabled(&paused, true).await;
    assert!(t.scheduler.is_registered(&task_name(wf.id)).await);

    t.fire(&wf).await;
    assert_eq!(t.notifier.sent().len(), 1);
    assert_eq!(t.binding(&alice, &wf).await.unwrap().position, 1);

    // the second step was already due while paused
    t.fire(&wf).await;
    assert!(t.binding(&alice, &wf).await.unwrap().terminal);
}

#[tokio::test]
async fn test_restart_step_rewinds_binding() {
    let t = TestEngine::new().await;
    let wf = t
        .create_workflow(json!({
            "name": "recertify",
            "steps": [
                { "type": "notify", "after": "1d", "config": { "message": "please recertify" } },
                { "type": "restart", "after": "2d", "config": { "position": 0 } }
            ]
        }))
        .await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(1));
    t.fire(&wf).await;
    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 1);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(3));

    t.advance(Duration::days(2));
    t.fire(&wf).await;
    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 0);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(4));
    assert!(!binding.terminal);
}

#[tokio::test]
async fn test_same_name_in_two_realms_is_isolated() {
    let t = TestEngine::new().await;
    let globex = t.store.add_realm("globex").await;

    let wf_acme = t.create_workflow(two_step_workflow("cleanup")).await;
    let wf_globex = t.create_workflow_in(globex.id, two_step_workflow("cleanup")).await;

    let alice = t.add_user("alice").await;
    let bob = t.add_user_in(globex.id, "bob", &[]).await;
    t.created(&alice).await;
    t.created(&bob).await;

    assert!(t.binding(&alice, &wf_acme).await.is_some());
    assert!(t.binding(&alice, &wf_globex).await.is_none());
    assert!(t.binding(&bob, &wf_globex).await.is_some());
    assert!(t.binding(&bob, &wf_acme).await.is_none());

    t.engine.delete_workflow(t.realm.id, wf_acme.id).await.unwrap();
    assert!(t.binding(&alice, &wf_acme).await.is_none());
    assert!(t.binding(&bob, &wf_globex).await.is_some());

    t.advance(Duration::days(5));
    t.fire(&wf_globex).await;
    let sent = t.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].username, "bob");
    assert_eq!(sent[0].realm_id, globex.id);
}

#[tokio::test]
async fn test_failed_step_is_retried_without_advancing() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.notifier.fail_next(1);
    t.advance(Duration::days(5));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.failed, 1);

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 0);
    let retry_at = t0() + Duration::days(5) + EngineConfig::default().retry_delay;
    assert_eq!(binding.scheduled_at, retry_at);

    t.advance(EngineConfig::default().retry_delay);
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.failed, 0);
    assert_eq!(t.notifier.sent().len(), 1);
    assert_eq!(t.binding(&alice, &wf).await.unwrap().position, 1);
}

#[tokio::test]
async fn test_non_retryable_failure_halts_binding() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.notifier.reject_next(1);
    t.advance(Duration::days(5));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.failed, 1);

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert!(binding.terminal);
    assert_eq!(binding.position, 0);

    t.advance(Duration::days(30));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert!(t.notifier.sent().is_empty());
    assert!(t.reload(&alice).await.unwrap().enabled);
}

#[tokio::test]
async fn test_tick_binds_in_batches_by_ascending_id() {
    let t = TestEngine::new().await;
    let mut users = Vec::new();
    for name in ["ann", "ben", "cid"] {
        users.push(t.add_user(name).await);
    }
    users.sort_by_key(|u| u.id);

    let mut definition = two_step_workflow("sweep");
    definition["batchSize"] = json!(2);
    let wf = t.create_workflow(definition).await;

    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.bound, 2);
    assert!(t.binding(&users[0], &wf).await.is_some());
    assert!(t.binding(&users[1], &wf).await.is_some());
    assert!(t.binding(&users[2], &wf).await.is_none());

    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.bound, 1);
    assert!(t.binding(&users[2], &wf).await.is_some());
}

#[tokio::test]
async fn test_resource_leaving_group_is_unbound_before_step() {
    let t = TestEngine::new().await;
    t.store.add_group(t.realm.id, "/contractors").await;

    let mut definition = two_step_workflow("contractors");
    definition["conditions"] = json!([{ "type": "is-member-of", "parameter": "/contractors" }]);
    let wf = t.create_workflow(definition).await;

    let carol = t.add_user_in(t.realm.id, "carol", &["/contractors"]).await;
    let dave = t.add_user("dave").await;
    t.created(&carol).await;
    t.created(&dave).await;
    assert!(t.binding(&carol, &wf).await.is_some());
    assert!(t.binding(&dave, &wf).await.is_none());

    t.store.update_user(t.realm.id, carol.id, |u| u.groups.clear()).await;
    t.advance(Duration::days(5));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(t.binding(&carol, &wf).await.is_none());
    assert!(t.notifier.sent().is_empty());
}

#[tokio::test]
async fn test_delete_step_removes_resource_and_bindings() {
    let t = TestEngine::new().await;
    let wf = t
        .create_workflow(json!({
            "name": "purge",
            "steps": [{ "type": "delete-resource", "after": "1h" }]
        }))
        .await;
    let other = t.create_workflow(two_step_workflow("notify")).await;

    let alice = t.add_user("alice").await;
    t.created(&alice).await;
    assert!(t.binding(&alice, &other).await.is_some());

    t.advance(Duration::hours(1));
    t.fire(&wf).await;

    assert!(t.reload(&alice).await.is_none());
    assert!(t.binding(&alice, &wf).await.is_none());
    assert!(t.binding(&alice, &other).await.is_none());
}

#[tokio::test]
async fn test_immediate_first_step_runs_on_event() {
    let t = TestEngine::new().await;
    let wf = t
        .create_workflow(json!({
            "name": "welcome",
            "steps": [
                { "type": "set-attribute", "config": { "onboarding": "started" } },
                { "type": "notify", "after": "1d", "config": { "message": "welcome {{attributes.onboarding}}" } }
            ]
        }))
        .await;

    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    let reloaded = t.reload(&alice).await.unwrap();
    assert_eq!(reloaded.first_attribute("onboarding"), Some("started"));

    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 1);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(1));

    t.advance(Duration::days(1));
    t.fire(&wf).await;
    assert_eq!(t.notifier.sent()[0].message, "welcome started");
}

#[tokio::test]
async fn test_async_mode_completes_in_background() {
    let t = TestEngine::with_config(ExecutionMode::Async, EngineConfig::default()).await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(5));
    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert_eq!(report.dispatched, 1);

    t.engine.drain().await;
    assert_eq!(t.notifier.sent().len(), 1);
    assert_eq!(t.binding(&alice, &wf).await.unwrap().position, 1);
}

#[tokio::test]
async fn test_task_cancels_when_workflow_or_realm_vanish() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("gone")).await;

    WorkflowRepository::delete(t.store.as_ref(), t.realm.id, wf.id).await.unwrap();
    assert_eq!(t.fire(&wf).await, Some(TaskOutcome::Cancel));
    assert!(!t.scheduler.is_registered(&task_name(wf.id)).await);

    let wf = t.create_workflow(two_step_workflow("orphaned")).await;
    t.store.remove_realm(t.realm.id).await;
    assert_eq!(t.fire(&wf).await, Some(TaskOutcome::Cancel));
    assert!(t.scheduler.registered().await.is_empty());
}
