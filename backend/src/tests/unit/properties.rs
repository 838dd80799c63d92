// Engine guarantees checked across store, selector and step registry

use chrono::Duration;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::jobs::{task_name, TaskScheduler};
use crate::services::identity::UserProvider;
use crate::tests::fixtures::{t0, two_step_workflow, TestEngine};
use crate::workflows::steps::{StepContext, StepOutcome};
use crate::workflows::{
    BindingKey, Clock, ResourceEvent, ResourceType, StepAction, StepRegistry, WorkflowStateStore,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_due_binding_is_claimed_once() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(5));
    let now = t.clock.now();
    let key = BindingKey::new(alice.id, wf.id);
    let due = t.binding(&alice, &wf).await.unwrap().scheduled_at;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = t.store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(key, 0, due, now, now + Duration::minutes(10)).await.unwrap()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        t.binding(&alice, &wf).await.unwrap().scheduled_at,
        now + Duration::minutes(10)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ticks_run_a_step_once() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    for name in ["ann", "ben", "cid", "dan"] {
        let user = t.add_user(name).await;
        t.created(&user).await;
    }

    t.advance(Duration::days(5));
    let (first, second) = tokio::join!(
        t.engine.run_now(t.realm.id, wf.id),
        t.engine.run_now(t.realm.id, wf.id)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.claimed + second.claimed, 4);
    assert_eq!(t.notifier.sent().len(), 4);

    let recipients: BTreeSet<String> = t.notifier.sent().into_iter().map(|n| n.username).collect();
    assert_eq!(recipients.len(), 4);
}

fn back_to_back_workflow() -> serde_json::Value {
    json!({
        "name": "back-to-back",
        "steps": [
            { "type": "notify", "after": "1d", "config": { "message": "first" } },
            { "type": "notify", "after": "0", "config": { "message": "second" } }
        ]
    })
}

#[tokio::test]
async fn test_stale_due_snapshot_cannot_reclaim_advanced_binding() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(back_to_back_workflow()).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(1));
    let now = t.clock.now();
    let stale = t.store.find_due(t.realm.id, wf.id, now, 10).await.unwrap();
    assert_eq!(stale.len(), 1);

    t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 1);
    // zero delay keeps the same due time
    assert_eq!(binding.scheduled_at, stale[0].due_at);

    let claimed = t
        .store
        .claim(stale[0].key(), stale[0].position, stale[0].due_at, now, now + Duration::minutes(10))
        .await
        .unwrap();
    assert!(!claimed);
    assert_eq!(t.binding(&alice, &wf).await.unwrap().scheduled_at, stale[0].due_at);

    t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    let messages: Vec<String> = t.notifier.sent().into_iter().map(|n| n.message).collect();
    assert_eq!(messages, vec!["first".to_string(), "second".to_string()]);
    assert!(t.binding(&alice, &wf).await.unwrap().terminal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ticks_with_zero_delay_step_run_each_step_once() {
    for _ in 0..25 {
        let t = TestEngine::new().await;
        let wf = t.create_workflow(back_to_back_workflow()).await;
        let mut users = Vec::new();
        for i in 0..8 {
            let user = t.add_user(&format!("user{}", i)).await;
            t.created(&user).await;
            users.push(user);
        }

        t.advance(Duration::days(1));
        let (first, second) = tokio::join!(
            t.engine.run_now(t.realm.id, wf.id),
            t.engine.run_now(t.realm.id, wf.id)
        );
        first.unwrap();
        second.unwrap();
        // drain whatever the racing ticks left due
        t.engine.run_now(t.realm.id, wf.id).await.unwrap();

        let mut counts: HashMap<(String, String), usize> = HashMap::new();
        for n in t.notifier.sent() {
            *counts.entry((n.username, n.message)).or_default() += 1;
        }
        for user in &users {
            for message in ["first", "second"] {
                assert_eq!(counts.get(&(user.username.clone(), message.to_string())), Some(&1));
            }
            assert!(t.binding(user, &wf).await.unwrap().terminal);
        }
    }
}

#[tokio::test]
async fn test_side_effect_steps_are_idempotent() {
    let t = TestEngine::new().await;
    let alice = t.add_user("alice").await;
    let registry = StepRegistry::new(t.store.clone(), t.notifier.clone());
    let ctx = StepContext {
        realm_id: t.realm.id,
        workflow_id: Uuid::new_v4(),
        workflow_name: "cleanup".to_string(),
        position: 0,
    };

    let config: BTreeMap<String, serde_json::Value> =
        BTreeMap::from([("status".to_string(), json!(["inactive", "{{username}}"]))]);
    let set_status = StepAction::from_config("set-attribute", &config).unwrap();

    for _ in 0..2 {
        let current = t.reload(&alice).await.unwrap();
        assert_eq!(registry.execute(&set_status, &ctx, &current).await.unwrap(), StepOutcome::Continue);
        assert_eq!(
            registry.execute(&StepAction::DisableResource, &ctx, &current).await.unwrap(),
            StepOutcome::Continue
        );
    }

    let reloaded = t.reload(&alice).await.unwrap();
    assert!(!reloaded.enabled);
    assert_eq!(reloaded.attributes["status"], vec!["inactive", "alice"]);
}

#[tokio::test]
async fn test_disabled_workflow_binds_nothing() {
    let t = TestEngine::new().await;
    let mut definition = two_step_workflow("dormant");
    definition["enabled"] = json!(false);
    let wf = t.create_workflow(definition).await;
    assert!(!t.scheduler.is_registered(&task_name(wf.id)).await);

    let alice = t.add_user("alice").await;
    t.created(&alice).await;
    assert!(!t.engine.bind(&wf, alice.id).await.unwrap());

    let report = t.engine.run_now(t.realm.id, wf.id).await.unwrap();
    assert!(report.paused);
    assert_eq!(report.bound, 0);
    assert_eq!(t.store.binding_count().await, 0);
}

#[tokio::test]
async fn test_selection_agrees_with_evaluation() {
    let t = TestEngine::new().await;
    t.store.add_group(t.realm.id, "/staff").await;
    t.store.add_role(t.realm.id, "admin").await;
    t.store.add_identity_provider(t.realm.id, "github").await;

    let shapes: [(&[&str], &[&str], &[&str], Option<&str>); 6] = [
        (&["/staff"], &["admin"], &[], Some("sales")),
        (&["/staff"], &[], &["github"], Some("sales")),
        (&[], &["admin"], &["github"], None),
        (&["/staff/contractors"], &[], &[], Some("ops")),
        (&[], &[], &[], Some("sales")),
        (&["/staff"], &["admin"], &["github"], Some("ops")),
    ];
    let mut users = Vec::new();
    for (i, (groups, roles, providers, department)) in shapes.iter().enumerate() {
        let mut user = t.add_user_in(t.realm.id, &format!("user{}", i), groups).await;
        t.store
            .update_user(t.realm.id, user.id, |u| {
                u.roles = roles.iter().map(|r| r.to_string()).collect();
                u.identity_providers = providers.iter().map(|p| p.to_string()).collect();
                if let Some(dept) = department {
                    u.attributes = HashMap::from([("department".to_string(), vec![dept.to_string()])]);
                }
            })
            .await;
        user = t.reload(&user).await.unwrap();
        users.push(user);
    }

    let condition_sets = [
        json!([{ "type": "is-member-of", "parameter": "/staff" }]),
        json!([
            { "type": "has-role", "parameter": "admin" },
            { "type": "has-user-attribute", "parameter": "department:sales" }
        ]),
        json!([{
            "type": "expression",
            "parameter": "has-identity-provider-link(github) OR NOT is-member-of(/staff)"
        }]),
        json!([{
            "type": "expression",
            "parameter": "(has-role(admin) AND NOT has-user-attribute('department:ops')) OR is-member-of(/staff)"
        }]),
    ];

    for (i, conditions) in condition_sets.into_iter().enumerate() {
        let mut definition = two_step_workflow(&format!("filter{}", i));
        definition["conditions"] = conditions;
        let wf = t.create_workflow(definition).await;

        let selected: BTreeSet<Uuid> = t
            .store
            .find_users(t.realm.id, &wf.predicate(), 100)
            .await
            .unwrap()
            .into_iter()
            .collect();
        let evaluated: BTreeSet<Uuid> = users.iter().filter(|u| wf.matches(u)).map(|u| u.id).collect();

        assert_eq!(selected, evaluated, "conditions of {} disagree", wf.name);
    }
}

#[tokio::test]
async fn test_removals_cascade_to_bindings_and_tasks() {
    let t = TestEngine::new().await;
    let first = t.create_workflow(two_step_workflow("first")).await;
    let second = t.create_workflow(two_step_workflow("second")).await;

    let alice = t.add_user("alice").await;
    let bob = t.add_user("bob").await;
    t.created(&alice).await;
    t.created(&bob).await;
    assert_eq!(t.store.binding_count().await, 4);

    t.engine
        .handle_event(ResourceEvent::ResourceRemoved {
            realm_id: t.realm.id,
            resource_type: ResourceType::Users,
            resource_id: alice.id,
        })
        .await
        .unwrap();
    assert!(t.binding(&alice, &first).await.is_none());
    assert!(t.binding(&alice, &second).await.is_none());
    assert_eq!(t.store.binding_count().await, 2);

    t.engine.delete_workflow(t.realm.id, first.id).await.unwrap();
    assert!(!t.scheduler.is_registered(&task_name(first.id)).await);
    assert!(t.binding(&bob, &first).await.is_none());
    assert!(t.binding(&bob, &second).await.is_some());

    t.engine
        .handle_event(ResourceEvent::RealmRemoved { realm_id: t.realm.id })
        .await
        .unwrap();
    assert!(t.scheduler.registered().await.is_empty());
    assert_eq!(t.store.binding_count().await, 0);
    assert!(t.engine.find_workflow(t.realm.id, second.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_workflow_keeps_other_workflows_and_definition() {
    let t = TestEngine::new().await;
    let first = t.create_workflow(two_step_workflow("first")).await;
    let second = t.create_workflow(two_step_workflow("second")).await;
    let alice = t.add_user("alice").await;
    let bob = t.add_user("bob").await;
    t.created(&alice).await;
    t.created(&bob).await;

    let removed = t.engine.cancel_workflow(t.realm.id, first.id).await.unwrap();
    assert_eq!(removed, 2);
    assert!(t.binding(&alice, &first).await.is_none());
    assert!(t.binding(&bob, &first).await.is_none());
    assert!(t.binding(&alice, &second).await.is_some());
    assert!(t.binding(&bob, &second).await.is_some());

    assert!(t.engine.find_workflow(t.realm.id, first.id).await.unwrap().is_some());
    assert!(t.scheduler.is_registered(&task_name(first.id)).await);

    // another realm's id matches nothing
    let globex = t.store.add_realm("globex").await;
    assert_eq!(t.engine.cancel_workflow(globex.id, second.id).await.unwrap(), 0);
    assert!(t.binding(&alice, &second).await.is_some());
}

#[tokio::test]
async fn test_cancel_binding_is_scoped_to_its_realm() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    let bob = t.add_user("bob").await;
    t.created(&alice).await;
    t.created(&bob).await;

    let globex = t.store.add_realm("globex").await;
    assert!(!t.engine.cancel_binding(globex.id, alice.id, wf.id).await.unwrap());
    assert!(t.binding(&alice, &wf).await.is_some());

    assert!(t.engine.cancel_binding(t.realm.id, alice.id, wf.id).await.unwrap());
    assert!(t.binding(&alice, &wf).await.is_none());
    assert!(t.binding(&bob, &wf).await.is_some());
    assert!(!t.engine.cancel_binding(t.realm.id, alice.id, wf.id).await.unwrap());

    let reloaded = t.reload(&alice).await.unwrap();
    assert!(reloaded.enabled);
    assert_eq!(reloaded.username, "alice");
}

#[tokio::test]
async fn test_manual_restart_targets_step_delay() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    t.advance(Duration::days(5));
    t.fire(&wf).await;
    assert_eq!(t.binding(&alice, &wf).await.unwrap().position, 1);

    t.advance(Duration::hours(1));
    t.engine.restart(t.realm.id, alice.id, wf.id, 0).await.unwrap();
    let binding = t.binding(&alice, &wf).await.unwrap();
    assert_eq!(binding.position, 0);
    assert_eq!(binding.scheduled_at, t0() + Duration::days(10) + Duration::hours(1));

    assert!(t.engine.restart(t.realm.id, alice.id, wf.id, 5).await.is_err());
    assert!(t.engine.restart(t.realm.id, Uuid::new_v4(), wf.id, 0).await.is_err());
}
