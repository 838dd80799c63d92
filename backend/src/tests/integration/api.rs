// Admin API round trips through the router

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Duration;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use crate::handlers::router;
use crate::tests::fixtures::{two_step_workflow, TestEngine};
use crate::workflows::event_channel;
use crate::AppState;

fn app(t: &TestEngine) -> Router {
    router(Arc::new(AppState {
        engine: t.engine.clone(),
        db_pool: None,
        events: None,
    }))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_workflow_crud() {
    let t = TestEngine::new().await;
    let app = app(&t);
    let base = format!("/api/v1/realms/{}/workflows", t.realm.id);

    let (status, created) = send(&app, Method::POST, &base, Some(two_step_workflow("offboarding"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["name"], "offboarding");
    assert_eq!(created["steps"][0]["after"], "5d");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = send(&app, Method::GET, &base, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, fetched) = send(&app, Method::GET, &format!("{}/{}", base, id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["on"], "resource-created");

    let mut changed = two_step_workflow("offboarding");
    changed["enabled"] = json!(false);
    let (status, updated) = send(&app, Method::PUT, &format!("{}/{}", base, id), Some(changed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["enabled"], false);

    let (status, _) = send(&app, Method::DELETE, &format!("{}/{}", base, id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &format!("{}/{}", base, id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_invalid_definitions_rejected() {
    let t = TestEngine::new().await;
    let app = app(&t);
    let base = format!("/api/v1/realms/{}/workflows", t.realm.id);

    let (status, body) = send(&app, Method::POST, &base, Some(json!({ "name": "empty", "steps": [] }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["steps"].is_array());

    let (status, body) = send(
        &app,
        Method::POST,
        &base,
        Some(json!({ "name": "rocket", "steps": [{ "type": "launch-rocket" }] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("launch-rocket"));

    let (status, _) = send(&app, Method::POST, &base, Some(two_step_workflow("twice"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, Method::POST, &base, Some(two_step_workflow("twice"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let unknown_realm = format!("/api/v1/realms/{}/workflows", Uuid::new_v4());
    let (status, _) = send(&app, Method::POST, &unknown_realm, Some(two_step_workflow("lost"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_events_scheduled_and_run() {
    let t = TestEngine::new().await;
    let app = app(&t);
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/events",
        Some(json!({ "type": "resource-created", "realmId": t.realm.id, "resourceId": alice.id })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let workflow_uri = format!("/api/v1/realms/{}/workflows/{}", t.realm.id, wf.id);
    let (status, scheduled) = send(&app, Method::GET, &format!("{}/scheduled", workflow_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(scheduled[0]["resourceId"], alice.id.to_string());
    assert_eq!(scheduled[0]["stepPosition"], 0);
    assert_eq!(scheduled[0]["stepType"], "notify");

    t.advance(Duration::days(5));
    let (status, report) = send(&app, Method::POST, &format!("{}/run", workflow_uri), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["claimed"], 1);
    assert_eq!(report["failed"], 0);
    assert_eq!(t.notifier.sent().len(), 1);

    let (status, _) = send(
        &app,
        Method::POST,
        "/api/v1/events",
        Some(json!({ "type": "resource-created", "realmId": t.realm.id, "resourceType": "groups", "resourceId": alice.id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_queued_events_reach_the_event_loop() {
    let t = TestEngine::new().await;
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    let event = json!({ "type": "resource-created", "realmId": t.realm.id, "resourceId": alice.id });

    let (status, _) = send(&app(&t), Method::POST, "/api/v1/events/queue", Some(event.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (publisher, events) = event_channel(8);
    t.engine.start(events).await.unwrap();
    let queued = router(Arc::new(AppState {
        engine: t.engine.clone(),
        db_pool: None,
        events: Some(publisher),
    }));

    let (status, _) = send(&queued, Method::POST, "/api/v1/events/queue", Some(event)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let mut bound = false;
    for _ in 0..100 {
        if t.binding(&alice, &wf).await.is_some() {
            bound = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(bound);
    t.engine.stop().await;
}

#[tokio::test]
async fn test_cancel_binding_route() {
    let t = TestEngine::new().await;
    let app = app(&t);
    let wf = t.create_workflow(two_step_workflow("offboarding")).await;
    let alice = t.add_user("alice").await;
    t.created(&alice).await;

    let uri = format!("/api/v1/realms/{}/workflows/{}/bindings/{}", t.realm.id, wf.id, alice.id);
    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(t.binding(&alice, &wf).await.is_none());
    assert!(t.reload(&alice).await.is_some());

    let (status, body) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_health_without_database() {
    let t = TestEngine::new().await;
    let (status, body) = send(&app(&t), Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "not-configured");
}
