use axum::{extract::State, http::Method, http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::database;
use crate::AppState;

pub mod events;
pub mod workflows;

pub use events::event_routes;
pub use workflows::workflow_routes;

/// Admin API with every route mounted
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Steward Workflow Engine API v0.1.0" }))
        .route("/health", get(health_check))
        .nest("/api/v1/realms/:realm_id/workflows", workflow_routes())
        .nest("/api/v1/events", event_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_status = match &state.db_pool {
        Some(pool) => {
            if database::health_check(pool).await {
                "ok"
            } else {
                "unavailable"
            }
        }
        None => "not-configured",
    };

    let (status, health) = if db_status == "unavailable" {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "healthy")
    };

    (status, Json(json!({"status": health, "service": "steward", "database": db_status})))
}
