use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use std::sync::Arc;

use steward_shared::ResourceEventRepresentation;

use crate::error::{ApiResult, AppError};
use crate::workflows::ResourceEvent;
use crate::AppState;

pub fn event_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(publish_event))
        .route("/queue", post(enqueue_event))
}

/// Applies a lifecycle event synchronously, so bindings exist when this returns
async fn publish_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResourceEventRepresentation>,
) -> ApiResult<StatusCode> {
    let event = ResourceEvent::from_representation(&payload)?;
    state.engine.handle_event(event).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Hands the event to the engine's event loop and returns without waiting for it
async fn enqueue_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ResourceEventRepresentation>,
) -> ApiResult<StatusCode> {
    let event = ResourceEvent::from_representation(&payload)?;
    let publisher = state
        .events
        .as_ref()
        .ok_or_else(|| AppError::InternalError("event loop is not running".to_string()))?;
    publisher.publish(event).await?;
    Ok(StatusCode::ACCEPTED)
}
