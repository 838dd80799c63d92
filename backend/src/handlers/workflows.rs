use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use steward_shared::{ScheduledStepRepresentation, TickReportRepresentation, WorkflowRepresentation};

use crate::error::{ApiResult, AppError, ValidationBuilder};
use crate::AppState;

pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/:id", get(get_workflow).put(update_workflow).delete(delete_workflow))
        .route("/:id/scheduled", get(list_scheduled))
        .route("/:id/run", post(run_workflow))
        .route("/:id/bindings/:resource_id", delete(cancel_binding))
}

// Shape checks the engine would also catch, reported per field
fn check_request(rep: &WorkflowRepresentation) -> ApiResult<()> {
    let error = ValidationBuilder::new()
        .error_if(rep.name.trim().is_empty(), "name", "Name is required")
        .error_if(rep.steps.is_empty(), "steps", "At least one step is required")
        .error_if(rep.batch_size == Some(0), "batchSize", "Batch size must be at least 1")
        .build();

    match error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Path(realm_id): Path<Uuid>,
) -> ApiResult<Json<Vec<WorkflowRepresentation>>> {
    let workflows = state.engine.list_workflows(realm_id).await?;
    Ok(Json(workflows.iter().map(|w| w.to_representation()).collect()))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Path(realm_id): Path<Uuid>,
    Json(payload): Json<WorkflowRepresentation>,
) -> ApiResult<(StatusCode, Json<WorkflowRepresentation>)> {
    check_request(&payload)?;
    let workflow = state.engine.create_workflow(realm_id, &payload).await?;
    Ok((StatusCode::CREATED, Json(workflow.to_representation())))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<WorkflowRepresentation>> {
    let workflow = state.engine.get_workflow(realm_id, id).await?;
    Ok(Json(workflow.to_representation()))
}

async fn update_workflow(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<WorkflowRepresentation>,
) -> ApiResult<Json<WorkflowRepresentation>> {
    check_request(&payload)?;
    let workflow = state.engine.update_workflow(realm_id, id, &payload).await?;
    Ok(Json(workflow.to_representation()))
}

async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    state.engine.delete_workflow(realm_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_scheduled(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<ScheduledStepRepresentation>>> {
    Ok(Json(state.engine.list_scheduled(realm_id, id).await?))
}

async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<TickReportRepresentation>> {
    let report = state.engine.run_now(realm_id, id).await?;
    Ok(Json(report.to_representation()))
}

async fn cancel_binding(
    State(state): State<Arc<AppState>>,
    Path((realm_id, id, resource_id)): Path<(Uuid, Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    if state.engine.cancel_binding(realm_id, resource_id, id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound("Binding".to_string()))
    }
}
