// Workflow Task - Recurring job that ticks one workflow

use futures::FutureExt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{ScheduledTask, TaskOutcome};
use crate::workflows::engine::WorkflowEngine;

pub fn task_name(workflow_id: Uuid) -> String {
    format!("workflow-{}", workflow_id)
}

/// Builds the task the scheduler runs for a workflow. It cancels itself once
/// the engine, realm or workflow is gone; transient errors keep it registered.
pub fn workflow_task(engine: Weak<WorkflowEngine>, realm_id: Uuid, workflow_id: Uuid) -> ScheduledTask {
    Arc::new(move || {
        let engine = engine.clone();
        async move {
            let Some(engine) = engine.upgrade() else {
                debug!("Engine dropped; cancelling task for workflow {}", workflow_id);
                return TaskOutcome::Cancel;
            };
            run(&engine, realm_id, workflow_id).await
        }
        .boxed()
    })
}

async fn run(engine: &WorkflowEngine, realm_id: Uuid, workflow_id: Uuid) -> TaskOutcome {
    match engine.find_realm(realm_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            error!("Realm {} not found; cancelling task for workflow {}", realm_id, workflow_id);
            return TaskOutcome::Cancel;
        }
        Err(e) => {
            warn!("Could not look up realm {}: {}", realm_id, e);
            return TaskOutcome::Continue;
        }
    }

    let workflow = match engine.find_workflow(realm_id, workflow_id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => {
            info!("Workflow {} was removed; cancelling its task", workflow_id);
            return TaskOutcome::Cancel;
        }
        Err(e) => {
            warn!("Could not load workflow {}: {}", workflow_id, e);
            return TaskOutcome::Continue;
        }
    };

    match engine.tick(&workflow).await {
        Ok(report) if report.paused => debug!("Workflow {} is paused", workflow_id),
        Ok(report) => info!(
            "Workflow {} tick: bound {}, claimed {}, dispatched {}, skipped {}, failed {}",
            workflow_id, report.bound, report.claimed, report.dispatched, report.skipped, report.failed
        ),
        Err(e) => error!("Tick of workflow {} in realm {} failed: {}", workflow_id, realm_id, e),
    }
    TaskOutcome::Continue
}
