// Workflow Repository - Durable storage of workflow definitions per realm

use async_trait::async_trait;
use uuid::Uuid;

use super::model::Workflow;
use crate::error::WorkflowResult;

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Fails with `Conflict` when the realm already has a workflow with this name
    async fn create(&self, workflow: &Workflow) -> WorkflowResult<()>;
    /// Fails with `NotFound` for unknown ids and `Conflict` on a name clash
    async fn update(&self, workflow: &Workflow) -> WorkflowResult<()>;
    async fn delete(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<bool>;
    async fn get(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Option<Workflow>>;
    /// Ordered by name
    async fn list(&self, realm_id: Uuid) -> WorkflowResult<Vec<Workflow>>;
    /// Returns the ids removed
    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<Vec<Uuid>>;
}
