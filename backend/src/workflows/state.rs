// Workflow State - Per-resource progress records and the due-step index

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use steward_shared::ScheduledStepRepresentation;

use super::model::{ResourceType, Workflow};
use crate::error::WorkflowResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub resource_id: Uuid,
    pub workflow_id: Uuid,
}

impl BindingKey {
    pub fn new(resource_id: Uuid, workflow_id: Uuid) -> Self {
        Self { resource_id, workflow_id }
    }
}

/// One resource's progress through one workflow. Existence means "already bound".
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowBinding {
    pub resource_id: Uuid,
    pub workflow_id: Uuid,
    pub realm_id: Uuid,
    pub resource_type: ResourceType,
    /// Position of the next step to run
    pub position: usize,
    pub scheduled_at: DateTime<Utc>,
    pub bound_at: DateTime<Utc>,
    pub terminal: bool,
}

impl WorkflowBinding {
    /// Fresh binding at position 0
    pub fn new(resource_id: Uuid, workflow: &Workflow, scheduled_at: DateTime<Utc>, bound_at: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            workflow_id: workflow.id,
            realm_id: workflow.realm_id,
            resource_type: workflow.resource_type,
            position: 0,
            scheduled_at,
            bound_at,
            terminal: false,
        }
    }

    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.resource_id, self.workflow_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.terminal && self.scheduled_at <= now
    }

    pub fn to_scheduled(&self) -> ScheduledStep {
        ScheduledStep {
            resource_id: self.resource_id,
            workflow_id: self.workflow_id,
            realm_id: self.realm_id,
            position: self.position,
            due_at: self.scheduled_at,
        }
    }
}

/// Read projection over non-terminal bindings
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledStep {
    pub resource_id: Uuid,
    pub workflow_id: Uuid,
    pub realm_id: Uuid,
    pub position: usize,
    pub due_at: DateTime<Utc>,
}

impl ScheduledStep {
    pub fn key(&self) -> BindingKey {
        BindingKey::new(self.resource_id, self.workflow_id)
    }

    pub fn to_representation(&self, step_type: &str) -> ScheduledStepRepresentation {
        ScheduledStepRepresentation {
            resource_id: self.resource_id,
            workflow_id: self.workflow_id,
            step_position: self.position as u32,
            step_type: step_type.to_string(),
            due_at: self.due_at,
        }
    }
}

#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Inserts unless a binding for the same key exists. Returns whether it was created.
    async fn bind(&self, binding: &WorkflowBinding) -> WorkflowResult<bool>;

    async fn get(&self, key: BindingKey) -> WorkflowResult<Option<WorkflowBinding>>;

    /// Non-terminal bindings of the workflow with `due_at <= now`, earliest first
    async fn find_due(
        &self,
        realm_id: Uuid,
        workflow_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> WorkflowResult<Vec<ScheduledStep>>;

    /// All non-terminal bindings of the workflow regardless of due time
    async fn list_pending(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledStep>>;

    /// Compare-and-set: succeeds only if the binding is still at
    /// `expected_position` and scheduled at `expected_due`, that time has
    /// passed, and it is not terminal. Moves the due time to `lease_until`.
    async fn claim(
        &self,
        key: BindingKey,
        expected_position: usize,
        expected_due: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> WorkflowResult<bool>;

    /// Moves the binding from `from_position` to `to_position`; no-op if the
    /// position changed underneath.
    async fn advance(
        &self,
        key: BindingKey,
        from_position: usize,
        to_position: usize,
        due: DateTime<Utc>,
        terminal: bool,
    ) -> WorkflowResult<bool>;

    /// Sets the due time, keeping the position
    async fn reschedule(&self, key: BindingKey, due: DateTime<Utc>) -> WorkflowResult<bool>;

    async fn delete(&self, key: BindingKey) -> WorkflowResult<bool>;
    async fn delete_by_resource(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<u64>;
    async fn delete_by_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<u64>;
    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<u64>;
}
