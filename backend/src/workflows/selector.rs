// Resource Type Selectors - Find resources a workflow should bind next

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::model::{ResourceType, Workflow};
use super::predicate::{Predicate, Relation};
use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::{Resource, UserProvider};

#[async_trait]
pub trait ResourceTypeSelector: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// Unbound resources of the workflow's realm that satisfy its conditions,
    /// ascending by id, at most `limit`
    async fn find_eligible(&self, workflow: &Workflow, limit: u32) -> WorkflowResult<Vec<Uuid>>;

    /// `None` when the resource no longer exists
    async fn resolve(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<Option<Resource>>;
}

/// Conditions of the workflow plus "not yet bound to it"
pub fn eligibility_predicate(workflow: &Workflow) -> Predicate {
    let mut clauses = vec![Predicate::negate(Predicate::exists(Relation::WorkflowBinding {
        workflow_id: workflow.id,
    }))];
    clauses.extend(workflow.conditions.iter().map(|c| c.to_predicate()));
    Predicate::And(clauses)
}

pub struct UserSelector {
    users: Arc<dyn UserProvider>,
}

impl UserSelector {
    pub fn new(users: Arc<dyn UserProvider>) -> Self {
        Self { users }
    }
}

#[async_trait]
impl ResourceTypeSelector for UserSelector {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Users
    }

    async fn find_eligible(&self, workflow: &Workflow, limit: u32) -> WorkflowResult<Vec<Uuid>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = eligibility_predicate(workflow);
        self.users.find_users(workflow.realm_id, &filter, limit).await
    }

    async fn resolve(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<Option<Resource>> {
        self.users.get_user(realm_id, resource_id).await
    }
}

#[derive(Default)]
pub struct SelectorRegistry {
    selectors: HashMap<ResourceType, Arc<dyn ResourceTypeSelector>>,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, selector: Arc<dyn ResourceTypeSelector>) {
        self.selectors.insert(selector.resource_type(), selector);
    }

    pub fn with_users(users: Arc<dyn UserProvider>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UserSelector::new(users)));
        registry
    }

    pub fn get(&self, resource_type: ResourceType) -> WorkflowResult<Arc<dyn ResourceTypeSelector>> {
        self.selectors
            .get(&resource_type)
            .cloned()
            .ok_or_else(|| WorkflowError::invalid(format!("no selector for resource type {}", resource_type)))
    }
}
