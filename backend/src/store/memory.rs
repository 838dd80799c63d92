// In-Memory Store - Process-local realms, users, workflows and bindings

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::{Realm, RealmRegistry, Resource, UserProvider};
use crate::workflows::model::Workflow;
use crate::workflows::predicate::Predicate;
use crate::workflows::repository::WorkflowRepository;
use crate::workflows::state::{BindingKey, ScheduledStep, WorkflowBinding, WorkflowStateStore};

#[derive(Default)]
struct Inner {
    realms: BTreeMap<Uuid, Realm>,
    users: BTreeMap<Uuid, Resource>,
    groups: BTreeSet<(Uuid, String)>,
    roles: BTreeSet<(Uuid, String)>,
    identity_providers: BTreeSet<(Uuid, String)>,
    workflows: BTreeMap<Uuid, Workflow>,
    bindings: BTreeMap<BindingKey, WorkflowBinding>,
}

impl Inner {
    fn user_mut(&mut self, realm_id: Uuid, user_id: Uuid) -> Option<&mut Resource> {
        self.users.get_mut(&user_id).filter(|u| u.realm_id == realm_id)
    }

    fn pending(&self, realm_id: Uuid, workflow_id: Uuid) -> impl Iterator<Item = &WorkflowBinding> {
        self.bindings
            .values()
            .filter(move |b| b.realm_id == realm_id && b.workflow_id == workflow_id && !b.terminal)
    }

    fn remove_bindings<F>(&mut self, filter: F) -> u64
    where
        F: Fn(&WorkflowBinding) -> bool,
    {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| !filter(b));
        (before - self.bindings.len()) as u64
    }
}

/// Backs every storage seam with one lock. Used in development mode and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_realm(&self, name: &str) -> Realm {
        let realm = Realm {
            id: Uuid::new_v4(),
            name: name.to_string(),
            enabled: true,
        };
        self.inner.write().await.realms.insert(realm.id, realm.clone());
        realm
    }

    /// Registers the user along with any groups, roles and providers it references
    pub async fn add_user(&self, user: Resource) {
        let mut inner = self.inner.write().await;
        for path in &user.groups {
            inner.groups.insert((user.realm_id, path.clone()));
        }
        for role in &user.roles {
            inner.roles.insert((user.realm_id, role.clone()));
        }
        for alias in &user.identity_providers {
            inner.identity_providers.insert((user.realm_id, alias.clone()));
        }
        inner.users.insert(user.id, user);
    }

    pub async fn add_group(&self, realm_id: Uuid, path: &str) {
        self.inner.write().await.groups.insert((realm_id, path.to_string()));
    }

    pub async fn add_role(&self, realm_id: Uuid, name: &str) {
        self.inner.write().await.roles.insert((realm_id, name.to_string()));
    }

    pub async fn add_identity_provider(&self, realm_id: Uuid, alias: &str) {
        self.inner.write().await.identity_providers.insert((realm_id, alias.to_string()));
    }

    /// Applies `change` to a stored user. Returns false when the user is unknown.
    pub async fn update_user<F>(&self, realm_id: Uuid, user_id: Uuid, change: F) -> bool
    where
        F: FnOnce(&mut Resource),
    {
        match self.inner.write().await.user_mut(realm_id, user_id) {
            Some(user) => {
                change(user);
                true
            }
            None => false,
        }
    }

    /// Drops the realm and its users. Workflows and bindings are left to the engine.
    pub async fn remove_realm(&self, realm_id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        inner.users.retain(|_, u| u.realm_id != realm_id);
        inner.groups.retain(|(realm, _)| *realm != realm_id);
        inner.roles.retain(|(realm, _)| *realm != realm_id);
        inner.identity_providers.retain(|(realm, _)| *realm != realm_id);
        inner.realms.remove(&realm_id).is_some()
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.read().await.bindings.len()
    }
}

#[async_trait]
impl RealmRegistry for MemoryStore {
    async fn get_realm(&self, realm_id: Uuid) -> WorkflowResult<Option<Realm>> {
        Ok(self.inner.read().await.realms.get(&realm_id).cloned())
    }

    async fn list_realms(&self) -> WorkflowResult<Vec<Realm>> {
        let mut realms: Vec<Realm> = self.inner.read().await.realms.values().cloned().collect();
        realms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(realms)
    }
}

#[async_trait]
impl UserProvider for MemoryStore {
    async fn find_users(&self, realm_id: Uuid, filter: &Predicate, limit: u32) -> WorkflowResult<Vec<Uuid>> {
        let inner = self.inner.read().await;

        Ok(inner
            .users
            .values()
            .filter(|u| u.realm_id == realm_id)
            .filter(|u| {
                let is_bound = |workflow_id: Uuid| inner.bindings.contains_key(&BindingKey::new(u.id, workflow_id));
                filter.matches(u, &is_bound)
            })
            .map(|u| u.id)
            .take(limit as usize)
            .collect())
    }

    async fn get_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<Option<Resource>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .get(&user_id)
            .filter(|u| u.realm_id == realm_id)
            .cloned())
    }

    async fn group_exists(&self, realm_id: Uuid, path: &str) -> WorkflowResult<bool> {
        Ok(self.inner.read().await.groups.contains(&(realm_id, path.to_string())))
    }

    async fn role_exists(&self, realm_id: Uuid, name: &str) -> WorkflowResult<bool> {
        Ok(self.inner.read().await.roles.contains(&(realm_id, name.to_string())))
    }

    async fn identity_provider_exists(&self, realm_id: Uuid, alias: &str) -> WorkflowResult<bool> {
        Ok(self
            .inner
            .read()
            .await
            .identity_providers
            .contains(&(realm_id, alias.to_string())))
    }

    async fn set_enabled(&self, realm_id: Uuid, user_id: Uuid, enabled: bool) -> WorkflowResult<bool> {
        Ok(self.update_user(realm_id, user_id, |u| u.enabled = enabled).await)
    }

    async fn set_attribute(&self, realm_id: Uuid, user_id: Uuid, name: &str, values: &[String]) -> WorkflowResult<bool> {
        Ok(self
            .update_user(realm_id, user_id, |u| {
                if values.is_empty() {
                    u.attributes.remove(name);
                } else {
                    u.attributes.insert(name.to_string(), values.to_vec());
                }
            })
            .await)
    }

    async fn delete_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.user_mut(realm_id, user_id).is_none() {
            return Ok(false);
        }
        inner.users.remove(&user_id);
        Ok(true)
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn create(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if inner
            .workflows
            .values()
            .any(|w| w.realm_id == workflow.realm_id && w.name == workflow.name)
        {
            return Err(WorkflowError::Conflict(format!("workflow '{}' already exists", workflow.name)));
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let mut inner = self.inner.write().await;
        if !inner
            .workflows
            .get(&workflow.id)
            .is_some_and(|w| w.realm_id == workflow.realm_id)
        {
            return Err(WorkflowError::NotFound("Workflow".to_string()));
        }
        if inner
            .workflows
            .values()
            .any(|w| w.realm_id == workflow.realm_id && w.name == workflow.name && w.id != workflow.id)
        {
            return Err(WorkflowError::Conflict(format!("workflow '{}' already exists", workflow.name)));
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn delete(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        if !inner.workflows.get(&workflow_id).is_some_and(|w| w.realm_id == realm_id) {
            return Ok(false);
        }
        inner.workflows.remove(&workflow_id);
        Ok(true)
    }

    async fn get(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Option<Workflow>> {
        Ok(self
            .inner
            .read()
            .await
            .workflows
            .get(&workflow_id)
            .filter(|w| w.realm_id == realm_id)
            .cloned())
    }

    async fn list(&self, realm_id: Uuid) -> WorkflowResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self
            .inner
            .read()
            .await
            .workflows
            .values()
            .filter(|w| w.realm_id == realm_id)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workflows)
    }

    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let removed: Vec<Uuid> = inner
            .workflows
            .values()
            .filter(|w| w.realm_id == realm_id)
            .map(|w| w.id)
            .collect();
        for id in &removed {
            inner.workflows.remove(id);
        }
        Ok(removed)
    }
}

#[async_trait]
impl WorkflowStateStore for MemoryStore {
    async fn bind(&self, binding: &WorkflowBinding) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        let key = binding.key();
        if inner.bindings.contains_key(&key) {
            return Ok(false);
        }
        inner.bindings.insert(key, binding.clone());
        Ok(true)
    }

    async fn get(&self, key: BindingKey) -> WorkflowResult<Option<WorkflowBinding>> {
        Ok(self.inner.read().await.bindings.get(&key).cloned())
    }

    async fn find_due(
        &self,
        realm_id: Uuid,
        workflow_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> WorkflowResult<Vec<ScheduledStep>> {
        let inner = self.inner.read().await;
        let mut due: Vec<ScheduledStep> = inner
            .pending(realm_id, workflow_id)
            .filter(|b| b.is_due(now))
            .map(WorkflowBinding::to_scheduled)
            .collect();
        due.sort_by(|a, b| (a.due_at, a.resource_id).cmp(&(b.due_at, b.resource_id)));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_pending(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledStep>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<ScheduledStep> = inner
            .pending(realm_id, workflow_id)
            .map(WorkflowBinding::to_scheduled)
            .collect();
        pending.sort_by(|a, b| (a.due_at, a.resource_id).cmp(&(b.due_at, b.resource_id)));
        Ok(pending)
    }

    async fn claim(
        &self,
        key: BindingKey,
        expected_position: usize,
        expected_due: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.bindings.get_mut(&key) {
            Some(binding)
                if binding.is_due(now)
                    && binding.position == expected_position
                    && binding.scheduled_at == expected_due =>
            {
                binding.scheduled_at = lease_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn advance(
        &self,
        key: BindingKey,
        from_position: usize,
        to_position: usize,
        due: DateTime<Utc>,
        terminal: bool,
    ) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.bindings.get_mut(&key) {
            Some(binding) if binding.position == from_position => {
                binding.position = to_position;
                binding.scheduled_at = due;
                binding.terminal = terminal;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(&self, key: BindingKey, due: DateTime<Utc>) -> WorkflowResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.bindings.get_mut(&key) {
            Some(binding) if !binding.terminal => {
                binding.scheduled_at = due;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: BindingKey) -> WorkflowResult<bool> {
        Ok(self.inner.write().await.bindings.remove(&key).is_some())
    }

    async fn delete_by_resource(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<u64> {
        Ok(self
            .inner
            .write()
            .await
            .remove_bindings(|b| b.realm_id == realm_id && b.resource_id == resource_id))
    }

    async fn delete_by_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<u64> {
        Ok(self
            .inner
            .write()
            .await
            .remove_bindings(|b| b.realm_id == realm_id && b.workflow_id == workflow_id))
    }

    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<u64> {
        Ok(self.inner.write().await.remove_bindings(|b| b.realm_id == realm_id))
    }
}
