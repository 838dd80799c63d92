// Identity Collaborators - Realm registry and user store seams used by the engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::workflows::model::ResourceType;
use crate::workflows::predicate::Predicate;

#[derive(Debug, Clone, PartialEq)]
pub struct Realm {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
}

/// A user account as the engine sees it
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub resource_type: ResourceType,
    pub username: String,
    pub email: Option<String>,
    pub enabled: bool,
    pub attributes: HashMap<String, Vec<String>>,
    /// Full group paths, e.g. `/staff/contractors`
    pub groups: Vec<String>,
    pub roles: Vec<String>,
    /// Aliases of linked identity providers
    pub identity_providers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn first_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RealmRegistry: Send + Sync {
    async fn get_realm(&self, realm_id: Uuid) -> WorkflowResult<Option<Realm>>;
    async fn list_realms(&self) -> WorkflowResult<Vec<Realm>>;
}

/// User store. Mutations return `false` when the user no longer exists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Ids of users in the realm matching `filter`, ascending, at most `limit`
    async fn find_users(&self, realm_id: Uuid, filter: &Predicate, limit: u32) -> WorkflowResult<Vec<Uuid>>;
    async fn get_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<Option<Resource>>;

    async fn group_exists(&self, realm_id: Uuid, path: &str) -> WorkflowResult<bool>;
    async fn role_exists(&self, realm_id: Uuid, name: &str) -> WorkflowResult<bool>;
    async fn identity_provider_exists(&self, realm_id: Uuid, alias: &str) -> WorkflowResult<bool>;

    async fn set_enabled(&self, realm_id: Uuid, user_id: Uuid, enabled: bool) -> WorkflowResult<bool>;
    /// Replaces all values of the attribute
    async fn set_attribute(&self, realm_id: Uuid, user_id: Uuid, name: &str, values: &[String]) -> WorkflowResult<bool>;
    async fn delete_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<bool>;
}
