// PostgreSQL Store - sqlx-backed realms, users, workflows and bindings

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use steward_shared::{
    ConditionRepresentation, RealmRecord, StepRepresentation, UserRecord, WorkflowRecord, WorkflowRepresentation,
    WorkflowStateRecord,
};

use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::{Realm, RealmRegistry, Resource, UserProvider};
use crate::workflows::model::{ResourceType, Workflow};
use crate::workflows::predicate::Predicate;
use crate::workflows::repository::WorkflowRepository;
use crate::workflows::state::{BindingKey, ScheduledStep, WorkflowBinding, WorkflowStateStore};

const STATE_COLUMNS: &str =
    "resource_id, workflow_id, realm_id, resource_type, step_position, scheduled_at, bound_at, terminal";

const WORKFLOW_COLUMNS: &str = "id, realm_id, name, enabled, trigger_event, resource_type, steps, conditions, \
     batch_size, created_at, updated_at";

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_position(position: usize) -> WorkflowResult<i32> {
    i32::try_from(position).map_err(|_| WorkflowError::invalid(format!("step position {} is too large", position)))
}

fn binding_from_record(record: WorkflowStateRecord) -> WorkflowResult<WorkflowBinding> {
    Ok(WorkflowBinding {
        resource_id: record.resource_id,
        workflow_id: record.workflow_id,
        realm_id: record.realm_id,
        resource_type: record.resource_type.parse()?,
        position: usize::try_from(record.step_position)
            .map_err(|_| WorkflowError::invalid(format!("negative step position {}", record.step_position)))?,
        scheduled_at: record.scheduled_at,
        bound_at: record.bound_at,
        terminal: record.terminal,
    })
}

/// Stored definitions are re-validated on load, like any other input
fn workflow_from_record(record: WorkflowRecord) -> WorkflowResult<Workflow> {
    let corrupt = |e: serde_json::Error| WorkflowError::invalid(format!("stored workflow {} is corrupt: {}", record.id, e));

    let steps: Vec<StepRepresentation> = serde_json::from_value(record.steps.clone()).map_err(corrupt)?;
    let conditions: Vec<ConditionRepresentation> = serde_json::from_value(record.conditions.clone()).map_err(corrupt)?;
    let rep = WorkflowRepresentation {
        id: Some(record.id),
        name: record.name.clone(),
        enabled: record.enabled,
        on: record.trigger_event.clone(),
        resource_type: record.resource_type.clone(),
        steps,
        conditions,
        batch_size: u32::try_from(record.batch_size).ok(),
    };

    let mut workflow = Workflow::from_representation(record.realm_id, record.id, &rep, record.created_at)?;
    workflow.updated_at = record.updated_at;
    Ok(workflow)
}

struct WorkflowColumns {
    steps: serde_json::Value,
    conditions: serde_json::Value,
    batch_size: i32,
}

fn workflow_columns(workflow: &Workflow) -> WorkflowResult<WorkflowColumns> {
    let rep = workflow.to_representation();
    let encode = |e: serde_json::Error| WorkflowError::invalid(format!("cannot encode workflow: {}", e));

    Ok(WorkflowColumns {
        steps: serde_json::to_value(&rep.steps).map_err(encode)?,
        conditions: serde_json::to_value(&rep.conditions).map_err(encode)?,
        batch_size: i32::try_from(workflow.batch_size)
            .map_err(|_| WorkflowError::invalid("batchSize is too large"))?,
    })
}

fn map_conflict(error: sqlx::Error, name: &str) -> WorkflowError {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            WorkflowError::Conflict(format!("workflow '{}' already exists", name))
        }
        other => WorkflowError::Database(other),
    }
}

#[async_trait]
impl RealmRegistry for PostgresStore {
    async fn get_realm(&self, realm_id: Uuid) -> WorkflowResult<Option<Realm>> {
        let record = sqlx::query_as::<_, RealmRecord>("SELECT id, name, enabled FROM realms WHERE id = $1")
            .bind(realm_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record.map(|r| Realm {
            id: r.id,
            name: r.name,
            enabled: r.enabled,
        }))
    }

    async fn list_realms(&self) -> WorkflowResult<Vec<Realm>> {
        let records = sqlx::query_as::<_, RealmRecord>("SELECT id, name, enabled FROM realms ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(records
            .into_iter()
            .map(|r| Realm {
                id: r.id,
                name: r.name,
                enabled: r.enabled,
            })
            .collect())
    }
}

#[async_trait]
impl UserProvider for PostgresStore {
    async fn find_users(&self, realm_id: Uuid, filter: &Predicate, limit: u32) -> WorkflowResult<Vec<Uuid>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT u.id FROM users u WHERE u.realm_id = ");
        qb.push_bind(realm_id);
        qb.push(" AND (");
        filter.push_sql(&mut qb);
        qb.push(") ORDER BY u.id LIMIT ");
        qb.push_bind(i64::from(limit));

        let ids = qb.build_query_scalar::<Uuid>().fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn get_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<Option<Resource>> {
        let Some(user) = sqlx::query_as::<_, UserRecord>(
            "SELECT id, realm_id, username, email, enabled, created_at FROM users WHERE realm_id = $1 AND id = $2",
        )
        .bind(realm_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let attribute_rows = sqlx::query_as::<_, (String, String)>(
            "SELECT name, value FROM user_attributes WHERE user_id = $1 ORDER BY name, position",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in attribute_rows {
            attributes.entry(name).or_default().push(value);
        }

        let groups = sqlx::query_scalar::<_, String>(
            "SELECT g.path FROM user_group_memberships m \
             JOIN realm_groups g ON g.id = m.group_id \
             WHERE m.user_id = $1 ORDER BY g.path",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let roles = sqlx::query_scalar::<_, String>(
            "SELECT r.name FROM user_role_mappings m \
             JOIN realm_roles r ON r.id = m.role_id \
             WHERE m.user_id = $1 ORDER BY r.name",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let identity_providers = sqlx::query_scalar::<_, String>(
            "SELECT identity_provider_alias FROM federated_identities \
             WHERE user_id = $1 ORDER BY identity_provider_alias",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Resource {
            id: user.id,
            realm_id: user.realm_id,
            resource_type: ResourceType::Users,
            username: user.username,
            email: user.email,
            enabled: user.enabled,
            attributes,
            groups,
            roles,
            identity_providers,
            created_at: user.created_at,
        }))
    }

    async fn group_exists(&self, realm_id: Uuid, path: &str) -> WorkflowResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM realm_groups WHERE realm_id = $1 AND path = $2)",
        )
        .bind(realm_id)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn role_exists(&self, realm_id: Uuid, name: &str) -> WorkflowResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM realm_roles WHERE realm_id = $1 AND name = $2)",
        )
        .bind(realm_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn identity_provider_exists(&self, realm_id: Uuid, alias: &str) -> WorkflowResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM identity_providers WHERE realm_id = $1 AND alias = $2)",
        )
        .bind(realm_id)
        .bind(alias)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn set_enabled(&self, realm_id: Uuid, user_id: Uuid, enabled: bool) -> WorkflowResult<bool> {
        let result = sqlx::query("UPDATE users SET enabled = $3 WHERE realm_id = $1 AND id = $2")
            .bind(realm_id)
            .bind(user_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_attribute(&self, realm_id: Uuid, user_id: Uuid, name: &str, values: &[String]) -> WorkflowResult<bool> {
        let mut tx = self.pool.begin().await?;

        let locked = sqlx::query_scalar::<_, Uuid>("SELECT id FROM users WHERE realm_id = $1 AND id = $2 FOR UPDATE")
            .bind(realm_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Ok(false);
        }

        sqlx::query("DELETE FROM user_attributes WHERE user_id = $1 AND name = $2")
            .bind(user_id)
            .bind(name)
            .execute(&mut *tx)
            .await?;

        for (position, value) in values.iter().enumerate() {
            sqlx::query("INSERT INTO user_attributes (user_id, name, position, value) VALUES ($1, $2, $3, $4)")
                .bind(user_id)
                .bind(name)
                .bind(db_position(position)?)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_user(&self, realm_id: Uuid, user_id: Uuid) -> WorkflowResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE realm_id = $1 AND id = $2")
            .bind(realm_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WorkflowRepository for PostgresStore {
    async fn create(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let columns = workflow_columns(workflow)?;

        sqlx::query(
            "INSERT INTO workflows (id, realm_id, name, enabled, trigger_event, resource_type, steps, conditions, \
             batch_size, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(workflow.id)
        .bind(workflow.realm_id)
        .bind(&workflow.name)
        .bind(workflow.enabled)
        .bind(workflow.trigger.as_str())
        .bind(workflow.resource_type.as_str())
        .bind(columns.steps)
        .bind(columns.conditions)
        .bind(columns.batch_size)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_conflict(e, &workflow.name))?;

        Ok(())
    }

    async fn update(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let columns = workflow_columns(workflow)?;

        let result = sqlx::query(
            "UPDATE workflows SET name = $3, enabled = $4, trigger_event = $5, resource_type = $6, \
             steps = $7, conditions = $8, batch_size = $9, updated_at = $10 \
             WHERE realm_id = $1 AND id = $2",
        )
        .bind(workflow.realm_id)
        .bind(workflow.id)
        .bind(&workflow.name)
        .bind(workflow.enabled)
        .bind(workflow.trigger.as_str())
        .bind(workflow.resource_type.as_str())
        .bind(columns.steps)
        .bind(columns.conditions)
        .bind(columns.batch_size)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_conflict(e, &workflow.name))?;

        if result.rows_affected() == 0 {
            return Err(WorkflowError::NotFound("Workflow".to_string()));
        }
        Ok(())
    }

    async fn delete(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE realm_id = $1 AND id = $2")
            .bind(realm_id)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Option<Workflow>> {
        let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
            "SELECT {} FROM workflows WHERE realm_id = $1 AND id = $2",
            WORKFLOW_COLUMNS
        ))
        .bind(realm_id)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        record.map(workflow_from_record).transpose()
    }

    async fn list(&self, realm_id: Uuid) -> WorkflowResult<Vec<Workflow>> {
        let records = sqlx::query_as::<_, WorkflowRecord>(&format!(
            "SELECT {} FROM workflows WHERE realm_id = $1 ORDER BY name",
            WORKFLOW_COLUMNS
        ))
        .bind(realm_id)
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(workflow_from_record).collect()
    }

    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>("DELETE FROM workflows WHERE realm_id = $1 RETURNING id")
            .bind(realm_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

#[async_trait]
impl WorkflowStateStore for PostgresStore {
    async fn bind(&self, binding: &WorkflowBinding) -> WorkflowResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO workflow_state ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (resource_id, workflow_id) DO NOTHING",
            STATE_COLUMNS
        ))
        .bind(binding.resource_id)
        .bind(binding.workflow_id)
        .bind(binding.realm_id)
        .bind(binding.resource_type.as_str())
        .bind(db_position(binding.position)?)
        .bind(binding.scheduled_at)
        .bind(binding.bound_at)
        .bind(binding.terminal)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: BindingKey) -> WorkflowResult<Option<WorkflowBinding>> {
        let record = sqlx::query_as::<_, WorkflowStateRecord>(&format!(
            "SELECT {} FROM workflow_state WHERE resource_id = $1 AND workflow_id = $2",
            STATE_COLUMNS
        ))
        .bind(key.resource_id)
        .bind(key.workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        record.map(binding_from_record).transpose()
    }

    async fn find_due(
        &self,
        realm_id: Uuid,
        workflow_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> WorkflowResult<Vec<ScheduledStep>> {
        let records = sqlx::query_as::<_, WorkflowStateRecord>(&format!(
            "SELECT {} FROM workflow_state \
             WHERE realm_id = $1 AND workflow_id = $2 AND NOT terminal AND scheduled_at <= $3 \
             ORDER BY scheduled_at, resource_id LIMIT $4",
            STATE_COLUMNS
        ))
        .bind(realm_id)
        .bind(workflow_id)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        records
            .into_iter()
            .map(|r| binding_from_record(r).map(|b| b.to_scheduled()))
            .collect()
    }

    async fn list_pending(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Vec<ScheduledStep>> {
        let records = sqlx::query_as::<_, WorkflowStateRecord>(&format!(
            "SELECT {} FROM workflow_state \
             WHERE realm_id = $1 AND workflow_id = $2 AND NOT terminal \
             ORDER BY scheduled_at, resource_id",
            STATE_COLUMNS
        ))
        .bind(realm_id)
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        records
            .into_iter()
            .map(|r| binding_from_record(r).map(|b| b.to_scheduled()))
            .collect()
    }

    async fn claim(
        &self,
        key: BindingKey,
        expected_position: usize,
        expected_due: DateTime<Utc>,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_state SET scheduled_at = $5 \
             WHERE resource_id = $1 AND workflow_id = $2 AND scheduled_at = $3 \
             AND scheduled_at <= $4 AND step_position = $6 AND NOT terminal",
        )
        .bind(key.resource_id)
        .bind(key.workflow_id)
        .bind(expected_due)
        .bind(now)
        .bind(lease_until)
        .bind(db_position(expected_position)?)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn advance(
        &self,
        key: BindingKey,
        from_position: usize,
        to_position: usize,
        due: DateTime<Utc>,
        terminal: bool,
    ) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_state SET step_position = $4, scheduled_at = $5, terminal = $6 \
             WHERE resource_id = $1 AND workflow_id = $2 AND step_position = $3",
        )
        .bind(key.resource_id)
        .bind(key.workflow_id)
        .bind(db_position(from_position)?)
        .bind(db_position(to_position)?)
        .bind(due)
        .bind(terminal)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reschedule(&self, key: BindingKey, due: DateTime<Utc>) -> WorkflowResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_state SET scheduled_at = $3 \
             WHERE resource_id = $1 AND workflow_id = $2 AND NOT terminal",
        )
        .bind(key.resource_id)
        .bind(key.workflow_id)
        .bind(due)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: BindingKey) -> WorkflowResult<bool> {
        let result = sqlx::query("DELETE FROM workflow_state WHERE resource_id = $1 AND workflow_id = $2")
            .bind(key.resource_id)
            .bind(key.workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_resource(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<u64> {
        let result = sqlx::query("DELETE FROM workflow_state WHERE realm_id = $1 AND resource_id = $2")
            .bind(realm_id)
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<u64> {
        let result = sqlx::query("DELETE FROM workflow_state WHERE realm_id = $1 AND workflow_id = $2")
            .bind(realm_id)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_by_realm(&self, realm_id: Uuid) -> WorkflowResult<u64> {
        let result = sqlx::query("DELETE FROM workflow_state WHERE realm_id = $1")
            .bind(realm_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
