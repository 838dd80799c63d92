use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ===== Admin wire representations =====

/// Workflow definition as accepted and returned by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRepresentation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Triggering event, e.g. `resource-created`
    #[serde(default = "default_trigger")]
    pub on: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub steps: Vec<StepRepresentation>,
    #[serde(default)]
    pub conditions: Vec<ConditionRepresentation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepRepresentation {
    #[serde(rename = "type")]
    pub step_type: String,
    /// Delay relative to the previous step, e.g. `5d`, `12h`, `30m`
    #[serde(default, alias = "afterDuration", skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConditionRepresentation {
    #[serde(rename = "type")]
    pub condition_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, serde_json::Value>,
}

/// Pending work for one resource in one workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledStepRepresentation {
    pub resource_id: Uuid,
    pub workflow_id: Uuid,
    pub step_position: u32,
    pub step_type: String,
    pub due_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TickReportRepresentation {
    pub paused: bool,
    pub bound: u32,
    pub claimed: u32,
    pub dispatched: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Lifecycle notification delivered by the host's event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ResourceEventRepresentation {
    ResourceCreated {
        realm_id: Uuid,
        #[serde(default = "default_resource_type")]
        resource_type: String,
        resource_id: Uuid,
    },
    ResourceUpdated {
        realm_id: Uuid,
        #[serde(default = "default_resource_type")]
        resource_type: String,
        resource_id: Uuid,
    },
    ResourceRemoved {
        realm_id: Uuid,
        #[serde(default = "default_resource_type")]
        resource_type: String,
        resource_id: Uuid,
    },
    RealmRemoved {
        realm_id: Uuid,
    },
}

fn default_enabled() -> bool {
    true
}

fn default_trigger() -> String {
    "resource-created".to_string()
}

fn default_resource_type() -> String {
    "users".to_string()
}

// ===== Persistence rows =====

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmRecord {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub trigger_event: String,
    pub resource_type: String,
    pub steps: serde_json::Value, // Vec<StepRepresentation>
    pub conditions: serde_json::Value, // Vec<ConditionRepresentation>
    pub batch_size: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStateRecord {
    pub resource_id: Uuid,
    pub workflow_id: Uuid,
    pub realm_id: Uuid,
    pub resource_type: String,
    pub step_position: i32,
    pub scheduled_at: DateTime<Utc>,
    pub bound_at: DateTime<Utc>,
    pub terminal: bool,
}
