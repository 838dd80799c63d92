// Workflow Steps - Step types and the registry that executes them against a resource

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::{Resource, UserProvider};
use crate::services::notifier::{Notification, Notifier, NotifyChannel};

pub const NOTIFY: &str = "notify";
pub const DISABLE_RESOURCE: &str = "disable-resource";
pub const DELETE_RESOURCE: &str = "delete-resource";
pub const SET_ATTRIBUTE: &str = "set-attribute";
pub const RESTART: &str = "restart";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NotifyConfig {
    #[serde(default)]
    pub channel: NotifyChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[validate(length(min = 1, message = "notify message must not be empty"))]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(url(message = "webhook url is not valid"))]
    pub url: Option<String>,
}

/// Attribute name to the full list of values it should hold
#[derive(Debug, Clone, PartialEq)]
pub struct SetAttributeConfig {
    pub attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartConfig {
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Notify(NotifyConfig),
    DisableResource,
    /// Removes the resource; its bindings go with it
    DeleteResource,
    SetAttribute(SetAttributeConfig),
    Restart(RestartConfig),
}

impl StepAction {
    /// Parses the typed config for a step type; unknown types are rejected
    pub fn from_config(step_type: &str, config: &BTreeMap<String, Value>) -> WorkflowResult<Self> {
        match step_type {
            NOTIFY => {
                let object: serde_json::Map<String, Value> = config.clone().into_iter().collect();
                let parsed: NotifyConfig = serde_json::from_value(Value::Object(object))
                    .map_err(|e| WorkflowError::invalid(format!("invalid notify config: {}", e)))?;
                parsed
                    .validate()
                    .map_err(|e| WorkflowError::invalid(format!("invalid notify config: {}", e)))?;
                if parsed.channel == NotifyChannel::Webhook && parsed.url.is_none() {
                    return Err(WorkflowError::invalid("webhook notify steps require a url"));
                }
                Ok(StepAction::Notify(parsed))
            }
            DISABLE_RESOURCE => Ok(StepAction::DisableResource),
            DELETE_RESOURCE => Ok(StepAction::DeleteResource),
            SET_ATTRIBUTE => {
                if config.is_empty() {
                    return Err(WorkflowError::invalid("set-attribute requires at least one attribute"));
                }
                let attributes = config
                    .iter()
                    .map(|(name, value)| Ok((name.clone(), attribute_values(name, value)?)))
                    .collect::<WorkflowResult<BTreeMap<_, _>>>()?;
                Ok(StepAction::SetAttribute(SetAttributeConfig { attributes }))
            }
            RESTART => {
                let position = match config.get("position") {
                    None => 0,
                    Some(value) => match value.as_i64() {
                        Some(p) if p < 0 => {
                            return Err(WorkflowError::invalid(format!(
                                "restart position {} must not be negative",
                                p
                            )));
                        }
                        Some(p) => p as usize,
                        None => {
                            return Err(WorkflowError::invalid("restart position must be an integer"));
                        }
                    },
                };
                Ok(StepAction::Restart(RestartConfig { position }))
            }
            other => Err(WorkflowError::invalid(format!("unknown step type '{}'", other))),
        }
    }

    pub fn type_id(&self) -> &'static str {
        match self {
            StepAction::Notify(_) => NOTIFY,
            StepAction::DisableResource => DISABLE_RESOURCE,
            StepAction::DeleteResource => DELETE_RESOURCE,
            StepAction::SetAttribute(_) => SET_ATTRIBUTE,
            StepAction::Restart(_) => RESTART,
        }
    }

    pub fn to_config(&self) -> BTreeMap<String, Value> {
        match self {
            StepAction::Notify(config) => match serde_json::to_value(config) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                _ => BTreeMap::new(),
            },
            StepAction::DisableResource | StepAction::DeleteResource => BTreeMap::new(),
            StepAction::SetAttribute(config) => config
                .attributes
                .iter()
                .map(|(name, values)| {
                    let value = match values.as_slice() {
                        [single] => Value::String(single.clone()),
                        many => Value::from(many.to_vec()),
                    };
                    (name.clone(), value)
                })
                .collect(),
            StepAction::Restart(config) => {
                BTreeMap::from([("position".to_string(), Value::from(config.position))])
            }
        }
    }
}

fn attribute_values(name: &str, value: &Value) -> WorkflowResult<Vec<String>> {
    let scalar = |v: &Value| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    };

    let values = match value {
        Value::Array(items) => items.iter().map(scalar).collect::<Option<Vec<_>>>(),
        other => scalar(other).map(|v| vec![v]),
    };

    values.ok_or_else(|| {
        WorkflowError::invalid(format!(
            "attribute '{}' must be a string, number, boolean or a list of them",
            name
        ))
    })
}

/// Where a step runs: owned so it can cross into spawned tasks
#[derive(Debug, Clone)]
pub struct StepContext {
    pub realm_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub position: usize,
}

/// What the engine should do with the binding after a successful step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Restart { position: usize },
    ResourceRemoved,
}

pub struct StepRegistry {
    users: Arc<dyn UserProvider>,
    notifier: Arc<dyn Notifier>,
}

impl StepRegistry {
    pub fn new(users: Arc<dyn UserProvider>, notifier: Arc<dyn Notifier>) -> Self {
        Self { users, notifier }
    }

    pub async fn execute(
        &self,
        action: &StepAction,
        ctx: &StepContext,
        resource: &Resource,
    ) -> WorkflowResult<StepOutcome> {
        debug!(
            "Executing {} for resource {} in workflow {} at position {}",
            action.type_id(),
            resource.id,
            ctx.workflow_id,
            ctx.position
        );

        match action {
            StepAction::Notify(config) => self.notify(config, ctx, resource).await,
            StepAction::DisableResource => self.disable(ctx, resource).await,
            StepAction::DeleteResource => self.delete(ctx, resource).await,
            StepAction::SetAttribute(config) => self.set_attributes(config, ctx, resource).await,
            StepAction::Restart(config) => Ok(StepOutcome::Restart {
                position: config.position,
            }),
        }
    }

    async fn notify(
        &self,
        config: &NotifyConfig,
        ctx: &StepContext,
        resource: &Resource,
    ) -> WorkflowResult<StepOutcome> {
        if config.channel == NotifyChannel::Email && resource.email.is_none() {
            warn!(
                "Skipping email notification for resource {} in workflow {}: no email address",
                resource.id, ctx.workflow_id
            );
            return Ok(StepOutcome::Continue);
        }

        let subject = config
            .subject
            .as_deref()
            .map(|s| render_template(s, ctx, resource))
            .unwrap_or_else(|| format!("Notification from {}", ctx.workflow_name));

        let notification = Notification {
            channel: config.channel,
            realm_id: ctx.realm_id,
            workflow_id: ctx.workflow_id,
            workflow_name: ctx.workflow_name.clone(),
            step_position: ctx.position,
            resource_id: resource.id,
            username: resource.username.clone(),
            recipient: resource.email.clone(),
            subject,
            message: render_template(&config.message, ctx, resource),
            url: config.url.clone(),
        };

        self.notifier.notify(&notification).await?;
        Ok(StepOutcome::Continue)
    }

    async fn disable(&self, ctx: &StepContext, resource: &Resource) -> WorkflowResult<StepOutcome> {
        let found = self.users.set_enabled(ctx.realm_id, resource.id, false).await?;
        if found {
            info!("Disabled resource {} via workflow {}", resource.id, ctx.workflow_id);
        } else {
            warn!("Resource {} vanished before it could be disabled", resource.id);
        }
        Ok(StepOutcome::Continue)
    }

    async fn delete(&self, ctx: &StepContext, resource: &Resource) -> WorkflowResult<StepOutcome> {
        if self.users.delete_user(ctx.realm_id, resource.id).await? {
            info!("Deleted resource {} via workflow {}", resource.id, ctx.workflow_id);
        }
        Ok(StepOutcome::ResourceRemoved)
    }

    async fn set_attributes(
        &self,
        config: &SetAttributeConfig,
        ctx: &StepContext,
        resource: &Resource,
    ) -> WorkflowResult<StepOutcome> {
        for (name, values) in &config.attributes {
            let rendered: Vec<String> = values
                .iter()
                .map(|v| render_template(v, ctx, resource))
                .collect();
            self.users
                .set_attribute(ctx.realm_id, resource.id, name, &rendered)
                .await?;
        }
        Ok(StepOutcome::Continue)
    }
}

/// Replaces `{{username}}`, `{{email}}`, `{{workflow}}`, `{{step}}` and
/// `{{attributes.<name>}}`. Unknown placeholders are left as written.
pub fn render_template(template: &str, ctx: &StepContext, resource: &Resource) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            let value = match key {
                "username" => Some(resource.username.clone()),
                "email" => Some(resource.email.clone().unwrap_or_default()),
                "workflow" => Some(ctx.workflow_name.clone()),
                "step" => Some(ctx.position.to_string()),
                _ => key
                    .strip_prefix("attributes.")
                    .map(|name| resource.attributes.get(name).map(|v| v.join(", ")).unwrap_or_default()),
            };
            value.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
