// Workflow Conditions - Eligibility checks attached to a workflow
//
// Every condition can be compiled into a predicate for the batch selector and
// evaluated directly against a loaded resource; both must agree.

pub mod expression;

use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use steward_shared::ConditionRepresentation;

use self::expression::{Expr, LeafCall};
use super::predicate::{Predicate, Relation};
use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::{Resource, UserProvider};

pub const IS_MEMBER_OF: &str = "is-member-of";
pub const HAS_IDENTITY_PROVIDER_LINK: &str = "has-identity-provider-link";
pub const HAS_ROLE: &str = "has-role";
pub const HAS_USER_ATTRIBUTE: &str = "has-user-attribute";
pub const EXPRESSION: &str = "expression";

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Direct member of the group at this path
    MemberOf { path: String },
    IdentityProviderLink { alias: String },
    HasRole { role: String },
    /// One of the attribute's values equals `value`
    HasAttribute { key: String, value: String },
    Expression { source: String, tree: Box<Expr<Condition>> },
}

impl Condition {
    pub fn from_representation(rep: &ConditionRepresentation) -> WorkflowResult<Self> {
        Self::from_parts(&rep.condition_type, rep.parameter.as_deref(), &rep.config)
    }

    pub fn from_parts(
        condition_type: &str,
        parameter: Option<&str>,
        config: &BTreeMap<String, Value>,
    ) -> WorkflowResult<Self> {
        if condition_type == EXPRESSION {
            let source = required(condition_type, parameter)?;
            return Self::parse_expression(source);
        }

        if condition_type == HAS_USER_ATTRIBUTE && parameter.is_none() {
            let key = config_string(config, "key")?;
            let value = config_string(config, "value")?;
            return attribute(key, value);
        }

        Self::leaf(condition_type, required(condition_type, parameter)?)
    }

    /// Single condition from its type and parameter. Composite types are not leaves.
    fn leaf(condition_type: &str, parameter: &str) -> WorkflowResult<Self> {
        match condition_type {
            IS_MEMBER_OF => {
                if !parameter.starts_with('/') {
                    return Err(WorkflowError::invalid(format!(
                        "group path '{}' must start with '/'",
                        parameter
                    )));
                }
                Ok(Condition::MemberOf { path: parameter.to_string() })
            }
            HAS_IDENTITY_PROVIDER_LINK => Ok(Condition::IdentityProviderLink {
                alias: parameter.to_string(),
            }),
            HAS_ROLE => Ok(Condition::HasRole { role: parameter.to_string() }),
            HAS_USER_ATTRIBUTE => {
                let (key, value) = parameter.split_once(':').ok_or_else(|| {
                    WorkflowError::invalid(format!(
                        "attribute condition '{}' must have the form key:value",
                        parameter
                    ))
                })?;
                attribute(key.trim().to_string(), value.trim().to_string())
            }
            EXPRESSION => Err(WorkflowError::invalid("expressions cannot be nested")),
            other => Err(WorkflowError::invalid(format!("unknown condition type '{}'", other))),
        }
    }

    fn parse_expression(source: &str) -> WorkflowResult<Self> {
        let parsed = expression::parse(source)
            .map_err(|e| WorkflowError::invalid(format!("invalid expression '{}': {}", source, e)))?;

        let tree = parsed.try_map(&mut |call: &LeafCall| {
            if call.argument.is_empty() {
                return Err(WorkflowError::invalid(format!(
                    "condition '{}' at position {} has no argument",
                    call.name, call.position
                )));
            }
            Self::leaf(&call.name, &call.argument)
        })?;

        Ok(Condition::Expression {
            source: source.trim().to_string(),
            tree: Box::new(tree),
        })
    }

    pub fn type_id(&self) -> &'static str {
        match self {
            Condition::MemberOf { .. } => IS_MEMBER_OF,
            Condition::IdentityProviderLink { .. } => HAS_IDENTITY_PROVIDER_LINK,
            Condition::HasRole { .. } => HAS_ROLE,
            Condition::HasAttribute { .. } => HAS_USER_ATTRIBUTE,
            Condition::Expression { .. } => EXPRESSION,
        }
    }

    pub fn parameter(&self) -> String {
        match self {
            Condition::MemberOf { path } => path.clone(),
            Condition::IdentityProviderLink { alias } => alias.clone(),
            Condition::HasRole { role } => role.clone(),
            Condition::HasAttribute { key, value } => format!("{}:{}", key, value),
            Condition::Expression { source, .. } => source.clone(),
        }
    }

    pub fn to_representation(&self) -> ConditionRepresentation {
        ConditionRepresentation {
            condition_type: self.type_id().to_string(),
            parameter: Some(self.parameter()),
            config: BTreeMap::new(),
        }
    }

    /// Checks that referenced groups, roles and providers exist in the realm.
    /// A failure here is a configuration error, not a non-match.
    pub async fn validate(&self, realm_id: Uuid, users: &dyn UserProvider) -> WorkflowResult<()> {
        match self {
            Condition::Expression { tree, .. } => {
                for leaf in tree.leaves() {
                    leaf.validate_leaf(realm_id, users).await?;
                }
                Ok(())
            }
            other => other.validate_leaf(realm_id, users).await,
        }
    }

    async fn validate_leaf(&self, realm_id: Uuid, users: &dyn UserProvider) -> WorkflowResult<()> {
        let (exists, what) = match self {
            Condition::MemberOf { path } => (users.group_exists(realm_id, path).await?, format!("group '{}'", path)),
            Condition::HasRole { role } => (users.role_exists(realm_id, role).await?, format!("role '{}'", role)),
            Condition::IdentityProviderLink { alias } => (
                users.identity_provider_exists(realm_id, alias).await?,
                format!("identity provider '{}'", alias),
            ),
            Condition::HasAttribute { .. } => return Ok(()),
            Condition::Expression { .. } => {
                return Err(WorkflowError::invalid("expressions cannot be nested"));
            }
        };

        if exists {
            Ok(())
        } else {
            Err(WorkflowError::invalid(format!("{} does not exist in realm {}", what, realm_id)))
        }
    }

    pub fn to_predicate(&self) -> Predicate {
        match self {
            Condition::MemberOf { path } => Predicate::exists(Relation::GroupMembership { path: path.clone() }),
            Condition::IdentityProviderLink { alias } => {
                Predicate::exists(Relation::IdentityProvider { alias: alias.clone() })
            }
            Condition::HasRole { role } => Predicate::exists(Relation::Role { name: role.clone() }),
            Condition::HasAttribute { key, value } => Predicate::exists(Relation::Attribute {
                name: key.clone(),
                value: value.clone(),
            }),
            Condition::Expression { tree, .. } => tree.to_predicate(&|leaf: &Condition| leaf.to_predicate()),
        }
    }

    pub fn evaluate(&self, resource: &Resource) -> bool {
        match self {
            Condition::Expression { tree, .. } => tree.evaluate(&|leaf: &Condition| leaf.evaluate(resource)),
            leaf => leaf.to_predicate().matches(resource, &|_| false),
        }
    }
}

fn attribute(key: String, value: String) -> WorkflowResult<Condition> {
    if key.is_empty() {
        return Err(WorkflowError::invalid("attribute condition requires a key"));
    }
    Ok(Condition::HasAttribute { key, value })
}

fn required<'a>(condition_type: &str, parameter: Option<&'a str>) -> WorkflowResult<&'a str> {
    match parameter.map(str::trim) {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(WorkflowError::invalid(format!(
            "condition '{}' requires a parameter",
            condition_type
        ))),
    }
}

fn config_string(config: &BTreeMap<String, Value>, key: &str) -> WorkflowResult<String> {
    match config.get(key) {
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Bool(b)) => Ok(b.to_string()),
        _ => Err(WorkflowError::invalid(format!(
            "attribute condition requires a '{}' entry",
            key
        ))),
    }
}
