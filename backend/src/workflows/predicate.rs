// Predicate Tree - Storage-neutral filter built from workflow conditions
//
// Each storage adapter decides how to run it: PostgreSQL compiles it into a
// WHERE clause over the `users u` alias, the in-memory store walks it directly.

use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::services::identity::Resource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// Direct membership of the group at this exact path
    GroupMembership { path: String },
    Role { name: String },
    IdentityProvider { alias: String },
    Attribute { name: String, value: String },
    /// A state row exists for this resource in the given workflow
    WorkflowBinding { workflow_id: Uuid },
}

impl Relation {
    fn holds(&self, resource: &Resource, is_bound: &dyn Fn(Uuid) -> bool) -> bool {
        match self {
            Relation::GroupMembership { path } => resource.groups.iter().any(|g| g == path),
            Relation::Role { name } => resource.roles.iter().any(|r| r == name),
            Relation::IdentityProvider { alias } => {
                resource.identity_providers.iter().any(|p| p == alias)
            }
            Relation::Attribute { name, value } => resource
                .attributes
                .get(name)
                .is_some_and(|values| values.iter().any(|v| v == value)),
            Relation::WorkflowBinding { workflow_id } => is_bound(*workflow_id),
        }
    }

    fn push_exists(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Relation::GroupMembership { path } => {
                qb.push(
                    "EXISTS (SELECT 1 FROM user_group_memberships m \
                     JOIN realm_groups g ON g.id = m.group_id \
                     WHERE m.user_id = u.id AND g.path = ",
                );
                qb.push_bind(path.clone());
            }
            Relation::Role { name } => {
                qb.push(
                    "EXISTS (SELECT 1 FROM user_role_mappings m \
                     JOIN realm_roles r ON r.id = m.role_id \
                     WHERE m.user_id = u.id AND r.name = ",
                );
                qb.push_bind(name.clone());
            }
            Relation::IdentityProvider { alias } => {
                qb.push(
                    "EXISTS (SELECT 1 FROM federated_identities f \
                     WHERE f.user_id = u.id AND f.identity_provider_alias = ",
                );
                qb.push_bind(alias.clone());
            }
            Relation::Attribute { name, value } => {
                qb.push(
                    "EXISTS (SELECT 1 FROM user_attributes a \
                     WHERE a.user_id = u.id AND a.name = ",
                );
                qb.push_bind(name.clone());
                qb.push(" AND a.value = ");
                qb.push_bind(value.clone());
            }
            Relation::WorkflowBinding { workflow_id } => {
                qb.push(
                    "EXISTS (SELECT 1 FROM workflow_state s \
                     WHERE s.resource_id = u.id AND s.workflow_id = ",
                );
                qb.push_bind(*workflow_id);
            }
        }
        qb.push(")");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    False,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Exists(Relation),
}

impl Predicate {
    pub fn exists(relation: Relation) -> Self {
        Predicate::Exists(relation)
    }

    pub fn negate(predicate: Predicate) -> Self {
        Predicate::Not(Box::new(predicate))
    }

    /// Evaluate against a loaded resource. `is_bound` answers binding lookups.
    pub fn matches(&self, resource: &Resource, is_bound: &dyn Fn(Uuid) -> bool) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::And(items) => items.iter().all(|p| p.matches(resource, is_bound)),
            Predicate::Or(items) => items.iter().any(|p| p.matches(resource, is_bound)),
            Predicate::Not(inner) => !inner.matches(resource, is_bound),
            Predicate::Exists(relation) => relation.holds(resource, is_bound),
        }
    }

    /// Append this predicate as a SQL boolean expression. Rows are aliased `u`.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Predicate::True => {
                qb.push("TRUE");
            }
            Predicate::False => {
                qb.push("FALSE");
            }
            Predicate::And(items) => Self::push_joined(qb, items, " AND ", "TRUE"),
            Predicate::Or(items) => Self::push_joined(qb, items, " OR ", "FALSE"),
            Predicate::Not(inner) => {
                qb.push("NOT (");
                inner.push_sql(qb);
                qb.push(")");
            }
            Predicate::Exists(relation) => relation.push_exists(qb),
        }
    }

    fn push_joined(
        qb: &mut QueryBuilder<'_, Postgres>,
        items: &[Predicate],
        separator: &str,
        identity: &str,
    ) {
        if items.is_empty() {
            qb.push(identity);
            return;
        }

        qb.push("(");
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                qb.push(separator);
            }
            item.push_sql(qb);
        }
        qb.push(")");
    }
}
