// Workflow Model - Definitions parsed from the admin wire representation

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

use steward_shared::{StepRepresentation, WorkflowRepresentation};

use super::conditions::Condition;
use super::predicate::Predicate;
use super::steps::StepAction;
use crate::error::{WorkflowError, WorkflowResult};
use crate::services::identity::Resource;

/// How many unbound resources a single tick may bind when the definition does not say
pub const DEFAULT_BATCH_SIZE: u32 = 100;

static DELAY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+)\s*(ms|s|m|h|d)?\s*$").expect("delay pattern is valid")
});

/// Kind of resource a workflow acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Users,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Users => "users",
        }
    }
}

impl FromStr for ResourceType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "users" | "user" => Ok(ResourceType::Users),
            other => Err(WorkflowError::invalid(format!("unknown resource type '{}'", other))),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle event that binds a resource outside the periodic scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTrigger {
    ResourceCreated,
    ResourceUpdated,
}

impl WorkflowTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowTrigger::ResourceCreated => "resource-created",
            WorkflowTrigger::ResourceUpdated => "resource-updated",
        }
    }
}

impl FromStr for WorkflowTrigger {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "resource-created" | "user-created" => Ok(WorkflowTrigger::ResourceCreated),
            "resource-updated" | "user-updated" => Ok(WorkflowTrigger::ResourceUpdated),
            other => Err(WorkflowError::invalid(format!("unknown trigger event '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub position: usize,
    /// Delay relative to the previous step
    pub after: Duration,
    pub action: StepAction,
}

impl WorkflowStep {
    pub fn step_type(&self) -> &'static str {
        self.action.type_id()
    }

    fn to_representation(&self) -> StepRepresentation {
        StepRepresentation {
            step_type: self.step_type().to_string(),
            after: (!self.after.is_zero()).then(|| format_delay(self.after)),
            config: self.action.to_config(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: Uuid,
    pub realm_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub trigger: WorkflowTrigger,
    pub resource_type: ResourceType,
    pub steps: Vec<WorkflowStep>,
    pub conditions: Vec<Condition>,
    pub batch_size: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Parse and validate a definition. Fails on the first malformed field.
    pub fn from_representation(
        realm_id: Uuid,
        id: Uuid,
        rep: &WorkflowRepresentation,
        created_at: DateTime<Utc>,
    ) -> WorkflowResult<Self> {
        let name = rep.name.trim();
        if name.is_empty() {
            return Err(WorkflowError::invalid("workflow name must not be empty"));
        }

        if rep.steps.is_empty() {
            return Err(WorkflowError::invalid("workflow must declare at least one step"));
        }

        let steps = rep
            .steps
            .iter()
            .enumerate()
            .map(|(position, step)| {
                let after = match step.after.as_deref() {
                    Some(value) => parse_delay(value)?,
                    None => Duration::zero(),
                };
                let action = StepAction::from_config(&step.step_type, &step.config)?;
                Ok(WorkflowStep { position, after, action })
            })
            .collect::<WorkflowResult<Vec<_>>>()?;

        for step in &steps {
            if let StepAction::Restart(config) = &step.action {
                if config.position >= steps.len() {
                    return Err(WorkflowError::invalid(format!(
                        "restart step at position {} targets position {} but the workflow has {} steps",
                        step.position,
                        config.position,
                        steps.len()
                    )));
                }
            }
        }

        let conditions = rep
            .conditions
            .iter()
            .map(Condition::from_representation)
            .collect::<WorkflowResult<Vec<_>>>()?;

        let batch_size = rep.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(WorkflowError::invalid("batchSize must be at least 1"));
        }

        Ok(Self {
            id,
            realm_id,
            name: name.to_string(),
            enabled: rep.enabled,
            trigger: rep.on.parse()?,
            resource_type: rep.resource_type.parse()?,
            steps,
            conditions,
            batch_size,
            created_at,
            updated_at: None,
        })
    }

    pub fn to_representation(&self) -> WorkflowRepresentation {
        WorkflowRepresentation {
            id: Some(self.id),
            name: self.name.clone(),
            enabled: self.enabled,
            on: self.trigger.as_str().to_string(),
            resource_type: self.resource_type.as_str().to_string(),
            steps: self.steps.iter().map(WorkflowStep::to_representation).collect(),
            conditions: self.conditions.iter().map(Condition::to_representation).collect(),
            batch_size: Some(self.batch_size),
        }
    }

    pub fn step(&self, position: usize) -> Option<&WorkflowStep> {
        self.steps.get(position)
    }

    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.steps.is_empty()
    }

    /// Top-level conditions are ANDed
    pub fn predicate(&self) -> Predicate {
        Predicate::And(self.conditions.iter().map(Condition::to_predicate).collect())
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.conditions.iter().all(|c| c.evaluate(resource))
    }
}

/// Parse `<n>[ms|s|m|h|d]`; a bare number is seconds
pub fn parse_delay(value: &str) -> WorkflowResult<Duration> {
    let caps = DELAY_PATTERN
        .captures(value)
        .ok_or_else(|| WorkflowError::invalid(format!("invalid step delay '{}'", value)))?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| WorkflowError::invalid(format!("invalid step delay '{}'", value)))?;
    if amount < 0 {
        return Err(WorkflowError::invalid(format!("step delay '{}' must not be negative", value)));
    }

    let delay = match caps.get(2).map(|m| m.as_str()).unwrap_or("s") {
        "ms" => Duration::try_milliseconds(amount),
        "m" => Duration::try_minutes(amount),
        "h" => Duration::try_hours(amount),
        "d" => Duration::try_days(amount),
        _ => Duration::try_seconds(amount),
    };

    delay.ok_or_else(|| WorkflowError::invalid(format!("step delay '{}' is out of range", value)))
}

pub fn format_delay(delay: Duration) -> String {
    let millis = delay.num_milliseconds();
    const UNITS: [(i64, &str); 4] = [
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];

    for (size, unit) in UNITS {
        if millis != 0 && millis % size == 0 {
            return format!("{}{}", millis / size, unit);
        }
    }
    format!("{}ms", millis)
}
