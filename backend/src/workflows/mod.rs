// Resource Workflow Engine
//
// Attaches multi-step automation to lifecycle events of realm resources and
// advances each bound resource through its steps over time.

pub mod clock;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod model;
pub mod predicate;
pub mod repository;
pub mod selector;
pub mod state;
pub mod steps;
pub mod triggers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use conditions::Condition;
pub use engine::{EngineConfig, EngineServices, TickReport, WorkflowEngine};
pub use executor::{ExecutionMode, WorkflowExecutor};
pub use model::{ResourceType, Workflow, WorkflowStep, WorkflowTrigger};
pub use predicate::{Predicate, Relation};
pub use repository::WorkflowRepository;
pub use selector::{ResourceTypeSelector, SelectorRegistry};
pub use state::{BindingKey, ScheduledStep, WorkflowBinding, WorkflowStateStore};
pub use steps::{StepAction, StepOutcome, StepRegistry};
pub use triggers::{event_channel, EventPublisher, ResourceEvent};
