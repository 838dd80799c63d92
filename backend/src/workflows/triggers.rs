// Workflow Triggers - Resource lifecycle events delivered to the engine

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use steward_shared::ResourceEventRepresentation;

use super::model::{ResourceType, WorkflowTrigger};
use crate::error::{WorkflowError, WorkflowResult};

/// Lifecycle notification from the host's event bus
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent {
    ResourceCreated {
        realm_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    },
    ResourceUpdated {
        realm_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    },
    ResourceRemoved {
        realm_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    },
    RealmRemoved {
        realm_id: Uuid,
    },
}

impl ResourceEvent {
    pub fn created(realm_id: Uuid, resource_id: Uuid) -> Self {
        ResourceEvent::ResourceCreated {
            realm_id,
            resource_type: ResourceType::Users,
            resource_id,
        }
    }

    pub fn from_representation(rep: &ResourceEventRepresentation) -> WorkflowResult<Self> {
        Ok(match rep {
            ResourceEventRepresentation::ResourceCreated { realm_id, resource_type, resource_id } => {
                ResourceEvent::ResourceCreated {
                    realm_id: *realm_id,
                    resource_type: resource_type.parse()?,
                    resource_id: *resource_id,
                }
            }
            ResourceEventRepresentation::ResourceUpdated { realm_id, resource_type, resource_id } => {
                ResourceEvent::ResourceUpdated {
                    realm_id: *realm_id,
                    resource_type: resource_type.parse()?,
                    resource_id: *resource_id,
                }
            }
            ResourceEventRepresentation::ResourceRemoved { realm_id, resource_type, resource_id } => {
                ResourceEvent::ResourceRemoved {
                    realm_id: *realm_id,
                    resource_type: resource_type.parse()?,
                    resource_id: *resource_id,
                }
            }
            ResourceEventRepresentation::RealmRemoved { realm_id } => {
                ResourceEvent::RealmRemoved { realm_id: *realm_id }
            }
        })
    }

    pub fn realm_id(&self) -> Uuid {
        match self {
            ResourceEvent::ResourceCreated { realm_id, .. }
            | ResourceEvent::ResourceUpdated { realm_id, .. }
            | ResourceEvent::ResourceRemoved { realm_id, .. }
            | ResourceEvent::RealmRemoved { realm_id } => *realm_id,
        }
    }

    /// The workflow trigger this event fires, if any
    pub fn trigger(&self) -> Option<WorkflowTrigger> {
        match self {
            ResourceEvent::ResourceCreated { .. } => Some(WorkflowTrigger::ResourceCreated),
            ResourceEvent::ResourceUpdated { .. } => Some(WorkflowTrigger::ResourceUpdated),
            _ => None,
        }
    }
}

/// Sending half of the engine's event channel
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: mpsc::Sender<ResourceEvent>,
}

impl EventPublisher {
    pub async fn publish(&self, event: ResourceEvent) -> WorkflowResult<()> {
        self.sender.send(event).await.map_err(|e| {
            warn!("Dropping event for realm {}: engine is not listening", e.0.realm_id());
            WorkflowError::Scheduler("event channel is closed".to_string())
        })
    }
}

pub fn event_channel(buffer: usize) -> (EventPublisher, mpsc::Receiver<ResourceEvent>) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (EventPublisher { sender }, receiver)
}
