// Workflow Engine - Binds resources to workflows and advances them over time

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use steward_shared::{ScheduledStepRepresentation, TickReportRepresentation, WorkflowRepresentation};

use super::clock::Clock;
use super::executor::{ExecutionMode, WorkflowExecutor};
use super::model::{ResourceType, Workflow, WorkflowTrigger};
use super::repository::WorkflowRepository;
use super::selector::SelectorRegistry;
use super::state::{BindingKey, ScheduledStep, WorkflowBinding, WorkflowStateStore};
use super::steps::{StepContext, StepOutcome, StepRegistry};
use super::triggers::ResourceEvent;
use crate::error::{WorkflowError, WorkflowResult};
use crate::jobs::scheduler::TaskScheduler;
use crate::jobs::workflow_task::{task_name, workflow_task};
use crate::services::identity::{Realm, RealmRegistry, Resource, UserProvider};
use crate::services::notifier::Notifier;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of each workflow's recurring task
    pub tick_interval: std::time::Duration,
    /// Offset applied to a binding after a failed or timed out step
    pub retry_delay: Duration,
    /// How long a claimed binding stays invisible to other ticks
    pub claim_lease: Duration,
    pub evaluate_before_step: bool,
    /// Max due bindings handled per tick
    pub due_batch_size: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: std::time::Duration::from_secs(60),
            retry_delay: Duration::minutes(5),
            claim_lease: Duration::minutes(10),
            evaluate_before_step: true,
            due_batch_size: 500,
        }
    }
}

/// Collaborators the engine is wired to
pub struct EngineServices {
    pub repository: Arc<dyn WorkflowRepository>,
    pub state: Arc<dyn WorkflowStateStore>,
    pub realms: Arc<dyn RealmRegistry>,
    pub users: Arc<dyn UserProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub scheduler: Arc<dyn TaskScheduler>,
    pub clock: Arc<dyn Clock>,
}

/// What one tick did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub paused: bool,
    pub bound: u32,
    pub claimed: u32,
    pub dispatched: u32,
    pub skipped: u32,
    pub failed: u32,
}

impl TickReport {
    fn paused() -> Self {
        Self {
            paused: true,
            ..Self::default()
        }
    }

    pub fn to_representation(&self) -> TickReportRepresentation {
        TickReportRepresentation {
            paused: self.paused,
            bound: self.bound,
            claimed: self.claimed,
            dispatched: self.dispatched,
            skipped: self.skipped,
            failed: self.failed,
        }
    }
}

pub struct WorkflowEngine {
    config: EngineConfig,
    repository: Arc<dyn WorkflowRepository>,
    state: Arc<dyn WorkflowStateStore>,
    realms: Arc<dyn RealmRegistry>,
    users: Arc<dyn UserProvider>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    selectors: SelectorRegistry,
    steps: Arc<StepRegistry>,
    executor: WorkflowExecutor,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    this: Weak<WorkflowEngine>,
}

impl WorkflowEngine {
    pub fn new(services: EngineServices, config: EngineConfig, executor: WorkflowExecutor) -> Arc<Self> {
        let selectors = SelectorRegistry::with_users(services.users.clone());
        let steps = Arc::new(StepRegistry::new(services.users.clone(), services.notifier));

        Arc::new_cyclic(|this| Self {
            config,
            repository: services.repository,
            state: services.state,
            realms: services.realms,
            users: services.users,
            scheduler: services.scheduler,
            clock: services.clock,
            selectors,
            steps,
            executor,
            shutdown: CancellationToken::new(),
            event_loop: Mutex::new(None),
            this: this.clone(),
        })
    }

    // ===== Definitions =====

    pub async fn create_workflow(&self, realm_id: Uuid, rep: &WorkflowRepresentation) -> WorkflowResult<Workflow> {
        self.require_realm(realm_id).await?;

        let workflow = Workflow::from_representation(realm_id, Uuid::new_v4(), rep, self.clock.now())?;
        self.validate(&workflow).await?;
        self.repository.create(&workflow).await?;

        info!("Created workflow {} ({}) in realm {}", workflow.name, workflow.id, realm_id);
        self.sync_task(&workflow).await?;
        Ok(workflow)
    }

    pub async fn update_workflow(
        &self,
        realm_id: Uuid,
        workflow_id: Uuid,
        rep: &WorkflowRepresentation,
    ) -> WorkflowResult<Workflow> {
        let existing = self.get_workflow(realm_id, workflow_id).await?;

        let mut workflow = Workflow::from_representation(realm_id, workflow_id, rep, existing.created_at)?;
        workflow.updated_at = Some(self.clock.now());
        self.validate(&workflow).await?;
        self.repository.update(&workflow).await?;

        match (existing.enabled, workflow.enabled) {
            (true, false) => info!("Workflow {} paused; bindings are kept", workflow_id),
            (false, true) => info!("Workflow {} resumed", workflow_id),
            _ => info!("Updated workflow {} in realm {}", workflow_id, realm_id),
        }

        self.sync_task(&workflow).await?;
        Ok(workflow)
    }

    pub async fn delete_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<()> {
        if !self.repository.delete(realm_id, workflow_id).await? {
            return Err(WorkflowError::NotFound("Workflow".to_string()));
        }

        self.scheduler.unregister(&task_name(workflow_id)).await?;
        self.cancel_workflow(realm_id, workflow_id).await?;

        info!("Deleted workflow {} in realm {}", workflow_id, realm_id);
        Ok(())
    }

    pub async fn get_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Workflow> {
        self.repository
            .get(realm_id, workflow_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound("Workflow".to_string()))
    }

    pub async fn find_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<Option<Workflow>> {
        self.repository.get(realm_id, workflow_id).await
    }

    pub async fn list_workflows(&self, realm_id: Uuid) -> WorkflowResult<Vec<Workflow>> {
        self.require_realm(realm_id).await?;
        self.repository.list(realm_id).await
    }

    pub async fn find_realm(&self, realm_id: Uuid) -> WorkflowResult<Option<Realm>> {
        self.realms.get_realm(realm_id).await
    }

    /// Pending bindings of a workflow with the step each one waits on
    pub async fn list_scheduled(
        &self,
        realm_id: Uuid,
        workflow_id: Uuid,
    ) -> WorkflowResult<Vec<ScheduledStepRepresentation>> {
        let workflow = self.get_workflow(realm_id, workflow_id).await?;
        let pending = self.state.list_pending(realm_id, workflow_id).await?;

        Ok(pending
            .iter()
            .map(|s| {
                let step_type = workflow.step(s.position).map_or("none", |step| step.step_type());
                s.to_representation(step_type)
            })
            .collect())
    }

    /// Runs a tick immediately, outside the recurring schedule
    pub async fn run_now(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<TickReport> {
        let workflow = self.get_workflow(realm_id, workflow_id).await?;
        self.tick(&workflow).await
    }

    async fn require_realm(&self, realm_id: Uuid) -> WorkflowResult<Realm> {
        self.realms
            .get_realm(realm_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound("Realm".to_string()))
    }

    async fn validate(&self, workflow: &Workflow) -> WorkflowResult<()> {
        self.selectors.get(workflow.resource_type)?;
        for condition in &workflow.conditions {
            condition.validate(workflow.realm_id, self.users.as_ref()).await?;
        }
        Ok(())
    }

    /// Registers the workflow's recurring task when it is schedulable, removes it otherwise
    async fn sync_task(&self, workflow: &Workflow) -> WorkflowResult<()> {
        let name = task_name(workflow.id);

        if workflow.is_schedulable() {
            let task = workflow_task(self.this.clone(), workflow.realm_id, workflow.id);
            self.scheduler.register(&name, self.config.tick_interval, task).await?;
        } else {
            self.scheduler.unregister(&name).await?;
        }
        Ok(())
    }

    /// Registers the recurring task of every enabled workflow of every realm
    pub async fn reschedule_all(&self) -> WorkflowResult<usize> {
        let mut registered = 0;

        for realm in self.realms.list_realms().await? {
            for workflow in self.repository.list(realm.id).await? {
                if workflow.is_schedulable() {
                    self.sync_task(&workflow).await?;
                    registered += 1;
                }
            }
        }

        info!("Rescheduled {} workflows", registered);
        Ok(registered)
    }

    // ===== Tick =====

    pub async fn tick(&self, workflow: &Workflow) -> WorkflowResult<TickReport> {
        if !workflow.enabled {
            debug!("Workflow {} is disabled; skipping tick", workflow.id);
            return Ok(TickReport::paused());
        }

        let mut report = TickReport::default();
        let now = self.clock.now();

        match self.bind_eligible(workflow, now).await {
            Ok(bound) => report.bound = bound,
            Err(e) => error!(
                "Selecting resources for workflow {} in realm {} failed: {}",
                workflow.id, workflow.realm_id, e
            ),
        }

        let due = self
            .state
            .find_due(workflow.realm_id, workflow.id, now, self.config.due_batch_size)
            .await?;

        let workflow = Arc::new(workflow.clone());
        for scheduled in due {
            if let Err(e) = self.process_due(&workflow, &scheduled, now, &mut report).await {
                report.failed += 1;
                error!(
                    "Failed to process resource {} in workflow {} (realm {}): {}",
                    scheduled.resource_id, workflow.id, workflow.realm_id, e
                );
            }
        }

        Ok(report)
    }

    async fn bind_eligible(&self, workflow: &Workflow, now: DateTime<Utc>) -> WorkflowResult<u32> {
        let selector = self.selectors.get(workflow.resource_type)?;
        let candidates = selector.find_eligible(workflow, workflow.batch_size).await?;
        let first_due = now + first_delay(workflow);

        let mut bound = 0;
        for resource_id in candidates {
            let binding = WorkflowBinding::new(resource_id, workflow, first_due, now);
            if self.state.bind(&binding).await? {
                debug!("Bound resource {} to workflow {}", resource_id, workflow.id);
                bound += 1;
            }
        }

        if bound > 0 {
            info!("Bound {} resources to workflow {} in realm {}", bound, workflow.id, workflow.realm_id);
        }
        Ok(bound)
    }

    async fn process_due(
        &self,
        workflow: &Arc<Workflow>,
        scheduled: &ScheduledStep,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> WorkflowResult<()> {
        let key = scheduled.key();
        let lease_until = now + self.config.claim_lease;

        if !self.state.claim(key, scheduled.position, scheduled.due_at, now, lease_until).await? {
            debug!("Resource {} in workflow {} was claimed elsewhere", key.resource_id, key.workflow_id);
            report.skipped += 1;
            return Ok(());
        }
        report.claimed += 1;

        if workflow.step(scheduled.position).is_none() {
            info!(
                "Resource {} is past the last step of workflow {}; marking complete",
                key.resource_id, workflow.id
            );
            self.state
                .advance(key, scheduled.position, scheduled.position, now, true)
                .await?;
            report.skipped += 1;
            return Ok(());
        }

        let selector = self.selectors.get(workflow.resource_type)?;
        let Some(resource) = selector.resolve(workflow.realm_id, key.resource_id).await? else {
            info!(
                "Resource {} no longer exists; removing its binding to workflow {}",
                key.resource_id, workflow.id
            );
            self.state.delete(key).await?;
            report.skipped += 1;
            return Ok(());
        };

        if self.config.evaluate_before_step && !workflow.matches(&resource) {
            info!(
                "Resource {} no longer matches workflow {}; unbinding",
                key.resource_id, workflow.id
            );
            self.state.delete(key).await?;
            report.skipped += 1;
            return Ok(());
        }

        report.dispatched += 1;
        if !self.dispatch(workflow, scheduled, resource).await {
            report.failed += 1;
        }
        Ok(())
    }

    /// Returns false only when the step is known to have failed
    async fn dispatch(&self, workflow: &Arc<Workflow>, scheduled: &ScheduledStep, resource: Resource) -> bool {
        let task = self.step_task(workflow, scheduled.position, resource);

        match self.executor.mode() {
            ExecutionMode::Blocking => {
                let result = self.executor.run_inline(task).await;
                self.complete(workflow, scheduled, result).await
            }
            ExecutionMode::Async => {
                let engine = self.this.clone();
                let workflow = workflow.clone();
                let scheduled = scheduled.clone();
                let label = format!(
                    "workflow {} step {} for resource {}",
                    workflow.id, scheduled.position, scheduled.resource_id
                );

                self.executor.submit(label, task, move |result| {
                    async move {
                        if let Some(engine) = engine.upgrade() {
                            engine.complete(&workflow, &scheduled, result).await;
                        }
                    }
                    .boxed()
                });
                true
            }
        }
    }

    fn step_task(
        &self,
        workflow: &Arc<Workflow>,
        position: usize,
        resource: Resource,
    ) -> impl Future<Output = WorkflowResult<StepOutcome>> + Send + 'static {
        let steps = self.steps.clone();
        let workflow = workflow.clone();

        async move {
            let step = workflow
                .step(position)
                .ok_or_else(|| WorkflowError::NotFound(format!("Step {}", position)))?;
            let ctx = StepContext {
                realm_id: workflow.realm_id,
                workflow_id: workflow.id,
                workflow_name: workflow.name.clone(),
                position,
            };
            steps.execute(&step.action, &ctx, &resource).await
        }
    }

    /// Applies the state transition for a finished step. Returns whether the step succeeded.
    async fn complete(
        &self,
        workflow: &Workflow,
        scheduled: &ScheduledStep,
        result: WorkflowResult<StepOutcome>,
    ) -> bool {
        let key = scheduled.key();
        let position = scheduled.position;
        let now = self.clock.now();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_retryable() => {
                warn!(
                    "Step {} of workflow {} failed for resource {} in realm {}: {}",
                    position, workflow.id, key.resource_id, workflow.realm_id, e
                );
                if let Err(e) = self.state.reschedule(key, now + self.config.retry_delay).await {
                    error!("Failed to schedule retry for resource {}: {}", key.resource_id, e);
                }
                return false;
            }
            Err(e) => {
                error!(
                    "Step {} of workflow {} cannot succeed for resource {} in realm {}; halting at this step: {}",
                    position, workflow.id, key.resource_id, workflow.realm_id, e
                );
                if let Err(e) = self.state.advance(key, position, position, now, true).await {
                    error!("Failed to halt binding of resource {}: {}", key.resource_id, e);
                }
                return false;
            }
        };

        let persisted = match outcome {
            StepOutcome::Continue => {
                let next = position + 1;
                match workflow.step(next) {
                    // next due is relative to when this step was due, not when it ran
                    Some(step) => {
                        self.state
                            .advance(key, position, next, scheduled.due_at + step.after, false)
                            .await
                    }
                    None => {
                        info!("Resource {} completed workflow {}", key.resource_id, workflow.id);
                        self.state.advance(key, position, next, now, true).await
                    }
                }
            }
            StepOutcome::Restart { position: target } => {
                let after = workflow.step(target).map_or_else(Duration::zero, |s| s.after);
                info!(
                    "Restarting resource {} in workflow {} at position {}",
                    key.resource_id, workflow.id, target
                );
                self.state.advance(key, position, target, now + after, false).await
            }
            StepOutcome::ResourceRemoved => self
                .state
                .delete_by_resource(workflow.realm_id, key.resource_id)
                .await
                .map(|_| true),
        };

        match persisted {
            Ok(true) => {}
            Ok(false) => debug!(
                "Binding of resource {} to workflow {} changed while its step ran",
                key.resource_id, workflow.id
            ),
            Err(e) => error!(
                "Failed to record step {} of workflow {} for resource {}: {}",
                position, workflow.id, key.resource_id, e
            ),
        }
        true
    }

    // ===== Bindings =====

    /// Binds one resource outside the periodic scan. A first step with no
    /// delay runs inline before this returns.
    pub async fn bind(&self, workflow: &Workflow, resource_id: Uuid) -> WorkflowResult<bool> {
        if !workflow.is_schedulable() {
            return Ok(false);
        }

        let key = BindingKey::new(resource_id, workflow.id);
        if self.state.get(key).await?.is_some() {
            return Ok(false);
        }

        let selector = self.selectors.get(workflow.resource_type)?;
        let Some(resource) = selector.resolve(workflow.realm_id, resource_id).await? else {
            return Ok(false);
        };
        if !workflow.matches(&resource) {
            return Ok(false);
        }

        let now = self.clock.now();
        let delay = first_delay(workflow);
        let binding = WorkflowBinding::new(resource_id, workflow, now + delay, now);
        if !self.state.bind(&binding).await? {
            return Ok(false);
        }
        info!("Bound resource {} to workflow {} in realm {}", resource_id, workflow.id, workflow.realm_id);

        if delay.is_zero()
            && self
                .state
                .claim(key, 0, binding.scheduled_at, now, now + self.config.claim_lease)
                .await?
        {
            let workflow = Arc::new(workflow.clone());
            let scheduled = binding.to_scheduled();
            let result = self.executor.run_inline(self.step_task(&workflow, 0, resource)).await;
            self.complete(&workflow, &scheduled, result).await;
        }

        Ok(true)
    }

    pub async fn handle_event(&self, event: ResourceEvent) -> WorkflowResult<()> {
        debug!("Handling {:?}", event);

        let trigger = event.trigger();
        match (event, trigger) {
            (
                ResourceEvent::ResourceCreated { realm_id, resource_type, resource_id }
                | ResourceEvent::ResourceUpdated { realm_id, resource_type, resource_id },
                Some(trigger),
            ) => self.bind_triggered(trigger, realm_id, resource_type, resource_id).await,
            (ResourceEvent::ResourceRemoved { realm_id, resource_id, .. }, _) => {
                self.cancel_resource(realm_id, resource_id).await.map(|_| ())
            }
            (ResourceEvent::RealmRemoved { realm_id }, _) => self.remove_realm(realm_id).await,
            (event, None) => {
                debug!("Event {:?} fires no workflow trigger", event);
                Ok(())
            }
        }
    }

    async fn bind_triggered(
        &self,
        trigger: WorkflowTrigger,
        realm_id: Uuid,
        resource_type: ResourceType,
        resource_id: Uuid,
    ) -> WorkflowResult<()> {
        let workflows = self.repository.list(realm_id).await?;

        for workflow in workflows
            .iter()
            .filter(|w| w.enabled && w.trigger == trigger && w.resource_type == resource_type)
        {
            if let Err(e) = self.bind(workflow, resource_id).await {
                error!(
                    "Failed to bind resource {} to workflow {} in realm {}: {}",
                    resource_id, workflow.id, realm_id, e
                );
            }
        }
        Ok(())
    }

    /// Drops every binding of the workflow; the definition is left alone
    pub async fn cancel_workflow(&self, realm_id: Uuid, workflow_id: Uuid) -> WorkflowResult<u64> {
        let removed = self.state.delete_by_workflow(realm_id, workflow_id).await?;
        info!("Cancelled {} bindings of workflow {}", removed, workflow_id);
        Ok(removed)
    }

    /// Unbinds one resource from one workflow. The resource itself is untouched.
    pub async fn cancel_binding(&self, realm_id: Uuid, resource_id: Uuid, workflow_id: Uuid) -> WorkflowResult<bool> {
        let key = BindingKey::new(resource_id, workflow_id);
        let cancelled = match self.state.get(key).await? {
            Some(binding) if binding.realm_id == realm_id => self.state.delete(key).await?,
            _ => false,
        };
        if cancelled {
            info!("Cancelled binding of resource {} to workflow {}", resource_id, workflow_id);
        }
        Ok(cancelled)
    }

    pub async fn cancel_resource(&self, realm_id: Uuid, resource_id: Uuid) -> WorkflowResult<u64> {
        let removed = self.state.delete_by_resource(realm_id, resource_id).await?;
        if removed > 0 {
            info!("Removed {} bindings of deleted resource {}", removed, resource_id);
        }
        Ok(removed)
    }

    /// Moves a binding to `position`, due after that step's delay
    pub async fn restart(
        &self,
        realm_id: Uuid,
        resource_id: Uuid,
        workflow_id: Uuid,
        position: usize,
    ) -> WorkflowResult<()> {
        let workflow = self.get_workflow(realm_id, workflow_id).await?;
        let step = workflow.step(position).ok_or_else(|| {
            WorkflowError::invalid(format!(
                "position {} is outside workflow {} ({} steps)",
                position,
                workflow_id,
                workflow.steps.len()
            ))
        })?;

        let key = BindingKey::new(resource_id, workflow_id);
        let binding = self
            .state
            .get(key)
            .await?
            .filter(|b| b.realm_id == realm_id)
            .ok_or_else(|| WorkflowError::NotFound("Binding".to_string()))?;

        let due = self.clock.now() + step.after;
        self.state.advance(key, binding.position, position, due, false).await?;
        info!("Restarted resource {} in workflow {} at position {}", resource_id, workflow_id, position);
        Ok(())
    }

    pub async fn remove_realm(&self, realm_id: Uuid) -> WorkflowResult<()> {
        let removed = self.repository.delete_by_realm(realm_id).await?;
        for workflow_id in &removed {
            self.scheduler.unregister(&task_name(*workflow_id)).await?;
        }
        let bindings = self.state.delete_by_realm(realm_id).await?;

        info!(
            "Removed realm {}: {} workflows, {} bindings",
            realm_id,
            removed.len(),
            bindings
        );
        Ok(())
    }

    // ===== Lifecycle =====

    /// Registers every workflow's task and starts consuming `events`
    pub async fn start(&self, mut events: mpsc::Receiver<ResourceEvent>) -> WorkflowResult<()> {
        self.reschedule_all().await?;

        let engine = self.this.clone();
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(engine) = engine.upgrade() else { break };
                        if let Err(e) = engine.handle_event(event).await {
                            error!("Failed to handle resource event: {}", e);
                        }
                    }
                }
            }
            debug!("Workflow event loop stopped");
        });

        *self.event_loop.lock().await = Some(handle);
        info!("Workflow engine started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.event_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Workflow event loop ended abnormally: {}", e);
            }
        }
        info!("Workflow engine stopped");
    }

    /// Waits for steps running in the background
    pub async fn drain(&self) {
        self.executor.drain().await;
    }
}

fn first_delay(workflow: &Workflow) -> Duration {
    workflow.step(0).map_or_else(Duration::zero, |s| s.after)
}
