// Job Scheduler - Recurring-task primitive that drives per-workflow ticks

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

impl From<JobError> for WorkflowError {
    fn from(err: JobError) -> Self {
        WorkflowError::Scheduler(err.to_string())
    }
}

/// Returned by a task run; `Cancel` deregisters the task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Continue,
    Cancel,
}

pub type ScheduledTask = Arc<dyn Fn() -> BoxFuture<'static, TaskOutcome> + Send + Sync>;

#[async_trait]
pub trait TaskScheduler: Send + Sync {
    /// Registers `task` to run every `interval` under `name`. Returns true when
    /// an existing task with that name was replaced.
    async fn register(&self, name: &str, interval: Duration, task: ScheduledTask) -> JobResult<bool>;
    async fn unregister(&self, name: &str) -> JobResult<bool>;
    async fn is_registered(&self, name: &str) -> bool;
}

/// tokio-cron-scheduler backed implementation
pub struct CronTaskScheduler {
    scheduler: TokioScheduler,
    jobs: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl CronTaskScheduler {
    pub async fn new() -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting workflow task scheduler");
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down workflow task scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        self.jobs.write().await.clear();
        Ok(())
    }

    pub async fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl TaskScheduler for CronTaskScheduler {
    async fn register(&self, name: &str, interval: Duration, task: ScheduledTask) -> JobResult<bool> {
        if interval.is_zero() {
            return Err(JobError::ConfigError(format!("task {} needs a non-zero interval", name)));
        }

        let jobs = self.jobs.clone();
        let job_name = name.to_string();

        let job = Job::new_repeated_async(interval, move |uuid, scheduler| {
            let task = task.clone();
            let jobs = jobs.clone();
            let job_name = job_name.clone();

            Box::pin(async move {
                if task().await == TaskOutcome::Cancel {
                    warn!("Task {} cancelled itself; deregistering", job_name);

                    let mut jobs = jobs.write().await;
                    if jobs.get(&job_name) == Some(&uuid) {
                        jobs.remove(&job_name);
                    }
                    drop(jobs);

                    if let Err(e) = scheduler.remove(&uuid).await {
                        error!("Failed to remove task {}: {}", job_name, e);
                    }
                }
            })
        })?;

        let mut jobs = self.jobs.write().await;
        let replaced = match jobs.remove(name) {
            Some(previous) => {
                self.scheduler.remove(&previous).await?;
                true
            }
            None => false,
        };

        let uuid = self.scheduler.add(job).await?;
        jobs.insert(name.to_string(), uuid);

        info!("Registered task {} every {:?}", name, interval);
        Ok(replaced)
    }

    async fn unregister(&self, name: &str) -> JobResult<bool> {
        let removed = self.jobs.write().await.remove(name);
        match removed {
            Some(uuid) => {
                self.scheduler.remove(&uuid).await?;
                info!("Unregistered task {}", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_registered(&self, name: &str) -> bool {
        self.jobs.read().await.contains_key(name)
    }
}

/// Scheduler whose tasks only run when fired explicitly
#[derive(Default)]
pub struct ManualTaskScheduler {
    tasks: RwLock<BTreeMap<String, (Duration, ScheduledTask)>>,
}

impl ManualTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the named task once. `None` when it is not registered.
    pub async fn fire(&self, name: &str) -> Option<TaskOutcome> {
        let task = self.tasks.read().await.get(name).map(|(_, task)| task.clone())?;
        let outcome = task().await;

        if outcome == TaskOutcome::Cancel {
            let mut tasks = self.tasks.write().await;
            if tasks.get(name).is_some_and(|(_, current)| Arc::ptr_eq(current, &task)) {
                tasks.remove(name);
            }
        }
        Some(outcome)
    }

    pub async fn fire_all(&self) -> Vec<(String, TaskOutcome)> {
        let names: Vec<String> = self.tasks.read().await.keys().cloned().collect();
        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            if let Some(outcome) = self.fire(&name).await {
                outcomes.push((name, outcome));
            }
        }
        outcomes
    }

    pub async fn interval(&self, name: &str) -> Option<Duration> {
        self.tasks.read().await.get(name).map(|(interval, _)| *interval)
    }

    pub async fn registered(&self) -> Vec<String> {
        self.tasks.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl TaskScheduler for ManualTaskScheduler {
    async fn register(&self, name: &str, interval: Duration, task: ScheduledTask) -> JobResult<bool> {
        Ok(self
            .tasks
            .write()
            .await
            .insert(name.to_string(), (interval, task))
            .is_some())
    }

    async fn unregister(&self, name: &str) -> JobResult<bool> {
        Ok(self.tasks.write().await.remove(name).is_some())
    }

    async fn is_registered(&self, name: &str) -> bool {
        self.tasks.read().await.contains_key(name)
    }
}
