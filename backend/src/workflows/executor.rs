// Workflow Executor - Bounded pool that runs steps inline or in the background

use futures::future::BoxFuture;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{WorkflowError, WorkflowResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Step runs on the caller's task
    Blocking,
    /// Step is handed to the pool and the caller proceeds
    #[default]
    Async,
}

impl FromStr for ExecutionMode {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blocking" | "sync" => Ok(ExecutionMode::Blocking),
            "async" => Ok(ExecutionMode::Async),
            other => Err(WorkflowError::invalid(format!("unknown execution mode '{}'", other))),
        }
    }
}

pub struct WorkflowExecutor {
    mode: ExecutionMode,
    task_timeout: Duration,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl WorkflowExecutor {
    pub fn new(mode: ExecutionMode, max_concurrent: usize, task_timeout: Duration) -> Self {
        Self {
            mode,
            task_timeout,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Background tasks not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Runs `task` to completion on the caller's task. No timeout applies.
    pub async fn run_inline<T, F>(&self, task: F) -> WorkflowResult<T>
    where
        F: Future<Output = WorkflowResult<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| WorkflowError::Scheduler("executor is closed".to_string()))?;
        task.await
    }

    /// Spawns `task` into the pool; `on_complete` receives its result. A task
    /// that outlives the timeout is detached and reported as `Timeout`.
    pub fn submit<T, F, C>(&self, label: String, task: F, on_complete: C)
    where
        T: Send + 'static,
        F: Future<Output = WorkflowResult<T>> + Send + 'static,
        C: FnOnce(WorkflowResult<T>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let task_timeout = self.task_timeout;

        self.tracker.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => {
                    let handle = tokio::spawn(task);
                    match tokio::time::timeout(task_timeout, handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => Err(WorkflowError::execution(format!(
                            "{} aborted: {}",
                            label, join_error
                        ))),
                        Err(_) => {
                            warn!("{} exceeded {:?}; abandoning it", label, task_timeout);
                            Err(WorkflowError::Timeout(task_timeout))
                        }
                    }
                }
                Err(_) => Err(WorkflowError::Scheduler("executor is closed".to_string())),
            };

            debug!("{} finished (ok: {})", label, result.is_ok());
            on_complete(result).await;
        });
    }

    /// Waits for every submitted task, then accepts work again
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
