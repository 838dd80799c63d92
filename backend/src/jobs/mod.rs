// Background Jobs
//
// Recurring tasks that drive workflow ticks. Tasks are scheduled using
// tokio-cron-scheduler and run automatically at the configured interval.

pub mod scheduler;
pub mod workflow_task;

pub use scheduler::{CronTaskScheduler, JobError, JobResult, ManualTaskScheduler, ScheduledTask, TaskOutcome, TaskScheduler};
pub use workflow_task::{task_name, workflow_task};
