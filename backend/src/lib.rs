// Steward - Resource workflow engine for realm-scoped identity platforms

use std::sync::Arc;

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod services;
pub mod store;
pub mod workflows;

pub use error::{ApiError, ApiResult, AppError, WorkflowError, WorkflowResult};

#[cfg(test)]
mod tests;

pub struct AppState {
    pub engine: Arc<workflows::WorkflowEngine>,
    /// `None` when running on in-memory storage
    pub db_pool: Option<sqlx::PgPool>,
    /// Feeds the engine's event loop; `None` when the loop is not running
    pub events: Option<workflows::EventPublisher>,
}
