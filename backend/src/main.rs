use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use steward_backend::config::{Config, StorageBackend};
use steward_backend::jobs::CronTaskScheduler;
use steward_backend::services::{ChannelNotifier, EmailService, Notifier, RealmRegistry, UserProvider, WebhookNotifier};
use steward_backend::store::{MemoryStore, PostgresStore};
use steward_backend::workflows::{
    event_channel, EngineServices, SystemClock, WorkflowEngine, WorkflowExecutor, WorkflowRepository,
    WorkflowStateStore,
};
use steward_backend::{database, handlers, AppState};

const EVENT_BUFFER: usize = 1024;

struct Storage {
    repository: Arc<dyn WorkflowRepository>,
    state: Arc<dyn WorkflowStateStore>,
    realms: Arc<dyn RealmRegistry>,
    users: Arc<dyn UserProvider>,
}

impl Storage {
    fn from_store<S>(store: Arc<S>) -> Self
    where
        S: WorkflowRepository + WorkflowStateStore + RealmRegistry + UserProvider + 'static,
    {
        Self {
            repository: store.clone(),
            state: store.clone(),
            realms: store.clone(),
            users: store,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let (db_pool, storage) = match config.storage {
        StorageBackend::Postgres => {
            let pool = database::create_pool(&config.database_url).await?;
            database::migrate(&pool).await?;
            (Some(pool.clone()), Storage::from_store(Arc::new(PostgresStore::new(pool))))
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage; workflows and bindings are lost on restart");
            (None, Storage::from_store(Arc::new(MemoryStore::new())))
        }
    };

    let email: Option<Arc<dyn Notifier>> = match &config.smtp {
        Some(smtp) if smtp.is_configured() => Some(Arc::new(EmailService::new(smtp)?)),
        _ => {
            info!("SMTP not configured; email notifications will be logged");
            None
        }
    };
    let webhook = Arc::new(WebhookNotifier::new(config.workflow.task_timeout())?);
    let notifier = Arc::new(ChannelNotifier::new(email, webhook));

    let scheduler = Arc::new(CronTaskScheduler::new().await?);

    let executor = WorkflowExecutor::new(
        config.workflow.execution_mode,
        config.workflow.max_concurrent_steps,
        config.workflow.task_timeout(),
    );
    let engine = WorkflowEngine::new(
        EngineServices {
            repository: storage.repository,
            state: storage.state,
            realms: storage.realms,
            users: storage.users,
            notifier,
            scheduler: scheduler.clone(),
            clock: Arc::new(SystemClock),
        },
        config.workflow.engine_config(),
        executor,
    );

    let (publisher, events) = event_channel(EVENT_BUFFER);
    engine.start(events).await?;
    scheduler.start().await?;

    let app = handlers::router(Arc::new(AppState {
        engine: engine.clone(),
        db_pool,
        events: Some(publisher),
    }));

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    engine.stop().await;
    scheduler.shutdown().await?;
    engine.drain().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
}
