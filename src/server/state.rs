use crate::db::executions::PgExecutionManager;
use crate::replication::adapter::AdapterRegistry;
use crate::replication::controller::ReplicationController;
use crate::replication::event::EventHandler;
use crate::replication::execution::{ExecutionManager, HookUpdater, InMemoryExecutionManager};
use crate::replication::flow::FlowContext;
use crate::replication::jobservice::{
    HttpJobServiceClient, HttpStatusReporter, JobBackend, LocalJobService, ReplicationJob,
    REPLICATION_JOB_NAME,
};
use crate::replication::policy::{PolicyStore, StaticPolicyStore};
use crate::replication::scheduler::Scheduler;
use crate::server::settings::{DatabaseSettings, JobServiceSettings, Settings};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;

/// Full state for HTTP server
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ReplicationController>,
    pub events: Arc<EventHandler>,
    /// Secret required on job status hooks, if configured
    pub hook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(controller: Arc<ReplicationController>, hook_secret: Option<String>) -> Self {
        Self {
            events: Arc::new(EventHandler::new(controller.clone())),
            controller,
            hook_secret: hook_secret.filter(|s| !s.is_empty()).map(Arc::from),
        }
    }

    /// Run database migrations
    async fn run_migrations(pool: &PgPool) -> Result<()> {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .context("Failed to run migrations")?;
        tracing::info!("Migrations completed successfully");
        Ok(())
    }

    async fn execution_manager(
        database: Option<&DatabaseSettings>,
    ) -> Result<Arc<dyn ExecutionManager>> {
        let Some(database) = database else {
            tracing::warn!("No database configured, executions are kept in memory only");
            return Ok(Arc::new(InMemoryExecutionManager::new()));
        };
        tracing::info!(
            "Connecting to PostgreSQL with {} max connections...",
            database.max_connections
        );
        let db_pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .connect(&database.url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        tracing::info!("Successfully connected to PostgreSQL");

        Self::run_migrations(&db_pool).await?;
        Ok(Arc::new(PgExecutionManager::new(db_pool)))
    }

    fn job_backend(
        settings: &Settings,
        adapters: Arc<AdapterRegistry>,
        http: reqwest::Client,
    ) -> Arc<dyn JobBackend> {
        match &settings.jobservice {
            JobServiceSettings::Remote { endpoint, secret } => {
                tracing::info!("Submitting replication jobs to {}", endpoint);
                Arc::new(HttpJobServiceClient::new(endpoint, secret, http))
            }
            local => {
                let config = local.local_config().unwrap_or_default();
                tracing::info!(
                    "Running replication jobs in process with {} workers",
                    config.max_workers
                );
                let reporter = Arc::new(HttpStatusReporter::new(
                    http,
                    settings.replication.hook_secret.clone(),
                ));
                Arc::new(
                    LocalJobService::new(config, reporter)
                        .with_runner(REPLICATION_JOB_NAME, Arc::new(ReplicationJob::new(adapters))),
                )
            }
        }
    }

    /// Initialize full state for HTTP server
    pub async fn new_for_server(settings: &Settings) -> Result<Self> {
        tracing::info!("Initializing AppState for HTTP server");

        let executions = Self::execution_manager(settings.database.as_ref()).await?;
        let client_options = settings.client_options();
        let http = client_options
            .http_client(false)
            .context("Failed to build HTTP client")?;
        let adapters = Arc::new(AdapterRegistry::with_defaults(client_options));
        tracing::info!("Registered adapters: {}", adapters.list().join(", "));

        let backend = Self::job_backend(settings, adapters.clone(), http);
        let scheduler = Arc::new(Scheduler::new(
            backend,
            &settings.server.public_url,
            settings.replication.submit_concurrency,
        ));

        let policies: Arc<dyn PolicyStore> = Arc::new(StaticPolicyStore::new(
            settings.policies().context("Invalid replication policies")?,
        ));
        let (hooks, _updater) = HookUpdater::spawn(executions.clone());

        let flow = FlowContext {
            adapters,
            executions,
            scheduler,
            local_registry: settings.local_registry(),
        };
        let controller = Arc::new(ReplicationController::new(flow, policies, hooks));
        Ok(Self::new(
            controller,
            settings.replication.hook_secret.clone(),
        ))
    }
}
