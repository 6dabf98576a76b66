use std::sync::Arc;

use accord_core::approvals::notice::NoticeError;
use accord_core::approvals::{ApprovalEngine, ApprovalProvider, InternalProvider, ProviderSet};
use accord_core::approvals::SyncService;
use accord_core::audit::{AuditSink, TracingAuditSink};
use accord_core::config::{AppConfig, ConfigError, LoadOptions};
use accord_core::notify::{LogNotifier, Notifier};
use accord_core::store::ApprovalStore;
use accord_db::{connect_with_config, migrations, DbPool, SqlApprovalStore};
use accord_eemp::{CallbackHandler, EempRuntime, EempSetupError};
use thiserror::Error;
use tracing::{info, warn};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<ApprovalEngine>,
    pub sync: Arc<SyncService>,
    /// Present only when the platform integration is enabled.
    pub callbacks: Option<Arc<CallbackHandler>>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("platform integration setup failed: {0}")]
    Eemp(#[from] EempSetupError),
    #[error(transparent)]
    Notices(#[from] NoticeError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        eemp_enabled = config.eemp.enabled,
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.database_ready",
        correlation_id = "bootstrap",
        "database connected and migrations applied"
    );

    let (providers, notifier, callbacks) = if config.eemp.enabled {
        let runtime = EempRuntime::from_config(&config.eemp)?;
        if !runtime.provider.probe().await {
            warn!(
                event_name = "system.bootstrap.eemp_unreachable",
                correlation_id = "bootstrap",
                "platform unreachable at startup; submissions use the internal provider"
            );
        }
        let external: Arc<dyn ApprovalProvider> = runtime.provider.clone();
        let notifier: Arc<dyn Notifier> = runtime.notifier.clone();
        (
            ProviderSet::new(Arc::new(InternalProvider), Some(external)),
            notifier,
            Some(runtime.callbacks.clone()),
        )
    } else {
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        (ProviderSet::internal_only(), notifier, None)
    };

    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let store: Arc<dyn ApprovalStore> = Arc::new(SqlApprovalStore::new(db_pool.clone()));
    let engine = Arc::new(
        ApprovalEngine::new(store, providers)
            .with_audit(audit.clone())
            .with_event_buffer(config.engine.event_buffer),
    );
    let sync = Arc::new(SyncService::new(engine.clone(), notifier)?.with_audit(audit));

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        external_provider = callbacks.is_some(),
        "approval engine assembled"
    );

    Ok(Application { config, db_pool, engine, sync, callbacks })
}
