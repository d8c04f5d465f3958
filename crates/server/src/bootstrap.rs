use std::sync::Arc;

use tenantry_core::cache::InMemoryTtlCache;
use tenantry_core::config::{AppConfig, ConfigError, LoadOptions};
use tenantry_core::context::TenantAdmission;
use tenantry_core::directory::TenantDirectory;
use tenantry_core::domain::tenant::Tenant;
use tenantry_core::execution_engine::{ExecutionEngine, ExecutionEngineConfig};
use tenantry_core::registry::OperationRegistry;
use tenantry_core::resolver::{ResolverSettings, TenantResolver};
use tenantry_db::{
    connect_with_settings, migrations, DbPool, SqlTenantDirectory, SqliteTenantStoreFactory,
};
use thiserror::Error;
use tracing::info;

use crate::routes::AppState;

pub struct Application {
    pub config: AppConfig,
    pub platform_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("platform database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("platform database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(
    options: LoadOptions,
    registry: OperationRegistry,
) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config, registry).await
}

/// Wires the platform database, tenant stores, resolver and engine around an
/// already-loaded config. Operations are supplied by the embedding binary.
pub async fn bootstrap_with_config(
    config: AppConfig,
    registry: OperationRegistry,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let platform_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "platform database connection established"
    );

    migrations::run_platform(&platform_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "platform migrations applied"
    );

    let directory: Arc<dyn TenantDirectory> =
        Arc::new(SqlTenantDirectory::new(platform_pool.clone()));
    let stores = Arc::new(SqliteTenantStoreFactory::new(
        &config.database.tenant_data_dir,
        config.database.max_connections,
        config.database.timeout_secs,
    ));
    let resolver = TenantResolver::new(
        directory.clone(),
        Arc::new(InMemoryTtlCache::<Tenant>::new()),
        ResolverSettings::from(&config.resolver),
    );
    let engine = ExecutionEngine::new(ExecutionEngineConfig::from(&config.engine), directory);

    info!(
        event_name = "system.bootstrap.ready",
        correlation_id = "bootstrap",
        operations = registry.len(),
        tenant_data_dir = %config.database.tenant_data_dir.display(),
        "application assembled"
    );

    let state = AppState::new(
        resolver,
        TenantAdmission::new(stores),
        engine,
        registry,
        &config.resolver.tenant_header,
    );
    Ok(Application { config, platform_pool, state })
}
