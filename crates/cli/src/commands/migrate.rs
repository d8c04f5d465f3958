use tenantry_core::config::{AppConfig, LoadOptions};
use tenantry_core::directory::TenantDirectory;
use tenantry_core::domain::audit::{Page, MAX_PAGE_LIMIT};
use tenantry_db::{connect_with_settings, migrations, SqlTenantDirectory, SqliteTenantStoreFactory};

use crate::commands::{runtime, CommandResult};

type Failure = (&'static str, String, u8);

pub fn run(options: &LoadOptions) -> CommandResult {
    let config = match AppConfig::load(options.clone()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "migrate",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(migrate_all(&config)) {
        Ok(tenant_count) => CommandResult::success(
            "migrate",
            format!("applied platform migrations; migrated {tenant_count} tenant store(s)"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("migrate", error_class, message, exit_code)
        }
    }
}

/// Platform schema first, then every tenant's store, whatever its status.
async fn migrate_all(config: &AppConfig) -> Result<usize, Failure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_platform(&pool)
        .await
        .map_err(|error| ("migration", error.to_string(), 5u8))?;

    let directory = SqlTenantDirectory::new(pool.clone());
    let stores = SqliteTenantStoreFactory::new(
        &config.database.tenant_data_dir,
        config.database.max_connections,
        config.database.timeout_secs,
    );

    let mut migrated = 0;
    let mut offset = 0;
    loop {
        let page = directory
            .list(None, Page::new(Some(offset), Some(MAX_PAGE_LIMIT)))
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        for tenant in &page {
            let store = stores.store(&tenant.database_name).await.map_err(|error| {
                ("tenant_migration", format!("tenant `{}`: {error}", tenant.id), 6u8)
            })?;
            store.pool().close().await;
            migrated += 1;
        }
        if page.len() < MAX_PAGE_LIMIT as usize {
            break;
        }
        offset += MAX_PAGE_LIMIT;
    }

    pool.close().await;
    Ok(migrated)
}
