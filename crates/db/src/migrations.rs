use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

/// Schema of the platform database (tenant directory).
pub static PLATFORM_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/platform");

/// Schema applied to every tenant's isolated store.
pub static TENANT_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/tenant");

pub async fn run_platform(pool: &DbPool) -> Result<(), MigrateError> {
    PLATFORM_MIGRATOR.run(pool).await
}

pub async fn run_tenant(pool: &DbPool) -> Result<(), MigrateError> {
    TENANT_MIGRATOR.run(pool).await
}

/// Platform migrations embedded in this build that `pool` has not applied yet.
pub async fn pending_platform(pool: &DbPool) -> Result<usize, sqlx::Error> {
    let tracked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_sqlx_migrations'",
    )
    .fetch_one(pool)
    .await?;
    let applied: Vec<i64> = if tracked == 0 {
        Vec::new()
    } else {
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success = 1")
            .fetch_all(pool)
            .await?
    };

    Ok(PLATFORM_MIGRATOR
        .iter()
        .filter(|migration| !migration.migration_type.is_down_migration())
        .filter(|migration| !applied.contains(&migration.version))
        .count())
}
