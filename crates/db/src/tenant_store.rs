use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use tenantry_core::audit::AuditLogStore;
use tenantry_core::directory::{
    validate_database_name, StoreError, TenantStore, TenantStoreFactory,
};

use crate::repositories::SqlAuditLogRepository;
use crate::{connect_file, migrations, ping, DbPool};

/// One tenant's isolated SQLite database.
pub struct SqliteTenantStore {
    database_name: String,
    pool: DbPool,
    audit_log: Arc<SqlAuditLogRepository>,
}

impl SqliteTenantStore {
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl TenantStore for SqliteTenantStore {
    fn database_name(&self) -> &str {
        &self.database_name
    }

    fn audit_log(&self) -> Arc<dyn AuditLogStore> {
        self.audit_log.clone()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        ping(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.database_name)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

type StoreSlot = Arc<OnceCell<Arc<SqliteTenantStore>>>;

/// Opens `<data_dir>/<database_name>.db`, migrating it on first open. Pools are
/// cached per name for the life of the factory.
///
/// The map lock only guards slot lookup. Connecting and migrating happen on the
/// name's own slot, so a slow first open never stalls other tenants.
pub struct SqliteTenantStoreFactory {
    data_dir: PathBuf,
    max_connections: u32,
    timeout_secs: u64,
    stores: RwLock<HashMap<String, StoreSlot>>,
}

impl SqliteTenantStoreFactory {
    pub fn new(data_dir: impl Into<PathBuf>, max_connections: u32, timeout_secs: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_connections,
            timeout_secs,
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database_path(&self, database_name: &str) -> PathBuf {
        self.data_dir.join(format!("{database_name}.db"))
    }

    pub async fn open_count(&self) -> usize {
        self.stores.read().await.values().filter(|slot| slot.initialized()).count()
    }

    pub async fn store(&self, database_name: &str) -> Result<Arc<SqliteTenantStore>, StoreError> {
        validate_database_name(database_name)?;
        let slot = self.slot(database_name).await;
        slot.get_or_try_init(|| async { self.connect(database_name).await.map(Arc::new) })
            .await
            .cloned()
    }

    async fn slot(&self, database_name: &str) -> StoreSlot {
        if let Some(slot) = self.stores.read().await.get(database_name) {
            return slot.clone();
        }
        self.stores.write().await.entry(database_name.to_owned()).or_default().clone()
    }

    async fn connect(&self, database_name: &str) -> Result<SqliteTenantStore, StoreError> {
        let unavailable = |e: &dyn std::fmt::Display| {
            StoreError::Unavailable(format!("tenant store `{database_name}`: {e}"))
        };

        tokio::fs::create_dir_all(&self.data_dir).await.map_err(|e| unavailable(&e))?;
        let path = self.database_path(database_name);
        let pool = connect_file(&path, self.max_connections, self.timeout_secs)
            .await
            .map_err(|e| unavailable(&e))?;
        migrations::run_tenant(&pool).await.map_err(|e| unavailable(&e))?;

        info!(
            event_name = "tenant.store.opened",
            database_name,
            path = %path.display(),
            "tenant store opened and migrated"
        );

        Ok(SqliteTenantStore {
            database_name: database_name.to_owned(),
            audit_log: Arc::new(SqlAuditLogRepository::new(pool.clone())),
            pool,
        })
    }
}

#[async_trait]
impl TenantStoreFactory for SqliteTenantStoreFactory {
    async fn open(&self, database_name: &str) -> Result<Arc<dyn TenantStore>, StoreError> {
        let store: Arc<dyn TenantStore> = self.store(database_name).await?;
        Ok(store)
    }
}
