pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod tenant_store;

pub use connection::{connect, connect_file, connect_with_settings, ping, DbPool};
pub use repositories::{RepositoryError, SqlAuditLogRepository, SqlTenantDirectory};
pub use tenant_store::{SqliteTenantStore, SqliteTenantStoreFactory};
