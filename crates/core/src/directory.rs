use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::audit::{AuditLogStore, InMemoryAuditLogStore};
use crate::domain::audit::Page;
use crate::domain::tenant::{Tenant, TenantId, TenantStatus};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("conflicting record: {0}")]
    Conflict(String),
    #[error("invalid database name `{0}`; expected [A-Za-z0-9_-]+")]
    InvalidDatabaseName(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored record could not be decoded: {0}")]
    Decode(String),
}

/// Read/write access to the platform's tenant records.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError>;
    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>, StoreError>;
    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, StoreError>;
    async fn save(&self, tenant: Tenant) -> Result<(), StoreError>;
    /// Returns `false` when no tenant has this id. Tenants are never deleted;
    /// retiring one moves it to `Deactivated`.
    async fn update_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;
    async fn increment_operation_count(
        &self,
        id: &TenantId,
        by: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn list(
        &self,
        status: Option<TenantStatus>,
        page: Page,
    ) -> Result<Vec<Tenant>, StoreError>;
}

/// Live handle to one tenant's isolated data store.
#[async_trait]
pub trait TenantStore: Send + Sync {
    fn database_name(&self) -> &str;
    fn audit_log(&self) -> Arc<dyn AuditLogStore>;
    async fn ping(&self) -> Result<(), StoreError>;
    /// Lets store-aware operations reach the concrete backend.
    fn as_any(&self) -> &dyn Any;
}

/// Opens the store named by a tenant's `database_name`. Distinct names never
/// share a store.
#[async_trait]
pub trait TenantStoreFactory: Send + Sync {
    async fn open(&self, database_name: &str) -> Result<Arc<dyn TenantStore>, StoreError>;
}

pub fn validate_database_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidDatabaseName(name.to_owned()))
    }
}

#[derive(Default)]
pub struct InMemoryTenantDirectory {
    tenants: RwLock<HashMap<String, Tenant>>,
}

impl InMemoryTenantDirectory {
    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let tenants = tenants.into_iter().map(|tenant| (tenant.id.0.clone(), tenant)).collect();
        Self { tenants: RwLock::new(tenants) }
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(&id.0).cloned())
    }

    async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .values()
            .find(|tenant| tenant.subdomain.eq_ignore_ascii_case(subdomain))
            .cloned())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, StoreError> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .values()
            .find(|tenant| {
                tenant.primary_domain.as_deref().is_some_and(|own| own.eq_ignore_ascii_case(domain))
            })
            .cloned())
    }

    async fn save(&self, tenant: Tenant) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().await;
        let clash = tenants.values().find(|other| {
            other.id != tenant.id
                && (other.subdomain == tenant.subdomain
                    || other.database_name == tenant.database_name)
        });
        if let Some(other) = clash {
            return Err(StoreError::Conflict(format!(
                "tenant `{}` already owns subdomain `{}` or database `{}`",
                other.id, tenant.subdomain, tenant.database_name
            )));
        }
        tenants.insert(tenant.id.0.clone(), tenant);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut tenants = self.tenants.write().await;
        let Some(tenant) = tenants.get_mut(&id.0) else {
            return Ok(false);
        };
        tenant.status = status;
        tenant.status_reason = reason.map(str::to_owned);
        tenant.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_operation_count(
        &self,
        id: &TenantId,
        by: u64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().await;
        if let Some(tenant) = tenants.get_mut(&id.0) {
            tenant.usage.operation_count = tenant.usage.operation_count.saturating_add(by);
            tenant.usage.last_activity_at = Some(at);
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<TenantStatus>,
        page: Page,
    ) -> Result<Vec<Tenant>, StoreError> {
        let tenants = self.tenants.read().await;
        let mut matched: Vec<Tenant> = tenants
            .values()
            .filter(|tenant| status.map_or(true, |status| tenant.status == status))
            .cloned()
            .collect();
        matched.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(matched.into_iter().skip(page.offset as usize).take(page.limit as usize).collect())
    }
}

pub struct InMemoryTenantStore {
    database_name: String,
    audit_log: Arc<InMemoryAuditLogStore>,
}

impl InMemoryTenantStore {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            audit_log: Arc::new(InMemoryAuditLogStore::default()),
        }
    }

    pub fn audit_entries(&self) -> Arc<InMemoryAuditLogStore> {
        self.audit_log.clone()
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    fn database_name(&self) -> &str {
        &self.database_name
    }

    fn audit_log(&self) -> Arc<dyn AuditLogStore> {
        self.audit_log.clone()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
pub struct InMemoryTenantStoreFactory {
    stores: RwLock<HashMap<String, Arc<InMemoryTenantStore>>>,
}

impl InMemoryTenantStoreFactory {
    /// The concrete store behind `database_name`, creating it on first use.
    pub async fn store(&self, database_name: &str) -> Result<Arc<InMemoryTenantStore>, StoreError> {
        validate_database_name(database_name)?;
        if let Some(store) = self.stores.read().await.get(database_name) {
            return Ok(store.clone());
        }
        let mut stores = self.stores.write().await;
        let store = stores
            .entry(database_name.to_owned())
            .or_insert_with(|| Arc::new(InMemoryTenantStore::new(database_name)));
        Ok(store.clone())
    }
}

#[async_trait]
impl TenantStoreFactory for InMemoryTenantStoreFactory {
    async fn open(&self, database_name: &str) -> Result<Arc<dyn TenantStore>, StoreError> {
        let store: Arc<dyn TenantStore> = self.store(database_name).await?;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::{
        validate_database_name, InMemoryTenantDirectory, InMemoryTenantStore,
        InMemoryTenantStoreFactory, StoreError, TenantDirectory, TenantStoreFactory,
    };
    use crate::domain::audit::Page;
    use crate::domain::tenant::{Tenant, TenantId, TenantStatus};

    #[tokio::test]
    async fn directory_looks_up_by_every_routing_key() {
        let directory = InMemoryTenantDirectory::with_tenants([Tenant::provisioned(
            "acme",
            "Acme Health",
            "acme",
            "tenant_",
        )
        .with_primary_domain("portal.acmehealth.com")]);

        let by_id = directory.find_by_id(&TenantId("acme".to_owned())).await.expect("lookup");
        let by_sub = directory.find_by_subdomain("ACME").await.expect("lookup");
        let by_domain = directory.find_by_domain("portal.acmehealth.com").await.expect("lookup");

        assert!(by_id.is_some());
        assert_eq!(by_sub.map(|tenant| tenant.id), Some(TenantId("acme".to_owned())));
        assert_eq!(by_domain.map(|tenant| tenant.id), Some(TenantId("acme".to_owned())));
        assert!(directory.find_by_subdomain("globex").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn directory_rejects_shared_subdomain_or_database() {
        let directory = InMemoryTenantDirectory::default();
        directory.save(Tenant::provisioned("acme", "Acme", "acme", "tenant_")).await.expect("save");

        let mut clash = Tenant::provisioned("acme2", "Acme Two", "acme", "tenant_");
        assert!(matches!(directory.save(clash.clone()).await, Err(StoreError::Conflict(_))));

        clash.subdomain = "acme-two".to_owned();
        clash.database_name = "tenant_acme".to_owned();
        assert!(matches!(directory.save(clash).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn status_update_and_usage_counter_apply_in_place() {
        let directory = InMemoryTenantDirectory::with_tenants([Tenant::provisioned(
            "acme", "Acme", "acme", "tenant_",
        )]);
        let id = TenantId("acme".to_owned());

        assert!(directory
            .update_status(&id, TenantStatus::Suspended, Some("billing overdue"))
            .await
            .expect("update"));
        assert!(!directory
            .update_status(&TenantId("ghost".to_owned()), TenantStatus::Active, None)
            .await
            .expect("update"));

        let at = Utc::now();
        directory.increment_operation_count(&id, 1, at).await.expect("increment");
        directory.increment_operation_count(&id, 2, at).await.expect("increment");

        let tenant = directory.find_by_id(&id).await.expect("lookup").expect("tenant");
        assert_eq!(tenant.status, TenantStatus::Suspended);
        assert_eq!(tenant.status_reason.as_deref(), Some("billing overdue"));
        assert_eq!(tenant.usage.operation_count, 3);
        assert_eq!(tenant.usage.last_activity_at, Some(at));

        let suspended =
            directory.list(Some(TenantStatus::Suspended), Page::default()).await.expect("list");
        assert_eq!(suspended.len(), 1);
    }

    #[tokio::test]
    async fn factory_isolates_distinct_database_names() {
        let factory = InMemoryTenantStoreFactory::default();

        let acme = factory.store("tenant_acme").await.expect("open");
        let acme_again = factory.store("tenant_acme").await.expect("open");
        let globex = factory.store("tenant_globex").await.expect("open");

        assert!(Arc::ptr_eq(&acme, &acme_again));
        assert!(!Arc::ptr_eq(&acme, &globex));
        assert!(!Arc::ptr_eq(&acme.audit_entries(), &globex.audit_entries()));

        let opened = factory.open("tenant_globex").await.expect("open");
        assert_eq!(opened.database_name(), "tenant_globex");
        assert!(opened.as_any().downcast_ref::<InMemoryTenantStore>().is_some());
        assert!(matches!(
            factory.open("../escape").await,
            Err(StoreError::InvalidDatabaseName(_))
        ));
    }

    #[test]
    fn database_names_are_restricted_to_safe_characters() {
        assert!(validate_database_name("tenant_acme-01").is_ok());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("../etc/passwd").is_err());
        assert!(validate_database_name("tenant acme").is_err());
    }
}
