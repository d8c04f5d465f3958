use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::warn;

use crate::directory::{TenantStore, TenantStoreFactory};
use crate::domain::tenant::{Admission, OperationKind, Tenant, TenantId};
use crate::resolver::ResolutionError;

tokio::task_local! {
    static CURRENT_TENANT: TenantContext;
}

/// Resolved tenant plus a live handle to its store, valid for one request.
#[derive(Clone)]
pub struct TenantContext {
    tenant: Arc<Tenant>,
    store: Arc<dyn TenantStore>,
}

impl fmt::Debug for TenantContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantContext")
            .field("tenant_id", &self.tenant.id)
            .field("database_name", &self.store.database_name())
            .finish()
    }
}

impl TenantContext {
    pub fn new(tenant: Tenant, store: Arc<dyn TenantStore>) -> Self {
        Self { tenant: Arc::new(tenant), store }
    }

    pub fn tenant(&self) -> &Tenant {
        &self.tenant
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant.id
    }

    pub fn database_name(&self) -> &str {
        self.store.database_name()
    }

    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.store
    }

    /// Unknown operation names are disabled.
    pub fn is_operation_enabled(&self, name: &str) -> bool {
        self.tenant.features.is_enabled_by_name(name)
    }

    pub fn is_enabled(&self, kind: OperationKind) -> bool {
        self.tenant.features.is_enabled(kind)
    }

    /// Runs `future` with this context installed. The slot is released when the
    /// future completes, panics, or is dropped before completion.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TENANT.scope(self, future).await
    }

    /// Context of the request driving the current task, if one is installed.
    pub fn current() -> Option<TenantContext> {
        CURRENT_TENANT.try_with(Clone::clone).ok()
    }

    pub fn with_current<R>(f: impl FnOnce(Option<&TenantContext>) -> R) -> R {
        let current = Self::current();
        f(current.as_ref())
    }
}

/// Carries the caller's context into `future`, typically one about to be
/// handed to `tokio::spawn`. The context is captured now, not when polled.
pub fn propagate<F>(future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let context = TenantContext::current();
    async move {
        match context {
            Some(context) => context.scope(future).await,
            None => future.await,
        }
    }
}

/// Status gate between resolution and request handling.
pub struct TenantAdmission {
    stores: Arc<dyn TenantStoreFactory>,
}

impl TenantAdmission {
    pub fn new(stores: Arc<dyn TenantStoreFactory>) -> Self {
        Self { stores }
    }

    /// Builds the request context for a serviceable tenant.
    pub async fn admit(&self, tenant: Tenant) -> Result<TenantContext, ResolutionError> {
        match tenant.status.admission() {
            Admission::Admitted => {}
            Admission::TemporarilyUnavailable => {
                warn!(
                    event_name = "tenant.admission.rejected",
                    tenant_id = %tenant.id,
                    status = tenant.status.as_str(),
                    "tenant not yet serviceable"
                );
                return Err(ResolutionError::TemporarilyUnavailable {
                    tenant_id: tenant.id,
                    status: tenant.status,
                });
            }
            Admission::Unavailable => {
                warn!(
                    event_name = "tenant.admission.rejected",
                    tenant_id = %tenant.id,
                    status = tenant.status.as_str(),
                    reason = tenant.status_reason.as_deref().unwrap_or(""),
                    "tenant not active"
                );
                let reason = tenant
                    .status_reason
                    .clone()
                    .unwrap_or_else(|| "Tenant is not active".to_owned());
                return Err(ResolutionError::Unavailable {
                    tenant_id: tenant.id,
                    status: tenant.status,
                    reason,
                });
            }
        }

        let store = self
            .stores
            .open(&tenant.database_name)
            .await
            .map_err(ResolutionError::StoreUnavailable)?;
        Ok(TenantContext::new(tenant, store))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;

    use super::{propagate, TenantAdmission, TenantContext};
    use crate::directory::{InMemoryTenantStoreFactory, TenantStoreFactory};
    use crate::domain::tenant::{FeatureMap, OperationKind, Tenant, TenantStatus};
    use crate::resolver::ResolutionError;

    async fn context_for(factory: &InMemoryTenantStoreFactory, id: &str) -> TenantContext {
        let tenant =
            Tenant::provisioned(id, id, id, "tenant_").with_status(TenantStatus::Active, None);
        let store = factory.open(&tenant.database_name).await.expect("open store");
        TenantContext::new(tenant, store)
    }

    #[tokio::test]
    async fn slot_is_empty_outside_scope_and_after_it() {
        let factory = InMemoryTenantStoreFactory::default();
        let context = context_for(&factory, "acme").await;

        assert!(TenantContext::current().is_none());
        let seen = context.scope(async { TenantContext::current().map(|c| c.tenant_id().clone()) });
        assert_eq!(seen.await.map(|id| id.0), Some("acme".to_owned()));
        assert!(TenantContext::current().is_none());
    }

    #[tokio::test]
    async fn slot_is_released_when_the_handler_panics() {
        let factory = InMemoryTenantStoreFactory::default();
        let context = context_for(&factory, "acme").await;

        let outcome = std::panic::AssertUnwindSafe(context.scope(async {
            assert!(TenantContext::current().is_some());
            panic!("handler blew up");
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert!(TenantContext::current().is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_never_observe_each_others_context() {
        let factory = Arc::new(InMemoryTenantStoreFactory::default());
        let mut handles = Vec::new();

        for round in 0..8 {
            for id in ["acme", "globex", "initech"] {
                let context = context_for(&factory, id).await;
                handles.push(tokio::spawn(context.scope(async move {
                    for step in 0..5_u64 {
                        tokio::time::sleep(Duration::from_millis((step * 7 + round) % 4)).await;
                        tokio::task::yield_now().await;
                        let current = TenantContext::current().expect("context installed");
                        assert_eq!(current.tenant_id().0, id);
                        assert_eq!(current.database_name(), format!("tenant_{id}"));
                    }
                    id
                })));
            }
        }

        for handle in handles {
            handle.await.expect("request task");
        }
        assert!(TenantContext::current().is_none());
    }

    #[tokio::test]
    async fn propagate_carries_context_into_spawned_tasks() {
        let factory = InMemoryTenantStoreFactory::default();
        let context = context_for(&factory, "globex").await;

        let seen = context
            .scope(async {
                let bare = tokio::spawn(async { TenantContext::current().is_some() });
                let carried = tokio::spawn(propagate(async {
                    TenantContext::current().map(|c| c.tenant_id().0.clone())
                }));
                (bare.await.expect("join"), carried.await.expect("join"))
            })
            .await;

        assert_eq!(seen, (false, Some("globex".to_owned())));
    }

    #[tokio::test]
    async fn with_current_sees_none_outside_a_request() {
        assert!(TenantContext::with_current(|context| context.is_none()));

        let factory = InMemoryTenantStoreFactory::default();
        let context = context_for(&factory, "acme").await;
        let inside = context
            .scope(async { TenantContext::with_current(|c| c.map(|c| c.tenant_id().0.clone())) })
            .await;
        assert_eq!(inside.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn feature_lookup_fails_closed() {
        let factory = InMemoryTenantStoreFactory::default();
        let tenant = Tenant::provisioned("acme", "Acme", "acme", "tenant_")
            .with_status(TenantStatus::Active, None)
            .with_features(FeatureMap::new().with(OperationKind::Triage, true));
        let store = factory.open(&tenant.database_name).await.expect("open");
        let context = TenantContext::new(tenant, store);

        assert!(context.is_operation_enabled("triage"));
        assert!(context.is_enabled(OperationKind::Triage));
        assert!(!context.is_operation_enabled("medical_coding"));
        assert!(!context.is_operation_enabled("does_not_exist"));
    }

    #[tokio::test]
    async fn admission_gates_on_status_and_surfaces_reason() {
        let admission = TenantAdmission::new(Arc::new(InMemoryTenantStoreFactory::default()));
        let base = Tenant::provisioned("acme", "Acme", "acme", "tenant_");

        let active = admission.admit(base.clone().with_status(TenantStatus::Active, None)).await;
        assert_eq!(active.expect("admitted").database_name(), "tenant_acme");

        let migrating =
            admission.admit(base.clone().with_status(TenantStatus::Migrating, None)).await;
        assert!(matches!(migrating, Err(ResolutionError::TemporarilyUnavailable { .. })));

        let provisioning = admission.admit(base.clone()).await;
        assert!(matches!(provisioning, Err(ResolutionError::TemporarilyUnavailable { .. })));

        let suspended = admission
            .admit(base.clone().with_status(TenantStatus::Suspended, Some("billing overdue")))
            .await;
        assert!(matches!(
            suspended,
            Err(ResolutionError::Unavailable { ref reason, .. }) if reason == "billing overdue"
        ));

        let deactivated = admission.admit(base.with_status(TenantStatus::Deactivated, None)).await;
        assert!(matches!(
            deactivated,
            Err(ResolutionError::Unavailable { ref reason, .. }) if reason == "Tenant is not active"
        ));
    }
}
