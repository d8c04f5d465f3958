use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::ResolverConfig;
use crate::directory::{StoreError, TenantDirectory};
use crate::domain::tenant::{Tenant, TenantId, TenantStatus};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("tenant not found")]
    NotFound,
    #[error("tenant `{tenant_id}` is temporarily unavailable while {}", .status.as_str())]
    TemporarilyUnavailable { tenant_id: TenantId, status: TenantStatus },
    #[error("tenant `{tenant_id}` is unavailable: {reason}")]
    Unavailable { tenant_id: TenantId, status: TenantStatus, reason: String },
    #[error("tenant directory failure: {0}")]
    Directory(StoreError),
    #[error("tenant store could not be opened: {0}")]
    StoreUnavailable(StoreError),
}

impl From<ResolutionError> for ApplicationError {
    fn from(error: ResolutionError) -> Self {
        match error {
            ResolutionError::NotFound => {
                Self::NotFound("Tenant not found. Please check your URL.".to_owned())
            }
            ResolutionError::TemporarilyUnavailable { status, .. } => Self::Unavailable(format!(
                "Service temporarily unavailable: tenant is {}",
                status.as_str()
            )),
            ResolutionError::Unavailable { reason, .. } => {
                Self::Unavailable(format!("Service temporarily unavailable: {reason}"))
            }
            ResolutionError::Directory(error) | ResolutionError::StoreUnavailable(error) => {
                Self::Persistence(error.to_string())
            }
        }
    }
}

/// The parts of an inbound request that can identify a tenant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionRequest {
    pub tenant_header: Option<String>,
    pub host: Option<String>,
}

impl ResolutionRequest {
    pub fn new(tenant_header: Option<&str>, host: Option<&str>) -> Self {
        Self {
            tenant_header: tenant_header
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned),
            host: host.map(str::to_owned),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupStrategy {
    Id,
    Subdomain,
    Domain,
}

impl LookupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Subdomain => "subdomain",
            Self::Domain => "domain",
        }
    }

    pub fn cache_key(&self, value: &str) -> String {
        format!("tenant:{}:{value}", self.as_str())
    }
}

impl fmt::Display for LookupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ResolverSettings {
    pub cache_ttl: Duration,
    pub reserved_subdomains: Vec<String>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self::from(&ResolverConfig {
            cache_ttl_secs: 300,
            tenant_header: "X-Tenant-ID".to_owned(),
            reserved_subdomains: vec!["www".to_owned(), "api".to_owned(), "admin".to_owned()],
        })
    }
}

impl From<&ResolverConfig> for ResolverSettings {
    fn from(config: &ResolverConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl(),
            reserved_subdomains: config
                .reserved_subdomains
                .iter()
                .map(|label| label.to_ascii_lowercase())
                .collect(),
        }
    }
}

/// Finds the tenant owning a request: explicit header id, then host
/// subdomain, then exact custom domain. First hit wins.
pub struct TenantResolver {
    directory: Arc<dyn TenantDirectory>,
    cache: Arc<dyn TtlCache<Tenant>>,
    settings: ResolverSettings,
}

impl TenantResolver {
    pub fn new(
        directory: Arc<dyn TenantDirectory>,
        cache: Arc<dyn TtlCache<Tenant>>,
        settings: ResolverSettings,
    ) -> Self {
        Self { directory, cache, settings }
    }

    pub async fn resolve(&self, request: &ResolutionRequest) -> Result<Tenant, ResolutionError> {
        for (strategy, value) in self.candidates(request) {
            if let Some(tenant) = self.lookup(strategy, &value).await? {
                info!(
                    event_name = "tenant.resolve.matched",
                    strategy = strategy.as_str(),
                    tenant_id = %tenant.id,
                    "tenant resolved"
                );
                return Ok(tenant);
            }
        }

        info!(
            event_name = "tenant.resolve.miss",
            tenant_header = request.tenant_header.as_deref().unwrap_or(""),
            host = request.host.as_deref().unwrap_or(""),
            "no tenant matched request"
        );
        Err(ResolutionError::NotFound)
    }

    /// Lookups to attempt, in priority order.
    pub fn candidates(&self, request: &ResolutionRequest) -> Vec<(LookupStrategy, String)> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(id) = &request.tenant_header {
            candidates.push((LookupStrategy::Id, id.clone()));
        }
        if let Some(host) = request.host.as_deref().and_then(normalize_host) {
            if let Some(subdomain) = extract_subdomain(&host, &self.settings.reserved_subdomains) {
                candidates.push((LookupStrategy::Subdomain, subdomain));
            }
            candidates.push((LookupStrategy::Domain, host));
        }
        candidates
    }

    async fn lookup(
        &self,
        strategy: LookupStrategy,
        value: &str,
    ) -> Result<Option<Tenant>, ResolutionError> {
        let key = strategy.cache_key(value);
        match self.cache.get(&key).await {
            Ok(Some(tenant)) => {
                debug!(
                    event_name = "tenant.resolve.cache_hit",
                    cache_key = %key,
                    "tenant cache hit"
                );
                return Ok(Some(tenant));
            }
            Ok(None) => {}
            Err(error) => warn!(
                event_name = "tenant.resolve.cache_failed",
                cache_key = %key,
                error = %error,
                "tenant cache read failed; falling back to directory"
            ),
        }

        let found = match strategy {
            LookupStrategy::Id => self.directory.find_by_id(&TenantId(value.to_owned())).await,
            LookupStrategy::Subdomain => self.directory.find_by_subdomain(value).await,
            LookupStrategy::Domain => self.directory.find_by_domain(value).await,
        }
        .map_err(ResolutionError::Directory)?;

        if let Some(tenant) = &found {
            let ttl = self.settings.cache_ttl;
            if let Err(error) = self.cache.insert(&key, tenant.clone(), ttl).await {
                warn!(
                    event_name = "tenant.resolve.cache_failed",
                    cache_key = %key,
                    error = %error,
                    "tenant cache write failed"
                );
            }
        }
        Ok(found)
    }
}

/// Lowercased host without port or trailing dot; `None` when nothing is left.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = raw.trim().to_ascii_lowercase();
    let host = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by `:port`.
        rest.split(']').next().unwrap_or_default().to_owned()
    } else if host.matches(':').count() == 1 {
        host.split(':').next().unwrap_or_default().to_owned()
    } else {
        host
    };
    let host = host.trim_end_matches('.');
    (!host.is_empty()).then(|| host.to_owned())
}

/// First label of a multi-label host, unless it is reserved or the host is
/// `localhost` or an IP literal.
pub fn extract_subdomain(host: &str, reserved: &[String]) -> Option<String> {
    if host == "localhost" || host.parse::<IpAddr>().is_ok() {
        return None;
    }
    let (label, rest) = host.split_once('.')?;
    let valid = !label.is_empty()
        && !rest.is_empty()
        && label.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if !valid || reserved.iter().any(|word| word == label) {
        return None;
    }
    Some(label.to_owned())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::{
        extract_subdomain, normalize_host, LookupStrategy, ResolutionError, ResolutionRequest,
        ResolverSettings, TenantResolver,
    };
    use crate::cache::{CacheError, InMemoryTtlCache, TtlCache};
    use crate::clock::ManualClock;
    use crate::directory::{InMemoryTenantDirectory, StoreError, TenantDirectory};
    use crate::domain::audit::Page;
    use crate::domain::tenant::{Tenant, TenantId, TenantStatus};
    use crate::errors::ApplicationError;

    /// Counts directory hits so cache behaviour is observable.
    struct CountingDirectory {
        inner: InMemoryTenantDirectory,
        lookups: AtomicUsize,
    }

    impl CountingDirectory {
        fn new(tenants: Vec<Tenant>) -> Self {
            Self {
                inner: InMemoryTenantDirectory::with_tenants(tenants),
                lookups: AtomicUsize::new(0),
            }
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TenantDirectory for CountingDirectory {
        async fn find_by_id(&self, id: &TenantId) -> Result<Option<Tenant>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_id(id).await
        }

        async fn find_by_subdomain(&self, subdomain: &str) -> Result<Option<Tenant>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_subdomain(subdomain).await
        }

        async fn find_by_domain(&self, domain: &str) -> Result<Option<Tenant>, StoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_domain(domain).await
        }

        async fn save(&self, tenant: Tenant) -> Result<(), StoreError> {
            self.inner.save(tenant).await
        }

        async fn update_status(
            &self,
            id: &TenantId,
            status: TenantStatus,
            reason: Option<&str>,
        ) -> Result<bool, StoreError> {
            self.inner.update_status(id, status, reason).await
        }

        async fn increment_operation_count(
            &self,
            id: &TenantId,
            by: u64,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.increment_operation_count(id, by, at).await
        }

        async fn list(
            &self,
            status: Option<TenantStatus>,
            page: Page,
        ) -> Result<Vec<Tenant>, StoreError> {
            self.inner.list(status, page).await
        }
    }

    struct BrokenCache;

    #[async_trait]
    impl TtlCache<Tenant> for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<Tenant>, CacheError> {
            Err(CacheError::Unavailable("connection refused".to_owned()))
        }

        async fn insert(
            &self,
            _key: &str,
            _value: Tenant,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_owned()))
        }

        async fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".to_owned()))
        }
    }

    fn tenants() -> Vec<Tenant> {
        vec![
            Tenant::provisioned("acme", "Acme Health", "acme", "tenant_")
                .with_status(TenantStatus::Active, None),
            Tenant::provisioned("globex", "Globex Clinic", "globex", "tenant_")
                .with_status(TenantStatus::Active, None)
                .with_primary_domain("care.globex.org"),
        ]
    }

    fn resolver_with(
        directory: Arc<CountingDirectory>,
        clock: ManualClock,
    ) -> TenantResolver {
        TenantResolver::new(
            directory,
            Arc::new(InMemoryTtlCache::with_clock(Arc::new(clock))),
            ResolverSettings::default(),
        )
    }

    #[tokio::test]
    async fn header_wins_over_host() {
        let directory = Arc::new(CountingDirectory::new(tenants()));
        let resolver = resolver_with(directory, ManualClock::default());

        let tenant = resolver
            .resolve(&ResolutionRequest::new(Some("globex"), Some("acme.example.com")))
            .await
            .expect("resolve");

        assert_eq!(tenant.id, TenantId("globex".to_owned()));
    }

    #[tokio::test]
    async fn unknown_header_falls_through_to_subdomain_then_domain() {
        let directory = Arc::new(CountingDirectory::new(tenants()));
        let resolver = resolver_with(directory, ManualClock::default());

        let by_subdomain = resolver
            .resolve(&ResolutionRequest::new(Some("nobody"), Some("ACME.example.com:8443")))
            .await
            .expect("resolve");
        assert_eq!(by_subdomain.id.0, "acme");

        let by_domain = resolver
            .resolve(&ResolutionRequest::new(None, Some("care.globex.org.")))
            .await
            .expect("resolve");
        assert_eq!(by_domain.id.0, "globex");
    }

    #[tokio::test]
    async fn miss_is_not_found_never_a_default_tenant() {
        let directory = Arc::new(CountingDirectory::new(tenants()));
        let resolver = resolver_with(directory, ManualClock::default());

        let result = resolver.resolve(&ResolutionRequest::new(None, Some("www.example.com"))).await;
        assert_eq!(result, Err(ResolutionError::NotFound));

        let empty = resolver.resolve(&ResolutionRequest::new(Some("  "), None)).await;
        assert_eq!(empty, Err(ResolutionError::NotFound));
    }

    #[tokio::test]
    async fn lookups_are_cached_until_ttl_expires() {
        let directory = Arc::new(CountingDirectory::new(tenants()));
        let clock = ManualClock::default();
        let resolver = resolver_with(directory.clone(), clock.clone());
        let request = ResolutionRequest::new(Some("acme"), None);

        resolver.resolve(&request).await.expect("resolve");
        resolver.resolve(&request).await.expect("resolve");
        assert_eq!(directory.lookups(), 1);

        // Status changes stay invisible until the entry ages out.
        directory
            .update_status(&TenantId("acme".to_owned()), TenantStatus::Suspended, Some("audit"))
            .await
            .expect("update");
        clock.advance(Duration::from_secs(299));
        assert_eq!(resolver.resolve(&request).await.expect("resolve").status, TenantStatus::Active);

        clock.advance(Duration::from_secs(1));
        assert_eq!(
            resolver.resolve(&request).await.expect("resolve").status,
            TenantStatus::Suspended
        );
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn broken_cache_degrades_to_directory_lookups() {
        let directory = Arc::new(CountingDirectory::new(tenants()));
        let resolver = TenantResolver::new(
            directory.clone(),
            Arc::new(BrokenCache),
            ResolverSettings::default(),
        );

        let tenant =
            resolver.resolve(&ResolutionRequest::new(Some("acme"), None)).await.expect("resolve");
        assert_eq!(tenant.id.0, "acme");
        assert_eq!(directory.lookups(), 1);
    }

    #[test]
    fn host_normalisation_strips_port_brackets_and_trailing_dot() {
        assert_eq!(normalize_host(" Acme.Example.com:8080 ").as_deref(), Some("acme.example.com"));
        assert_eq!(normalize_host("example.com.").as_deref(), Some("example.com"));
        assert_eq!(normalize_host("[::1]:3000").as_deref(), Some("::1"));
        assert_eq!(normalize_host("::1").as_deref(), Some("::1"));
        assert_eq!(normalize_host("   "), None);
    }

    #[test]
    fn subdomain_extraction_skips_reserved_local_and_ip_hosts() {
        let reserved = ResolverSettings::default().reserved_subdomains;

        assert_eq!(extract_subdomain("acme.example.com", &reserved).as_deref(), Some("acme"));
        assert_eq!(extract_subdomain("acme-2.example.com", &reserved).as_deref(), Some("acme-2"));
        assert_eq!(extract_subdomain("www.example.com", &reserved), None);
        assert_eq!(extract_subdomain("api.example.com", &reserved), None);
        assert_eq!(extract_subdomain("admin.example.com", &reserved), None);
        assert_eq!(extract_subdomain("localhost", &reserved), None);
        assert_eq!(extract_subdomain("127.0.0.1", &reserved), None);
        assert_eq!(extract_subdomain("::1", &reserved), None);
        assert_eq!(extract_subdomain("intranet", &reserved), None);
        assert_eq!(extract_subdomain("ac_me.example.com", &reserved), None);
    }

    #[test]
    fn cache_keys_carry_strategy_and_raw_value() {
        assert_eq!(LookupStrategy::Subdomain.cache_key("acme"), "tenant:subdomain:acme");
        assert_eq!(
            LookupStrategy::Domain.cache_key("care.globex.org"),
            "tenant:domain:care.globex.org"
        );
    }

    #[test]
    fn resolution_errors_map_onto_application_errors() {
        assert!(matches!(
            ApplicationError::from(ResolutionError::NotFound),
            ApplicationError::NotFound(_)
        ));
        let unavailable = ApplicationError::from(ResolutionError::Unavailable {
            tenant_id: TenantId("acme".to_owned()),
            status: TenantStatus::Suspended,
            reason: "billing overdue".to_owned(),
        });
        assert_eq!(
            unavailable,
            ApplicationError::Unavailable(
                "Service temporarily unavailable: billing overdue".to_owned()
            )
        );
    }
}
