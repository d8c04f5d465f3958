pub mod audit;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod directory;
pub mod domain;
pub mod errors;
pub mod execution_engine;
pub mod registry;
pub mod resolver;
pub mod retry;

pub use audit::{AuditError, AuditLogStore, AuditService, InMemoryAuditLogStore};
pub use cache::{CacheError, InMemoryTtlCache, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{propagate, TenantAdmission, TenantContext};
pub use directory::{
    InMemoryTenantDirectory, InMemoryTenantStore, InMemoryTenantStoreFactory, StoreError,
    TenantDirectory, TenantStore, TenantStoreFactory,
};
pub use domain::audit::{AuditFilter, AuditLogEntry, AuditLogId, AuditStats, Page};
pub use domain::execution::{
    ErrorKind, ExecutionId, ExecutionMetrics, ExecutionResult, ExecutionStatus, OperationMetrics,
    OperationOutcome,
};
pub use domain::tenant::{FeatureMap, OperationKind, Tenant, TenantId, TenantStatus, TenantUsage};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use execution_engine::{
    ExecutionEngine, ExecutionEngineConfig, Operation, OperationError, OperationPolicy,
};
pub use registry::{DynOperation, OperationRegistry, RegistryError};
pub use resolver::{ResolutionError, ResolutionRequest, ResolverSettings, TenantResolver};
pub use retry::{RetryClassify, RetryPolicy};
