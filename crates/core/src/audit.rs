use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::domain::audit::{AuditFilter, AuditLogEntry, AuditLogId, AuditStats, Page};
use crate::domain::execution::ExecutionResult;
use crate::domain::tenant::TenantId;
use crate::errors::{ApplicationError, DomainError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit storage failure: {0}")]
    Storage(String),
    #[error("reviewer must not be empty")]
    MissingReviewer,
}

impl From<AuditError> for ApplicationError {
    fn from(error: AuditError) -> Self {
        match error {
            AuditError::Storage(message) => Self::Persistence(message),
            AuditError::MissingReviewer => {
                Self::Domain(DomainError::InvalidInput("reviewer must not be empty".to_owned()))
            }
        }
    }
}

/// Persistence for audit entries inside one tenant's store.
#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn insert(&self, entry: AuditLogEntry) -> Result<AuditLogId, AuditError>;
    async fn find(&self, id: &AuditLogId) -> Result<Option<AuditLogEntry>, AuditError>;
    /// Newest first.
    async fn list(&self, filter: &AuditFilter, page: Page)
        -> Result<Vec<AuditLogEntry>, AuditError>;
    /// Sets the review fields only when the entry exists and has no reviewer yet.
    async fn mark_reviewed(
        &self,
        id: &AuditLogId,
        reviewer: &str,
        notes: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool, AuditError>;
    async fn aggregate(&self, filter: &AuditFilter) -> Result<AuditStats, AuditError>;
    async fn count(&self, filter: &AuditFilter) -> Result<u64, AuditError>;
}

#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn AuditLogStore>,
    clock: Arc<dyn Clock>,
}

impl AuditService {
    pub fn new(store: Arc<dyn AuditLogStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn AuditLogStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn record(
        &self,
        result: &ExecutionResult<serde_json::Value>,
        input: serde_json::Value,
        tenant_id: TenantId,
    ) -> Result<AuditLogId, AuditError> {
        let entry = AuditLogEntry::from_result(result, tenant_id, input);
        self.store.insert(entry).await
    }

    pub async fn list(
        &self,
        filter: &AuditFilter,
        page: Page,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.store.list(filter, page).await
    }

    pub async fn get(&self, id: &AuditLogId) -> Result<Option<AuditLogEntry>, AuditError> {
        self.store.find(id).await
    }

    /// Records the first reviewer of an entry. Returns `false` when the entry is
    /// missing or already carries a review; earlier review fields are kept.
    pub async fn mark_reviewed(
        &self,
        id: &AuditLogId,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<bool, AuditError> {
        let reviewer = reviewer.trim();
        if reviewer.is_empty() {
            return Err(AuditError::MissingReviewer);
        }

        let notes = notes.map(str::trim).filter(|notes| !notes.is_empty());
        let updated = self.store.mark_reviewed(id, reviewer, notes, self.clock.now()).await?;
        info!(
            event_name = "audit.review.marked",
            log_id = %id.0,
            reviewer,
            updated,
            "audit review requested"
        );
        Ok(updated)
    }

    pub async fn aggregate(&self, filter: &AuditFilter) -> Result<AuditStats, AuditError> {
        self.store.aggregate(filter).await
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<u64, AuditError> {
        self.store.count(filter).await
    }
}

#[derive(Default)]
pub struct InMemoryAuditLogStore {
    entries: RwLock<Vec<AuditLogEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditLogStore {
    /// While set, every call fails with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn entries(&self) -> Vec<AuditLogEntry> {
        self.entries.read().await.clone()
    }

    fn check_available(&self) -> Result<(), AuditError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Storage("in-memory audit store is failing".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl AuditLogStore for InMemoryAuditLogStore {
    async fn insert(&self, entry: AuditLogEntry) -> Result<AuditLogId, AuditError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(AuditError::Storage(format!("audit log `{}` already exists", entry.id.0)));
        }
        let id = entry.id.clone();
        entries.push(entry);
        Ok(id)
    }

    async fn find(&self, id: &AuditLogId) -> Result<Option<AuditLogEntry>, AuditError> {
        self.check_available()?;
        Ok(self.entries.read().await.iter().find(|entry| entry.id == *id).cloned())
    }

    async fn list(
        &self,
        filter: &AuditFilter,
        page: Page,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditLogEntry> =
            entries.iter().filter(|entry| filter.matches(entry)).cloned().collect();
        matched.sort_by(|left, right| right.executed_at.cmp(&left.executed_at));
        Ok(matched.into_iter().skip(page.offset as usize).take(page.limit as usize).collect())
    }

    async fn mark_reviewed(
        &self,
        id: &AuditLogId,
        reviewer: &str,
        notes: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool, AuditError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|entry| entry.id == *id) else {
            return Ok(false);
        };
        if entry.review.is_reviewed() {
            return Ok(false);
        }
        entry.review.reviewed_by = Some(reviewer.to_owned());
        entry.review.reviewed_at = Some(reviewed_at);
        entry.review.review_notes = notes.map(str::to_owned);
        Ok(true)
    }

    async fn aggregate(&self, filter: &AuditFilter) -> Result<AuditStats, AuditError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(AuditStats::from_entries(entries.iter().filter(|entry| filter.matches(entry))))
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64, AuditError> {
        self.check_available()?;
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|entry| filter.matches(entry)).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::{AuditError, AuditLogStore, AuditService, InMemoryAuditLogStore};
    use crate::domain::audit::{AuditFilter, AuditLogId, Page};
    use crate::domain::execution::{
        ErrorKind, ExecutionHeader, ExecutionId, ExecutionMetrics, ExecutionResult,
        ExecutionStatus, OperationOutcome,
    };
    use crate::domain::tenant::{OperationKind, TenantId};

    fn header(operation: OperationKind, actor: &str, minutes_ago: i64) -> ExecutionHeader {
        ExecutionHeader {
            execution_id: ExecutionId::generate(),
            operation,
            operation_version: "1.0.0".to_owned(),
            tenant_id: Some(TenantId("acme".to_owned())),
            actor_id: actor.to_owned(),
            started_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn succeeded(
        operation: OperationKind,
        actor: &str,
        confidence: f64,
        minutes_ago: i64,
    ) -> ExecutionResult<serde_json::Value> {
        ExecutionResult::succeeded(
            header(operation, actor, minutes_ago),
            OperationOutcome::new(serde_json::json!({"ok": true}), confidence),
            ExecutionMetrics { duration_ms: 12.0, cost_usd: 0.01, ..Default::default() },
            0.85,
            Utc::now(),
        )
    }

    fn failed(operation: OperationKind, minutes_ago: i64) -> ExecutionResult<serde_json::Value> {
        ExecutionResult::unsuccessful(
            header(operation, "system", minutes_ago),
            ExecutionStatus::Failed,
            ErrorKind::RetriesExhausted,
            "upstream unavailable",
            "Operation failed",
            ExecutionMetrics { retry_count: 3, ..Default::default() },
            Utc::now(),
        )
    }

    async fn seeded() -> (Arc<InMemoryAuditLogStore>, AuditService, Vec<AuditLogId>) {
        let store = Arc::new(InMemoryAuditLogStore::default());
        let service = AuditService::new(store.clone());
        let tenant = TenantId("acme".to_owned());
        let mut ids = Vec::new();
        for result in [
            succeeded(OperationKind::MedicalCoding, "coder-1", 0.95, 30),
            succeeded(OperationKind::MedicalCoding, "coder-2", 0.60, 20),
            failed(OperationKind::InsuranceVerification, 10),
        ] {
            ids.push(
                service
                    .record(&result, serde_json::json!({"claim": 1}), tenant.clone())
                    .await
                    .expect("record"),
            );
        }
        (store, service, ids)
    }

    #[tokio::test]
    async fn list_filters_and_orders_newest_first() {
        let (_, service, ids) = seeded().await;

        let all = service.list(&AuditFilter::default(), Page::default()).await.expect("list");
        assert_eq!(all.iter().map(|entry| entry.id.clone()).collect::<Vec<_>>(), vec![
            ids[2].clone(),
            ids[1].clone(),
            ids[0].clone()
        ]);

        let coding_needing_review = AuditFilter {
            operation: Some(OperationKind::MedicalCoding),
            needs_review: Some(true),
            ..AuditFilter::default()
        };
        let listed = service.list(&coding_needing_review, Page::default()).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].actor_id, "coder-2");

        let paged = service.list(&AuditFilter::default(), Page::new(Some(1), Some(1))).await;
        assert_eq!(paged.expect("list")[0].id, ids[1]);
    }

    #[tokio::test]
    async fn first_reviewer_wins() {
        let (_, service, ids) = seeded().await;

        let reviewed = service
            .mark_reviewed(&ids[1], "dr-lee", Some("coded correctly"))
            .await
            .expect("review");
        assert!(reviewed);
        let overridden =
            service.mark_reviewed(&ids[1], "dr-kim", Some("override")).await.expect("review");
        assert!(!overridden);

        let entry = service.get(&ids[1]).await.expect("get").expect("entry exists");
        assert_eq!(entry.review.reviewed_by.as_deref(), Some("dr-lee"));
        assert_eq!(entry.review.review_notes.as_deref(), Some("coded correctly"));
        assert!(entry.review.reviewed_at.is_some());
        assert!(entry.needs_human_review, "review marking does not clear the flag");
    }

    #[tokio::test]
    async fn review_of_missing_entry_returns_false_and_blank_reviewer_is_rejected() {
        let (_, service, ids) = seeded().await;

        let missing = AuditLogId("missing".to_owned());
        assert!(!service.mark_reviewed(&missing, "dr-lee", None).await.expect("review"));
        assert_eq!(
            service.mark_reviewed(&ids[0], "   ", None).await,
            Err(AuditError::MissingReviewer)
        );
    }

    #[tokio::test]
    async fn aggregate_and_count_respect_filters() {
        let (_, service, _) = seeded().await;

        let stats = service.aggregate(&AuditFilter::default()).await.expect("aggregate");
        assert_eq!(stats.count, 3);
        assert_eq!(stats.needs_review_count, 2);
        assert!((stats.success_rate - 200.0 / 3.0).abs() < 1e-9);

        let failed_only =
            AuditFilter { status: Some(ExecutionStatus::Failed), ..AuditFilter::default() };
        assert_eq!(service.count(&failed_only).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_storage_error_and_keeps_the_original() {
        let (store, _, ids) = seeded().await;
        let mut replay = store.find(&ids[0]).await.expect("find").expect("entry");
        let original_actor = replay.actor_id.clone();
        replay.actor_id = "intruder".to_owned();

        let result = store.insert(replay).await;

        assert!(matches!(result, Err(AuditError::Storage(_))));
        let kept = store.find(&ids[0]).await.expect("find").expect("entry");
        assert_eq!(kept.actor_id, original_actor);
        assert_eq!(store.count(&AuditFilter::default()).await.expect("count"), 3);
    }

    #[tokio::test]
    async fn failing_store_surfaces_storage_error() {
        let (store, service, _) = seeded().await;
        store.set_failing(true);

        let result = service.list(&AuditFilter::default(), Page::default()).await;
        assert!(matches!(result, Err(AuditError::Storage(_))));

        store.set_failing(false);
        assert_eq!(store.count(&AuditFilter::default()).await.expect("count"), 3);
    }
}
