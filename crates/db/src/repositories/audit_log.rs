use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite};

use tenantry_core::audit::{AuditError, AuditLogStore};
use tenantry_core::domain::audit::{
    AuditFilter, AuditLogEntry, AuditLogId, AuditStats, Page, ReviewRecord,
};
use tenantry_core::domain::execution::{ExecutionId, ExecutionStatus};
use tenantry_core::domain::tenant::{OperationKind, TenantId};

use super::{
    column, format_timestamp, non_negative, parse_optional_timestamp, parse_timestamp,
    saturating_i64, RepositoryError,
};
use crate::DbPool;

const AUDIT_COLUMNS: &str = "id, execution_id, tenant_id, actor_id, operation, operation_version,
    status, input_json, output_json, confidence, needs_human_review, review_reason, error,
    duration_ms, retry_count, external_calls, tokens_used, cost_usd, executed_at,
    reviewed_by, reviewed_at, review_notes";

/// Audit log inside one tenant's store.
#[derive(Clone)]
pub struct SqlAuditLogRepository {
    pool: DbPool,
}

impl SqlAuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &AuditFilter) {
    query.push(" WHERE 1=1");
    if let Some(operation) = filter.operation {
        query.push(" AND operation = ").push_bind(operation.as_str());
    }
    if let Some(status) = filter.status {
        query.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(actor_id) = &filter.actor_id {
        query.push(" AND actor_id = ").push_bind(actor_id.clone());
    }
    if let Some(needs_review) = filter.needs_review {
        query.push(" AND needs_human_review = ").push_bind(needs_review);
    }
    match filter.reviewed {
        Some(true) => {
            query.push(" AND reviewed_by IS NOT NULL");
        }
        Some(false) => {
            query.push(" AND reviewed_by IS NULL");
        }
        None => {}
    }
    if let Some(from) = filter.executed_from {
        query.push(" AND executed_at >= ").push_bind(format_timestamp(from));
    }
    if let Some(to) = filter.executed_to {
        query.push(" AND executed_at <= ").push_bind(format_timestamp(to));
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditLogEntry, RepositoryError> {
    let operation: String = column(row, "operation")?;
    let operation = OperationKind::parse(&operation)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown operation `{operation}`")))?;
    let status: String = column(row, "status")?;
    let status = ExecutionStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown execution status `{status}`")))?;
    let input: String = column(row, "input_json")?;
    let input = serde_json::from_str(&input)
        .map_err(|e| RepositoryError::Decode(format!("input_json: {e}")))?;
    let output: Option<String> = column(row, "output_json")?;
    let output = output
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| RepositoryError::Decode(format!("output_json: {e}")))?;
    let executed_at: String = column(row, "executed_at")?;

    Ok(AuditLogEntry {
        id: AuditLogId(column(row, "id")?),
        execution_id: ExecutionId(column(row, "execution_id")?),
        tenant_id: TenantId(column(row, "tenant_id")?),
        actor_id: column(row, "actor_id")?,
        operation,
        operation_version: column(row, "operation_version")?,
        status,
        input,
        output,
        confidence: column(row, "confidence")?,
        needs_human_review: column(row, "needs_human_review")?,
        review_reason: column(row, "review_reason")?,
        error: column(row, "error")?,
        duration_ms: column(row, "duration_ms")?,
        retry_count: non_negative(column(row, "retry_count")?, "retry_count")?,
        external_calls: non_negative(column(row, "external_calls")?, "external_calls")?,
        tokens_used: non_negative(column(row, "tokens_used")?, "tokens_used")?,
        cost_usd: column(row, "cost_usd")?,
        executed_at: parse_timestamp(&executed_at)?,
        review: ReviewRecord {
            reviewed_by: column(row, "reviewed_by")?,
            reviewed_at: parse_optional_timestamp(column(row, "reviewed_at")?)?,
            review_notes: column(row, "review_notes")?,
        },
    })
}

#[async_trait]
impl AuditLogStore for SqlAuditLogRepository {
    async fn insert(&self, entry: AuditLogEntry) -> Result<AuditLogId, AuditError> {
        let input = serde_json::to_string(&entry.input)
            .map_err(|e| AuditError::Storage(format!("input: {e}")))?;
        let output = entry
            .output
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| AuditError::Storage(format!("output: {e}")))?;

        sqlx::query(
            "INSERT INTO audit_log (id, execution_id, tenant_id, actor_id, operation,
                                    operation_version, status, input_json, output_json,
                                    confidence, needs_human_review, review_reason, error,
                                    duration_ms, retry_count, external_calls, tokens_used,
                                    cost_usd, executed_at, reviewed_by, reviewed_at, review_notes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.execution_id.0)
        .bind(&entry.tenant_id.0)
        .bind(&entry.actor_id)
        .bind(entry.operation.as_str())
        .bind(&entry.operation_version)
        .bind(entry.status.as_str())
        .bind(input)
        .bind(output)
        .bind(entry.confidence)
        .bind(entry.needs_human_review)
        .bind(&entry.review_reason)
        .bind(&entry.error)
        .bind(entry.duration_ms)
        .bind(i64::from(entry.retry_count))
        .bind(i64::from(entry.external_calls))
        .bind(saturating_i64(entry.tokens_used))
        .bind(entry.cost_usd)
        .bind(format_timestamp(entry.executed_at))
        .bind(&entry.review.reviewed_by)
        .bind(entry.review.reviewed_at.map(format_timestamp))
        .bind(&entry.review.review_notes)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(entry.id)
    }

    async fn find(&self, id: &AuditLogId) -> Result<Option<AuditLogEntry>, AuditError> {
        let row = sqlx::query(&format!("SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_entry).transpose()?)
    }

    async fn list(
        &self,
        filter: &AuditFilter,
        page: Page,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {AUDIT_COLUMNS} FROM audit_log"));
        push_filter(&mut query, filter);
        query
            .push(" ORDER BY executed_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(page.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset));

        let rows = query.build().fetch_all(&self.pool).await.map_err(RepositoryError::from)?;
        Ok(rows.iter().map(row_to_entry).collect::<Result<Vec<_>, _>>()?)
    }

    async fn mark_reviewed(
        &self,
        id: &AuditLogId,
        reviewer: &str,
        notes: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<bool, AuditError> {
        let updated = sqlx::query(
            "UPDATE audit_log
             SET reviewed_by = ?, reviewed_at = ?, review_notes = ?
             WHERE id = ? AND reviewed_by IS NULL",
        )
        .bind(reviewer)
        .bind(format_timestamp(reviewed_at))
        .bind(notes)
        .bind(&id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(updated.rows_affected() == 1)
    }

    async fn aggregate(&self, filter: &AuditFilter) -> Result<AuditStats, AuditError> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) AS count,
                    COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS success_count,
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count,
                    COALESCE(AVG(confidence), 0.0) AS avg_confidence,
                    COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms,
                    COALESCE(SUM(cost_usd), 0.0) AS total_cost_usd,
                    COALESCE(SUM(tokens_used), 0) AS total_tokens,
                    COALESCE(SUM(needs_human_review), 0) AS needs_review_count
             FROM audit_log",
        );
        push_filter(&mut query, filter);

        let row = query.build().fetch_one(&self.pool).await.map_err(RepositoryError::from)?;
        let count: u64 = non_negative(column(&row, "count")?, "count")?;
        let success_count: u64 = non_negative(column(&row, "success_count")?, "success_count")?;
        let success_rate =
            if count == 0 { 0.0 } else { success_count as f64 / count as f64 * 100.0 };

        Ok(AuditStats {
            count,
            success_count,
            failed_count: non_negative(column(&row, "failed_count")?, "failed_count")?,
            success_rate,
            avg_confidence: column(&row, "avg_confidence")?,
            avg_duration_ms: column(&row, "avg_duration_ms")?,
            total_cost_usd: column(&row, "total_cost_usd")?,
            total_tokens: non_negative(column(&row, "total_tokens")?, "total_tokens")?,
            needs_review_count: non_negative(
                column(&row, "needs_review_count")?,
                "needs_review_count",
            )?,
        })
    }

    async fn count(&self, filter: &AuditFilter) -> Result<u64, AuditError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS count FROM audit_log");
        push_filter(&mut query, filter);

        let row = query.build().fetch_one(&self.pool).await.map_err(RepositoryError::from)?;
        Ok(non_negative(column(&row, "count")?, "count")?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use tenantry_core::audit::AuditLogStore;
    use tenantry_core::domain::audit::{AuditFilter, AuditLogEntry, AuditLogId, Page};
    use tenantry_core::domain::execution::{
        ErrorKind, ExecutionHeader, ExecutionId, ExecutionMetrics, ExecutionResult,
        ExecutionStatus, OperationOutcome,
    };
    use tenantry_core::domain::tenant::{OperationKind, TenantId};

    use super::SqlAuditLogRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlAuditLogRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_tenant(&pool).await.expect("migrations");
        SqlAuditLogRepository::new(pool)
    }

    fn header(operation: OperationKind, actor: &str, minutes_ago: i64) -> ExecutionHeader {
        ExecutionHeader {
            execution_id: ExecutionId::generate(),
            operation,
            operation_version: "1.0.0".to_owned(),
            tenant_id: Some(TenantId::from("acme")),
            actor_id: actor.to_owned(),
            started_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    fn succeeded(
        operation: OperationKind,
        actor: &str,
        confidence: f64,
        minutes_ago: i64,
    ) -> AuditLogEntry {
        let header = header(operation, actor, minutes_ago);
        let completed_at = header.started_at;
        let metrics = ExecutionMetrics {
            duration_ms: 120.0,
            tokens_used: 300,
            cost_usd: 0.02,
            ..ExecutionMetrics::default()
        };
        let result = ExecutionResult::succeeded(
            header,
            OperationOutcome::new(json!({"codes": ["J45.909"]}), confidence),
            metrics,
            0.85,
            completed_at,
        );
        AuditLogEntry::from_result(&result, TenantId::from("acme"), json!({"note": "wheezing"}))
    }

    fn failed(operation: OperationKind, minutes_ago: i64) -> AuditLogEntry {
        let header = header(operation, "batch", minutes_ago);
        let completed_at = header.started_at;
        let result: ExecutionResult<serde_json::Value> = ExecutionResult::unsuccessful(
            header,
            ExecutionStatus::Failed,
            ErrorKind::RetriesExhausted,
            "Operation failed after 3 retries: payer timeout",
            "Operation execution failed after retries",
            ExecutionMetrics { retry_count: 3, ..ExecutionMetrics::default() },
            completed_at,
        );
        AuditLogEntry::from_result(&result, TenantId::from("acme"), json!({}))
    }

    #[tokio::test]
    async fn insert_and_find_preserve_the_entry() {
        let repo = setup().await;
        let entry = succeeded(OperationKind::MedicalCoding, "coder-1", 0.91, 5);

        let id = repo.insert(entry.clone()).await.expect("insert");
        let found = repo.find(&id).await.expect("find").expect("present");

        assert_eq!(found.id, entry.id);
        assert_eq!(found.execution_id, entry.execution_id);
        assert_eq!(found.operation, OperationKind::MedicalCoding);
        assert_eq!(found.status, ExecutionStatus::Success);
        assert_eq!(found.input, json!({"note": "wheezing"}));
        assert_eq!(found.output, Some(json!({"codes": ["J45.909"]})));
        assert_eq!(found.tokens_used, 300);
        assert!(!found.review.is_reviewed());
        assert!(repo.find(&AuditLogId("missing".to_owned())).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_storage_error() {
        let repo = setup().await;
        let entry = succeeded(OperationKind::Triage, "nurse", 0.9, 1);

        repo.insert(entry.clone()).await.expect("first insert");
        assert!(repo.insert(entry).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_orders_newest_first_and_pages() {
        let repo = setup().await;
        let oldest = succeeded(OperationKind::MedicalCoding, "coder-1", 0.95, 30);
        let middle = succeeded(OperationKind::MedicalCoding, "coder-2", 0.50, 20);
        let newest = succeeded(OperationKind::MedicalCoding, "coder-1", 0.92, 10);
        let other = failed(OperationKind::PaymentPosting, 5);
        for entry in [&oldest, &middle, &newest, &other] {
            repo.insert(entry.clone()).await.expect("insert");
        }

        let coding = AuditFilter {
            operation: Some(OperationKind::MedicalCoding),
            ..AuditFilter::default()
        };
        let listed = repo.list(&coding, Page::default()).await.expect("list");
        let ids: Vec<_> = listed.iter().map(|entry| entry.id.clone()).collect();
        assert_eq!(ids, vec![newest.id.clone(), middle.id.clone(), oldest.id.clone()]);

        let paged = repo.list(&coding, Page::new(Some(1), Some(1))).await.expect("list");
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].id, middle.id);

        let by_actor = AuditFilter { actor_id: Some("coder-1".to_owned()), ..coding.clone() };
        assert_eq!(repo.count(&by_actor).await.expect("count"), 2);

        let needs_review = AuditFilter { needs_review: Some(true), ..AuditFilter::default() };
        assert_eq!(repo.count(&needs_review).await.expect("count"), 2);

        let window = AuditFilter {
            executed_from: Some(Utc::now() - Duration::minutes(25)),
            executed_to: Some(Utc::now() - Duration::minutes(7)),
            ..AuditFilter::default()
        };
        let in_window = repo.list(&window, Page::default()).await.expect("list");
        assert_eq!(in_window.len(), 2);
    }

    #[tokio::test]
    async fn first_reviewer_wins() {
        let repo = setup().await;
        let id = repo.insert(failed(OperationKind::ClaimsGeneration, 3)).await.expect("insert");

        let first = repo
            .mark_reviewed(&id, "dr-adams", Some("resubmitted"), Utc::now())
            .await
            .expect("review");
        let second =
            repo.mark_reviewed(&id, "dr-baker", None, Utc::now()).await.expect("review");
        let missing = repo
            .mark_reviewed(&AuditLogId("nope".to_owned()), "dr-adams", None, Utc::now())
            .await
            .expect("review");

        assert!(first);
        assert!(!second);
        assert!(!missing);
        let entry = repo.find(&id).await.expect("find").expect("present");
        assert_eq!(entry.review.reviewed_by.as_deref(), Some("dr-adams"));
        assert_eq!(entry.review.review_notes.as_deref(), Some("resubmitted"));
        assert!(entry.needs_human_review);

        let reviewed = AuditFilter { reviewed: Some(true), ..AuditFilter::default() };
        let unreviewed = AuditFilter { reviewed: Some(false), ..AuditFilter::default() };
        assert_eq!(repo.count(&reviewed).await.expect("count"), 1);
        assert_eq!(repo.count(&unreviewed).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn aggregate_matches_in_memory_statistics() {
        let repo = setup().await;
        let entries = vec![
            succeeded(OperationKind::Triage, "nurse", 0.9, 4),
            succeeded(OperationKind::Triage, "nurse", 0.6, 3),
            failed(OperationKind::Triage, 2),
            failed(OperationKind::PaymentPosting, 1),
        ];
        for entry in &entries {
            repo.insert(entry.clone()).await.expect("insert");
        }

        let triage =
            AuditFilter { operation: Some(OperationKind::Triage), ..AuditFilter::default() };
        let stats = repo.aggregate(&triage).await.expect("aggregate");
        let expected = tenantry_core::domain::audit::AuditStats::from_entries(
            entries.iter().filter(|entry| triage.matches(entry)),
        );

        assert_eq!(stats.count, 3);
        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.needs_review_count, expected.needs_review_count);
        assert_eq!(stats.total_tokens, 600);
        assert!((stats.success_rate - expected.success_rate).abs() < 1e-9);
        assert!((stats.avg_confidence - expected.avg_confidence).abs() < 1e-9);

        let empty = repo
            .aggregate(&AuditFilter {
                actor_id: Some("ghost".to_owned()),
                ..AuditFilter::default()
            })
            .await
            .expect("aggregate");
        assert_eq!(empty.count, 0);
        assert_eq!(empty.success_rate, 0.0);
    }
}
