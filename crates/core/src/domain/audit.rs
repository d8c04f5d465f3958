use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::{ExecutionId, ExecutionResult, ExecutionStatus};
use crate::domain::tenant::{OperationKind, TenantId};

pub const DEFAULT_PAGE_LIMIT: u32 = 100;
pub const MAX_PAGE_LIMIT: u32 = 500;

/// Shares its value with the execution it records.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditLogId(pub String);

impl From<&ExecutionId> for AuditLogId {
    fn from(id: &ExecutionId) -> Self {
        Self(id.0.clone())
    }
}

/// Set once by an explicit review action; empty until then.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_notes: Option<String>,
}

impl ReviewRecord {
    pub fn is_reviewed(&self) -> bool {
        self.reviewed_by.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditLogId,
    pub execution_id: ExecutionId,
    pub tenant_id: TenantId,
    pub actor_id: String,
    pub operation: OperationKind,
    pub operation_version: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub confidence: f64,
    pub needs_human_review: bool,
    pub review_reason: Option<String>,
    pub error: Option<String>,
    pub duration_ms: f64,
    pub retry_count: u32,
    pub external_calls: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub executed_at: DateTime<Utc>,
    pub review: ReviewRecord,
}

impl AuditLogEntry {
    /// Projects a finished execution into an unreviewed entry. The output is taken
    /// as already encoded, so what is stored is exactly what the caller was served.
    pub fn from_result(
        result: &ExecutionResult<serde_json::Value>,
        tenant_id: TenantId,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: AuditLogId::from(&result.execution_id),
            execution_id: result.execution_id.clone(),
            tenant_id,
            actor_id: result.actor_id.clone(),
            operation: result.operation,
            operation_version: result.operation_version.clone(),
            status: result.status,
            input,
            output: result.output.clone(),
            confidence: result.confidence,
            needs_human_review: result.needs_human_review,
            review_reason: result.review_reason.clone(),
            error: result.error.clone(),
            duration_ms: result.metrics.duration_ms,
            retry_count: result.metrics.retry_count,
            external_calls: result.metrics.external_calls,
            tokens_used: result.metrics.tokens_used,
            cost_usd: result.metrics.cost_usd,
            executed_at: result.started_at,
            review: ReviewRecord::default(),
        }
    }
}

/// Every field narrows the result set; `None` means unconstrained.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub operation: Option<OperationKind>,
    pub status: Option<ExecutionStatus>,
    pub actor_id: Option<String>,
    pub needs_review: Option<bool>,
    pub reviewed: Option<bool>,
    pub executed_from: Option<DateTime<Utc>>,
    pub executed_to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.operation.map_or(true, |operation| entry.operation == operation)
            && self.status.map_or(true, |status| entry.status == status)
            && self.actor_id.as_deref().map_or(true, |actor| entry.actor_id == actor)
            && self.needs_review.map_or(true, |flag| entry.needs_human_review == flag)
            && self.reviewed.map_or(true, |flag| entry.review.is_reviewed() == flag)
            && self.executed_from.map_or(true, |from| entry.executed_at >= from)
            && self.executed_to.map_or(true, |to| entry.executed_at <= to)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: DEFAULT_PAGE_LIMIT }
    }
}

impl Page {
    /// Clamps the limit into `1..=MAX_PAGE_LIMIT`; a missing limit takes the default.
    pub fn new(offset: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            offset: offset.unwrap_or(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub count: u64,
    pub success_count: u64,
    pub failed_count: u64,
    /// Percentage in `0.0..=100.0`; zero when nothing matched.
    pub success_rate: f64,
    pub avg_confidence: f64,
    pub avg_duration_ms: f64,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub needs_review_count: u64,
}

impl AuditStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a AuditLogEntry>) -> Self {
        let mut stats = Self::default();
        let mut confidence_sum = 0.0;
        let mut duration_sum = 0.0;

        for entry in entries {
            stats.count += 1;
            match entry.status {
                ExecutionStatus::Success => stats.success_count += 1,
                ExecutionStatus::Failed => stats.failed_count += 1,
                _ => {}
            }
            if entry.needs_human_review {
                stats.needs_review_count += 1;
            }
            confidence_sum += entry.confidence;
            duration_sum += entry.duration_ms;
            stats.total_cost_usd += entry.cost_usd;
            stats.total_tokens += entry.tokens_used;
        }

        if stats.count > 0 {
            let count = stats.count as f64;
            stats.success_rate = stats.success_count as f64 / count * 100.0;
            stats.avg_confidence = confidence_sum / count;
            stats.avg_duration_ms = duration_sum / count;
        }
        stats
    }
}
