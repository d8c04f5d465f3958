use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::tenant::{OperationKind, TenantId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Retrying,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Timeout | Self::Cancelled)
    }
}

/// Why a non-successful execution ended the way it did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Operation disabled for the tenant, or no tenant context.
    Configuration,
    /// Transient failures outlasted the retry budget.
    RetriesExhausted,
    /// Operation reported a non-retryable failure.
    Permanent,
    InvalidInput,
    Timeout,
    Cancelled,
    /// Panic or contract breach inside the operation.
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Permanent => "permanent",
            Self::InvalidInput => "invalid_input",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Unexpected => "unexpected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "configuration" => Some(Self::Configuration),
            "retries_exhausted" => Some(Self::RetriesExhausted),
            "permanent" => Some(Self::Permanent),
            "invalid_input" => Some(Self::InvalidInput),
            "timeout" => Some(Self::Timeout),
            "cancelled" => Some(Self::Cancelled),
            "unexpected" => Some(Self::Unexpected),
            _ => None,
        }
    }
}

/// Per-call figures reported by an operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    pub external_calls: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationOutcome<O> {
    pub output: O,
    pub confidence: f64,
    pub metrics: OperationMetrics,
}

impl<O> OperationOutcome<O> {
    pub fn new(output: O, confidence: f64) -> Self {
        Self { output, confidence, metrics: OperationMetrics::default() }
    }

    pub fn with_metrics(mut self, metrics: OperationMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: f64,
    pub retry_count: u32,
    pub external_calls: u32,
    pub tokens_used: u64,
    pub cost_usd: f64,
}

/// Identity of one invocation, shared by every result constructor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionHeader {
    pub execution_id: ExecutionId,
    pub operation: OperationKind,
    pub operation_version: String,
    pub tenant_id: Option<TenantId>,
    pub actor_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult<O> {
    pub execution_id: ExecutionId,
    pub operation: OperationKind,
    pub operation_version: String,
    pub status: ExecutionStatus,
    pub output: Option<O>,
    pub confidence: f64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub metrics: ExecutionMetrics,
    pub tenant_id: Option<TenantId>,
    pub actor_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub needs_human_review: bool,
    pub review_reason: Option<String>,
}

impl<O> ExecutionResult<O> {
    /// Successful result. Review is requested when `confidence` falls below `threshold`;
    /// a score equal to the threshold passes.
    pub fn succeeded(
        header: ExecutionHeader,
        outcome: OperationOutcome<O>,
        metrics: ExecutionMetrics,
        threshold: f64,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let needs_human_review = outcome.confidence < threshold;
        let review_reason = needs_human_review.then(|| {
            format!("Low confidence score: {} < {threshold}", outcome.confidence)
        });

        Self {
            execution_id: header.execution_id,
            operation: header.operation,
            operation_version: header.operation_version,
            status: ExecutionStatus::Success,
            output: Some(outcome.output),
            confidence: outcome.confidence,
            error: None,
            error_kind: None,
            metrics,
            tenant_id: header.tenant_id,
            actor_id: header.actor_id,
            started_at: header.started_at,
            completed_at,
            needs_human_review,
            review_reason,
        }
    }

    /// Any terminal outcome other than success. Always flagged for review.
    pub fn unsuccessful(
        header: ExecutionHeader,
        status: ExecutionStatus,
        kind: ErrorKind,
        error: impl Into<String>,
        review_reason: impl Into<String>,
        metrics: ExecutionMetrics,
        completed_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(status != ExecutionStatus::Success);
        Self {
            execution_id: header.execution_id,
            operation: header.operation,
            operation_version: header.operation_version,
            status,
            output: None,
            confidence: 0.0,
            error: Some(error.into()),
            error_kind: Some(kind),
            metrics,
            tenant_id: header.tenant_id,
            actor_id: header.actor_id,
            started_at: header.started_at,
            completed_at,
            needs_human_review: true,
            review_reason: Some(review_reason.into()),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn meets_confidence_threshold(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }

    pub fn header(&self) -> ExecutionHeader {
        ExecutionHeader {
            execution_id: self.execution_id.clone(),
            operation: self.operation,
            operation_version: self.operation_version.clone(),
            tenant_id: self.tenant_id.clone(),
            actor_id: self.actor_id.clone(),
            started_at: self.started_at,
        }
    }

    /// Same envelope around a separately produced output.
    pub fn with_output<P>(&self, output: Option<P>) -> ExecutionResult<P> {
        ExecutionResult {
            execution_id: self.execution_id.clone(),
            operation: self.operation,
            operation_version: self.operation_version.clone(),
            status: self.status,
            output,
            confidence: self.confidence,
            error: self.error.clone(),
            error_kind: self.error_kind,
            metrics: self.metrics,
            tenant_id: self.tenant_id.clone(),
            actor_id: self.actor_id.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            needs_human_review: self.needs_human_review,
            review_reason: self.review_reason.clone(),
        }
    }

    pub fn map_output<P>(self, f: impl FnOnce(O) -> P) -> ExecutionResult<P> {
        match self.try_map_output(|output| Ok::<P, std::convert::Infallible>(f(output))) {
            Ok(mapped) => mapped,
            Err(never) => match never {},
        }
    }

    pub fn try_map_output<P, E>(
        self,
        f: impl FnOnce(O) -> Result<P, E>,
    ) -> Result<ExecutionResult<P>, E> {
        let output = self.output.map(f).transpose()?;
        Ok(ExecutionResult {
            execution_id: self.execution_id,
            operation: self.operation,
            operation_version: self.operation_version,
            status: self.status,
            output,
            confidence: self.confidence,
            error: self.error,
            error_kind: self.error_kind,
            metrics: self.metrics,
            tenant_id: self.tenant_id,
            actor_id: self.actor_id,
            started_at: self.started_at,
            completed_at: self.completed_at,
            needs_human_review: self.needs_human_review,
            review_reason: self.review_reason,
        })
    }
}
