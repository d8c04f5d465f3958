//! Execution engine
//!
//! Runs one tenant-scoped operation with bounded retries, an overall deadline,
//! cooperative cancellation and a confidence gate, then records the outcome in
//! the tenant's audit log.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audit::AuditService;
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, EngineConfig};
use crate::context::TenantContext;
use crate::directory::TenantDirectory;
use crate::domain::execution::{
    ErrorKind, ExecutionHeader, ExecutionId, ExecutionMetrics, ExecutionResult, ExecutionStatus,
    OperationOutcome,
};
use crate::domain::tenant::OperationKind;
use crate::retry::{with_retry, RetryClassify, RetryPolicy};

/// Failure reported by an operation body.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OperationError {
    /// Worth another attempt (upstream hiccup, rate limit, lock timeout).
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

impl RetryClassify for OperationError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Per-operation overrides of the engine-wide retry budget and deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationPolicy {
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

/// A unit of tenant-scoped work the engine can run.
#[async_trait]
pub trait Operation: Send + Sync {
    type Input: Serialize + Send + Sync;
    type Output: Serialize + Send + Sync;

    fn kind(&self) -> OperationKind;

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn policy(&self) -> OperationPolicy {
        OperationPolicy::default()
    }

    /// One attempt. May be invoked again after a transient failure.
    async fn run(
        &self,
        input: &Self::Input,
        context: &TenantContext,
    ) -> Result<OperationOutcome<Self::Output>, OperationError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionEngineConfig {
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub confidence_threshold: f64,
    pub audit_enabled: bool,
    pub usage_metering_enabled: bool,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default().engine)
    }
}

impl From<&EngineConfig> for ExecutionEngineConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: RetryPolicy::from(config),
            timeout: config.timeout(),
            confidence_threshold: config.confidence_threshold,
            audit_enabled: config.audit_enabled,
            usage_metering_enabled: config.usage_metering_enabled,
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Operation(OperationError),
    Panicked(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Operation(error) => error.fmt(f),
            Self::Panicked(message) => write!(f, "operation panicked: {message}"),
        }
    }
}

impl RetryClassify for AttemptError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Operation(error) if error.is_transient())
    }
}

enum Outcome<O> {
    Completed(OperationOutcome<O>),
    Failed(AttemptError),
    TimedOut(Duration),
    Cancelled,
}

/// Runs operations against the tenant installed in the current request context.
#[derive(Clone)]
pub struct ExecutionEngine {
    config: ExecutionEngineConfig,
    directory: Arc<dyn TenantDirectory>,
    clock: Arc<dyn Clock>,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionEngineConfig, directory: Arc<dyn TenantDirectory>) -> Self {
        Self::with_clock(config, directory, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ExecutionEngineConfig,
        directory: Arc<dyn TenantDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, directory, clock }
    }

    pub fn config(&self) -> &ExecutionEngineConfig {
        &self.config
    }

    pub async fn execute<Op>(
        &self,
        operation: &Op,
        input: Op::Input,
        actor_id: &str,
    ) -> ExecutionResult<Op::Output>
    where
        Op: Operation,
    {
        self.execute_with_cancellation(operation, input, actor_id, CancellationToken::new()).await
    }

    /// Never fails: every outcome, including a missing tenant context, comes back
    /// as a structured result.
    pub async fn execute_with_cancellation<Op>(
        &self,
        operation: &Op,
        input: Op::Input,
        actor_id: &str,
        cancel: CancellationToken,
    ) -> ExecutionResult<Op::Output>
    where
        Op: Operation,
    {
        self.run(operation, input, actor_id, cancel).await.0
    }

    /// Like [`execute`](Self::execute), with the output already encoded as the JSON
    /// that went into the audit log.
    pub async fn execute_encoded<Op>(
        &self,
        operation: &Op,
        input: Op::Input,
        actor_id: &str,
    ) -> ExecutionResult<Value>
    where
        Op: Operation,
    {
        self.run(operation, input, actor_id, CancellationToken::new()).await.1
    }

    async fn run<Op>(
        &self,
        operation: &Op,
        input: Op::Input,
        actor_id: &str,
        cancel: CancellationToken,
    ) -> (ExecutionResult<Op::Output>, ExecutionResult<Value>)
    where
        Op: Operation,
    {
        let timer = Instant::now();
        let context = TenantContext::current();
        let header = ExecutionHeader {
            execution_id: ExecutionId::generate(),
            operation: operation.kind(),
            operation_version: operation.version().to_owned(),
            tenant_id: context.as_ref().map(|context| context.tenant_id().clone()),
            actor_id: actor_id.to_owned(),
            started_at: self.clock.now(),
        };

        info!(
            event_name = "engine.execution.started",
            execution_id = %header.execution_id.0,
            operation = header.operation.as_str(),
            tenant_id = header.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or(""),
            actor_id,
            "operation execution started"
        );

        let Some(context) = context else {
            let result = ExecutionResult::unsuccessful(
                header,
                ExecutionStatus::Failed,
                ErrorKind::Configuration,
                "no tenant context is installed for this task",
                "Operation execution error: no tenant context",
                metrics_since(timer, 0),
                self.clock.now(),
            );
            log_completion(&result);
            let encoded = result.with_output(None);
            return (result, encoded);
        };

        let result = if context.is_enabled(operation.kind()) {
            let retries = AtomicU32::new(0);
            let outcome = self.attempt(operation, &input, &context, &retries, &cancel).await;
            self.assemble(header, outcome, timer, retries.load(Ordering::SeqCst))
        } else {
            let error = format!(
                "Operation {} is not enabled for tenant {}",
                operation.kind().as_str(),
                context.tenant_id()
            );
            let review_reason = format!("Operation execution error: {error}");
            ExecutionResult::unsuccessful(
                header,
                ExecutionStatus::Failed,
                ErrorKind::Configuration,
                error,
                review_reason,
                metrics_since(timer, 0),
                self.clock.now(),
            )
        };

        let (result, encoded) = self.encode(result);
        log_completion(&result);
        self.record_audit(&encoded, &input, &context).await;
        self.meter_usage(&context).await;
        (result, encoded)
    }

    async fn attempt<Op>(
        &self,
        operation: &Op,
        input: &Op::Input,
        context: &TenantContext,
        retries: &AtomicU32,
        cancel: &CancellationToken,
    ) -> Outcome<Op::Output>
    where
        Op: Operation,
    {
        let overrides = operation.policy();
        let policy = match overrides.max_retries {
            Some(max_retries) => self.config.retry.clone().with_max_retries(max_retries),
            None => self.config.retry.clone(),
        };
        let deadline = overrides.timeout.unwrap_or(self.config.timeout);

        let attempts = with_retry(&policy, self.clock.as_ref(), retries, move |_| {
            let run = AssertUnwindSafe(operation.run(input, context)).catch_unwind();
            async move {
                match run.await {
                    Ok(result) => result.map_err(AttemptError::Operation),
                    Err(payload) => Err(AttemptError::Panicked(panic_message(payload.as_ref()))),
                }
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            bounded = tokio::time::timeout(deadline, attempts) => match bounded {
                Ok(Ok(outcome)) => Outcome::Completed(outcome),
                Ok(Err(error)) => Outcome::Failed(error),
                Err(_) => Outcome::TimedOut(deadline),
            },
        }
    }

    fn assemble<O>(
        &self,
        header: ExecutionHeader,
        outcome: Outcome<O>,
        timer: Instant,
        retry_count: u32,
    ) -> ExecutionResult<O> {
        let completed_at = self.clock.now();
        let unsuccessful = |header, status, kind, error: String, review: String| {
            ExecutionResult::unsuccessful(
                header,
                status,
                kind,
                error,
                review,
                metrics_since(timer, retry_count),
                completed_at,
            )
        };

        match outcome {
            Outcome::Completed(outcome) if !(0.0..=1.0).contains(&outcome.confidence) => {
                let error = format!("confidence {} is outside 0.0..=1.0", outcome.confidence);
                let review = format!("Operation execution error: {error}");
                unsuccessful(header, ExecutionStatus::Failed, ErrorKind::Unexpected, error, review)
            }
            Outcome::Completed(outcome) => {
                let mut metrics = metrics_since(timer, retry_count);
                metrics.external_calls = outcome.metrics.external_calls;
                metrics.tokens_used = outcome.metrics.tokens_used;
                metrics.cost_usd = outcome.metrics.cost_usd;
                ExecutionResult::succeeded(
                    header,
                    outcome,
                    metrics,
                    self.config.confidence_threshold,
                    completed_at,
                )
            }
            Outcome::Failed(AttemptError::Operation(error)) if error.is_transient() => unsuccessful(
                header,
                ExecutionStatus::Failed,
                ErrorKind::RetriesExhausted,
                format!("Operation failed after {retry_count} retries: {error}"),
                "Operation execution failed after retries".to_owned(),
            ),
            Outcome::Failed(AttemptError::Operation(error)) => {
                let kind = match error {
                    OperationError::InvalidInput(_) => ErrorKind::InvalidInput,
                    _ => ErrorKind::Permanent,
                };
                let review = format!("Operation execution error: {error}");
                unsuccessful(header, ExecutionStatus::Failed, kind, error.to_string(), review)
            }
            Outcome::Failed(panicked @ AttemptError::Panicked(_)) => {
                let review = format!("Operation execution error: {panicked}");
                unsuccessful(
                    header,
                    ExecutionStatus::Failed,
                    ErrorKind::Unexpected,
                    panicked.to_string(),
                    review,
                )
            }
            Outcome::TimedOut(deadline) => unsuccessful(
                header,
                ExecutionStatus::Timeout,
                ErrorKind::Timeout,
                format!("Operation execution exceeded timeout of {}s", format_secs(deadline)),
                "Operation execution timeout".to_owned(),
            ),
            Outcome::Cancelled => unsuccessful(
                header,
                ExecutionStatus::Cancelled,
                ErrorKind::Cancelled,
                "Operation execution cancelled by caller".to_owned(),
                "Operation execution cancelled".to_owned(),
            ),
        }
    }

    /// An output that cannot be encoded is never served or audited; the execution
    /// becomes an unexpected failure instead.
    fn encode<O: Serialize>(
        &self,
        result: ExecutionResult<O>,
    ) -> (ExecutionResult<O>, ExecutionResult<Value>) {
        match result.output.as_ref().map(serde_json::to_value).transpose() {
            Ok(output) => {
                let encoded = result.with_output(output);
                (result, encoded)
            }
            Err(error) => {
                let error = format!("operation output could not be encoded: {error}");
                warn!(
                    event_name = "engine.execution.output_unencodable",
                    execution_id = %result.execution_id.0,
                    operation = result.operation.as_str(),
                    error = %error,
                    "discarding operation output"
                );
                let review = format!("Operation execution error: {error}");
                let failed = ExecutionResult::unsuccessful(
                    result.header(),
                    ExecutionStatus::Failed,
                    ErrorKind::Unexpected,
                    error,
                    review,
                    result.metrics,
                    result.completed_at,
                );
                let encoded = failed.with_output(None);
                (failed, encoded)
            }
        }
    }

    async fn record_audit<I: Serialize>(
        &self,
        result: &ExecutionResult<Value>,
        input: &I,
        context: &TenantContext,
    ) {
        if !self.config.audit_enabled {
            return;
        }

        let input = serde_json::to_value(input).unwrap_or_else(|error| {
            warn!(
                event_name = "audit.write.input_unserializable",
                execution_id = %result.execution_id.0,
                error = %error,
                "recording audit entry without input"
            );
            Value::Null
        });
        let audit = AuditService::with_clock(context.store().audit_log(), self.clock.clone());
        if let Err(error) = audit.record(result, input, context.tenant_id().clone()).await {
            error!(
                event_name = "audit.write.failed",
                execution_id = %result.execution_id.0,
                tenant_id = %context.tenant_id(),
                error = %error,
                "audit write failed; execution result unaffected"
            );
        }
    }

    async fn meter_usage(&self, context: &TenantContext) {
        if !self.config.usage_metering_enabled {
            return;
        }

        let recorded = self
            .directory
            .increment_operation_count(context.tenant_id(), 1, self.clock.now())
            .await;
        if let Err(error) = recorded {
            warn!(
                event_name = "tenant.usage.increment_failed",
                tenant_id = %context.tenant_id(),
                error = %error,
                "usage counter not updated"
            );
        }
    }
}

fn metrics_since(timer: Instant, retry_count: u32) -> ExecutionMetrics {
    ExecutionMetrics {
        duration_ms: timer.elapsed().as_secs_f64() * 1000.0,
        retry_count,
        ..ExecutionMetrics::default()
    }
}

fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_owned())
}

fn log_completion<O>(result: &ExecutionResult<O>) {
    let tenant_id = result.tenant_id.as_ref().map(|id| id.0.as_str()).unwrap_or("");
    if result.is_successful() {
        info!(
            event_name = "engine.execution.completed",
            execution_id = %result.execution_id.0,
            operation = result.operation.as_str(),
            tenant_id,
            confidence = result.confidence,
            needs_human_review = result.needs_human_review,
            retry_count = result.metrics.retry_count,
            duration_ms = result.metrics.duration_ms,
            "operation execution completed"
        );
    } else {
        error!(
            event_name = "engine.execution.failed",
            execution_id = %result.execution_id.0,
            operation = result.operation.as_str(),
            tenant_id,
            status = result.status.as_str(),
            error_kind = result.error_kind.map(|kind| kind.as_str()).unwrap_or(""),
            error = result.error.as_deref().unwrap_or(""),
            retry_count = result.metrics.retry_count,
            duration_ms = result.metrics.duration_ms,
            "operation execution did not succeed"
        );
    }
}
