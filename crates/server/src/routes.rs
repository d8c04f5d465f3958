//! Tenant-scoped JSON API.
//!
//! - `POST /operations/{name}`             run a registered operation for the current tenant
//! - `GET  /audit/logs`                    filtered, paged audit entries (newest first)
//! - `GET  /audit/logs/{log_id}`           one audit entry
//! - `POST /audit/logs/{log_id}/review`    record the first reviewer of an entry
//! - `GET  /audit/stats`                   aggregate figures over a filter

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tenantry_core::audit::AuditService;
use tenantry_core::context::{TenantAdmission, TenantContext};
use tenantry_core::domain::audit::{AuditFilter, AuditLogEntry, AuditLogId, AuditStats, Page};
use tenantry_core::domain::execution::{ExecutionResult, ExecutionStatus};
use tenantry_core::domain::tenant::OperationKind;
use tenantry_core::errors::{ApplicationError, DomainError, InterfaceError};
use tenantry_core::execution_engine::ExecutionEngine;
use tenantry_core::registry::OperationRegistry;
use tenantry_core::resolver::TenantResolver;
use tenantry_db::DbPool;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::health;
use crate::middleware::{correlation_id, tenant_routing};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
const ANONYMOUS_ACTOR: &str = "anonymous";

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<TenantResolver>,
    pub admission: Arc<TenantAdmission>,
    pub engine: Arc<ExecutionEngine>,
    pub registry: Arc<OperationRegistry>,
    pub tenant_header: String,
}

impl AppState {
    pub fn new(
        resolver: TenantResolver,
        admission: TenantAdmission,
        engine: ExecutionEngine,
        registry: OperationRegistry,
        tenant_header: &str,
    ) -> Self {
        Self {
            resolver: Arc::new(resolver),
            admission: Arc::new(admission),
            engine: Arc::new(engine),
            registry: Arc::new(registry),
            tenant_header: tenant_header.trim().to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

fn api_error(error: InterfaceError) -> (StatusCode, Json<ErrorBody>) {
    let (status, code) = match &error {
        InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
        InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        InterfaceError::ServiceUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        InterfaceError::Internal { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_server_error")
        }
    };
    let message = match &error {
        InterfaceError::Internal { .. } => error.user_message().to_owned(),
        _ => error.message().to_owned(),
    };
    (
        status,
        Json(ErrorBody {
            error: code.to_owned(),
            message,
            correlation_id: error.correlation_id().to_owned(),
        }),
    )
}

fn fail(error: impl Into<ApplicationError>, correlation_id: &str) -> (StatusCode, Json<ErrorBody>) {
    let error: ApplicationError = error.into();
    warn!(
        event_name = "api.request.failed",
        correlation_id,
        error = %error,
        "request failed"
    );
    api_error(error.into_interface(correlation_id))
}

fn current_context(correlation_id: &str) -> Result<TenantContext, (StatusCode, Json<ErrorBody>)> {
    TenantContext::current().ok_or_else(|| {
        fail(
            ApplicationError::Configuration("no tenant context installed".to_owned()),
            correlation_id,
        )
    })
}

fn audit_service(context: &TenantContext) -> AuditService {
    AuditService::new(context.store().audit_log())
}

/// Tenant-scoped routes behind the routing middleware, merged with the platform
/// endpoints.
pub fn app(state: AppState, platform_pool: DbPool) -> Router {
    Router::new()
        .route("/operations/{name}", post(execute_operation))
        .route("/audit/logs", get(list_audit_logs))
        .route("/audit/logs/{log_id}", get(get_audit_log))
        .route("/audit/logs/{log_id}/review", post(review_audit_log))
        .route("/audit/stats", get(audit_stats))
        .with_state(state.clone())
        .merge(health::router(platform_pool))
        .layer(from_fn_with_state(state, tenant_routing))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

async fn execute_operation(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(input): Json<Value>,
) -> ApiResult<ExecutionResult<Value>> {
    let correlation_id = correlation_id(&headers);
    let actor_id = headers
        .get(ACTOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(ANONYMOUS_ACTOR);

    let result = state
        .registry
        .execute_json(&state.engine, &name, input, actor_id)
        .await
        .map_err(|error| fail(error, &correlation_id))?;

    info!(
        event_name = "api.operation.executed",
        correlation_id = %correlation_id,
        execution_id = %result.execution_id.0,
        operation = result.operation.as_str(),
        status = result.status.as_str(),
        needs_human_review = result.needs_human_review,
        "operation request completed"
    );
    Ok(Json(result))
}

/// Query string shared by the list and stats endpoints. Paging is ignored by stats.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub operation: Option<String>,
    pub status: Option<String>,
    pub actor_id: Option<String>,
    pub needs_review: Option<bool>,
    pub reviewed: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

impl AuditQuery {
    fn filter(&self) -> Result<AuditFilter, DomainError> {
        let operation = self
            .operation
            .as_deref()
            .map(|raw| {
                OperationKind::parse(raw)
                    .ok_or_else(|| DomainError::InvalidInput(format!("unknown operation `{raw}`")))
            })
            .transpose()?;
        let status = self
            .status
            .as_deref()
            .map(|raw| {
                ExecutionStatus::parse(raw)
                    .ok_or_else(|| DomainError::InvalidInput(format!("unknown status `{raw}`")))
            })
            .transpose()?;
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(DomainError::InvalidInput("`from` must not be after `to`".to_owned()));
            }
        }

        Ok(AuditFilter {
            operation,
            status,
            actor_id: self.actor_id.clone().filter(|actor| !actor.trim().is_empty()),
            needs_review: self.needs_review,
            reviewed: self.reviewed,
            executed_from: self.from,
            executed_to: self.to,
        })
    }

    fn page(&self) -> Page {
        Page::new(self.offset, self.limit)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditLogPage {
    pub entries: Vec<AuditLogEntry>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

async fn list_audit_logs(
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> ApiResult<AuditLogPage> {
    let correlation_id = correlation_id(&headers);
    let context = current_context(&correlation_id)?;
    let filter = query.filter().map_err(|error| fail(error, &correlation_id))?;
    let page = query.page();

    let audit = audit_service(&context);
    let entries = audit.list(&filter, page).await.map_err(|error| fail(error, &correlation_id))?;
    let total = audit.count(&filter).await.map_err(|error| fail(error, &correlation_id))?;

    Ok(Json(AuditLogPage { entries, total, offset: page.offset, limit: page.limit }))
}

async fn get_audit_log(
    headers: HeaderMap,
    Path(log_id): Path<String>,
) -> ApiResult<AuditLogEntry> {
    let correlation_id = correlation_id(&headers);
    let context = current_context(&correlation_id)?;

    audit_service(&context)
        .get(&AuditLogId(log_id.clone()))
        .await
        .map_err(|error| fail(error, &correlation_id))?
        .map(Json)
        .ok_or_else(|| {
            fail(ApplicationError::NotFound(format!("audit log `{log_id}`")), &correlation_id)
        })
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub reviewer: String,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub log_id: String,
    /// `false` when the entry is missing or was already reviewed.
    pub updated: bool,
}

async fn review_audit_log(
    headers: HeaderMap,
    Path(log_id): Path<String>,
    Json(body): Json<ReviewRequest>,
) -> ApiResult<ReviewResponse> {
    let correlation_id = correlation_id(&headers);
    let context = current_context(&correlation_id)?;

    let updated = audit_service(&context)
        .mark_reviewed(&AuditLogId(log_id.clone()), &body.reviewer, body.notes.as_deref())
        .await
        .map_err(|error| fail(error, &correlation_id))?;

    Ok(Json(ReviewResponse { log_id, updated }))
}

async fn audit_stats(headers: HeaderMap, Query(query): Query<AuditQuery>) -> ApiResult<AuditStats> {
    let correlation_id = correlation_id(&headers);
    let context = current_context(&correlation_id)?;
    let filter = query.filter().map_err(|error| fail(error, &correlation_id))?;

    let stats = audit_service(&context)
        .aggregate(&filter)
        .await
        .map_err(|error| fail(error, &correlation_id))?;
    Ok(Json(stats))
}
