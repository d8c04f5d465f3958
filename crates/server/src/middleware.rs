use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tenantry_core::errors::ApplicationError;
use tenantry_core::resolver::{ResolutionError, ResolutionRequest};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::health::is_platform_path;
use crate::routes::{AppState, ErrorBody};

pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Caller-supplied request id, or a fresh one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn resolution_request(state: &AppState, request: &Request) -> ResolutionRequest {
    let headers = request.headers();
    let tenant_header =
        headers.get(state.tenant_header.as_str()).and_then(|value| value.to_str().ok());
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| request.uri().host());
    ResolutionRequest::new(tenant_header, host)
}

/// Resolves and admits the tenant, then runs the rest of the request inside its
/// context. The context slot is empty again once the response is produced.
pub async fn tenant_routing(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if is_platform_path(request.uri().path()) {
        return next.run(request).await;
    }

    let correlation_id = correlation_id(request.headers());
    let resolution = resolution_request(&state, &request);

    let tenant = match state.resolver.resolve(&resolution).await {
        Ok(tenant) => tenant,
        Err(error) => return rejection(error, &correlation_id),
    };
    let context = match state.admission.admit(tenant).await {
        Ok(context) => context,
        Err(error) => return rejection(error, &correlation_id),
    };

    let tenant_id = context.tenant_id().clone();
    info!(
        event_name = "tenant.request.admitted",
        correlation_id = %correlation_id,
        tenant_id = %tenant_id,
        database_name = context.database_name(),
        method = %request.method(),
        path = request.uri().path(),
        "tenant context installed"
    );

    let mut response = context.scope(next.run(request)).await;
    match HeaderValue::from_str(&tenant_id.0) {
        Ok(value) => {
            response.headers_mut().insert(TENANT_ID_HEADER, value);
        }
        Err(_) => warn!(
            event_name = "tenant.request.header_skipped",
            correlation_id = %correlation_id,
            tenant_id = %tenant_id,
            "tenant id is not a valid header value"
        ),
    }
    response
}

fn rejection_status(error: &ResolutionError) -> StatusCode {
    match error {
        ResolutionError::NotFound => StatusCode::NOT_FOUND,
        ResolutionError::TemporarilyUnavailable { .. } | ResolutionError::Unavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ResolutionError::Directory(_) | ResolutionError::StoreUnavailable(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn rejection(error: ResolutionError, correlation_id: &str) -> Response {
    let status = rejection_status(&error);
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(
            event_name = "tenant.request.failed",
            correlation_id,
            error = %error,
            "tenant resolution failed"
        );
        "Tenant resolution failed".to_owned()
    } else {
        info!(
            event_name = "tenant.request.rejected",
            correlation_id,
            status = status.as_u16(),
            error = %error,
            "request rejected before reaching a handler"
        );
        ApplicationError::from(error).into_interface(correlation_id).message().to_owned()
    };

    let body = ErrorBody {
        error: status.canonical_reason().unwrap_or("error").to_ascii_lowercase().replace(' ', "_"),
        message,
        correlation_id: correlation_id.to_owned(),
    };
    (status, Json(body)).into_response()
}
