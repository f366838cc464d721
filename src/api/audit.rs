//! Audit log API endpoints and helpers.

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Query, State},
    http::{request::Parts, HeaderMap},
    Extension, Json,
};
use std::convert::Infallible;
use std::{net::SocketAddr, sync::Arc};

use crate::admin::Membership;
use crate::db::{list_audit_logs, log_audit, AuditLogListResponse, AuditLogQuery};
use crate::AppState;

use super::error::ApiError;

/// Extract client IP address from request headers or connection info.
/// Checks X-Forwarded-For, X-Real-IP headers first (for reverse proxy scenarios),
/// then falls back to the connection info.
pub fn extract_client_ip(headers: &HeaderMap, conn_info: Option<&SocketAddr>) -> Option<String> {
    // Check X-Forwarded-For header first (comma-separated list, first is client)
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first_ip) = forwarded.split(',').next() {
            let ip = first_ip.trim();
            if !ip.is_empty() {
                return Some(ip.to_string());
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return Some(ip.to_string());
        }
    }

    conn_info.map(|addr| addr.ip().to_string())
}

/// Client address of the request, when it can be determined
pub struct ClientIp(pub Option<String>);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let conn_info = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr);
        Ok(ClientIp(extract_client_ip(&parts.headers, conn_info)))
    }
}

/// Record an audit event. Failures are logged and never fail the request.
#[allow(clippy::too_many_arguments)]
pub async fn audit_log(
    state: &AppState,
    user_id: Option<i64>,
    org_id: Option<i64>,
    ip_address: Option<&str>,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    resource_name: Option<&str>,
    details: Option<serde_json::Value>,
) {
    if let Err(e) = log_audit(
        &state.db,
        action,
        resource_type,
        resource_id,
        resource_name,
        user_id,
        org_id,
        ip_address,
        details,
    )
    .await
    {
        tracing::warn!(
            action = action,
            resource_type = resource_type,
            error = %e,
            "Failed to create audit log entry"
        );
    }
}

/// [`audit_log`] on behalf of an authenticated member
#[allow(clippy::too_many_arguments)]
pub async fn audit_member(
    state: &AppState,
    member: &Membership,
    ip_address: Option<&str>,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    resource_name: Option<&str>,
    details: Option<serde_json::Value>,
) {
    // user id 0 is the system membership behind the admin token
    let user_id = Some(member.user_id).filter(|id| *id != 0);
    audit_log(
        state,
        user_id,
        Some(member.org_id),
        ip_address,
        action,
        resource_type,
        resource_id,
        resource_name,
        details,
    )
    .await
}

/// GET /api/audit
///
/// Query parameters: action, resource_type, resource_id, org_id,
/// start_date, end_date, page, per_page.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<AuditLogListResponse>, ApiError> {
    member.require_admin("view audit logs")?;
    let result = list_audit_logs(&state.db, &query).await?;
    Ok(Json(result))
}
