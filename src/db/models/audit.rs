//! Audit log models for tracking user actions.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// Audit log entry for tracking user actions
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub resource_name: Option<String>,
    pub user_id: Option<i64>,
    pub org_id: Option<i64>,
    pub ip_address: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

/// Response for listing audit logs with pagination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogListResponse {
    pub items: Vec<AuditLog>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

/// Query parameters for filtering audit logs
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuditLogQuery {
    /// Filter by action (e.g., "loadbalancer.create")
    pub action: Option<String>,
    /// Filter by resource type (e.g., "instance")
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub org_id: Option<i64>,
    /// Start date for filtering (RFC 3339)
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Page number (1-indexed, defaults to 1)
    pub page: Option<i64>,
    /// Items per page (defaults to 50, max 100)
    pub per_page: Option<i64>,
}

/// Common audit action types
pub mod actions {
    pub const LOAD_BALANCER_CREATE: &str = "loadbalancer.create";
    pub const LOAD_BALANCER_UPDATE: &str = "loadbalancer.update";
    pub const LOAD_BALANCER_DELETE: &str = "loadbalancer.delete";
    pub const FLOATING_IP_ATTACH: &str = "floatingip.attach";
    pub const FLOATING_IP_DETACH: &str = "floatingip.detach";

    pub const LISTENER_CREATE: &str = "listener.create";
    pub const LISTENER_UPDATE: &str = "listener.update";
    pub const LISTENER_DELETE: &str = "listener.delete";

    pub const BACKEND_CREATE: &str = "backend.create";
    pub const BACKEND_UPDATE: &str = "backend.update";
    pub const BACKEND_DELETE: &str = "backend.delete";

    pub const INSTANCE_CREATE: &str = "instance.create";
    pub const INSTANCE_UPDATE: &str = "instance.update";
    pub const INSTANCE_DELETE: &str = "instance.delete";
    pub const INSTANCE_REINSTALL: &str = "instance.reinstall";
    pub const INSTANCE_SET_PASSWORD: &str = "instance.set_password";
    pub const INSTANCE_POWER: &str = "instance.power";

    pub const VOLUME_CREATE: &str = "volume.create";
    pub const VOLUME_UPDATE: &str = "volume.update";
    pub const VOLUME_RESIZE: &str = "volume.resize";
    pub const VOLUME_DELETE: &str = "volume.delete";

    pub const ROUTER_CREATE: &str = "router.create";
    pub const SUBNET_CREATE: &str = "subnet.create";
    pub const IMAGE_CREATE: &str = "image.create";
    pub const FLAVOR_CREATE: &str = "flavor.create";

    pub const ORG_CREATE: &str = "org.create";
    pub const ORG_MEMBER_ADD: &str = "org.member.add";
    pub const USER_CREATE: &str = "user.create";

    pub const AUTH_LOGIN: &str = "auth.login";
}

/// Common resource types
pub mod resource_types {
    pub const LOAD_BALANCER: &str = "loadbalancer";
    pub const FLOATING_IP: &str = "floatingip";
    pub const LISTENER: &str = "listener";
    pub const BACKEND: &str = "backend";
    pub const INSTANCE: &str = "instance";
    pub const VOLUME: &str = "volume";
    pub const ROUTER: &str = "router";
    pub const SUBNET: &str = "subnet";
    pub const IMAGE: &str = "image";
    pub const FLAVOR: &str = "flavor";
    pub const ORG: &str = "org";
    pub const USER: &str = "user";
}

/// Log an audit event to the database
#[allow(clippy::too_many_arguments)]
pub async fn log_audit(
    db: &SqlitePool,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    resource_name: Option<&str>,
    user_id: Option<i64>,
    org_id: Option<i64>,
    ip_address: Option<&str>,
    details: Option<serde_json::Value>,
) -> Result<(), sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = super::now();
    let details_json = details.map(|d| d.to_string());

    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, action, resource_type, resource_id, resource_name, user_id, org_id, ip_address, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(action)
    .bind(resource_type)
    .bind(resource_id)
    .bind(resource_name)
    .bind(user_id)
    .bind(org_id)
    .bind(ip_address)
    .bind(&details_json)
    .bind(&now)
    .execute(db)
    .await?;

    tracing::debug!(
        action = action,
        resource_type = resource_type,
        resource_id = resource_id,
        user_id = user_id,
        "Audit log recorded"
    );

    Ok(())
}

/// List audit logs with filtering and pagination
pub async fn list_audit_logs(
    db: &SqlitePool,
    query: &AuditLogQuery,
) -> Result<AuditLogListResponse, sqlx::Error> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(50).clamp(1, 100);
    let offset = (page - 1) * per_page;

    let mut conditions = Vec::new();
    let mut bindings: Vec<String> = Vec::new();

    if let Some(action) = &query.action {
        conditions.push("action = ?");
        bindings.push(action.clone());
    }

    if let Some(resource_type) = &query.resource_type {
        conditions.push("resource_type = ?");
        bindings.push(resource_type.clone());
    }

    if let Some(resource_id) = &query.resource_id {
        conditions.push("resource_id = ?");
        bindings.push(resource_id.clone());
    }

    if let Some(org_id) = query.org_id {
        // org_id has INTEGER affinity, so the text binding compares numerically
        conditions.push("org_id = ?");
        bindings.push(org_id.to_string());
    }

    if let Some(start_date) = &query.start_date {
        conditions.push("created_at >= ?");
        bindings.push(start_date.clone());
    }

    if let Some(end_date) = &query.end_date {
        conditions.push("created_at <= ?");
        bindings.push(end_date.clone());
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };

    let count_sql = format!("SELECT COUNT(*) as count FROM audit_logs {}", where_clause);
    let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
    for binding in &bindings {
        count_query = count_query.bind(binding);
    }
    let total = count_query.fetch_one(db).await?;

    let sql = format!(
        "SELECT * FROM audit_logs {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
        where_clause
    );
    let mut query_builder = sqlx::query_as::<_, AuditLog>(&sql);
    for binding in &bindings {
        query_builder = query_builder.bind(binding);
    }
    query_builder = query_builder.bind(per_page).bind(offset);

    let items = query_builder.fetch_all(db).await?;

    let total_pages = (total + per_page - 1) / per_page;

    Ok(AuditLogListResponse {
        items,
        total,
        page,
        per_page,
        total_pages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_and_filter() {
        let pool = crate::db::init_in_memory().await.unwrap();

        log_audit(
            &pool,
            actions::LOAD_BALANCER_CREATE,
            resource_types::LOAD_BALANCER,
            Some("1"),
            Some("web"),
            Some(1),
            Some(2),
            Some("10.0.0.1"),
            Some(serde_json::json!({"router_id": 4})),
        )
        .await
        .unwrap();
        log_audit(
            &pool,
            actions::INSTANCE_DELETE,
            resource_types::INSTANCE,
            Some("7"),
            None,
            Some(1),
            Some(3),
            None,
            None,
        )
        .await
        .unwrap();

        let all = list_audit_logs(&pool, &AuditLogQuery::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.total_pages, 1);

        let by_org = list_audit_logs(
            &pool,
            &AuditLogQuery {
                org_id: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_org.total, 1);
        assert_eq!(by_org.items[0].action, "loadbalancer.create");
        assert_eq!(by_org.items[0].details.as_deref(), Some(r#"{"router_id":4}"#));
    }
}
