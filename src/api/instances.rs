//! Instance endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{instance, Membership};
use crate::db::{
    actions, resource_types, CreateInstanceRequest, Instance, InstanceDetail, ListQuery,
    ListResponse, PowerActionRequest, RedirectResponse, ReinstallInstanceRequest,
    SetPasswordRequest, UpdateInstanceRequest,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::{ApiError, ValidationErrorBuilder};
use super::ids;
use super::validation::{validate_hostname, validate_password, validate_port};

pub const COLLECTION: &str = "/api/instances";

fn validate_create_request(req: &CreateInstanceRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();

    if !(1..=instance::MAX_BATCH).contains(&req.count) {
        errors.add(
            "count",
            format!("count must be between 1 and {}", instance::MAX_BATCH),
        );
    }
    errors.check("hostname", validate_hostname(&req.hostname));
    if let Some(port) = req.login_port {
        errors.check("login_port", validate_port(port));
    }
    if let Some(password) = req.root_passwd.as_deref().filter(|p| !p.is_empty()) {
        errors.check("root_passwd", validate_password(password));
    }
    if req.flavor_id.is_none() {
        for (field, value) in [("cpu", req.cpu), ("memory", req.memory), ("disk", req.disk)] {
            if value.is_none() {
                errors.add(field, "Required when flavor_id is not given");
            }
        }
    }

    errors.finish()
}

fn validate_update_request(req: &UpdateInstanceRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Some(hostname) = req.hostname.as_deref() {
        errors.check("hostname", validate_hostname(hostname));
    }
    for (field, value) in [("cpu", req.cpu), ("memory", req.memory), ("disk", req.disk)] {
        if value.is_some_and(|v| v <= 0) {
            errors.add(field, "Must be positive");
        }
    }
    errors.finish()
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Instance>>, ApiError> {
    let mut tx = state.db.begin().await?;
    let instances = instance::list(&state.cx(&member), &mut tx, &query).await?;
    tx.commit().await?;
    Ok(Json(instances))
}

/// POST /api/instances
///
/// Rows are committed first; the launch commands go out afterwards so the
/// agents' callbacks always find them.
pub async fn create_instances(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<Vec<Instance>>), ApiError> {
    validate_create_request(&req)?;

    let mut tx = state.db.begin().await?;
    let (instances, batch) = instance::create(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    let failed = state.dispatcher.execute_all(batch).await;
    if failed > 0 {
        tracing::warn!(failed, total = instances.len(), "Some launch commands failed");
    }

    for inst in &instances {
        audit_member(
            &state,
            &member,
            ip.as_deref(),
            actions::INSTANCE_CREATE,
            resource_types::INSTANCE,
            Some(&inst.uuid),
            Some(&inst.hostname),
            Some(json!({ "image_id": inst.image_id, "cpu": inst.cpu, "memory": inst.memory, "disk": inst.disk })),
        )
        .await;
    }

    Ok((StatusCode::CREATED, Json(instances)))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(id): Path<String>,
) -> Result<Json<InstanceDetail>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    let detail = instance::detail(&cx, &mut tx, inst.id).await?;
    tx.commit().await?;
    Ok(Json(detail))
}

pub async fn update_instance(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<UpdateInstanceRequest>,
) -> Result<Json<Instance>, ApiError> {
    validate_update_request(&req)?;

    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    let updated = instance::update(&cx, &mut tx, inst.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::INSTANCE_UPDATE,
        resource_types::INSTANCE,
        Some(&updated.uuid),
        Some(&updated.hostname),
        Some(json!({
            "hostname": req.hostname,
            "flavor_id": req.flavor_id,
            "cpu": req.cpu,
            "memory": req.memory,
            "disk": req.disk,
            "power_action": req.power_action.map(|a| a.as_str()),
        })),
    )
    .await;

    Ok(Json(updated))
}

pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    instance::delete(&cx, &mut tx, inst.id).await?;
    tx.commit().await?;

    tracing::info!(instance_id = inst.id, hostname = %inst.hostname, "Instance deletion requested");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::INSTANCE_DELETE,
        resource_types::INSTANCE,
        Some(&inst.uuid),
        Some(&inst.hostname),
        None,
    )
    .await;

    Ok(Json(RedirectResponse::to(COLLECTION)))
}

pub async fn reinstall_instance(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<ReinstallInstanceRequest>,
) -> Result<Json<Instance>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    let updated = instance::reinstall(&cx, &mut tx, inst.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::INSTANCE_REINSTALL,
        resource_types::INSTANCE,
        Some(&updated.uuid),
        Some(&updated.hostname),
        Some(json!({ "image_id": updated.image_id })),
    )
    .await;

    Ok(Json(updated))
}

pub async fn set_instance_password(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<SetPasswordRequest>,
) -> Result<StatusCode, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    instance::set_user_password(&cx, &mut tx, inst.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::INSTANCE_SET_PASSWORD,
        resource_types::INSTANCE,
        Some(&inst.uuid),
        Some(&inst.hostname),
        Some(json!({ "user": req.user })),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn instance_action(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<PowerActionRequest>,
) -> Result<Json<Instance>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let inst = ids::instance(&cx, &mut tx, &id).await?;
    let updated = instance::change_status(&cx, &mut tx, inst.id, req.action).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::INSTANCE_POWER,
        resource_types::INSTANCE,
        Some(&updated.uuid),
        Some(&updated.hostname),
        Some(json!({ "action": req.action.as_str() })),
    )
    .await;

    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorResponse;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    fn request() -> CreateInstanceRequest {
        serde_json::from_value(json!({
            "hostname": "web",
            "image_id": 1,
            "flavor_id": 1,
            "zone_id": 1,
            "subnet_id": 1,
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_create_request() {
        assert!(validate_create_request(&request()).is_ok());
    }

    #[tokio::test]
    async fn test_create_request_collects_every_field() {
        let mut req = request();
        req.count = 40;
        req.hostname = "bad_host!".to_string();
        req.login_port = Some(0);
        req.flavor_id = None;
        req.cpu = Some(2);

        let response = validate_create_request(&req).unwrap_err().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.error.code, "validation_error");
        assert_eq!(body.error.error_code, Some(100003));

        let json = serde_json::to_value(&body.error.details).unwrap();
        for field in ["count", "hostname", "login_port", "memory", "disk"] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert!(json.get("cpu").is_none());
    }

    #[test]
    fn test_update_request() {
        assert!(validate_update_request(&UpdateInstanceRequest::default()).is_ok());
        let req = UpdateInstanceRequest {
            hostname: Some("bad_host!".to_string()),
            disk: Some(-1),
            ..Default::default()
        };
        assert!(validate_update_request(&req).is_err());
    }
}
