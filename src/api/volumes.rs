//! Volume endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{volume, Membership};
use crate::db::{
    actions, resource_types, CreateVolumeRequest, ListQuery, ListResponse, RedirectResponse,
    ResizeVolumeRequest, UpdateVolumeRequest, Volume,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::{ApiError, ValidationErrorBuilder};
use super::ids;
use super::validation::validate_name;

pub const COLLECTION: &str = "/api/volumes";

fn validate_create_request(req: &CreateVolumeRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors.check("name", validate_name(&req.name));
    if req.size <= 0 {
        errors.add("size", "Size must be positive");
    }
    errors.finish()
}

pub async fn list_volumes(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Volume>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(volume::list(&state.cx(&member), &mut conn, &query).await?))
}

pub async fn get_volume(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(id): Path<String>,
) -> Result<Json<Volume>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(ids::volume(&state.cx(&member), &mut conn, &id).await?))
}

pub async fn create_volume(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateVolumeRequest>,
) -> Result<(StatusCode, Json<Volume>), ApiError> {
    validate_create_request(&req)?;

    let mut tx = state.db.begin().await?;
    let vol = volume::create(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::VOLUME_CREATE,
        resource_types::VOLUME,
        Some(&vol.uuid),
        Some(&vol.name),
        Some(json!({ "size": vol.size })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(vol)))
}

pub async fn update_volume(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<UpdateVolumeRequest>,
) -> Result<Json<Volume>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let vol = ids::volume(&cx, &mut tx, &id).await?;
    let updated = volume::update(&cx, &mut tx, vol.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::VOLUME_UPDATE,
        resource_types::VOLUME,
        Some(&updated.uuid),
        Some(&updated.name),
        Some(json!({ "instance_id": req.instance_id, "status": updated.status })),
    )
    .await;

    Ok(Json(updated))
}

pub async fn resize_volume(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    Json(req): Json<ResizeVolumeRequest>,
) -> Result<Json<Volume>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let vol = ids::volume(&cx, &mut tx, &id).await?;
    let resized = volume::resize(&cx, &mut tx, vol.id, &req).await?;
    tx.commit().await?;

    tracing::info!(volume_id = vol.id, from = vol.size, to = resized.size, "Volume resize requested");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::VOLUME_RESIZE,
        resource_types::VOLUME,
        Some(&resized.uuid),
        Some(&resized.name),
        Some(json!({ "from": vol.size, "to": resized.size })),
    )
    .await;

    Ok(Json(resized))
}

pub async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let vol = ids::volume(&cx, &mut tx, &id).await?;
    volume::delete(&cx, &mut tx, vol.id).await?;
    tx.commit().await?;

    tracing::info!(volume_id = vol.id, name = %vol.name, "Volume deletion requested");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::VOLUME_DELETE,
        resource_types::VOLUME,
        Some(&vol.uuid),
        Some(&vol.name),
        None,
    )
    .await;

    Ok(Json(RedirectResponse::to(COLLECTION)))
}
