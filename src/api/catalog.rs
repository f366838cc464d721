//! Images and flavors.

use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{catalog, Membership};
use crate::db::{actions, resource_types, CreateFlavorRequest, CreateImageRequest, Flavor, Image};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;

pub async fn list_images(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Image>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(catalog::list_images(&mut conn).await?))
}

pub async fn create_image(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateImageRequest>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let mut tx = state.db.begin().await?;
    let image = catalog::create_image(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::IMAGE_CREATE,
        resource_types::IMAGE,
        Some(&image.uuid),
        Some(&image.name),
        Some(json!({ "os_code": image.os_code, "size": image.size })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn list_flavors(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Flavor>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(catalog::list_flavors(&mut conn).await?))
}

pub async fn create_flavor(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateFlavorRequest>,
) -> Result<(StatusCode, Json<Flavor>), ApiError> {
    let mut tx = state.db.begin().await?;
    let flavor = catalog::create_flavor(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::FLAVOR_CREATE,
        resource_types::FLAVOR,
        Some(&flavor.id.to_string()),
        Some(&flavor.name),
        Some(json!({ "cpu": flavor.cpu, "memory": flavor.memory, "disk": flavor.disk })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(flavor)))
}
