//! Organizations, members and users.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{org, Membership};
use crate::db::{
    actions, resource_types, AddMemberRequest, CreateOrgRequest, CreateUserRequest, Member,
    Organization, UserResponse,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;

pub async fn list_orgs(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
) -> Result<Json<Vec<Organization>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(org::list_orgs(&state.cx(&member), &mut conn).await?))
}

pub async fn create_org(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateOrgRequest>,
) -> Result<(StatusCode, Json<Organization>), ApiError> {
    let mut tx = state.db.begin().await?;
    let created = org::create_org(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::ORG_CREATE,
        resource_types::ORG,
        Some(&created.uuid),
        Some(&created.name),
        Some(json!({ "owner": req.owner_username })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(org_id): Path<i64>,
) -> Result<Json<Vec<Member>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(
        org::list_members(&state.cx(&member), &mut conn, org_id).await?,
    ))
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(org_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<(StatusCode, Json<Member>), ApiError> {
    let mut tx = state.db.begin().await?;
    let added = org::add_member(&state.cx(&member), &mut tx, org_id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::ORG_MEMBER_ADD,
        resource_types::ORG,
        Some(&added.org_id.to_string()),
        Some(&added.org_name),
        Some(json!({ "username": added.user_name, "role": added.role })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(added)))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let mut tx = state.db.begin().await?;
    let user = org::create_user(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    tracing::info!(username = %user.username, "User created");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::USER_CREATE,
        resource_types::USER,
        Some(&user.uuid),
        Some(&user.username),
        None,
    )
    .await;

    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}
