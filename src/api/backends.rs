//! Backend endpoints, nested under a listener.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{backend, Membership};
use crate::db::{
    actions, resource_types, Backend, BackendResponse, CreateBackendRequest, ListQuery,
    ListResponse, RedirectResponse, UpdateBackendRequest,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;
use super::ids;
use super::load_balancers::COLLECTION;

pub async fn list_backends(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path((lbid, lstnid)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<BackendResponse>>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let backends = backend::list(&cx, &mut tx, lb.id, lstn.id, &query).await?;
    tx.commit().await?;
    Ok(Json(backends))
}

pub async fn create_backend(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, lstnid)): Path<(String, String)>,
    Json(req): Json<CreateBackendRequest>,
) -> Result<(StatusCode, Json<Backend>), ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let bk = backend::create(&cx, &mut tx, lb.id, lstn.id, &req).await?;
    tx.commit().await?;

    tracing::info!(lb_id = lb.id, backend_id = bk.id, addr = %bk.backend_addr, "Backend created");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::BACKEND_CREATE,
        resource_types::BACKEND,
        Some(&bk.uuid),
        Some(&bk.name),
        Some(json!({ "listener": lstn.uuid, "backend_addr": bk.backend_addr })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(bk)))
}

pub async fn get_backend(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path((lbid, lstnid, bkid)): Path<(String, String, String)>,
) -> Result<Json<Backend>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let bk = ids::backend(&cx, &mut tx, lb.id, lstn.id, &bkid).await?;
    tx.commit().await?;
    Ok(Json(bk))
}

pub async fn update_backend(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, lstnid, bkid)): Path<(String, String, String)>,
    Json(req): Json<UpdateBackendRequest>,
) -> Result<Json<Backend>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let bk = ids::backend(&cx, &mut tx, lb.id, lstn.id, &bkid).await?;
    let updated = backend::update(&cx, &mut tx, lb.id, lstn.id, bk.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::BACKEND_UPDATE,
        resource_types::BACKEND,
        Some(&updated.uuid),
        Some(&updated.name),
        Some(json!({ "old_addr": bk.backend_addr, "backend_addr": updated.backend_addr })),
    )
    .await;

    Ok(Json(updated))
}

pub async fn delete_backend(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, lstnid, bkid)): Path<(String, String, String)>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let bk = ids::backend(&cx, &mut tx, lb.id, lstn.id, &bkid).await?;
    backend::delete(&cx, &mut tx, lb.id, lstn.id, bk.id).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::BACKEND_DELETE,
        resource_types::BACKEND,
        Some(&bk.uuid),
        Some(&bk.name),
        None,
    )
    .await;

    Ok(Json(RedirectResponse::to(format!(
        "{}/{}/listeners/{}/backends",
        COLLECTION, lb.id, lstn.id
    ))))
}
