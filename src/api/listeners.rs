//! Listener endpoints, nested under a load balancer.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{listener, Membership};
use crate::db::{
    actions, resource_types, CreateListenerRequest, ListQuery, ListResponse, ListenerResponse,
    RedirectResponse, UpdateListenerRequest,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;
use super::ids;
use super::load_balancers::COLLECTION;

fn collection(lb_id: i64) -> String {
    format!("{}/{}/listeners", COLLECTION, lb_id)
}

pub async fn list_listeners(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(lbid): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<ListenerResponse>>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let listeners = listener::list(&cx, &mut tx, lb.id, &query).await?;
    tx.commit().await?;
    Ok(Json(listeners.map(ListenerResponse::from)))
}

pub async fn create_listener(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(lbid): Path<String>,
    Json(req): Json<CreateListenerRequest>,
) -> Result<(StatusCode, Json<ListenerResponse>), ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = listener::create(&cx, &mut tx, lb.id, &req).await?;
    tx.commit().await?;

    tracing::info!(lb_id = lb.id, listener_id = lstn.id, port = lstn.port, "Listener created");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LISTENER_CREATE,
        resource_types::LISTENER,
        Some(&lstn.uuid),
        Some(&lstn.name),
        Some(json!({ "load_balancer": lb.uuid, "mode": lstn.mode, "port": lstn.port })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(ListenerResponse::from(lstn))))
}

pub async fn get_listener(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path((lbid, lstnid)): Path<(String, String)>,
) -> Result<Json<ListenerResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    tx.commit().await?;
    Ok(Json(ListenerResponse::from(lstn)))
}

pub async fn update_listener(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, lstnid)): Path<(String, String)>,
    Json(req): Json<UpdateListenerRequest>,
) -> Result<Json<ListenerResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    let updated = listener::update(&cx, &mut tx, lb.id, lstn.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LISTENER_UPDATE,
        resource_types::LISTENER,
        Some(&updated.uuid),
        Some(&updated.name),
        Some(json!({ "mode": updated.mode, "port": updated.port })),
    )
    .await;

    Ok(Json(ListenerResponse::from(updated)))
}

pub async fn delete_listener(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, lstnid)): Path<(String, String)>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let lstn = ids::listener(&cx, &mut tx, lb.id, &lstnid).await?;
    listener::delete(&cx, &mut tx, lb.id, lstn.id).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LISTENER_DELETE,
        resource_types::LISTENER,
        Some(&lstn.uuid),
        Some(&lstn.name),
        None,
    )
    .await;

    Ok(Json(RedirectResponse::to(collection(lb.id))))
}
