//! Load balancer and floating IP endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{load_balancer, Membership};
use crate::db::{
    actions, resource_types, AttachFloatingIpRequest, CreateLoadBalancerRequest, FloatingIp,
    ListQuery, ListResponse, LoadBalancer, LoadBalancerDetail, RedirectResponse,
    UpdateLoadBalancerRequest,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;
use super::ids;

pub const COLLECTION: &str = "/api/loadbalancers";

pub async fn list_load_balancers(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<LoadBalancer>>, ApiError> {
    let mut tx = state.db.begin().await?;
    let lbs = load_balancer::list(&state.cx(&member), &mut tx, &query).await?;
    tx.commit().await?;
    Ok(Json(lbs))
}

pub async fn create_load_balancer(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateLoadBalancerRequest>,
) -> Result<(StatusCode, Json<LoadBalancer>), ApiError> {
    let mut tx = state.db.begin().await?;
    let lb = load_balancer::create(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    tracing::info!(lb_id = lb.id, name = %lb.name, "Load balancer created");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LOAD_BALANCER_CREATE,
        resource_types::LOAD_BALANCER,
        Some(&lb.uuid),
        Some(&lb.name),
        Some(json!({ "router_id": req.router_id, "zone_id": req.zone_id })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(lb)))
}

pub async fn get_load_balancer(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(lbid): Path<String>,
) -> Result<Json<LoadBalancerDetail>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let detail = load_balancer::detail(&cx, &mut tx, lb.id).await?;
    tx.commit().await?;
    Ok(Json(detail))
}

pub async fn update_load_balancer(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(lbid): Path<String>,
    Json(req): Json<UpdateLoadBalancerRequest>,
) -> Result<Json<LoadBalancer>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let updated = load_balancer::update(&cx, &mut tx, lb.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LOAD_BALANCER_UPDATE,
        resource_types::LOAD_BALANCER,
        Some(&updated.uuid),
        Some(&updated.name),
        Some(json!({ "old_name": lb.name })),
    )
    .await;

    Ok(Json(updated))
}

pub async fn delete_load_balancer(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(lbid): Path<String>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    load_balancer::delete(&cx, &mut tx, lb.id).await?;
    tx.commit().await?;

    tracing::info!(lb_id = lb.id, name = %lb.name, "Load balancer deleted");
    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::LOAD_BALANCER_DELETE,
        resource_types::LOAD_BALANCER,
        Some(&lb.uuid),
        Some(&lb.name),
        None,
    )
    .await;

    Ok(Json(RedirectResponse::to(COLLECTION)))
}

pub async fn list_floating_ips(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(lbid): Path<String>,
) -> Result<Json<Vec<FloatingIp>>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let fips = load_balancer::list_floating_ips(&cx, &mut tx, lb.id).await?;
    tx.commit().await?;
    Ok(Json(fips))
}

pub async fn attach_floating_ip(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path(lbid): Path<String>,
    Json(req): Json<AttachFloatingIpRequest>,
) -> Result<(StatusCode, Json<FloatingIp>), ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    let fip = load_balancer::attach_floating_ip(&cx, &mut tx, lb.id, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::FLOATING_IP_ATTACH,
        resource_types::FLOATING_IP,
        Some(&fip.uuid),
        Some(&fip.fip_address),
        Some(json!({ "load_balancer": lb.uuid })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(fip)))
}

pub async fn detach_floating_ip(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Path((lbid, fipid)): Path<(String, i64)>,
) -> Result<Json<RedirectResponse>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let lb = ids::load_balancer(&cx, &mut tx, &lbid).await?;
    load_balancer::detach_floating_ip(&cx, &mut tx, lb.id, fipid).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::FLOATING_IP_DETACH,
        resource_types::FLOATING_IP,
        Some(&fipid.to_string()),
        None,
        Some(json!({ "load_balancer": lb.uuid })),
    )
    .await;

    Ok(Json(RedirectResponse::to(format!(
        "{}/{}/floatingips",
        COLLECTION, lb.id
    ))))
}
