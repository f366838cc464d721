//! Routers, subnets, zones and hypervisors.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;

use crate::admin::{hypers, network, Membership};
use crate::db::{
    actions, resource_types, CreateRouterRequest, CreateSubnetRequest, Hyper, ListQuery,
    ListResponse, Router, Subnet, Zone,
};
use crate::AppState;

use super::audit::{audit_member, ClientIp};
use super::error::ApiError;
use super::ids::PathRef;

pub async fn list_routers(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Router>>, ApiError> {
    let mut tx = state.db.begin().await?;
    let routers = network::list_routers(&state.cx(&member), &mut tx, &query).await?;
    tx.commit().await?;
    Ok(Json(routers))
}

pub async fn create_router(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateRouterRequest>,
) -> Result<(StatusCode, Json<Router>), ApiError> {
    let mut tx = state.db.begin().await?;
    let router = network::create_router(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::ROUTER_CREATE,
        resource_types::ROUTER,
        Some(&router.uuid),
        Some(&router.name),
        Some(json!({ "zone_id": router.zone_id })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(router)))
}

pub async fn get_router(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(id): Path<String>,
) -> Result<Json<Router>, ApiError> {
    let cx = state.cx(&member);
    let mut tx = state.db.begin().await?;
    let router = match PathRef::parse(&id) {
        PathRef::Id(id) => network::get_router(&cx, &mut tx, id).await?,
        PathRef::Uuid(uuid) => network::get_router_by_uuid(&cx, &mut tx, uuid).await?,
    };
    tx.commit().await?;
    Ok(Json(router))
}

pub async fn list_subnets(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Subnet>>, ApiError> {
    let mut tx = state.db.begin().await?;
    let subnets = network::list_subnets(&state.cx(&member), &mut tx, &query).await?;
    tx.commit().await?;
    Ok(Json(subnets))
}

pub async fn create_subnet(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    ClientIp(ip): ClientIp,
    Json(req): Json<CreateSubnetRequest>,
) -> Result<(StatusCode, Json<Subnet>), ApiError> {
    let mut tx = state.db.begin().await?;
    let subnet = network::create_subnet(&state.cx(&member), &mut tx, &req).await?;
    tx.commit().await?;

    audit_member(
        &state,
        &member,
        ip.as_deref(),
        actions::SUBNET_CREATE,
        resource_types::SUBNET,
        Some(&subnet.uuid),
        Some(&subnet.name),
        Some(json!({ "network": subnet.network, "type": subnet.subnet_type, "vlan": subnet.vlan })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(subnet)))
}

pub async fn get_subnet(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
    Path(id): Path<i64>,
) -> Result<Json<Subnet>, ApiError> {
    let mut tx = state.db.begin().await?;
    let subnet = network::get_subnet(&state.cx(&member), &mut tx, id).await?;
    tx.commit().await?;
    Ok(Json(subnet))
}

pub async fn list_zones(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
) -> Result<Json<Vec<Zone>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(hypers::list_zones(&state.cx(&member), &mut conn).await?))
}

pub async fn list_hypers(
    State(state): State<Arc<AppState>>,
    Extension(member): Extension<Membership>,
) -> Result<Json<Vec<Hyper>>, ApiError> {
    let mut conn = state.db.acquire().await?;
    Ok(Json(hypers::list_hypers(&state.cx(&member), &mut conn).await?))
}
