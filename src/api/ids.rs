//! Path identifiers: numeric ids, or UUIDs for anything else.
//!
//! The resolvers apply the same owner scoping as the admin lookups.

use sqlx::SqliteConnection;

use crate::admin::{
    backend, instance, listener, load_balancer, volume, AdminContext, AdminResult,
};
use crate::db::{Backend, Instance, Listener, LoadBalancer, Volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRef<'a> {
    Id(i64),
    Uuid(&'a str),
}

impl<'a> PathRef<'a> {
    pub fn parse(segment: &'a str) -> Self {
        match segment.parse::<i64>() {
            Ok(id) => PathRef::Id(id),
            Err(_) => PathRef::Uuid(segment),
        }
    }
}

pub async fn load_balancer(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    segment: &str,
) -> AdminResult<LoadBalancer> {
    match PathRef::parse(segment) {
        PathRef::Id(id) => load_balancer::get(cx, conn, id).await,
        PathRef::Uuid(uuid) => load_balancer::get_by_uuid(cx, conn, uuid).await,
    }
}

pub async fn listener(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    segment: &str,
) -> AdminResult<Listener> {
    let (_, lstn) = match PathRef::parse(segment) {
        PathRef::Id(id) => listener::get(cx, conn, lb_id, id).await?,
        PathRef::Uuid(uuid) => listener::get_by_uuid(cx, conn, lb_id, uuid).await?,
    };
    Ok(lstn)
}

pub async fn backend(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    segment: &str,
) -> AdminResult<Backend> {
    let (_, _, bk) = match PathRef::parse(segment) {
        PathRef::Id(id) => backend::get(cx, conn, lb_id, listener_id, id).await?,
        PathRef::Uuid(uuid) => backend::get_by_uuid(cx, conn, lb_id, listener_id, uuid).await?,
    };
    Ok(bk)
}

pub async fn instance(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    segment: &str,
) -> AdminResult<Instance> {
    match PathRef::parse(segment) {
        PathRef::Id(id) => instance::get(cx, conn, id).await,
        PathRef::Uuid(uuid) => instance::get_by_uuid(cx, conn, uuid).await,
    }
}

pub async fn volume(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    segment: &str,
) -> AdminResult<Volume> {
    match PathRef::parse(segment) {
        PathRef::Id(id) => volume::get(cx, conn, id).await,
        PathRef::Uuid(uuid) => volume::get_by_uuid(cx, conn, uuid).await,
    }
}
