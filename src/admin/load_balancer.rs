//! Load balancers and their floating IPs.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::{backend, hypers, listener, network, vrrp, AdminContext};
use crate::api::validation::validate_name;
use crate::db::{
    created_unix, new_uuid, now, AttachFloatingIpRequest, CreateLoadBalancerRequest, FloatingIp,
    ListQuery, ListResponse, ListenerResponse, LoadBalancer, LoadBalancerDetail, Role, SubnetType,
    UpdateLoadBalancerRequest, STATUS_AVAILABLE, STATUS_DELETED,
};

const ORDER_COLUMNS: &[&str] = &["id", "name", "status", "created_at", "updated_at"];

enum Key<'a> {
    Id(i64),
    Uuid(&'a str),
    Name(&'a str),
}

async fn find(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    key: Key<'_>,
) -> AdminResult<LoadBalancer> {
    let column = match key {
        Key::Id(_) => "id",
        Key::Uuid(_) => "uuid",
        Key::Name(_) => "name",
    };
    let sql = format!(
        "SELECT * FROM load_balancers WHERE {} = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
        column
    );
    let scope = cx.member.owner_scope();
    let query = sqlx::query_as::<_, LoadBalancer>(&sql);
    let query = match key {
        Key::Id(id) => query.bind(id),
        Key::Uuid(uuid) => query.bind(uuid.to_string()),
        Key::Name(name) => query.bind(name.to_string()),
    };
    let lb = query
        .bind(scope)
        .bind(scope)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::LoadBalancerNotFound, "Load balancer not found")?;

    cx.member
        .require_owner(Role::Reader, lb.owner, "view this load balancer")?;
    Ok(lb)
}

pub async fn get(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<LoadBalancer> {
    find(cx, conn, Key::Id(id)).await
}

pub async fn get_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    uuid: &str,
) -> AdminResult<LoadBalancer> {
    find(cx, conn, Key::Uuid(uuid)).await
}

pub async fn get_by_name(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    name: &str,
) -> AdminResult<LoadBalancer> {
    find(cx, conn, Key::Name(name)).await
}

/// Load balancer by id, ignoring ownership. Used by agent callbacks.
pub async fn load(conn: &mut SqliteConnection, id: i64) -> AdminResult<LoadBalancer> {
    sqlx::query_as::<_, LoadBalancer>(
        "SELECT * FROM load_balancers WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::LoadBalancerNotFound, "Load balancer not found")
}

pub async fn find_by_vrrp(
    conn: &mut SqliteConnection,
    vrrp_id: i64,
) -> AdminResult<Option<LoadBalancer>> {
    Ok(sqlx::query_as::<_, LoadBalancer>(
        "SELECT * FROM load_balancers WHERE vrrp_instance_id = ? AND deleted_at IS NULL",
    )
    .bind(vrrp_id)
    .fetch_optional(&mut *conn)
    .await?)
}

pub async fn create(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateLoadBalancerRequest,
) -> AdminResult<LoadBalancer> {
    cx.member.require(Role::Writer, "create load balancers")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;

    let router = network::get_router(cx, conn, req.router_id).await?;
    cx.member
        .require_owner(Role::Writer, router.owner, "create load balancers on this router")?;

    let zone_id = req.zone_id.unwrap_or(router.zone_id);
    if zone_id > 0 {
        hypers::get_zone(conn, zone_id).await?;
    }

    let (taken,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM load_balancers WHERE owner = ? AND name = ? AND deleted_at IS NULL",
    )
    .bind(router.owner)
    .bind(&req.name)
    .fetch_one(&mut *conn)
    .await?;
    if taken > 0 {
        return Err(AdminError::invalid(format!(
            "Load balancer {} already exists",
            req.name
        )));
    }

    let vrrp = vrrp::create_vrrp_instance(cx, conn, &req.name, &router, zone_id)
        .await
        .map_err(|e| {
            e.context(
                ErrorKind::LoadBalancerCreateFailed,
                "Failed to create VRRP instance for load balancer",
            )
        })?;

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO load_balancers (uuid, owner, name, status, router_id, vrrp_instance_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(router.owner)
    .bind(&req.name)
    .bind(STATUS_AVAILABLE)
    .bind(router.id)
    .bind(vrrp.id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    tracing::info!(lb = id, name = %req.name, vrrp = vrrp.id, "Created load balancer");
    load(conn, id).await
}

pub async fn detail(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
) -> AdminResult<LoadBalancerDetail> {
    let lb = get(cx, conn, id).await?;
    let vrrp = vrrp::get_vrrp_instance(conn, lb.vrrp_instance_id).await?;
    let subnet = network::load_subnet(conn, vrrp.vrrp_subnet_id).await?;
    let vrrp_interfaces = vrrp::vrrp_interfaces(conn, vrrp.id).await?.into_vec();
    let floating_ips = list_floating_ips(cx, conn, lb.id).await?;
    let listeners = listener::listeners_of(conn, lb.id)
        .await?
        .into_iter()
        .map(ListenerResponse::from)
        .collect();

    Ok(LoadBalancerDetail {
        load_balancer: lb,
        vlan: subnet.vlan,
        vrrp_interfaces,
        floating_ips,
        listeners,
    })
}

pub async fn update(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &UpdateLoadBalancerRequest,
) -> AdminResult<LoadBalancer> {
    let lb = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, lb.owner, "update this load balancer")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;

    if req.name != lb.name {
        sqlx::query("UPDATE load_balancers SET name = ?, updated_at = ? WHERE id = ?")
            .bind(&req.name)
            .bind(now())
            .bind(lb.id)
            .execute(&mut *conn)
            .await?;
    }
    load(conn, lb.id).await
}

pub async fn delete(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    let lb = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, lb.owner, "delete this load balancer")?;

    for fip in floating_ips_of(conn, lb.id).await? {
        release_floating_ip(conn, &fip).await?;
    }

    listener::delete_all(conn, lb.id).await?;

    let deleted_name = format!("{}-{}", lb.name, created_unix(&lb.created_at));
    sqlx::query("UPDATE load_balancers SET name = ?, updated_at = ? WHERE id = ?")
        .bind(&deleted_name)
        .bind(now())
        .bind(lb.id)
        .execute(&mut *conn)
        .await?;

    vrrp::delete_vrrp_instance(cx, conn, lb.vrrp_instance_id)
        .await
        .map_err(|e| e.context(ErrorKind::LoadBalancerDeleteFailed, "Failed to delete VRRP instance"))?;

    sqlx::query("UPDATE load_balancers SET status = ?, deleted_at = ? WHERE id = ?")
        .bind(STATUS_DELETED)
        .bind(now())
        .bind(lb.id)
        .execute(&mut *conn)
        .await?;

    tracing::info!(lb = lb.id, name = %lb.name, "Deleted load balancer");
    Ok(())
}

pub async fn list(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    query: &ListQuery,
) -> AdminResult<ListResponse<LoadBalancer>> {
    let scope = cx.member.owner_scope();
    let pattern = query.pattern();
    let filter = "deleted_at IS NULL AND (? IS NULL OR owner = ?) AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) =
        sqlx::query_as(&format!("SELECT COUNT(*) FROM load_balancers WHERE {}", filter))
            .bind(scope)
            .bind(scope)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_one(&mut *conn)
            .await?;

    let sql = format!(
        "SELECT * FROM load_balancers WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ORDER_COLUMNS, "-created_at")
    );
    let items = sqlx::query_as::<_, LoadBalancer>(&sql)
        .bind(scope)
        .bind(scope)
        .bind(&pattern)
        .bind(&pattern)
        .bind(query.limit())
        .bind(query.offset())
        .fetch_all(&mut *conn)
        .await?;

    Ok(ListResponse::new(total, query, items))
}

/// Set a load balancer available and push its configuration once the VRRP
/// pair is up
pub async fn mark_available(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    vrrp_id: i64,
) -> AdminResult<Option<LoadBalancer>> {
    sqlx::query(
        "UPDATE load_balancers SET status = ?, updated_at = ? WHERE vrrp_instance_id = ? AND deleted_at IS NULL",
    )
    .bind(STATUS_AVAILABLE)
    .bind(now())
    .bind(vrrp_id)
    .execute(&mut *conn)
    .await?;

    let Some(lb) = find_by_vrrp(conn, vrrp_id).await? else {
        tracing::warn!(vrrp = vrrp_id, "No load balancer for VRRP instance");
        return Ok(None);
    };

    if !floating_ips_of(conn, lb.id).await?.is_empty() {
        vrrp::create_vrrp_conf(cx, conn, &lb).await?;
    }
    backend::sync_haproxy_conf(cx, conn, &lb).await?;
    Ok(Some(lb))
}

// ---------------------------------------------------------------------------
// Floating IPs
// ---------------------------------------------------------------------------

async fn floating_ips_of(conn: &mut SqliteConnection, lb_id: i64) -> AdminResult<Vec<FloatingIp>> {
    Ok(sqlx::query_as::<_, FloatingIp>(
        "SELECT * FROM floating_ips WHERE load_balancer_id = ? ORDER BY id",
    )
    .bind(lb_id)
    .fetch_all(&mut *conn)
    .await?)
}

async fn release_floating_ip(conn: &mut SqliteConnection, fip: &FloatingIp) -> AdminResult<()> {
    network::release_address(conn, fip.subnet_id, &fip.fip_address).await?;
    sqlx::query("DELETE FROM floating_ips WHERE id = ?")
        .bind(fip.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_floating_ips(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
) -> AdminResult<Vec<FloatingIp>> {
    let lb = get(cx, conn, lb_id).await?;
    floating_ips_of(conn, lb.id).await
}

pub async fn attach_floating_ip(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    req: &AttachFloatingIpRequest,
) -> AdminResult<FloatingIp> {
    let lb = get(cx, conn, lb_id).await?;
    cx.member
        .require_owner(Role::Writer, lb.owner, "attach floating IPs to this load balancer")?;

    let subnet = match req.subnet_id {
        Some(id) => {
            let subnet = network::load_subnet(conn, id).await?;
            if subnet.kind() != SubnetType::Public {
                return Err(AdminError::invalid(format!(
                    "Subnet {} is not a public subnet",
                    subnet.name
                )));
            }
            subnet
        }
        None => network::find_public_subnet(conn).await?,
    };

    let address = network::allocate_address(conn, &subnet, req.address.as_deref(), 0).await?;
    let id = sqlx::query(
        r#"
        INSERT INTO floating_ips (uuid, owner, load_balancer_id, subnet_id, fip_address, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(lb.owner)
    .bind(lb.id)
    .bind(subnet.id)
    .bind(&address)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    if lb.is_available() {
        vrrp::create_vrrp_conf(cx, conn, &lb).await?;
        backend::sync_haproxy_conf(cx, conn, &lb).await?;
    }

    tracing::info!(lb = lb.id, address = %address, "Attached floating IP");
    sqlx::query_as::<_, FloatingIp>("SELECT * FROM floating_ips WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(AdminError::from)
}

pub async fn detach_floating_ip(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    fip_id: i64,
) -> AdminResult<()> {
    let lb = get(cx, conn, lb_id).await?;
    cx.member
        .require_owner(Role::Writer, lb.owner, "detach floating IPs from this load balancer")?;

    let fip = sqlx::query_as::<_, FloatingIp>(
        "SELECT * FROM floating_ips WHERE id = ? AND load_balancer_id = ?",
    )
    .bind(fip_id)
    .bind(lb.id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::FloatingIpNotFound, "Floating IP not found")?;

    release_floating_ip(conn, &fip).await?;

    if lb.is_available() {
        vrrp::create_vrrp_conf(cx, conn, &lb).await?;
        backend::sync_haproxy_conf(cx, conn, &lb).await?;
    }
    tracing::info!(lb = lb.id, address = %fip.fip_address, "Detached floating IP");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::db::{VRRP_BACKUP, VRRP_MASTER};

    #[tokio::test]
    async fn test_create_and_get() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 3, "zone-a").await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let router = fx.router(&mut conn, &member, zone).await;
        let cx = fx.cx(&member);

        let lb = create(
            &cx,
            &mut conn,
            &CreateLoadBalancerRequest {
                name: "web".to_string(),
                router_id: router.id,
                zone_id: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(lb.status, STATUS_AVAILABLE);
        assert_eq!(lb.owner, member.org_id);
        assert!(lb.vrrp_instance_id > 0);

        assert_eq!(get_by_uuid(&cx, &mut conn, &lb.uuid).await.unwrap().id, lb.id);
        assert_eq!(get_by_name(&cx, &mut conn, "web").await.unwrap().id, lb.id);

        let detail = detail(&cx, &mut conn, lb.id).await.unwrap();
        assert_eq!(detail.vrrp_interfaces.len(), 2);
        assert!(detail.vlan >= 5000);

        let err = create(
            &cx,
            &mut conn,
            &CreateLoadBalancerRequest {
                name: "web".to_string(),
                router_id: router.id,
                zone_id: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_create_fails_without_qualified_hyper() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 3, "zone-a").await;
        sqlx::query("UPDATE hypers SET status = 0")
            .execute(&mut *conn)
            .await
            .unwrap();
        let router = fx.router(&mut conn, &fx.admin, zone).await;

        let err = create(
            &fx.admin_cx(),
            &mut conn,
            &CreateLoadBalancerRequest {
                name: "web".to_string(),
                router_id: router.id,
                zone_id: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LoadBalancerCreateFailed);
    }

    #[tokio::test]
    async fn test_reader_cannot_create_or_see_others() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, reader) = fx.org_member(&mut conn, "acme", Role::Reader).await;
        let (_, other) = fx.org_member(&mut conn, "globex", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &other, "web").await;

        let err = create(
            &fx.cx(&reader),
            &mut conn,
            &CreateLoadBalancerRequest {
                name: "x".to_string(),
                router_id: lb.router_id,
                zone_id: None,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let err = get(&fx.cx(&reader), &mut conn, lb.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LoadBalancerNotFound);
        let listed = list(&fx.cx(&reader), &mut conn, &ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 0);
    }

    #[tokio::test]
    async fn test_list_filters_by_name() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        fx.load_balancer(&mut conn, &member, "web-1").await;
        fx.load_balancer(&mut conn, &member, "web-2").await;
        fx.load_balancer(&mut conn, &member, "db").await;

        let cx = fx.cx(&member);
        let all = list(&cx, &mut conn, &ListQuery::default()).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.items[0].name, "db");

        let query = ListQuery {
            q: Some("web".to_string()),
            order: Some("name".to_string()),
            limit: Some(1),
            ..Default::default()
        };
        let page = list(&cx, &mut conn, &query).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].name, "web-1");
    }

    #[tokio::test]
    async fn test_floating_ip_pushes_keepalived_conf() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let public = fx.public_subnet(&mut conn, "203.0.113.0/28", 300).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        vrrp::set_interface_hyper(&mut conn, lb.vrrp_instance_id, VRRP_MASTER, 3).await.unwrap();
        vrrp::set_interface_hyper(&mut conn, lb.vrrp_instance_id, VRRP_BACKUP, 4).await.unwrap();
        fx.recorder.clear();

        let cx = fx.cx(&member);
        let fip = attach_floating_ip(&cx, &mut conn, lb.id, &AttachFloatingIpRequest::default())
            .await
            .unwrap();
        assert_eq!(fip.subnet_id, public.id);
        assert_eq!(fip.fip_address, "203.0.113.2/28");

        let calls = fx.recorder.calls_for("create_keepalived_conf");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "inter=3");
        assert!(calls[0].1.contains("'MASTER'<<EOF\n[{\"address\":\"203.0.113.2/28\",\"vlan\":300}]\nEOF"));
        assert_eq!(calls[1].0, "inter=4");
        assert!(calls[1].1.contains("'BACKUP'<<EOF"));

        detach_floating_ip(&cx, &mut conn, lb.id, fip.id).await.unwrap();
        assert!(list_floating_ips(&cx, &mut conn, lb.id).await.unwrap().is_empty());
        let err = detach_floating_ip(&cx, &mut conn, lb.id, fip.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FloatingIpNotFound);
    }

    #[tokio::test]
    async fn test_delete_tears_everything_down() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        fx.public_subnet(&mut conn, "203.0.113.0/28", 300).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        vrrp::set_interface_hyper(&mut conn, lb.vrrp_instance_id, VRRP_MASTER, 3).await.unwrap();
        let cx = fx.cx(&member);
        attach_floating_ip(&cx, &mut conn, lb.id, &AttachFloatingIpRequest::default())
            .await
            .unwrap();
        fx.recorder.clear();

        delete(&cx, &mut conn, lb.id).await.unwrap();

        assert_eq!(fx.recorder.calls_for("clear_keepalived_conf").len(), 1);
        assert!(get(&cx, &mut conn, lb.id).await.is_err());

        let (name, status): (String, String) =
            sqlx::query_as("SELECT name, status FROM load_balancers WHERE id = ?")
                .bind(lb.id)
                .fetch_one(&mut *conn)
                .await
                .unwrap();
        assert_eq!(name, format!("web-{}", created_unix(&lb.created_at)));
        assert_eq!(status, STATUS_DELETED);

        let (fips,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM floating_ips")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(fips, 0);

        // the name is free again
        fx.load_balancer(&mut conn, &member, "web").await;
    }
}
