//! VRRP instances: the MASTER/BACKUP interface pair that carries keepalived
//! and haproxy for a load balancer.

use serde::Serialize;
use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::network::{self, NewInterface, NewSubnet};
use super::{hypers, AdminContext};
use crate::db::{
    created_nanos, new_uuid, now, Interface, InterfaceType, LoadBalancer, Router, Subnet,
    SubnetType, VrrpInstance, VRRP_BACKUP, VRRP_MASTER,
};
use crate::dispatch::{format_group, Command, Control, GroupKind};

/// The two interfaces of a VRRP instance
#[derive(Debug, Clone)]
pub struct VrrpPair {
    pub master: Interface,
    pub backup: Interface,
}

impl VrrpPair {
    /// Hosts the pair is placed on, MASTER first
    pub fn placed_hypers(&self) -> Vec<i64> {
        [&self.master, &self.backup]
            .into_iter()
            .filter(|iface| iface.is_placed())
            .map(|iface| iface.hyper)
            .collect()
    }

    pub fn into_vec(self) -> Vec<Interface> {
        vec![self.master, self.backup]
    }
}

/// Floating IP entry of keepalived and haproxy payloads
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FloatingIpEntry {
    pub address: String,
    pub vlan: i64,
}

pub async fn get_vrrp_instance(conn: &mut SqliteConnection, id: i64) -> AdminResult<VrrpInstance> {
    sqlx::query_as::<_, VrrpInstance>(
        "SELECT * FROM vrrp_instances WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::ResourceNotFound, "VRRP instance not found")
}

/// The VRRP subnet of a router, created over `networking.vrrp_cidr` on first use
async fn ensure_vrrp_subnet(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    name: &str,
    router: &Router,
) -> AdminResult<Subnet> {
    if router.vrrp_subnet_id > 0 {
        return network::load_subnet(conn, router.vrrp_subnet_id).await;
    }

    let net = network::parse_cidr(&cx.config.networking.vrrp_cidr)?;
    let subnet_name = format!("{}-{}", name, created_nanos(&now()));
    let subnet = network::insert_subnet(
        cx,
        conn,
        NewSubnet {
            owner: router.owner,
            name: &subnet_name,
            network: net,
            gateway: None,
            vlan: None,
            kind: SubnetType::Vrrp,
            router_id: router.id,
        },
    )
    .await?;

    sqlx::query("UPDATE routers SET vrrp_subnet_id = ?, updated_at = ? WHERE id = ?")
        .bind(subnet.id)
        .bind(now())
        .bind(router.id)
        .execute(&mut *conn)
        .await?;

    Ok(subnet)
}

/// Create a VRRP instance on `router` and ask a host of `zone_id` to bring up
/// the MASTER side. The BACKUP side follows from the `set_vrrp_ip` callback.
pub async fn create_vrrp_instance(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    name: &str,
    router: &Router,
    zone_id: i64,
) -> AdminResult<VrrpInstance> {
    let subnet = ensure_vrrp_subnet(cx, conn, name, router).await?;

    let id = sqlx::query(
        r#"
        INSERT INTO vrrp_instances (uuid, owner, vrrp_subnet_id, zone_id, router_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(router.owner)
    .bind(subnet.id)
    .bind(zone_id)
    .bind(router.id)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let mut pair = Vec::with_capacity(2);
    for role in [VRRP_MASTER, VRRP_BACKUP] {
        let iface = network::create_interface(
            conn,
            &subnet,
            NewInterface {
                owner: router.owner,
                name: role,
                kind: InterfaceType::Vrrp,
                instance_id: 0,
                device: id,
                address: None,
                primary: false,
            },
        )
        .await?;
        pair.push(iface);
    }
    let (master, backup) = (&pair[0], &pair[1]);

    let control = if zone_id > 0 {
        Control::select(hypers::zone_hyper_group(conn, zone_id, -1).await?)
    } else {
        Control::inter(-1)
    };
    let command = Command::new("set_vrrp_ip")
        .arg(router.id)
        .arg(id)
        .arg(subnet.vlan)
        .arg(&master.mac_addr)
        .arg(&master.address)
        .arg(&backup.mac_addr)
        .arg(&backup.address)
        .arg(VRRP_MASTER);
    cx.dispatch(control, command).await?;

    tracing::info!(vrrp = id, router = router.id, vlan = subnet.vlan, "Created VRRP instance");
    get_vrrp_instance(conn, id).await
}

pub async fn vrrp_interfaces(conn: &mut SqliteConnection, vrrp_id: i64) -> AdminResult<VrrpPair> {
    let ifaces = sqlx::query_as::<_, Interface>(
        "SELECT * FROM interfaces WHERE if_type = 'vrrp' AND device = ? ORDER BY id",
    )
    .bind(vrrp_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut master = None;
    let mut backup = None;
    for iface in ifaces {
        match iface.name.as_str() {
            VRRP_MASTER => master = Some(iface),
            VRRP_BACKUP => backup = Some(iface),
            _ => {}
        }
    }

    match (master, backup) {
        (Some(master), Some(backup)) => Ok(VrrpPair { master, backup }),
        _ => Err(AdminError::not_found(
            ErrorKind::ResourceNotFound,
            format!("VRRP instance {} is missing its interfaces", vrrp_id),
        )),
    }
}

/// `group-vrrp-<vrrp>:<h1>,<h2>` over the placed interfaces, `None` while
/// neither side is placed
pub async fn placed_vrrp_group(
    conn: &mut SqliteConnection,
    vrrp_id: i64,
) -> AdminResult<Option<String>> {
    let hypers = vrrp_interfaces(conn, vrrp_id).await?.placed_hypers();
    if hypers.is_empty() {
        return Ok(None);
    }
    Ok(Some(format_group(GroupKind::Vrrp, vrrp_id, &hypers)))
}

pub async fn vrrp_hyper_group(conn: &mut SqliteConnection, vrrp_id: i64) -> AdminResult<String> {
    placed_vrrp_group(conn, vrrp_id).await?.ok_or_else(|| {
        AdminError::new(
            ErrorKind::NoQualifiedHypervisor,
            "No valid hyper for vrrp interfaces",
        )
    })
}

/// Record the host a VRRP interface came up on
pub async fn set_interface_hyper(
    conn: &mut SqliteConnection,
    vrrp_id: i64,
    role: &str,
    hyper: i64,
) -> AdminResult<()> {
    let updated = sqlx::query(
        "UPDATE interfaces SET hyper = ? WHERE if_type = 'vrrp' AND name = ? AND device = ?",
    )
    .bind(hyper)
    .bind(role)
    .bind(vrrp_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(AdminError::not_found(
            ErrorKind::ResourceNotFound,
            format!("No {} interface for VRRP instance {}", role, vrrp_id),
        ));
    }
    Ok(())
}

/// Floating IPs of a load balancer with the VLAN of their subnet
pub async fn floating_ip_entries(
    conn: &mut SqliteConnection,
    lb_id: i64,
) -> AdminResult<Vec<FloatingIpEntry>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT f.fip_address, s.vlan FROM floating_ips f
        INNER JOIN subnets s ON s.id = f.subnet_id
        WHERE f.load_balancer_id = ?
        ORDER BY f.id
        "#,
    )
    .bind(lb_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(address, vlan)| FloatingIpEntry { address, vlan })
        .collect())
}

/// Push keepalived configuration carrying the floating IPs of `lb` to both
/// sides of its VRRP pair
pub async fn create_vrrp_conf(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb: &LoadBalancer,
) -> AdminResult<()> {
    if !lb.is_available() {
        return Err(AdminError::new(
            ErrorKind::LoadBalancerUnavailable,
            format!("Load balancer {} is not available yet", lb.name),
        ));
    }

    let vrrp = get_vrrp_instance(conn, lb.vrrp_instance_id).await?;
    let subnet = network::load_subnet(conn, vrrp.vrrp_subnet_id).await?;
    let pair = vrrp_interfaces(conn, vrrp.id).await?;
    let payload = serde_json::to_string(&floating_ip_entries(conn, lb.id).await?)
        .map_err(|e| AdminError::new(ErrorKind::JsonMarshalFailed, "Failed to encode floating IPs").with_source(e))?;

    let sides = [
        (&pair.master, &pair.backup, VRRP_MASTER),
        (&pair.backup, &pair.master, VRRP_BACKUP),
    ];
    for (local, peer, role) in sides {
        if !local.is_placed() {
            tracing::debug!(vrrp = vrrp.id, role, "VRRP interface not placed yet, skipping keepalived conf");
            continue;
        }
        let command = Command::new("create_keepalived_conf")
            .arg(vrrp.router_id)
            .arg(vrrp.id)
            .arg(subnet.vlan)
            .arg(&local.address)
            .arg(&peer.address)
            .arg(role)
            .heredoc(payload.clone());
        cx.dispatch(Control::inter(local.hyper), command).await?;
    }
    Ok(())
}

/// Tear down keepalived on the pair, free both interfaces and soft delete the instance
pub async fn delete_vrrp_instance(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    vrrp_id: i64,
) -> AdminResult<()> {
    let vrrp = get_vrrp_instance(conn, vrrp_id).await?;
    let subnet = network::load_subnet(conn, vrrp.vrrp_subnet_id).await?;
    let pair = vrrp_interfaces(conn, vrrp.id).await?;

    let hypers = pair.placed_hypers();
    if hypers.is_empty() {
        tracing::info!(vrrp = vrrp.id, "VRRP pair was never placed, skipping keepalived cleanup");
    } else {
        let command = Command::new("clear_keepalived_conf")
            .arg(vrrp.router_id)
            .arg(vrrp.id)
            .arg(subnet.vlan)
            .arg(&pair.master.mac_addr)
            .arg(&pair.master.address)
            .arg(&pair.backup.mac_addr)
            .arg(&pair.backup.address);
        let group = format_group(GroupKind::Vrrp, vrrp.id, &hypers);
        cx.dispatch(Control::to_all(group), command).await?;
    }

    for iface in pair.into_vec() {
        network::delete_interface(conn, &iface).await?;
    }

    sqlx::query("UPDATE vrrp_instances SET deleted_at = ? WHERE id = ?")
        .bind(now())
        .bind(vrrp.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::db::Role;

    #[tokio::test]
    async fn test_create_vrrp_instance_dispatches_master() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 3, "zone-a").await;
        fx.hyper(&mut conn, 4, "zone-a").await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let router = fx.router(&mut conn, &member, zone).await;
        let cx = fx.cx(&member);

        let vrrp = create_vrrp_instance(&cx, &mut conn, "web", &router, zone).await.unwrap();
        let router = network::load_router(&mut conn, router.id).await.unwrap();
        assert_eq!(vrrp.vrrp_subnet_id, router.vrrp_subnet_id);

        let subnet = network::load_subnet(&mut conn, router.vrrp_subnet_id).await.unwrap();
        assert_eq!(subnet.kind(), SubnetType::Vrrp);
        assert!(subnet.gateway.is_empty());

        let pair = vrrp_interfaces(&mut conn, vrrp.id).await.unwrap();
        assert!(pair.placed_hypers().is_empty());
        assert_eq!(pair.master.address, "192.168.196.1/24");
        assert_eq!(pair.backup.address, "192.168.196.2/24");

        let calls = fx.recorder.calls_for("set_vrrp_ip");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, format!("select=group-zone-{}:3,4", zone));
        assert!(calls[0].1.ends_with(&format!(
            "'{}' '{}' '{}' '{}' '192.168.196.1/24' '{}' '192.168.196.2/24' 'MASTER'",
            router.id, vrrp.id, subnet.vlan, pair.master.mac_addr, pair.backup.mac_addr
        )));

        // a second instance reuses the router's VRRP subnet
        let second = create_vrrp_instance(&cx, &mut conn, "api", &router, zone).await.unwrap();
        assert_eq!(second.vrrp_subnet_id, vrrp.vrrp_subnet_id);
    }

    #[tokio::test]
    async fn test_vrrp_group_requires_placement() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 3, "zone-a").await;
        let router = fx.router(&mut conn, &fx.admin, zone).await;
        let vrrp = create_vrrp_instance(&fx.admin_cx(), &mut conn, "web", &router, zone)
            .await
            .unwrap();

        let err = vrrp_hyper_group(&mut conn, vrrp.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoQualifiedHypervisor);
        assert_eq!(err.to_string(), "No valid hyper for vrrp interfaces");

        set_interface_hyper(&mut conn, vrrp.id, VRRP_BACKUP, 7).await.unwrap();
        assert_eq!(
            vrrp_hyper_group(&mut conn, vrrp.id).await.unwrap(),
            format!("group-vrrp-{}:7", vrrp.id)
        );
        set_interface_hyper(&mut conn, vrrp.id, VRRP_MASTER, 3).await.unwrap();
        assert_eq!(
            vrrp_hyper_group(&mut conn, vrrp.id).await.unwrap(),
            format!("group-vrrp-{}:3,7", vrrp.id)
        );
    }

    #[tokio::test]
    async fn test_no_zone_lets_transport_pick() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let router = fx.router(&mut conn, &fx.admin, 0).await;
        create_vrrp_instance(&fx.admin_cx(), &mut conn, "web", &router, 0)
            .await
            .unwrap();
        assert_eq!(fx.recorder.calls_for("set_vrrp_ip")[0].0, "inter=");
    }

    #[tokio::test]
    async fn test_delete_releases_addresses() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let router = fx.router(&mut conn, &fx.admin, 0).await;
        let cx = fx.admin_cx();
        let vrrp = create_vrrp_instance(&cx, &mut conn, "web", &router, 0).await.unwrap();
        set_interface_hyper(&mut conn, vrrp.id, VRRP_MASTER, 3).await.unwrap();

        delete_vrrp_instance(&cx, &mut conn, vrrp.id).await.unwrap();

        let calls = fx.recorder.calls_for("clear_keepalived_conf");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, format!("toall=group-vrrp-{}:3", vrrp.id));
        assert!(get_vrrp_instance(&mut conn, vrrp.id).await.is_err());

        let (allocated,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM addresses WHERE subnet_id = ? AND allocated = 1",
        )
        .bind(vrrp.vrrp_subnet_id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(allocated, 0);
    }
}
