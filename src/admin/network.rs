//! Routers, subnets, address pools and network interfaces.

use ipnetwork::Ipv4Network;
use rand::Rng;
use sqlx::SqliteConnection;
use std::net::Ipv4Addr;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::hypers;
use super::AdminContext;
use crate::api::validation::validate_name;
use crate::db::{
    new_uuid, now, CreateRouterRequest, CreateSubnetRequest, Interface, InterfaceType, ListQuery,
    ListResponse, Role, Router, Subnet, SubnetType,
};

const ROUTER_ORDER: &[&str] = &["id", "name", "created_at"];
const SUBNET_ORDER: &[&str] = &["id", "name", "vlan", "created_at"];

/// Smallest prefix accepted for a subnet; every host address gets a row
const MIN_PREFIX: u8 = 16;

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

pub async fn create_router(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateRouterRequest,
) -> AdminResult<Router> {
    cx.member.require(Role::Writer, "create routers")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;

    let zone_id = req.zone_id.unwrap_or(0);
    if zone_id > 0 {
        hypers::get_zone(conn, zone_id).await?;
    }

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO routers (uuid, owner, name, zone_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(cx.member.org_id)
    .bind(&req.name)
    .bind(zone_id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    tracing::info!(router = id, name = %req.name, "Created router");
    load_router(conn, id).await
}

/// Router by id, ignoring ownership
pub async fn load_router(conn: &mut SqliteConnection, id: i64) -> AdminResult<Router> {
    sqlx::query_as::<_, Router>("SELECT * FROM routers WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::RouterNotFound, "Router not found")
}

pub async fn get_router(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
) -> AdminResult<Router> {
    let scope = cx.member.owner_scope();
    let router = sqlx::query_as::<_, Router>(
        "SELECT * FROM routers WHERE id = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(id)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::RouterNotFound, "Router not found")?;
    cx.member
        .require_owner(Role::Reader, router.owner, "view this router")?;
    Ok(router)
}

pub async fn get_router_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    uuid: &str,
) -> AdminResult<Router> {
    let scope = cx.member.owner_scope();
    sqlx::query_as::<_, Router>(
        "SELECT * FROM routers WHERE uuid = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(uuid)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::RouterNotFound, "Router not found")
}

pub async fn list_routers(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    query: &ListQuery,
) -> AdminResult<ListResponse<Router>> {
    let scope = cx.member.owner_scope();
    let pattern = query.pattern();
    let filter = "deleted_at IS NULL AND (? IS NULL OR owner = ?) AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM routers WHERE {}", filter))
        .bind(scope)
        .bind(scope)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM routers WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ROUTER_ORDER, "-created_at")
    );
    let items = sqlx::query_as::<_, Router>(&sql)
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

// ---------------------------------------------------------------------------
// Subnets and addresses
// ---------------------------------------------------------------------------

/// Parse an IPv4 CIDR, rejecting networks too large to pre-populate
pub fn parse_cidr(cidr: &str) -> AdminResult<Ipv4Network> {
    let net: Ipv4Network = cidr
        .trim()
        .parse()
        .map_err(|e| AdminError::invalid(format!("Invalid CIDR {}: {}", cidr, e)))?;
    if net.prefix() < MIN_PREFIX {
        return Err(AdminError::invalid(format!(
            "Subnet {} is too large (minimum prefix /{})",
            cidr, MIN_PREFIX
        )));
    }
    Ok(net)
}

/// Host addresses of a network. Network and broadcast addresses are skipped
/// unless the network is a /31 or /32.
pub fn host_addresses(net: &Ipv4Network) -> Vec<Ipv4Addr> {
    let network = net.network();
    let broadcast = net.broadcast();
    net.iter()
        .filter(|ip| net.prefix() >= 31 || (*ip != network && *ip != broadcast))
        .collect()
}

async fn next_vlan(conn: &mut SqliteConnection, start: i64) -> AdminResult<i64> {
    let (vlan,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(vlan) + 1, ?) FROM subnets WHERE vlan >= ?")
            .bind(start)
            .bind(start)
            .fetch_one(&mut *conn)
            .await?;
    Ok(vlan)
}

/// Values of a subnet row about to be written
pub struct NewSubnet<'a> {
    pub owner: i64,
    pub name: &'a str,
    pub network: Ipv4Network,
    /// Gateway IP without prefix, empty for none
    pub gateway: Option<Ipv4Addr>,
    pub vlan: Option<i64>,
    pub kind: SubnetType,
    pub router_id: i64,
}

/// Insert a subnet and one address row per host address
pub async fn insert_subnet(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    new: NewSubnet<'_>,
) -> AdminResult<Subnet> {
    let vlan = match new.vlan {
        Some(vlan) => vlan,
        None => next_vlan(conn, cx.config.networking.vlan_start).await?,
    };
    let prefix = new.network.prefix();
    let gateway = new
        .gateway
        .map(|ip| format!("{}/{}", ip, prefix))
        .unwrap_or_default();
    let ts = now();

    let id = sqlx::query(
        r#"
        INSERT INTO subnets (uuid, owner, name, network, netmask, gateway, vlan,
                             subnet_type, router_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(new.owner)
    .bind(new.name)
    .bind(new.network.network().to_string())
    .bind(new.network.mask().to_string())
    .bind(&gateway)
    .bind(vlan)
    .bind(new.kind.as_str())
    .bind(new.router_id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    for ip in host_addresses(&new.network) {
        sqlx::query("INSERT INTO addresses (subnet_id, address) VALUES (?, ?)")
            .bind(id)
            .bind(format!("{}/{}", ip, prefix))
            .execute(&mut *conn)
            .await?;
    }

    tracing::info!(subnet = id, name = new.name, vlan, kind = %new.kind, "Created subnet");
    load_subnet(conn, id).await
}

pub async fn create_subnet(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateSubnetRequest,
) -> AdminResult<Subnet> {
    cx.member.require(Role::Writer, "create subnets")?;
    if req.subnet_type != SubnetType::Internal {
        cx.member
            .require_admin(&format!("create {} subnets", req.subnet_type))?;
    }
    validate_name(&req.name).map_err(AdminError::invalid)?;

    let net = parse_cidr(&req.cidr)?;
    let net = Ipv4Network::new(net.network(), net.prefix())
        .map_err(|e| AdminError::invalid(format!("Invalid CIDR {}: {}", req.cidr, e)))?;

    let gateway = match req.gateway.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
        Some(gw) => {
            let ip: Ipv4Addr = crate::db::strip_prefix_len(gw)
                .parse()
                .map_err(|_| AdminError::invalid(format!("Invalid gateway {}", gw)))?;
            if !net.contains(ip) {
                return Err(AdminError::invalid(format!(
                    "Gateway {} is outside {}",
                    ip, net
                )));
            }
            Some(ip)
        }
        None if req.subnet_type == SubnetType::Vrrp => None,
        None => host_addresses(&net).first().copied(),
    };

    if let Some(vlan) = req.vlan {
        if !(1..=16_777_215).contains(&vlan) {
            return Err(AdminError::invalid("VLAN must be between 1 and 16777215"));
        }
    }

    let router_id = match req.router_id {
        Some(id) => get_router(cx, conn, id).await?.id,
        None => 0,
    };

    insert_subnet(
        cx,
        conn,
        NewSubnet {
            owner: cx.member.org_id,
            name: &req.name,
            network: net,
            gateway,
            vlan: req.vlan,
            kind: req.subnet_type,
            router_id,
        },
    )
    .await
}

/// Subnet by id, ignoring ownership
pub async fn load_subnet(conn: &mut SqliteConnection, id: i64) -> AdminResult<Subnet> {
    sqlx::query_as::<_, Subnet>("SELECT * FROM subnets WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::SubnetNotFound, "Subnet not found")
}

/// Subnet visible to the caller. Public subnets are visible to everyone.
pub async fn get_subnet(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
) -> AdminResult<Subnet> {
    let scope = cx.member.owner_scope();
    sqlx::query_as::<_, Subnet>(
        "SELECT * FROM subnets WHERE id = ? AND (? IS NULL OR owner = ? OR subnet_type = 'public')",
    )
    .bind(id)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::SubnetNotFound, "Subnet not found")
}

pub async fn list_subnets(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    query: &ListQuery,
) -> AdminResult<ListResponse<Subnet>> {
    let scope = cx.member.owner_scope();
    let pattern = query.pattern();
    let filter = "(? IS NULL OR owner = ? OR subnet_type = 'public') AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM subnets WHERE {}", filter))
        .bind(scope)
        .bind(scope)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM subnets WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(SUBNET_ORDER, "-created_at")
    );
    let items = sqlx::query_as::<_, Subnet>(&sql)
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

/// First public subnet that still has a free address
pub async fn find_public_subnet(conn: &mut SqliteConnection) -> AdminResult<Subnet> {
    sqlx::query_as::<_, Subnet>(
        r#"
        SELECT s.* FROM subnets s
        WHERE s.subnet_type = 'public'
          AND EXISTS (
            SELECT 1 FROM addresses a
            WHERE a.subnet_id = s.id AND a.allocated = 0 AND a.address != s.gateway
          )
        ORDER BY s.id
        LIMIT 1
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::AddressExhausted, "No public subnet with free addresses")
}

/// Allocate an address of `subnet` to `interface_id`.
///
/// With `requested`, that exact address must be free; otherwise the first
/// free address that is not the gateway is taken. Returns `ip/prefix`.
pub async fn allocate_address(
    conn: &mut SqliteConnection,
    subnet: &Subnet,
    requested: Option<&str>,
    interface_id: i64,
) -> AdminResult<String> {
    let row: Option<(i64, String)> = match requested {
        Some(addr) => {
            let addr = if addr.contains('/') {
                addr.to_string()
            } else {
                let prefix = subnet.gateway.split('/').nth(1).map(str::to_string);
                let prefix = match prefix {
                    Some(p) => p,
                    None => ipnetwork::ipv4_mask_to_prefix(
                        subnet.netmask.parse().map_err(|_| {
                            AdminError::invalid(format!("Subnet {} has an invalid netmask", subnet.id))
                        })?,
                    )
                    .map_err(|e| AdminError::invalid(e.to_string()))?
                    .to_string(),
                };
                format!("{}/{}", addr, prefix)
            };
            let row = sqlx::query_as(
                "SELECT id, address FROM addresses WHERE subnet_id = ? AND address = ? AND allocated = 0",
            )
            .bind(subnet.id)
            .bind(&addr)
            .fetch_optional(&mut *conn)
            .await?;
            if row.is_none() {
                return Err(AdminError::invalid(format!(
                    "Address {} is not available in subnet {}",
                    addr, subnet.name
                )));
            }
            row
        }
        None => {
            sqlx::query_as(
                r#"
                SELECT id, address FROM addresses
                WHERE subnet_id = ? AND allocated = 0 AND address != ?
                ORDER BY id
                LIMIT 1
                "#,
            )
            .bind(subnet.id)
            .bind(&subnet.gateway)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    let (id, address) = row.ok_or_else(|| {
        AdminError::new(
            ErrorKind::AddressExhausted,
            format!("No free address in subnet {}", subnet.name),
        )
    })?;

    sqlx::query("UPDATE addresses SET allocated = 1, interface_id = ? WHERE id = ?")
        .bind(interface_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(address)
}

pub async fn release_address(
    conn: &mut SqliteConnection,
    subnet_id: i64,
    address: &str,
) -> AdminResult<()> {
    sqlx::query(
        "UPDATE addresses SET allocated = 0, interface_id = 0 WHERE subnet_id = ? AND address = ?",
    )
    .bind(subnet_id)
    .bind(address)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Interfaces
// ---------------------------------------------------------------------------

/// `52:54:xx:xx:xx:xx` with random low bytes
pub fn random_mac() -> String {
    let bytes: [u8; 4] = rand::rng().random();
    format!(
        "52:54:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3]
    )
}

pub struct NewInterface<'a> {
    pub owner: i64,
    pub name: &'a str,
    pub kind: InterfaceType,
    pub instance_id: i64,
    /// VRRP instance id for vrrp interfaces
    pub device: i64,
    pub address: Option<&'a str>,
    pub primary: bool,
}

/// Create an unplaced interface on `subnet` with a freshly allocated address
pub async fn create_interface(
    conn: &mut SqliteConnection,
    subnet: &Subnet,
    new: NewInterface<'_>,
) -> AdminResult<Interface> {
    let id = sqlx::query(
        r#"
        INSERT INTO interfaces (uuid, owner, name, mac_addr, if_type, instance_id, device,
                                hyper, subnet_id, primary_if, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, -1, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(new.owner)
    .bind(new.name)
    .bind(random_mac())
    .bind(new.kind.as_str())
    .bind(new.instance_id)
    .bind(new.device)
    .bind(subnet.id)
    .bind(new.primary)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    let address = allocate_address(conn, subnet, new.address, id).await?;
    sqlx::query("UPDATE interfaces SET address = ? WHERE id = ?")
        .bind(&address)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    get_interface(conn, id).await
}

pub async fn get_interface(conn: &mut SqliteConnection, id: i64) -> AdminResult<Interface> {
    sqlx::query_as::<_, Interface>("SELECT * FROM interfaces WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::ResourceNotFound, "Interface not found")
}

/// Release the interface's address and remove it
pub async fn delete_interface(conn: &mut SqliteConnection, iface: &Interface) -> AdminResult<()> {
    if !iface.address.is_empty() {
        release_address(conn, iface.subnet_id, &iface.address).await?;
    }
    sqlx::query("DELETE FROM interfaces WHERE id = ?")
        .bind(iface.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn instance_interfaces(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> AdminResult<Vec<Interface>> {
    Ok(sqlx::query_as::<_, Interface>(
        "SELECT * FROM interfaces WHERE if_type = 'instance' AND instance_id = ? ORDER BY primary_if DESC, id",
    )
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn set_instance_interfaces_hyper(
    conn: &mut SqliteConnection,
    instance_id: i64,
    hyper: i64,
) -> AdminResult<()> {
    sqlx::query("UPDATE interfaces SET hyper = ? WHERE if_type = 'instance' AND instance_id = ?")
        .bind(hyper)
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete every interface of an instance, freeing the addresses
pub async fn release_instance_interfaces(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> AdminResult<usize> {
    let ifaces = instance_interfaces(conn, instance_id).await?;
    for iface in &ifaces {
        delete_interface(conn, iface).await?;
    }
    Ok(ifaces.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;

    fn subnet_req(name: &str, cidr: &str, kind: SubnetType) -> CreateSubnetRequest {
        CreateSubnetRequest {
            name: name.to_string(),
            cidr: cidr.to_string(),
            gateway: None,
            vlan: None,
            subnet_type: kind,
            router_id: None,
        }
    }

    #[test]
    fn test_host_addresses() {
        let net: Ipv4Network = "10.0.0.0/29".parse().unwrap();
        let hosts = host_addresses(&net);
        assert_eq!(hosts.len(), 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[5], Ipv4Addr::new(10, 0, 0, 6));

        let p2p: Ipv4Network = "10.0.0.0/31".parse().unwrap();
        assert_eq!(host_addresses(&p2p).len(), 2);
    }

    #[test]
    fn test_parse_cidr_rejects_large_networks() {
        assert!(parse_cidr("10.0.0.0/24").is_ok());
        assert!(parse_cidr("10.0.0.0/8").is_err());
        assert!(parse_cidr("not-a-cidr").is_err());
    }

    #[test]
    fn test_random_mac_format() {
        let mac = random_mac();
        assert!(mac.starts_with("52:54:"));
        assert_eq!(mac.len(), 17);
    }

    #[tokio::test]
    async fn test_create_subnet_populates_addresses() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let cx = fx.admin_cx();

        let subnet = create_subnet(&cx, &mut conn, &subnet_req("lan", "10.1.0.0/28", SubnetType::Internal))
            .await
            .unwrap();
        assert_eq!(subnet.network, "10.1.0.0");
        assert_eq!(subnet.netmask, "255.255.255.240");
        assert_eq!(subnet.gateway, "10.1.0.1/28");
        assert_eq!(subnet.vlan, 5000);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM addresses WHERE subnet_id = ?")
            .bind(subnet.id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 14);

        let second = create_subnet(&cx, &mut conn, &subnet_req("lan2", "10.2.0.0/28", SubnetType::Internal))
            .await
            .unwrap();
        assert_eq!(second.vlan, 5001);
    }

    #[tokio::test]
    async fn test_public_subnet_requires_admin() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, writer) = fx.org_member(&mut conn, "acme", Role::Writer).await;

        let err = create_subnet(
            &fx.cx(&writer),
            &mut conn,
            &subnet_req("pub", "203.0.113.0/28", SubnetType::Public),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_allocation_skips_gateway_and_exhausts() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let cx = fx.admin_cx();
        let subnet = create_subnet(&cx, &mut conn, &subnet_req("tiny", "10.3.0.0/30", SubnetType::Internal))
            .await
            .unwrap();

        let first = allocate_address(&mut conn, &subnet, None, 1).await.unwrap();
        assert_eq!(first, "10.3.0.2/30");
        let err = allocate_address(&mut conn, &subnet, None, 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AddressExhausted);

        release_address(&mut conn, subnet.id, &first).await.unwrap();
        let again = allocate_address(&mut conn, &subnet, Some("10.3.0.2"), 3).await.unwrap();
        assert_eq!(again, "10.3.0.2/30");
    }

    #[tokio::test]
    async fn test_interface_lifecycle() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let cx = fx.admin_cx();
        let subnet = create_subnet(&cx, &mut conn, &subnet_req("lan", "10.4.0.0/29", SubnetType::Internal))
            .await
            .unwrap();

        let iface = create_interface(
            &mut conn,
            &subnet,
            NewInterface {
                owner: 1,
                name: "eth0",
                kind: InterfaceType::Instance,
                instance_id: 9,
                device: 0,
                address: None,
                primary: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(iface.ip(), "10.4.0.2");
        assert!(!iface.is_placed());

        set_instance_interfaces_hyper(&mut conn, 9, 4).await.unwrap();
        let ifaces = instance_interfaces(&mut conn, 9).await.unwrap();
        assert_eq!(ifaces[0].hyper, 4);

        assert_eq!(release_instance_interfaces(&mut conn, 9).await.unwrap(), 1);
        let again = allocate_address(&mut conn, &subnet, None, 0).await.unwrap();
        assert_eq!(again, "10.4.0.2/29");
    }

    #[tokio::test]
    async fn test_router_scope() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, alice) = fx.org_member(&mut conn, "alice", Role::Writer).await;
        let (_, bob) = fx.org_member(&mut conn, "bob", Role::Writer).await;

        let router = create_router(
            &fx.cx(&alice),
            &mut conn,
            &CreateRouterRequest {
                name: "r1".to_string(),
                zone_id: None,
            },
        )
        .await
        .unwrap();

        assert!(get_router(&fx.cx(&alice), &mut conn, router.id).await.is_ok());
        let err = get_router(&fx.cx(&bob), &mut conn, router.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RouterNotFound);

        let listed = list_routers(&fx.cx(&bob), &mut conn, &ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 0);
        let listed = list_routers(&fx.admin_cx(), &mut conn, &ListQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.total, 1);
    }
}
