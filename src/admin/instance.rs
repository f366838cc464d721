//! Virtual machine instances.
//!
//! Every state change is driven through an agent script; the database only
//! records the intent (`pending`, `resizing`, `deleting`, ...) until the
//! matching callback reports the outcome.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::{catalog, hypers, network, volume, AdminContext};
use crate::api::validation::{validate_hostname, validate_name, validate_password, validate_port};
use crate::db::{
    created_unix, new_uuid, now, CreateInstanceRequest, Image, Instance, InstanceDetail,
    InstanceStatus, InterfaceType, ListQuery, ListResponse, PowerAction,
    ReinstallInstanceRequest, Role, SetPasswordRequest, UpdateInstanceRequest,
    VOLUME_STATUS_ATTACHED, VOLUME_STATUS_AVAILABLE, VOLUME_STATUS_DELETING,
    VOLUME_STATUS_REINSTALLING,
};
use crate::dispatch::{Command, Control, Resources};

const ORDER_COLUMNS: &[&str] = &["id", "hostname", "status", "created_at", "updated_at"];

/// Most instances a single create request may launch
pub const MAX_BATCH: i64 = 16;

const GIB: i64 = 1024 * 1024 * 1024;

/// Upper bounds on instance sizing, keeping KiB and byte conversions in range
pub const MAX_CPU: i64 = 512;
pub const MAX_MEMORY_MIB: i64 = 16 * 1024 * 1024;
pub const MAX_DISK_GIB: i64 = 1024 * 1024;

/// Commands queued by [`create`], run once the transaction has committed
pub type LaunchBatch = Vec<(Control, Command)>;

// ---------------------------------------------------------------------------
// Metadata handed to the guest agent
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct VlanInfo {
    device: String,
    vlan: i64,
    gateway: String,
    router: i64,
    ip_address: String,
    mac_address: String,
}

#[derive(Debug, Serialize)]
struct NetworkRoute {
    network: String,
    netmask: String,
    gateway: String,
}

#[derive(Debug, Serialize)]
struct InstanceNetwork {
    #[serde(rename = "type")]
    kind: String,
    ip_address: String,
    netmask: String,
    link: String,
    id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<NetworkRoute>,
}

#[derive(Debug, Serialize)]
struct NetworkLink {
    ethernet_mac_address: String,
    mtu: i64,
    id: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize)]
struct VolumeInfo {
    id: i64,
    uuid: String,
    booting: bool,
}

#[derive(Debug, Serialize)]
struct InstanceMetadata {
    userdata: String,
    dns: String,
    vlans: Vec<VlanInfo>,
    networks: Vec<InstanceNetwork>,
    links: Vec<NetworkLink>,
    volumes: Vec<VolumeInfo>,
    root_passwd: String,
    login_port: i64,
    os_code: String,
}

/// Hash a root password the way cloud-init expects it (sha512-crypt)
pub fn crypt_password(password: &str) -> AdminResult<String> {
    let params = sha_crypt::Sha512Params::new(sha_crypt::ROUNDS_DEFAULT)
        .map_err(|e| AdminError::new(ErrorKind::Unknown, format!("Invalid crypt parameters: {:?}", e)))?;
    sha_crypt::sha512_simple(password, &params)
        .map_err(|e| AdminError::new(ErrorKind::Unknown, format!("Failed to hash password: {:?}", e)))
}

/// Base64 encoded JSON describing the instance's networks and volumes
async fn build_metadata(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    instance: &Instance,
    image: &Image,
    root_passwd: &str,
) -> AdminResult<String> {
    let mut vlans = Vec::new();
    let mut networks = Vec::new();
    let mut links = Vec::new();

    for (i, iface) in network::instance_interfaces(conn, instance.id)
        .await?
        .into_iter()
        .enumerate()
    {
        let subnet = network::load_subnet(conn, iface.subnet_id).await?;
        let routes = if iface.primary_if && !subnet.gateway.is_empty() {
            vec![NetworkRoute {
                network: "0.0.0.0".to_string(),
                netmask: "0.0.0.0".to_string(),
                gateway: subnet.gateway_ip().to_string(),
            }]
        } else {
            Vec::new()
        };
        networks.push(InstanceNetwork {
            kind: "ipv4".to_string(),
            ip_address: iface.ip().to_string(),
            netmask: subnet.netmask.clone(),
            link: iface.name.clone(),
            id: format!("network{}", i),
            routes,
        });
        links.push(NetworkLink {
            ethernet_mac_address: iface.mac_addr.clone(),
            mtu: iface.mtu,
            id: iface.name.clone(),
            kind: "phy".to_string(),
        });
        vlans.push(VlanInfo {
            device: iface.name,
            vlan: subnet.vlan,
            gateway: subnet.gateway,
            router: subnet.router_id,
            ip_address: iface.address,
            mac_address: iface.mac_addr,
        });
    }

    let volumes = volume::instance_volumes(conn, instance.id)
        .await?
        .into_iter()
        .map(|v| VolumeInfo {
            id: v.id,
            uuid: v.uuid,
            booting: v.booting,
        })
        .collect();

    let metadata = InstanceMetadata {
        userdata: instance.userdata.clone(),
        dns: cx.config.instances.dns.clone(),
        vlans,
        networks,
        links,
        volumes,
        root_passwd: root_passwd.to_string(),
        login_port: instance.login_port,
        os_code: image.os_code.clone(),
    };
    let json = serde_json::to_vec(&metadata).map_err(|e| {
        AdminError::new(ErrorKind::JsonMarshalFailed, "Failed to encode instance metadata")
            .with_source(e)
    })?;
    Ok(BASE64.encode(json))
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn get(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<Instance> {
    let scope = cx.member.owner_scope();
    let instance = sqlx::query_as::<_, Instance>(
        "SELECT * FROM instances WHERE id = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(id)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::InstanceNotFound, "Instance not found")?;
    cx.member
        .require_owner(Role::Reader, instance.owner, "view this instance")?;
    Ok(instance)
}

pub async fn get_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    uuid: &str,
) -> AdminResult<Instance> {
    let scope = cx.member.owner_scope();
    let instance = sqlx::query_as::<_, Instance>(
        "SELECT * FROM instances WHERE uuid = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(uuid)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::InstanceNotFound, "Instance not found")?;
    cx.member
        .require_owner(Role::Reader, instance.owner, "view this instance")?;
    Ok(instance)
}

/// Instance by id, ignoring ownership. Used by agent callbacks.
pub async fn load(conn: &mut SqliteConnection, id: i64) -> AdminResult<Instance> {
    sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::InstanceNotFound, "Instance not found")
}

pub async fn detail(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
) -> AdminResult<InstanceDetail> {
    let instance = get(cx, conn, id).await?;
    let interfaces = network::instance_interfaces(conn, instance.id).await?;
    let volumes = volume::instance_volumes(conn, instance.id).await?;
    Ok(InstanceDetail {
        instance,
        interfaces,
        volumes,
    })
}

pub async fn list(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    query: &ListQuery,
) -> AdminResult<ListResponse<Instance>> {
    let scope = cx.member.owner_scope();
    let pattern = query.pattern();
    let filter =
        "deleted_at IS NULL AND (? IS NULL OR owner = ?) AND (? IS NULL OR hostname LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM instances WHERE {}", filter))
        .bind(scope)
        .bind(scope)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM instances WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ORDER_COLUMNS, "-created_at")
    );
    let items = sqlx::query_as::<_, Instance>(&sql)
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

/// Parse the id out of an `inst-<id>` domain name
pub fn instance_id_from_domain(domain: &str) -> AdminResult<i64> {
    domain
        .trim()
        .strip_prefix("inst-")
        .and_then(|id| id.parse::<i64>().ok())
        .filter(|id| *id > 0)
        .ok_or_else(|| AdminError::invalid(format!("Invalid instance domain: {}", domain)))
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Sizing from a flavor, explicit values, or a fallback
async fn resolve_sizing(
    conn: &mut SqliteConnection,
    flavor_id: Option<i64>,
    cpu: Option<i64>,
    memory: Option<i64>,
    disk: Option<i64>,
    fallback: Option<(i64, i64, i64, i64)>,
) -> AdminResult<(i64, i64, i64, i64)> {
    if let Some(flavor_id) = flavor_id {
        let flavor = catalog::get_flavor(conn, flavor_id).await?;
        check_sizing(flavor.cpu, flavor.memory, flavor.disk)?;
        return Ok((flavor.id, flavor.cpu, flavor.memory, flavor.disk));
    }
    let (flavor, cur_cpu, cur_memory, cur_disk) = match fallback {
        Some(current) => current,
        None => match (cpu, memory, disk) {
            (Some(c), Some(m), Some(d)) => (0, c, m, d),
            _ => {
                return Err(AdminError::invalid(
                    "Either flavor_id or cpu, memory and disk are required",
                ))
            }
        },
    };
    let sizing = (
        flavor,
        cpu.unwrap_or(cur_cpu),
        memory.unwrap_or(cur_memory),
        disk.unwrap_or(cur_disk),
    );
    check_sizing(sizing.1, sizing.2, sizing.3)?;
    Ok(sizing)
}

/// Reject non-positive or oversized cpu (cores), memory (MiB) and disk (GiB)
pub fn check_sizing(cpu: i64, memory: i64, disk: i64) -> AdminResult<()> {
    if cpu <= 0 || memory <= 0 || disk <= 0 {
        return Err(AdminError::invalid("cpu, memory and disk must be positive"));
    }
    if cpu > MAX_CPU || memory > MAX_MEMORY_MIB || disk > MAX_DISK_GIB {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidConfig,
            format!(
                "Sizing exceeds the limits of {} cpus, {} MB memory and {} GB disk",
                MAX_CPU, MAX_MEMORY_MIB, MAX_DISK_GIB
            ),
        ));
    }
    Ok(())
}

fn check_image_fits(image: &Image, disk_gib: i64) -> AdminResult<()> {
    let capacity = disk_gib.checked_mul(GIB).ok_or_else(|| {
        AdminError::new(
            ErrorKind::InstanceInvalidConfig,
            format!("Disk size {} GB is too large", disk_gib),
        )
    })?;
    if image.size > capacity {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidConfig,
            format!(
                "Image {} ({} bytes) does not fit a {} GB disk",
                image.name, image.size, disk_gib
            ),
        ));
    }
    Ok(())
}

async fn available_image(conn: &mut SqliteConnection, id: i64) -> AdminResult<Image> {
    let image = catalog::get_image(conn, id).await?;
    if image.status != "available" {
        return Err(AdminError::new(
            ErrorKind::ImageNotAvailable,
            format!("Image {} is not available", image.name),
        ));
    }
    Ok(image)
}

fn default_login_port(cx: &AdminContext<'_>, image: &Image) -> i64 {
    if image.is_windows() {
        cx.config.instances.default_windows_port
    } else {
        cx.config.instances.default_linux_port
    }
}

/// Insert the instance rows and queue one `launch_vm` per instance.
///
/// The returned batch must be executed after the transaction commits, so
/// agents never report on rows that do not exist yet.
pub async fn create(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateInstanceRequest,
) -> AdminResult<(Vec<Instance>, LaunchBatch)> {
    cx.member.require(Role::Writer, "create instances")?;
    if !(1..=MAX_BATCH).contains(&req.count) {
        return Err(AdminError::invalid(format!(
            "count must be between 1 and {}",
            MAX_BATCH
        )));
    }
    validate_hostname(&req.hostname).map_err(AdminError::invalid)?;

    let image = available_image(conn, req.image_id).await?;
    let (flavor_id, cpu, memory, disk) =
        resolve_sizing(conn, req.flavor_id, req.cpu, req.memory, req.disk, None).await?;
    check_image_fits(&image, disk)?;

    let zone = hypers::get_zone(conn, req.zone_id).await?;
    if let Some(hyper) = req.hyper_id {
        hypers::get_hyper_in_zone(conn, hyper, zone.id).await?;
    }
    let subnet = network::get_subnet(cx, conn, req.subnet_id).await?;

    let login_port = req
        .login_port
        .unwrap_or_else(|| default_login_port(cx, &image));
    validate_port(login_port).map_err(AdminError::invalid)?;

    let root_passwd = match req.root_passwd.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            validate_password(password).map_err(AdminError::invalid)?;
            crypt_password(password)?
        }
        None => String::new(),
    };

    let (existing,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM instances")
        .fetch_one(&mut *conn)
        .await?;
    let snapshot = existing / cx.config.instances.snapshot_interval.max(1) + 1;

    let resources = Resources::for_instance(cpu, memory, disk);
    let needs_group = req.hyper_id.is_none() || req.count > 1;
    let group = if needs_group {
        Some(hypers::zone_hyper_group(conn, zone.id, -1).await?)
    } else {
        None
    };

    let mut instances = Vec::with_capacity(req.count as usize);
    let mut batch = LaunchBatch::with_capacity(req.count as usize);

    for i in 0..req.count {
        let hostname = if req.count > 1 {
            format!("{}-{}", req.hostname, i + 1)
        } else {
            req.hostname.clone()
        };

        let ts = now();
        let id = sqlx::query(
            r#"
            INSERT INTO instances (uuid, owner, hostname, status, cpu, memory, disk, image_id,
                                   flavor_id, zone_id, router_id, hyper, login_port, userdata,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, -1, ?, ?, ?, ?)
            "#,
        )
        .bind(new_uuid())
        .bind(cx.member.org_id)
        .bind(&hostname)
        .bind(InstanceStatus::Pending.as_str())
        .bind(cpu)
        .bind(memory)
        .bind(disk)
        .bind(image.id)
        .bind(flavor_id)
        .bind(zone.id)
        .bind(subnet.router_id)
        .bind(login_port)
        .bind(req.userdata.as_deref().unwrap_or_default())
        .bind(&ts)
        .bind(&ts)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        let boot_volume = sqlx::query(
            r#"
            INSERT INTO volumes (uuid, owner, name, instance_id, booting, status, size, target, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, ?, ?, 'vda', ?, ?)
            "#,
        )
        .bind(new_uuid())
        .bind(cx.member.org_id)
        .bind(format!("instance-{}-boot-volume", id))
        .bind(id)
        .bind(VOLUME_STATUS_ATTACHED)
        .bind(disk)
        .bind(&ts)
        .bind(&ts)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        network::create_interface(
            conn,
            &subnet,
            network::NewInterface {
                owner: cx.member.org_id,
                name: "eth0",
                kind: InterfaceType::Instance,
                instance_id: id,
                device: 0,
                address: None,
                primary: true,
            },
        )
        .await?;

        let instance = load(conn, id).await?;
        let metadata = build_metadata(cx, conn, &instance, &image, &root_passwd).await?;

        let control = match (req.hyper_id, &group) {
            (Some(hyper), _) if i == 0 => Control::inter(hyper),
            (_, Some(group)) => Control::select(group.clone()),
            (hyper, None) => Control::inter(hyper.unwrap_or(-1)),
        }
        .with_resources(resources);

        let command = Command::new("launch_vm")
            .arg(id)
            .arg(image.id)
            .arg(&image.os_code)
            .arg(snapshot)
            .arg(&hostname)
            .arg(cpu)
            .arg(memory)
            .arg(disk)
            .arg(boot_volume)
            .heredoc(metadata);

        tracing::info!(instance = id, hostname = %hostname, "Queued instance launch");
        batch.push((control, command));
        instances.push(instance);
    }

    Ok((instances, batch))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

pub(crate) fn require_placed(instance: &Instance) -> AdminResult<i64> {
    if instance.hyper < 0 {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidState,
            format!("Instance {} is not running on a hypervisor", instance.hostname),
        ));
    }
    Ok(instance.hyper)
}

fn reject_migrating(instance: &Instance) -> AdminResult<()> {
    if instance.is(InstanceStatus::Migrating) {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidState,
            "Instance is not in a valid state",
        ));
    }
    Ok(())
}

async fn set_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: InstanceStatus,
) -> AdminResult<()> {
    sqlx::query("UPDATE instances SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn change_status(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    action: PowerAction,
) -> AdminResult<Instance> {
    let instance = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, instance.owner, "change the power state of this instance")?;
    reject_migrating(&instance)?;
    let hyper = require_placed(&instance)?;

    let command = Command::new("action_vm").arg(instance.id).arg(action.as_str());
    cx.dispatch(Control::inter(hyper), command)
        .await
        .map_err(|e| e.context(ErrorKind::InstancePowerActionFailed, "Failed to change instance power state"))?;

    tracing::info!(instance = instance.id, action = action.as_str(), "Requested power action");
    Ok(instance)
}

/// Apply a rename, resize and power action in that order.
///
/// Every field is checked before the first write or dispatch, so a rejected
/// request leaves the hypervisor untouched.
pub async fn update(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &UpdateInstanceRequest,
) -> AdminResult<Instance> {
    let instance = get(cx, conn, id).await?;
    reject_migrating(&instance)?;
    cx.member
        .require_owner(Role::Writer, instance.owner, "update this instance")?;

    let hostname = req
        .hostname
        .as_deref()
        .filter(|hostname| *hostname != instance.hostname);
    if let Some(hostname) = hostname {
        validate_hostname(hostname).map_err(AdminError::invalid)?;
    }
    if req.power_action.is_some() {
        require_placed(&instance)?;
    }

    let wants_resize = req.flavor_id.is_some()
        || req.cpu.is_some()
        || req.memory.is_some()
        || req.disk.is_some();
    let mut resize = None;
    if wants_resize {
        let current = (instance.flavor_id, instance.cpu, instance.memory, instance.disk);
        let (flavor_id, cpu, memory, disk) =
            resolve_sizing(conn, req.flavor_id, req.cpu, req.memory, req.disk, Some(current)).await?;

        if (cpu, memory, disk) != (instance.cpu, instance.memory, instance.disk) {
            if instance.is(InstanceStatus::Running) {
                return Err(AdminError::new(
                    ErrorKind::InstanceInvalidState,
                    "Instance must be stopped before it can be resized",
                ));
            }
            if disk < instance.disk {
                return Err(AdminError::new(
                    ErrorKind::InstanceInvalidConfig,
                    "Disk size cannot be reduced",
                ));
            }
            let hyper = require_placed(&instance)?;
            resize = Some((hyper, flavor_id, cpu, memory, disk));
        }
    }

    if let Some(hostname) = hostname {
        sqlx::query("UPDATE instances SET hostname = ?, updated_at = ? WHERE id = ?")
            .bind(hostname)
            .bind(now())
            .bind(instance.id)
            .execute(&mut *conn)
            .await?;
    }

    if let Some((hyper, flavor_id, cpu, memory, disk)) = resize {
        sqlx::query(
            r#"
            UPDATE instances SET status = ?, flavor_id = ?, cpu = ?, memory = ?, disk = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(InstanceStatus::Resizing.as_str())
        .bind(flavor_id)
        .bind(cpu)
        .bind(memory)
        .bind(disk)
        .bind(now())
        .bind(instance.id)
        .execute(&mut *conn)
        .await?;

        let command = Command::new("resize_vm")
            .arg(instance.id)
            .arg(cpu)
            .arg(memory)
            .arg(disk);
        let control = Control::inter(hyper).with_resources(Resources::for_instance(cpu, memory, disk));
        cx.dispatch(control, command)
            .await
            .map_err(|e| e.context(ErrorKind::InstanceUpdateFailed, "Failed to resize instance"))?;
    }

    if let Some(action) = req.power_action {
        change_status(cx, conn, instance.id, action).await?;
    }

    load(conn, instance.id).await
}

pub async fn reinstall(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &ReinstallInstanceRequest,
) -> AdminResult<Instance> {
    let instance = get(cx, conn, id).await?;
    reject_migrating(&instance)?;
    cx.member
        .require_owner(Role::Writer, instance.owner, "reinstall this instance")?;

    let boot_volume = volume::boot_volume(conn, instance.id).await?;
    let image = available_image(conn, req.image_id.unwrap_or(instance.image_id)).await?;
    let current = (instance.flavor_id, instance.cpu, instance.memory, instance.disk);
    let (flavor_id, cpu, memory, disk) =
        resolve_sizing(conn, req.flavor_id, None, None, None, Some(current)).await?;
    check_image_fits(&image, disk)?;
    if disk < instance.disk {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidConfig,
            "Disk size cannot be reduced",
        ));
    }
    let hyper = require_placed(&instance)?;

    let login_port = req
        .login_port
        .unwrap_or_else(|| default_login_port(cx, &image));
    validate_port(login_port).map_err(AdminError::invalid)?;
    let root_passwd = match req.root_passwd.as_deref().filter(|p| !p.is_empty()) {
        Some(password) => {
            validate_password(password).map_err(AdminError::invalid)?;
            crypt_password(password)?
        }
        None => String::new(),
    };

    let ts = now();
    sqlx::query(
        r#"
        UPDATE instances SET status = ?, image_id = ?, flavor_id = ?, cpu = ?, memory = ?, disk = ?,
                             login_port = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(InstanceStatus::Reinstalling.as_str())
    .bind(image.id)
    .bind(flavor_id)
    .bind(cpu)
    .bind(memory)
    .bind(disk)
    .bind(login_port)
    .bind(&ts)
    .bind(instance.id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE volumes SET status = ?, size = ?, updated_at = ? WHERE id = ?")
        .bind(VOLUME_STATUS_REINSTALLING)
        .bind(disk)
        .bind(&ts)
        .bind(boot_volume.id)
        .execute(&mut *conn)
        .await?;

    let updated = load(conn, instance.id).await?;
    let metadata = build_metadata(cx, conn, &updated, &image, &root_passwd).await?;
    let command = Command::new("reinstall_vm")
        .arg(instance.id)
        .arg(image.id)
        .arg(&image.os_code)
        .arg(boot_volume.id)
        .arg(cpu)
        .arg(memory)
        .arg(disk)
        .heredoc(metadata);
    cx.dispatch(Control::inter(hyper), command)
        .await
        .map_err(|e| e.context(ErrorKind::InstanceUpdateFailed, "Failed to reinstall instance"))?;

    tracing::info!(instance = instance.id, image = image.id, "Requested reinstall");
    Ok(updated)
}

pub async fn set_user_password(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &SetPasswordRequest,
) -> AdminResult<()> {
    if !cx.config.instances.qa_enabled {
        return Err(AdminError::invalid(
            "Setting guest passwords is disabled on this deployment",
        ));
    }
    let instance = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, instance.owner, "set passwords on this instance")?;
    if !instance.is(InstanceStatus::Running) {
        return Err(AdminError::new(
            ErrorKind::InstanceInvalidState,
            "Instance must be running to set a password",
        ));
    }
    validate_name(&req.user).map_err(AdminError::invalid)?;
    validate_password(&req.password).map_err(AdminError::invalid)?;
    let hyper = require_placed(&instance)?;

    let command = Command::new("set_user_passwd")
        .arg(instance.id)
        .arg(&req.user)
        .heredoc(req.password.clone());
    cx.dispatch(Control::inter(hyper), command)
        .await
        .map_err(|e| e.context(ErrorKind::InstanceUpdateFailed, "Failed to set user password"))?;

    tracing::info!(instance = instance.id, user = %req.user, "Requested password change");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ClearedInterface {
    name: String,
    mac_address: String,
    ip_address: String,
    vlan: i64,
}

#[derive(Debug, Serialize)]
struct ClearPayload {
    interfaces: Vec<ClearedInterface>,
}

pub async fn delete(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    let instance = get(cx, conn, id).await?;
    reject_migrating(&instance)?;
    cx.member
        .require_owner(Role::Writer, instance.owner, "delete this instance")?;

    let ts = now();
    let mut boot_volume_id = 0;
    for volume in volume::instance_volumes(conn, instance.id).await? {
        if volume.booting {
            boot_volume_id = volume.id;
            sqlx::query("UPDATE volumes SET status = ?, updated_at = ? WHERE id = ?")
                .bind(VOLUME_STATUS_DELETING)
                .bind(&ts)
                .bind(volume.id)
                .execute(&mut *conn)
                .await?;
        } else {
            sqlx::query("UPDATE volumes SET instance_id = 0, status = ?, updated_at = ? WHERE id = ?")
                .bind(VOLUME_STATUS_AVAILABLE)
                .bind(&ts)
                .bind(volume.id)
                .execute(&mut *conn)
                .await?;
        }
    }

    let mut interfaces = Vec::new();
    for iface in network::instance_interfaces(conn, instance.id).await? {
        let subnet = network::load_subnet(conn, iface.subnet_id).await?;
        interfaces.push(ClearedInterface {
            name: iface.name,
            mac_address: iface.mac_addr,
            ip_address: iface.address,
            vlan: subnet.vlan,
        });
    }
    let payload = serde_json::to_string(&ClearPayload { interfaces }).map_err(|e| {
        AdminError::new(ErrorKind::JsonMarshalFailed, "Failed to encode interfaces").with_source(e)
    })?;

    let control = if instance.hyper >= 0 {
        Control::inter(instance.hyper)
    } else {
        Control::to_all("")
    };
    let command = Command::new("clear_vm")
        .arg(instance.id)
        .arg(instance.router_id)
        .arg(boot_volume_id)
        .heredoc(payload);
    cx.dispatch(control, command)
        .await
        .map_err(|e| e.context(ErrorKind::InstanceDeleteFailed, "Failed to delete instance"))?;

    set_status(conn, instance.id, InstanceStatus::Deleting).await?;
    tracing::info!(instance = instance.id, hostname = %instance.hostname, "Requested instance deletion");
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent reports
// ---------------------------------------------------------------------------

/// Apply a `launch_vm` report. Ignored while the instance is migrating.
pub async fn record_launch(
    conn: &mut SqliteConnection,
    id: i64,
    status: &str,
    hyper: i64,
    reason: &str,
) -> AdminResult<()> {
    let instance = load(conn, id).await?;
    if instance.is(InstanceStatus::Migrating) {
        tracing::info!(instance = id, "Instance is migrating, ignoring launch report");
        return Ok(());
    }

    let zone_id = match hypers::get_hyper(conn, hyper).await {
        Ok(h) => h.zone_id,
        Err(e) if e.kind.is_not_found() => instance.zone_id,
        Err(e) => return Err(e),
    };

    sqlx::query(
        "UPDATE instances SET status = ?, hyper = ?, zone_id = ?, reason = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(hyper)
    .bind(zone_id)
    .bind(reason)
    .bind(now())
    .bind(id)
    .execute(&mut *conn)
    .await?;

    network::set_instance_interfaces_hyper(conn, id, hyper).await
}

/// Apply an `action_vm` report
pub async fn record_status(conn: &mut SqliteConnection, id: i64, status: &str) -> AdminResult<()> {
    let updated = sqlx::query("UPDATE instances SET status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(status)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(AdminError::not_found(ErrorKind::InstanceNotFound, "Instance not found"));
    }
    Ok(())
}

/// Apply a `clear_vm` report: free the network, detach data volumes, drop
/// the boot volume and soft delete the instance.
pub async fn finish_delete(conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    let instance = load(conn, id).await?;
    network::release_instance_interfaces(conn, id).await?;

    let ts = now();
    sqlx::query(
        "UPDATE volumes SET instance_id = 0, status = ?, updated_at = ? WHERE instance_id = ? AND booting = 0 AND deleted_at IS NULL",
    )
    .bind(VOLUME_STATUS_AVAILABLE)
    .bind(&ts)
    .bind(id)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE volumes SET deleted_at = ?, updated_at = ? WHERE instance_id = ? AND booting = 1 AND deleted_at IS NULL",
    )
    .bind(&ts)
    .bind(&ts)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "UPDATE instances SET hostname = ?, status = ?, updated_at = ?, deleted_at = ? WHERE id = ?",
    )
    .bind(format!("{}-{}", instance.hostname, created_unix(&instance.created_at)))
    .bind(InstanceStatus::Deleted.as_str())
    .bind(&ts)
    .bind(&ts)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    tracing::info!(instance = id, hostname = %instance.hostname, "Instance deleted");
    Ok(())
}
