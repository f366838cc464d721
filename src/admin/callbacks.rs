//! Reports sent back by hypervisor agents.
//!
//! Agents echo the script name as the first argument, so `args[0]` is the
//! command and the positional values start at `args[1]`.

use serde::Deserialize;
use sqlx::SqliteConnection;
use std::str::FromStr;

use super::error::{AdminError, AdminResult, ErrorKind};
use super::hypers::{self, HyperReport};
use super::{instance, load_balancer, network, volume, vrrp, AdminContext};
use crate::db::{VRRP_BACKUP, VRRP_MASTER};
use crate::dispatch::{Command, Control};

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> AdminResult<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| AdminError::invalid(format!("Missing argument {} ({})", idx, name)))
}

fn parse_arg<T: FromStr>(args: &[String], idx: usize, name: &str) -> AdminResult<T> {
    let raw = arg(args, idx, name)?;
    raw.trim()
        .parse()
        .map_err(|_| AdminError::invalid(format!("Invalid {}: {}", name, raw)))
}

fn vrrp_role(raw: &str) -> AdminResult<&'static str> {
    match raw.to_ascii_uppercase().as_str() {
        VRRP_MASTER => Ok(VRRP_MASTER),
        VRRP_BACKUP => Ok(VRRP_BACKUP),
        _ => Err(AdminError::invalid(format!("Invalid VRRP role: {}", raw))),
    }
}

/// Apply one agent report inside the caller's transaction
pub async fn handle(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CallbackRequest,
) -> AdminResult<()> {
    let args = req.args.as_slice();
    tracing::debug!(command = %req.command, args = ?args, "Agent callback");

    match volume_command(&req.command) {
        "hyper_status" => hyper_status(conn, args).await,
        "launch_vm" => {
            let id = parse_arg(args, 1, "instance id")?;
            let status = arg(args, 2, "status")?;
            let hyper = parse_arg(args, 3, "hyper id")?;
            let reason = args.get(4).map(String::as_str).unwrap_or_default();
            instance::record_launch(conn, id, status, hyper, reason).await
        }
        "action_vm" => {
            let id = parse_arg(args, 1, "instance id")?;
            instance::record_status(conn, id, arg(args, 2, "status")?).await
        }
        "clear_vm" => instance::finish_delete(conn, parse_arg(args, 1, "instance id")?).await,
        "set_vrrp_ip" => set_vrrp_ip(cx, conn, args).await,
        "create_keepalived_conf" => {
            let vrrp_id = parse_arg(args, 1, "vrrp id")?;
            let hyper = parse_arg(args, 2, "hyper id")?;
            let role = vrrp_role(arg(args, 3, "role")?)?;
            vrrp::set_interface_hyper(conn, vrrp_id, role, hyper).await
        }
        "create_volume" => {
            let id = parse_arg(args, 1, "volume id")?;
            let path = arg(args, 2, "path")?;
            volume::record_create(conn, id, path, arg(args, 3, "status")?).await
        }
        "attach_volume" if args.len() == 2 => {
            volume::record_attach_failed(conn, parse_arg(args, 1, "volume id")?).await
        }
        "attach_volume" => {
            let instance_id = parse_arg(args, 1, "instance id")?;
            let id = parse_arg(args, 2, "volume id")?;
            volume::record_attach(conn, instance_id, id, arg(args, 3, "target")?).await
        }
        "detach_volume" => volume::record_detach(conn, parse_arg(args, 2, "volume id")?).await,
        "resize_volume" => {
            let id = parse_arg(args, 1, "volume id")?;
            volume::record_resize(conn, id, arg(args, 2, "status")?).await
        }
        _ => Err(AdminError::invalid(format!(
            "Unknown callback command: {}",
            req.command
        ))),
    }
}

/// Volume scripts carry the storage driver as a suffix
/// (`attach_volume_local`); reports are handled the same for every driver.
fn volume_command(command: &str) -> &str {
    for base in ["create_volume", "attach_volume", "detach_volume", "resize_volume"] {
        if let Some(rest) = command.strip_prefix(base) {
            if rest.is_empty() || rest.starts_with('_') {
                return base;
            }
        }
    }
    command
}

async fn hyper_status(conn: &mut SqliteConnection, args: &[String]) -> AdminResult<()> {
    let report = HyperReport {
        hostid: parse_arg(args, 1, "host id")?,
        hostname: arg(args, 2, "hostname")?.to_string(),
        cpu: parse_arg(args, 3, "cpu")?,
        total_cpu: parse_arg(args, 4, "total cpu")?,
        memory: parse_arg(args, 5, "memory")?,
        total_memory: parse_arg(args, 6, "total memory")?,
        disk: parse_arg(args, 7, "disk")?,
        total_disk: parse_arg(args, 8, "total disk")?,
        status: parse_arg(args, 9, "state")?,
        host_ip: arg(args, 10, "host ip")?.to_string(),
        zone_name: arg(args, 11, "zone")?.to_string(),
    };
    if report.hostid < 0 {
        return Err(AdminError::invalid("Invalid host id"));
    }
    let hyper = hypers::upsert_hyper(conn, &report).await?;
    tracing::debug!(hyper = hyper.hostid, zone = %report.zone_name, status = hyper.status, "Hypervisor status");
    Ok(())
}

/// A VRRP interface came up. After the MASTER, bring up the BACKUP on a
/// different host; once the BACKUP is up (or no host is left for it) the load
/// balancer becomes available.
async fn set_vrrp_ip(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    args: &[String],
) -> AdminResult<()> {
    let vrrp_id: i64 = parse_arg(args, 1, "vrrp id")?;
    let hyper: i64 = parse_arg(args, 2, "hyper id")?;
    let role = vrrp_role(arg(args, 3, "role")?)?;
    if hyper < 0 {
        return Err(AdminError::invalid("Invalid hyper id"));
    }
    hypers::get_hyper(conn, hyper).await?;

    let instance = vrrp::get_vrrp_instance(conn, vrrp_id).await?;
    vrrp::set_interface_hyper(conn, vrrp_id, role, hyper).await?;
    tracing::info!(vrrp = vrrp_id, hyper, role, "VRRP interface placed");

    if role == VRRP_BACKUP {
        load_balancer::mark_available(cx, conn, vrrp_id).await?;
        return Ok(());
    }

    let group = match hypers::zone_hyper_group(conn, instance.zone_id, hyper).await {
        Ok(group) => group,
        Err(e) if e.kind == ErrorKind::NoQualifiedHypervisor => {
            tracing::warn!(vrrp = vrrp_id, "No host left for the BACKUP interface");
            load_balancer::mark_available(cx, conn, vrrp_id).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let pair = vrrp::vrrp_interfaces(conn, vrrp_id).await?;
    let subnet = network::load_subnet(conn, instance.vrrp_subnet_id).await?;
    let command = Command::new("set_vrrp_ip")
        .arg(instance.router_id)
        .arg(vrrp_id)
        .arg(subnet.vlan)
        .arg(&pair.backup.mac_addr)
        .arg(&pair.backup.address)
        .arg(&pair.master.mac_addr)
        .arg(&pair.master.address)
        .arg(VRRP_BACKUP);
    cx.dispatch(Control::select(group), command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::db::{CreateListenerRequest, ListenerMode, Role, STATUS_AVAILABLE};

    fn req(command: &str, args: &[&str]) -> CallbackRequest {
        let mut all = vec![command.to_string()];
        all.extend(args.iter().map(|a| a.to_string()));
        CallbackRequest {
            command: command.to_string(),
            args: all,
        }
    }

    #[test]
    fn test_vrrp_role() {
        assert_eq!(vrrp_role("master").unwrap(), VRRP_MASTER);
        assert_eq!(vrrp_role("BACKUP").unwrap(), VRRP_BACKUP);
        assert!(vrrp_role("standby").is_err());
    }

    #[test]
    fn test_parse_arg_errors() {
        let args = vec!["x".to_string(), "abc".to_string()];
        assert_eq!(
            parse_arg::<i64>(&args, 1, "id").unwrap_err().kind,
            ErrorKind::InvalidParameter
        );
        assert!(arg(&args, 5, "missing").is_err());
    }

    #[tokio::test]
    async fn test_hyper_status_registers_host() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let cx = fx.admin_cx();

        handle(
            &cx,
            &mut conn,
            &req(
                "hyper_status",
                &["7", "hyper-7", "12", "16", "30000", "65536", "500", "1000", "1", "10.0.0.7", "zone-b"],
            ),
        )
        .await
        .unwrap();

        let hyper = hypers::get_hyper(&mut conn, 7).await.unwrap();
        assert_eq!(hyper.hostname, "hyper-7");
        assert_eq!(hyper.total_memory, 65536);
        assert!(hyper.is_ready());
        assert_eq!(hypers::get_zone(&mut conn, hyper.zone_id).await.unwrap().name, "zone-b");

        let err = handle(&cx, &mut conn, &req("hyper_status", &["7", "short"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_volume_command() {
        assert_eq!(volume_command("attach_volume_local"), "attach_volume");
        assert_eq!(volume_command("resize_volume"), "resize_volume");
        assert_eq!(volume_command("create_volumes"), "create_volumes");
        assert_eq!(volume_command("launch_vm"), "launch_vm");
    }

    #[tokio::test]
    async fn test_volume_reports() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let cx = fx.admin_cx();
        let created = volume::create(
            &cx,
            &mut conn,
            &crate::db::CreateVolumeRequest {
                name: "data".to_string(),
                size: 10,
            },
        )
        .await
        .unwrap();
        let id = created.id.to_string();

        handle(
            &cx,
            &mut conn,
            &req("create_volume_local", &[&id, "local:///volumes/data.qcow2", "available"]),
        )
        .await
        .unwrap();
        let vol = volume::load(&mut conn, created.id).await.unwrap();
        assert_eq!(vol.status, "available");
        assert_eq!(vol.path, "local:///volumes/data.qcow2");

        // unknown instance
        let err = handle(&cx, &mut conn, &req("attach_volume_local", &["999", &id, "vdb"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InstanceNotFound);

        handle(&cx, &mut conn, &req("attach_volume_local", &[&id]))
            .await
            .unwrap();
        handle(&cx, &mut conn, &req("resize_volume_local", &[&id, "resized"]))
            .await
            .unwrap();
        assert_eq!(volume::load(&mut conn, created.id).await.unwrap().status, "available");

        handle(&cx, &mut conn, &req("detach_volume_local", &["5", &id]))
            .await
            .unwrap();
        let vol = volume::load(&mut conn, created.id).await.unwrap();
        assert_eq!(vol.instance_id, 0);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let err = handle(&fx.admin_cx(), &mut conn, &req("format_disk", &["1"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_vrrp_bring_up() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        fx.hyper(&mut conn, 3, "zone-a").await;
        fx.hyper(&mut conn, 4, "zone-a").await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        crate::admin::listener::create(
            &fx.cx(&member),
            &mut conn,
            lb.id,
            &CreateListenerRequest {
                name: "http".to_string(),
                mode: ListenerMode::Http,
                port: 80,
                certificate: None,
                key: None,
            },
        )
        .await
        .unwrap();
        fx.recorder.clear();

        let cx = fx.admin_cx();
        let vrrp_id = lb.vrrp_instance_id.to_string();
        handle(&cx, &mut conn, &req("set_vrrp_ip", &[&vrrp_id, "3", "MASTER"]))
            .await
            .unwrap();

        let pair = vrrp::vrrp_interfaces(&mut conn, lb.vrrp_instance_id).await.unwrap();
        assert_eq!(pair.master.hyper, 3);
        let calls = fx.recorder.calls_for("set_vrrp_ip");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "select=group-zone-0:4");
        assert!(calls[0].1.ends_with(&format!(
            "'{}' '{}' '{}' '{}' 'BACKUP'",
            pair.backup.mac_addr, pair.backup.address, pair.master.mac_addr, pair.master.address
        )));

        handle(&cx, &mut conn, &req("set_vrrp_ip", &[&vrrp_id, "4", "BACKUP"]))
            .await
            .unwrap();
        let lb = load_balancer::load(&mut conn, lb.id).await.unwrap();
        assert_eq!(lb.status, STATUS_AVAILABLE);
        let haproxy = fx.recorder.calls_for("create_haproxy_conf");
        assert_eq!(haproxy.len(), 1);
        assert_eq!(haproxy[0].0, format!("toall=group-vrrp-{}:3,4", lb.vrrp_instance_id));
    }

    #[tokio::test]
    async fn test_vrrp_master_without_spare_host() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        fx.hyper(&mut conn, 3, "zone-a").await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        sqlx::query("UPDATE load_balancers SET status = 'pending' WHERE id = ?")
            .bind(lb.id)
            .execute(&mut *conn)
            .await
            .unwrap();
        fx.recorder.clear();

        let vrrp_id = lb.vrrp_instance_id.to_string();
        handle(&fx.admin_cx(), &mut conn, &req("set_vrrp_ip", &[&vrrp_id, "3", "MASTER"]))
            .await
            .unwrap();

        assert!(fx.recorder.calls_for("set_vrrp_ip").is_empty());
        let lb = load_balancer::load(&mut conn, lb.id).await.unwrap();
        assert_eq!(lb.status, STATUS_AVAILABLE);
    }

    #[tokio::test]
    async fn test_keepalived_report_places_interface() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;

        let vrrp_id = lb.vrrp_instance_id.to_string();
        handle(
            &fx.admin_cx(),
            &mut conn,
            &req("create_keepalived_conf", &[&vrrp_id, "9", "backup"]),
        )
        .await
        .unwrap();
        let pair = vrrp::vrrp_interfaces(&mut conn, lb.vrrp_instance_id).await.unwrap();
        assert_eq!(pair.backup.hyper, 9);
        assert_eq!(pair.master.hyper, -1);
    }
}
