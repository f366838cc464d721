//! Backends of a listener, and the haproxy configuration built from them.

use serde::Serialize;
use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::vrrp::{self, FloatingIpEntry};
use super::{listener, AdminContext};
use crate::api::validation::{validate_backend_addr, validate_name};
use crate::db::{
    created_nanos, new_uuid, now, Backend, BackendResponse, CreateBackendRequest, ListQuery,
    ListResponse, Listener, LoadBalancer, Role, UpdateBackendRequest, STATUS_AVAILABLE,
};
use crate::dispatch::{Command, Control};

const ORDER_COLUMNS: &[&str] = &["id", "name", "backend_addr", "created_at", "updated_at"];

#[derive(Debug, Serialize)]
struct HaproxyBackend {
    backend_url: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct HaproxyListener {
    name: String,
    mode: String,
    key: String,
    cert: String,
    port: i64,
    backends: Vec<HaproxyBackend>,
}

#[derive(Debug, Serialize)]
struct HaproxyConf {
    listeners: Vec<HaproxyListener>,
    floating_ips: Vec<FloatingIpEntry>,
}

async fn backends_of(conn: &mut SqliteConnection, listener_id: i64) -> AdminResult<Vec<Backend>> {
    Ok(sqlx::query_as::<_, Backend>(
        "SELECT * FROM backends WHERE listener_id = ? AND deleted_at IS NULL ORDER BY id",
    )
    .bind(listener_id)
    .fetch_all(&mut *conn)
    .await?)
}

async fn build_conf(conn: &mut SqliteConnection, lb: &LoadBalancer) -> AdminResult<HaproxyConf> {
    let mut listeners = Vec::new();
    for l in listener::listeners_of(conn, lb.id).await? {
        let backends = backends_of(conn, l.id)
            .await?
            .into_iter()
            .map(|b| HaproxyBackend {
                backend_url: b.backend_addr,
                status: b.status,
            })
            .collect();
        listeners.push(HaproxyListener {
            name: format!("lb-{}-lsn-{}-{}", lb.id, l.id, l.name),
            mode: l.mode,
            key: l.key,
            cert: l.certificate,
            port: l.port,
            backends,
        });
    }

    Ok(HaproxyConf {
        listeners,
        floating_ips: vrrp::floating_ip_entries(conn, lb.id).await?,
    })
}

/// Push the full haproxy configuration of `lb` to both VRRP hosts.
///
/// Skipped while the VRRP pair is not placed; the `set_vrrp_ip` callback
/// pushes it once the BACKUP side is up.
pub async fn create_haproxy_conf(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb: &LoadBalancer,
) -> AdminResult<()> {
    let Some(group) = vrrp::placed_vrrp_group(conn, lb.vrrp_instance_id).await? else {
        tracing::info!(lb = lb.id, "VRRP pair not placed yet, deferring haproxy conf");
        return Ok(());
    };

    let conf = build_conf(conn, lb).await?;
    let payload = serde_json::to_string(&conf).map_err(|e| {
        AdminError::new(ErrorKind::JsonMarshalFailed, "Failed to encode haproxy configuration")
            .with_source(e)
    })?;

    let command = Command::new("create_haproxy_conf")
        .arg(lb.router_id)
        .arg(lb.id)
        .heredoc(payload);
    cx.dispatch(Control::to_all(group), command).await
}

pub async fn clear_haproxy_conf(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb: &LoadBalancer,
) -> AdminResult<()> {
    let Some(group) = vrrp::placed_vrrp_group(conn, lb.vrrp_instance_id).await? else {
        tracing::info!(lb = lb.id, "VRRP pair not placed, nothing to clear");
        return Ok(());
    };

    let command = Command::new("clear_haproxy_conf").arg(lb.router_id).arg(lb.id);
    cx.dispatch(Control::to_all(group), command).await
}

/// Regenerate the configuration, or clear it when no listener is left
pub async fn sync_haproxy_conf(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb: &LoadBalancer,
) -> AdminResult<()> {
    if listener::listeners_of(conn, lb.id).await?.is_empty() {
        clear_haproxy_conf(cx, conn, lb).await
    } else {
        create_haproxy_conf(cx, conn, lb).await
    }
}

async fn addr_taken(
    conn: &mut SqliteConnection,
    listener_id: i64,
    addr: &str,
    except: i64,
) -> AdminResult<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM backends WHERE listener_id = ? AND backend_addr = ? AND id != ? AND deleted_at IS NULL",
    )
    .bind(listener_id)
    .bind(addr)
    .bind(except)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn create(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    req: &CreateBackendRequest,
) -> AdminResult<Backend> {
    let (lb, listener) = listener::get(cx, conn, lb_id, listener_id).await?;
    cx.member
        .require_owner(Role::Writer, listener.owner, "create backends on this listener")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;
    let addr = req.backend_addr.trim();
    validate_backend_addr(addr).map_err(AdminError::invalid)?;

    if addr_taken(conn, listener.id, addr, 0).await? {
        return Err(AdminError::invalid(format!(
            "Backend {} already exists on this listener",
            addr
        )));
    }

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO backends (uuid, owner, name, listener_id, load_balancer_id, backend_addr,
                              status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(listener.owner)
    .bind(&req.name)
    .bind(listener.id)
    .bind(lb.id)
    .bind(addr)
    .bind(STATUS_AVAILABLE)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    create_haproxy_conf(cx, conn, &lb)
        .await
        .map_err(|e| e.context(ErrorKind::BackendCreateFailed, "Failed to push haproxy configuration"))?;

    tracing::info!(listener = listener.id, backend = id, addr, "Created backend");
    load(conn, id).await
}

async fn load(conn: &mut SqliteConnection, id: i64) -> AdminResult<Backend> {
    sqlx::query_as::<_, Backend>("SELECT * FROM backends WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::BackendNotFound, "Backend not found")
}

pub async fn get(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    id: i64,
) -> AdminResult<(LoadBalancer, Listener, Backend)> {
    let (lb, listener) = listener::get(cx, conn, lb_id, listener_id).await?;
    let backend = sqlx::query_as::<_, Backend>(
        "SELECT * FROM backends WHERE id = ? AND listener_id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(listener.id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::BackendNotFound, "Backend not found")?;
    Ok((lb, listener, backend))
}

pub async fn get_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    uuid: &str,
) -> AdminResult<(LoadBalancer, Listener, Backend)> {
    let (lb, listener) = listener::get(cx, conn, lb_id, listener_id).await?;
    let backend = sqlx::query_as::<_, Backend>(
        "SELECT * FROM backends WHERE uuid = ? AND listener_id = ? AND deleted_at IS NULL",
    )
    .bind(uuid)
    .bind(listener.id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::BackendNotFound, "Backend not found")?;
    Ok((lb, listener, backend))
}

pub async fn update(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    id: i64,
    req: &UpdateBackendRequest,
) -> AdminResult<Backend> {
    let (lb, listener, backend) = get(cx, conn, lb_id, listener_id, id).await?;
    cx.member
        .require_owner(Role::Writer, backend.owner, "update this backend")?;
    let addr = req.backend_addr.trim();
    validate_backend_addr(addr).map_err(AdminError::invalid)?;

    if addr != backend.backend_addr && addr_taken(conn, listener.id, addr, backend.id).await? {
        return Err(AdminError::invalid(format!(
            "Backend {} already exists on this listener",
            addr
        )));
    }

    sqlx::query("UPDATE backends SET backend_addr = ?, updated_at = ? WHERE id = ?")
        .bind(addr)
        .bind(now())
        .bind(backend.id)
        .execute(&mut *conn)
        .await?;

    create_haproxy_conf(cx, conn, &lb)
        .await
        .map_err(|e| e.context(ErrorKind::BackendUpdateFailed, "Failed to push haproxy configuration"))?;

    load(conn, backend.id).await
}

async fn remove(conn: &mut SqliteConnection, backend: &Backend) -> AdminResult<()> {
    let ts = now();
    sqlx::query("UPDATE backends SET backend_addr = ?, updated_at = ?, deleted_at = ? WHERE id = ?")
        .bind(format!(
            "{}-{}",
            backend.backend_addr,
            created_nanos(&backend.created_at)
        ))
        .bind(&ts)
        .bind(&ts)
        .bind(backend.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    id: i64,
) -> AdminResult<()> {
    let (lb, _, backend) = get(cx, conn, lb_id, listener_id, id).await?;
    cx.member
        .require_owner(Role::Writer, backend.owner, "delete this backend")?;

    remove(conn, &backend).await?;

    let (remaining,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM backends WHERE load_balancer_id = ? AND deleted_at IS NULL",
    )
    .bind(lb.id)
    .fetch_one(&mut *conn)
    .await?;

    let pushed = if remaining == 0 {
        clear_haproxy_conf(cx, conn, &lb).await
    } else {
        create_haproxy_conf(cx, conn, &lb).await
    };
    pushed.map_err(|e| e.context(ErrorKind::BackendDeleteFailed, "Failed to push haproxy configuration"))?;

    tracing::info!(backend = backend.id, addr = %backend.backend_addr, "Deleted backend");
    Ok(())
}

/// Soft delete every backend of a listener. Does not touch the agents.
pub async fn delete_all(conn: &mut SqliteConnection, listener_id: i64) -> AdminResult<usize> {
    let backends = backends_of(conn, listener_id).await?;
    for backend in &backends {
        remove(conn, backend).await?;
    }
    Ok(backends.len())
}

pub async fn list(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    listener_id: i64,
    query: &ListQuery,
) -> AdminResult<ListResponse<BackendResponse>> {
    let (_, listener) = listener::get(cx, conn, lb_id, listener_id).await?;
    let pattern = query.pattern();
    let filter = "listener_id = ? AND deleted_at IS NULL AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM backends WHERE {}", filter))
        .bind(listener.id)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM backends WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ORDER_COLUMNS, "-created_at")
    );
    let backends = sqlx::query_as::<_, Backend>(&sql)
        .bind(listener.id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(query.limit())
        .bind(query.offset())
        .fetch_all(&mut *conn)
        .await?;

    // only admins see which organization owns a row
    let owner_name = if cx.member.is_admin() {
        sqlx::query_as::<_, (String,)>("SELECT name FROM organizations WHERE id = ?")
            .bind(listener.owner)
            .fetch_optional(&mut *conn)
            .await?
            .map(|(name,)| name)
    } else {
        None
    };

    let items = backends
        .into_iter()
        .map(|backend| BackendResponse {
            backend,
            owner_name: owner_name.clone(),
        })
        .collect();
    Ok(ListResponse::new(total, query, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::db::{CreateListenerRequest, ListenerMode, VRRP_BACKUP, VRRP_MASTER};

    async fn setup(fx: &Fixture, conn: &mut SqliteConnection) -> (crate::admin::Membership, LoadBalancer, Listener) {
        let (_, member) = fx.org_member(conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(conn, &member, "web").await;
        vrrp::set_interface_hyper(conn, lb.vrrp_instance_id, VRRP_MASTER, 3).await.unwrap();
        vrrp::set_interface_hyper(conn, lb.vrrp_instance_id, VRRP_BACKUP, 4).await.unwrap();
        let listener = listener::create(
            &fx.cx(&member),
            conn,
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
        (member, lb, listener)
    }

    fn backend_req(name: &str, addr: &str) -> CreateBackendRequest {
        CreateBackendRequest {
            name: name.to_string(),
            backend_addr: addr.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_pushes_haproxy_conf() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        let cx = fx.cx(&member);

        create(&cx, &mut conn, lb.id, listener.id, &backend_req("app1", "10.0.0.5:8080"))
            .await
            .unwrap();

        let calls = fx.recorder.calls_for("create_haproxy_conf");
        assert_eq!(calls.len(), 1);
        let (control, command) = &calls[0];
        assert_eq!(control, &format!("toall=group-vrrp-{}:3,4", lb.vrrp_instance_id));
        assert!(command.contains(&format!("create_haproxy_conf.sh '{}' '{}'<<EOF\n", lb.router_id, lb.id)));

        let payload = command
            .split("<<EOF\n")
            .nth(1)
            .and_then(|rest| rest.strip_suffix("\nEOF"))
            .unwrap();
        let conf: serde_json::Value = serde_json::from_str(payload).unwrap();
        let l = &conf["listeners"][0];
        assert_eq!(l["name"], format!("lb-{}-lsn-{}-http", lb.id, listener.id));
        assert_eq!(l["mode"], "http");
        assert_eq!(l["port"], 80);
        assert_eq!(l["backends"][0]["backend_url"], "10.0.0.5:8080");
        assert_eq!(l["backends"][0]["status"], "available");
        assert!(conf["floating_ips"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_addresses() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        let cx = fx.cx(&member);

        create(&cx, &mut conn, lb.id, listener.id, &backend_req("app1", "10.0.0.5:8080"))
            .await
            .unwrap();
        let err = create(&cx, &mut conn, lb.id, listener.id, &backend_req("app2", "10.0.0.5:8080"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        let err = create(&cx, &mut conn, lb.id, listener.id, &backend_req("app3", "10.0.0.5"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_dispatch_failure_rolls_up_as_create_failed() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        fx.recorder.fail_on("create_haproxy_conf");

        let err = create(&fx.cx(&member), &mut conn, lb.id, listener.id, &backend_req("app1", "10.0.0.5:80"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BackendCreateFailed);
    }

    #[tokio::test]
    async fn test_delete_last_backend_clears_conf() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let a = create(&cx, &mut conn, lb.id, listener.id, &backend_req("a", "10.0.0.5:80"))
            .await
            .unwrap();
        let b = create(&cx, &mut conn, lb.id, listener.id, &backend_req("b", "10.0.0.6:80"))
            .await
            .unwrap();
        fx.recorder.clear();

        delete(&cx, &mut conn, lb.id, listener.id, a.id).await.unwrap();
        assert_eq!(fx.recorder.calls_for("create_haproxy_conf").len(), 1);
        assert!(fx.recorder.calls_for("clear_haproxy_conf").is_empty());

        delete(&cx, &mut conn, lb.id, listener.id, b.id).await.unwrap();
        assert_eq!(fx.recorder.calls_for("clear_haproxy_conf").len(), 1);

        let (addr,): (String,) = sqlx::query_as("SELECT backend_addr FROM backends WHERE id = ?")
            .bind(a.id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(addr, format!("10.0.0.5:80-{}", created_nanos(&a.created_at)));

        // the address can be reused after delete
        create(&cx, &mut conn, lb.id, listener.id, &backend_req("a", "10.0.0.5:80"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_shows_owner_to_admins_only() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        create(&cx, &mut conn, lb.id, listener.id, &backend_req("a", "10.0.0.5:80"))
            .await
            .unwrap();

        let listed = list(&cx, &mut conn, lb.id, listener.id, &ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 1);
        assert!(listed.items[0].owner_name.is_none());

        let listed = list(&fx.admin_cx(), &mut conn, lb.id, listener.id, &ListQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.items[0].owner_name.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_update_backend_addr() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (member, lb, listener) = setup(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let a = create(&cx, &mut conn, lb.id, listener.id, &backend_req("a", "10.0.0.5:80"))
            .await
            .unwrap();

        let updated = update(
            &cx,
            &mut conn,
            lb.id,
            listener.id,
            a.id,
            &UpdateBackendRequest {
                backend_addr: "10.0.0.7:81".to_string(),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.backend_addr, "10.0.0.7:81");
        assert_eq!(fx.recorder.calls_for("create_haproxy_conf").len(), 2);

        let (_, _, fetched) = get_by_uuid(&cx, &mut conn, lb.id, listener.id, &a.uuid).await.unwrap();
        assert_eq!(fetched.id, a.id);
    }
}
