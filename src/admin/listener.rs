//! Listeners: the frontends of a load balancer.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::{backend, load_balancer, AdminContext};
use crate::api::validation::{validate_name, validate_port};
use crate::db::{
    created_unix, new_uuid, now, CreateListenerRequest, ListQuery, ListResponse, Listener,
    ListenerMode, LoadBalancer, Role, UpdateListenerRequest, STATUS_AVAILABLE,
};

const ORDER_COLUMNS: &[&str] = &["id", "name", "port", "created_at", "updated_at"];

/// Check that `certificate` holds a PEM certificate chain and `key` a PEM private key
pub fn validate_tls_material(certificate: &str, key: &str) -> AdminResult<()> {
    let chain = pem::parse_many(certificate)
        .map_err(|e| AdminError::invalid(format!("Invalid certificate: {}", e)))?;
    match chain.first() {
        Some(first) if first.tag() == "CERTIFICATE" => {}
        _ => return Err(AdminError::invalid("Certificate must be a PEM encoded certificate")),
    }

    let key = pem::parse(key).map_err(|e| AdminError::invalid(format!("Invalid key: {}", e)))?;
    if !key.tag().ends_with("PRIVATE KEY") {
        return Err(AdminError::invalid("Key must be a PEM encoded private key"));
    }
    Ok(())
}

fn check_mode(mode: ListenerMode, certificate: &str, key: &str) -> AdminResult<()> {
    if mode == ListenerMode::Https {
        if certificate.is_empty() || key.is_empty() {
            return Err(AdminError::invalid(
                "https listeners require a certificate and a key",
            ));
        }
        validate_tls_material(certificate, key)?;
    }
    Ok(())
}

async fn port_taken(
    conn: &mut SqliteConnection,
    lb_id: i64,
    port: i64,
    except: i64,
) -> AdminResult<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM listeners WHERE load_balancer_id = ? AND port = ? AND id != ? AND deleted_at IS NULL",
    )
    .bind(lb_id)
    .bind(port)
    .bind(except)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

pub async fn create(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    req: &CreateListenerRequest,
) -> AdminResult<Listener> {
    let lb = load_balancer::get(cx, conn, lb_id).await?;
    cx.member
        .require_owner(Role::Writer, lb.owner, "create listeners on this load balancer")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;
    validate_port(req.port).map_err(AdminError::invalid)?;

    let certificate = req.certificate.as_deref().unwrap_or_default().trim();
    let key = req.key.as_deref().unwrap_or_default().trim();
    check_mode(req.mode, certificate, key)?;

    if port_taken(conn, lb.id, req.port, 0).await? {
        return Err(AdminError::invalid(format!(
            "Port {} is already used by another listener",
            req.port
        )));
    }

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO listeners (uuid, owner, name, status, port, mode, certificate, key,
                               load_balancer_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(lb.owner)
    .bind(&req.name)
    .bind(STATUS_AVAILABLE)
    .bind(req.port)
    .bind(req.mode.as_str())
    .bind(certificate)
    .bind(key)
    .bind(lb.id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    backend::sync_haproxy_conf(cx, conn, &lb)
        .await
        .map_err(|e| e.context(ErrorKind::ListenerCreateFailed, "Failed to push haproxy configuration"))?;

    tracing::info!(lb = lb.id, listener = id, port = req.port, "Created listener");
    load(conn, id).await
}

/// Listener by id, ignoring ownership
pub async fn load(conn: &mut SqliteConnection, id: i64) -> AdminResult<Listener> {
    sqlx::query_as::<_, Listener>("SELECT * FROM listeners WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::ListenerNotFound, "Listener not found")
}

pub async fn get(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    id: i64,
) -> AdminResult<(LoadBalancer, Listener)> {
    let lb = load_balancer::get(cx, conn, lb_id).await?;
    let listener = sqlx::query_as::<_, Listener>(
        "SELECT * FROM listeners WHERE id = ? AND load_balancer_id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .bind(lb.id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::ListenerNotFound, "Listener not found")?;
    Ok((lb, listener))
}

pub async fn get_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    uuid: &str,
) -> AdminResult<(LoadBalancer, Listener)> {
    let lb = load_balancer::get(cx, conn, lb_id).await?;
    let listener = sqlx::query_as::<_, Listener>(
        "SELECT * FROM listeners WHERE uuid = ? AND load_balancer_id = ? AND deleted_at IS NULL",
    )
    .bind(uuid)
    .bind(lb.id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::ListenerNotFound, "Listener not found")?;
    Ok((lb, listener))
}

pub async fn update(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    id: i64,
    req: &UpdateListenerRequest,
) -> AdminResult<Listener> {
    let (lb, listener) = get(cx, conn, lb_id, id).await?;
    cx.member
        .require_owner(Role::Writer, listener.owner, "update this listener")?;

    let name = req.name.clone().unwrap_or_else(|| listener.name.clone());
    validate_name(&name).map_err(AdminError::invalid)?;

    let port = req.port.unwrap_or(listener.port);
    validate_port(port).map_err(AdminError::invalid)?;
    if port != listener.port && port_taken(conn, lb.id, port, listener.id).await? {
        return Err(AdminError::invalid(format!(
            "Port {} is already used by another listener",
            port
        )));
    }

    let mode = match req.mode {
        Some(mode) => mode,
        None => listener.mode.parse().map_err(AdminError::invalid)?,
    };
    let certificate = req
        .certificate
        .as_deref()
        .map(str::trim)
        .unwrap_or(listener.certificate.as_str())
        .to_string();
    let key = req
        .key
        .as_deref()
        .map(str::trim)
        .unwrap_or(listener.key.as_str())
        .to_string();
    check_mode(mode, &certificate, &key)?;

    sqlx::query(
        r#"
        UPDATE listeners SET name = ?, port = ?, mode = ?, certificate = ?, key = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&name)
    .bind(port)
    .bind(mode.as_str())
    .bind(&certificate)
    .bind(&key)
    .bind(now())
    .bind(listener.id)
    .execute(&mut *conn)
    .await?;

    backend::sync_haproxy_conf(cx, conn, &lb)
        .await
        .map_err(|e| e.context(ErrorKind::ListenerUpdateFailed, "Failed to push haproxy configuration"))?;

    load(conn, listener.id).await
}

/// Rename and soft delete a listener with all of its backends
async fn remove(conn: &mut SqliteConnection, listener: &Listener) -> AdminResult<()> {
    backend::delete_all(conn, listener.id).await?;
    let ts = now();
    sqlx::query("UPDATE listeners SET name = ?, updated_at = ?, deleted_at = ? WHERE id = ?")
        .bind(format!("{}-{}", listener.name, created_unix(&listener.created_at)))
        .bind(&ts)
        .bind(&ts)
        .bind(listener.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn delete(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    id: i64,
) -> AdminResult<()> {
    let (lb, listener) = get(cx, conn, lb_id, id).await?;
    cx.member
        .require_owner(Role::Writer, listener.owner, "delete this listener")?;

    remove(conn, &listener).await?;
    backend::sync_haproxy_conf(cx, conn, &lb)
        .await
        .map_err(|e| e.context(ErrorKind::ListenerDeleteFailed, "Failed to push haproxy configuration"))?;

    tracing::info!(lb = lb.id, listener = listener.id, "Deleted listener");
    Ok(())
}

/// Soft delete every listener of a load balancer. Does not touch the agents.
pub async fn delete_all(conn: &mut SqliteConnection, lb_id: i64) -> AdminResult<usize> {
    let listeners = listeners_of(conn, lb_id).await?;
    for listener in &listeners {
        remove(conn, listener).await?;
    }
    Ok(listeners.len())
}

pub async fn listeners_of(conn: &mut SqliteConnection, lb_id: i64) -> AdminResult<Vec<Listener>> {
    Ok(sqlx::query_as::<_, Listener>(
        "SELECT * FROM listeners WHERE load_balancer_id = ? AND deleted_at IS NULL ORDER BY id",
    )
    .bind(lb_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn list(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    lb_id: i64,
    query: &ListQuery,
) -> AdminResult<ListResponse<Listener>> {
    let lb = load_balancer::get(cx, conn, lb_id).await?;
    let pattern = query.pattern();
    let filter = "load_balancer_id = ? AND deleted_at IS NULL AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM listeners WHERE {}", filter))
        .bind(lb.id)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM listeners WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ORDER_COLUMNS, "-created_at")
    );
    let items = sqlx::query_as::<_, Listener>(&sql)
        .bind(lb.id)
        .bind(&pattern)
        .bind(&pattern)
        .bind(query.limit())
        .bind(query.offset())
        .fetch_all(&mut *conn)
        .await?;

    Ok(ListResponse::new(total, query, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::{Fixture, TEST_CERT, TEST_KEY};
    use crate::db::VRRP_MASTER;

    fn http(name: &str, port: i64) -> CreateListenerRequest {
        CreateListenerRequest {
            name: name.to_string(),
            mode: ListenerMode::Http,
            port,
            certificate: None,
            key: None,
        }
    }

    #[test]
    fn test_validate_tls_material() {
        assert!(validate_tls_material(TEST_CERT, TEST_KEY).is_ok());
        assert!(validate_tls_material("garbage", TEST_KEY).is_err());
        assert!(validate_tls_material(TEST_KEY, TEST_KEY).is_err());
        assert!(validate_tls_material(TEST_CERT, TEST_CERT).is_err());
    }

    #[tokio::test]
    async fn test_create_checks_port_and_tls() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        let cx = fx.cx(&member);

        let listener = create(&cx, &mut conn, lb.id, &http("http", 80)).await.unwrap();
        assert_eq!(listener.status, STATUS_AVAILABLE);

        let err = create(&cx, &mut conn, lb.id, &http("http2", 80)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        let mut https = http("https", 443);
        https.mode = ListenerMode::Https;
        let err = create(&cx, &mut conn, lb.id, &https).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        https.certificate = Some(TEST_CERT.to_string());
        https.key = Some(TEST_KEY.to_string());
        let listener = create(&cx, &mut conn, lb.id, &https).await.unwrap();
        assert_eq!(listener.mode, "https");

        let err = create(&cx, &mut conn, lb.id, &http("bad", 70000)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn test_create_pushes_conf_once_placed() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        let cx = fx.cx(&member);

        create(&cx, &mut conn, lb.id, &http("a", 80)).await.unwrap();
        assert!(fx.recorder.calls_for("create_haproxy_conf").is_empty());

        crate::admin::vrrp::set_interface_hyper(&mut conn, lb.vrrp_instance_id, VRRP_MASTER, 3)
            .await
            .unwrap();
        create(&cx, &mut conn, lb.id, &http("b", 81)).await.unwrap();
        let calls = fx.recorder.calls_for("create_haproxy_conf");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, format!("toall=group-vrrp-{}:3", lb.vrrp_instance_id));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, member) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &member, "web").await;
        crate::admin::vrrp::set_interface_hyper(&mut conn, lb.vrrp_instance_id, VRRP_MASTER, 3)
            .await
            .unwrap();
        let cx = fx.cx(&member);
        let a = create(&cx, &mut conn, lb.id, &http("a", 80)).await.unwrap();
        let b = create(&cx, &mut conn, lb.id, &http("b", 81)).await.unwrap();

        let err = update(
            &cx,
            &mut conn,
            lb.id,
            b.id,
            &UpdateListenerRequest {
                port: Some(80),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        let updated = update(
            &cx,
            &mut conn,
            lb.id,
            b.id,
            &UpdateListenerRequest {
                name: Some("api".to_string()),
                port: Some(8080),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.name, "api");
        assert_eq!(updated.port, 8080);

        fx.recorder.clear();
        delete(&cx, &mut conn, lb.id, a.id).await.unwrap();
        assert_eq!(fx.recorder.calls_for("create_haproxy_conf").len(), 1);
        delete(&cx, &mut conn, lb.id, b.id).await.unwrap();
        assert_eq!(fx.recorder.calls_for("clear_haproxy_conf").len(), 1);

        let listed = list(&cx, &mut conn, lb.id, &ListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 0);

        // deleted names are freed
        create(&cx, &mut conn, lb.id, &http("a", 80)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_cannot_modify() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (org_id, owner) = fx.org_member(&mut conn, "acme", Role::Writer).await;
        let lb = fx.load_balancer(&mut conn, &owner, "web").await;
        let listener = create(&fx.cx(&owner), &mut conn, lb.id, &http("a", 80)).await.unwrap();

        let reader = crate::admin::Membership {
            role: Role::Reader,
            user_id: owner.user_id + 100,
            user_name: "viewer".to_string(),
            ..owner.clone()
        };
        assert_eq!(reader.org_id, org_id);
        let cx = fx.cx(&reader);
        assert!(get(&cx, &mut conn, lb.id, listener.id).await.is_ok());
        let err = delete(&cx, &mut conn, lb.id, listener.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }
}
