//! Data volumes and the boot volumes owned by instances.
//!
//! Volume scripts are suffixed with the configured driver
//! (`create_volume_local`, `attach_volume_local`, ...). As with instances the
//! row records the intent (`pending`, `attaching`, `resizing`, ...) until the
//! agent reports back.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::{instance, AdminContext};
use crate::api::validation::validate_name;
use crate::db::{
    new_uuid, now, CreateVolumeRequest, ListQuery, ListResponse, ResizeVolumeRequest, Role,
    UpdateVolumeRequest, Volume, VOLUME_STATUS_AVAILABLE, VOLUME_STATUS_ATTACHED,
    VOLUME_STATUS_ATTACHING, VOLUME_STATUS_DETACHING, VOLUME_STATUS_ERROR, VOLUME_STATUS_PENDING,
    VOLUME_STATUS_RESIZING,
};
use crate::dispatch::{Command, Control};

const ORDER_COLUMNS: &[&str] = &["id", "name", "size", "status", "created_at"];

fn script(cx: &AdminContext<'_>, action: &str) -> Command {
    Command::new(format!("{}_{}", action, cx.config.instances.volume_driver))
}

fn check_size(size: i64) -> AdminResult<()> {
    if size <= 0 || size > instance::MAX_DISK_GIB {
        return Err(AdminError::new(
            ErrorKind::VolumeInvalidSize,
            format!("Volume size must be between 1 and {} GB", instance::MAX_DISK_GIB),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

pub async fn get(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<Volume> {
    let scope = cx.member.owner_scope();
    let volume = sqlx::query_as::<_, Volume>(
        "SELECT * FROM volumes WHERE id = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(id)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::VolumeNotFound, "Volume not found")?;
    cx.member
        .require_owner(Role::Reader, volume.owner, "view this volume")?;
    Ok(volume)
}

pub async fn get_by_uuid(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    uuid: &str,
) -> AdminResult<Volume> {
    let scope = cx.member.owner_scope();
    let volume = sqlx::query_as::<_, Volume>(
        "SELECT * FROM volumes WHERE uuid = ? AND deleted_at IS NULL AND (? IS NULL OR owner = ?)",
    )
    .bind(uuid)
    .bind(scope)
    .bind(scope)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::VolumeNotFound, "Volume not found")?;
    cx.member
        .require_owner(Role::Reader, volume.owner, "view this volume")?;
    Ok(volume)
}

/// Volume by id, ignoring ownership. Used by agent callbacks.
pub async fn load(conn: &mut SqliteConnection, id: i64) -> AdminResult<Volume> {
    sqlx::query_as::<_, Volume>("SELECT * FROM volumes WHERE id = ? AND deleted_at IS NULL")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::VolumeNotFound, "Volume not found")
}

pub async fn list(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    query: &ListQuery,
) -> AdminResult<ListResponse<Volume>> {
    let scope = cx.member.owner_scope();
    let pattern = query.pattern();
    let filter = "deleted_at IS NULL AND (? IS NULL OR owner = ?) AND (? IS NULL OR name LIKE ?)";

    let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM volumes WHERE {}", filter))
        .bind(scope)
        .bind(scope)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await?;

    let sql = format!(
        "SELECT * FROM volumes WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
        filter,
        query.order_by(ORDER_COLUMNS, "-created_at")
    );
    let items = sqlx::query_as::<_, Volume>(&sql)
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

pub async fn instance_volumes(
    conn: &mut SqliteConnection,
    instance_id: i64,
) -> AdminResult<Vec<Volume>> {
    Ok(sqlx::query_as::<_, Volume>(
        "SELECT * FROM volumes WHERE instance_id = ? AND deleted_at IS NULL ORDER BY booting DESC, id",
    )
    .bind(instance_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn boot_volume(conn: &mut SqliteConnection, instance_id: i64) -> AdminResult<Volume> {
    sqlx::query_as::<_, Volume>(
        "SELECT * FROM volumes WHERE instance_id = ? AND booting = 1 AND deleted_at IS NULL",
    )
    .bind(instance_id)
    .fetch_optional(&mut *conn)
    .await?
    .or_not_found(ErrorKind::VolumeNotFound, "Boot volume not found")
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Insert a `pending` data volume and ask any host to allocate it
pub async fn create(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateVolumeRequest,
) -> AdminResult<Volume> {
    cx.member.require(Role::Writer, "create volumes")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;
    check_size(req.size)?;

    let ts = now();
    let id = sqlx::query(
        r#"
        INSERT INTO volumes (uuid, owner, name, instance_id, booting, status, size, created_at, updated_at)
        VALUES (?, ?, ?, 0, 0, ?, ?, ?, ?)
        "#,
    )
    .bind(new_uuid())
    .bind(cx.member.org_id)
    .bind(&req.name)
    .bind(VOLUME_STATUS_PENDING)
    .bind(req.size)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    let volume = load(conn, id).await?;

    let command = script(cx, "create_volume")
        .arg(volume.id)
        .arg(volume.size)
        .arg(&volume.uuid);
    cx.dispatch(Control::inter(-1), command)
        .await
        .map_err(|e| e.context(ErrorKind::VolumeCreateFailed, "Failed to create volume"))?;

    tracing::info!(volume = volume.id, name = %volume.name, size = volume.size, "Requested volume");
    Ok(volume)
}

enum Attachment {
    Attach { instance_id: i64, hyper: i64 },
    Detach { instance_id: i64, hyper: i64 },
}

/// Rename a volume and attach it to (positive `instance_id`) or detach it
/// from (`instance_id = 0`) an instance.
pub async fn update(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &UpdateVolumeRequest,
) -> AdminResult<Volume> {
    let volume = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, volume.owner, "update this volume")?;
    if volume.is_error() {
        return Err(AdminError::new(
            ErrorKind::VolumeInvalidState,
            format!("Volume {} is in error state", volume.uuid),
        ));
    }
    if let Some(name) = req.name.as_deref() {
        validate_name(name).map_err(AdminError::invalid)?;
    }

    let attachment = match req.instance_id {
        Some(target) if target < 0 => {
            return Err(AdminError::invalid("instance_id cannot be negative"));
        }
        Some(target) if target != volume.instance_id => {
            if volume.is_busy() {
                return Err(AdminError::new(
                    ErrorKind::VolumeIsBusy,
                    format!("Volume is busy, status: {}", volume.status),
                ));
            }
            if target > 0 && volume.instance_id > 0 {
                return Err(AdminError::new(
                    ErrorKind::VolumeIsInUse,
                    "Detach the volume before attaching it to another instance",
                ));
            }
            if target == 0 {
                if volume.booting {
                    return Err(AdminError::new(
                        ErrorKind::BootVolumeCannotDetach,
                        "Boot volume cannot be detached",
                    ));
                }
                if !volume.is_attached() {
                    return Err(AdminError::new(
                        ErrorKind::VolumeInvalidState,
                        format!("Volume is not attached, status: {}", volume.status),
                    ));
                }
                let inst = instance::load(conn, volume.instance_id).await?;
                Some(Attachment::Detach {
                    instance_id: inst.id,
                    hyper: inst.hyper,
                })
            } else {
                if volume.status != VOLUME_STATUS_AVAILABLE {
                    return Err(AdminError::new(
                        ErrorKind::VolumeInvalidState,
                        format!("Volume is not available, status: {}", volume.status),
                    ));
                }
                let inst = instance::get(cx, conn, target).await?;
                cx.member
                    .require_owner(Role::Writer, inst.owner, "attach volumes to this instance")?;
                let hyper = instance::require_placed(&inst)?;
                Some(Attachment::Attach {
                    instance_id: inst.id,
                    hyper,
                })
            }
        }
        _ => None,
    };

    let ts = now();
    if let Some(name) = req.name.as_deref() {
        sqlx::query("UPDATE volumes SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(&ts)
            .bind(volume.id)
            .execute(&mut *conn)
            .await?;
    }

    // the attachment itself is recorded when the agent reports back
    match attachment {
        Some(Attachment::Attach { instance_id, hyper }) => {
            set_status(conn, volume.id, VOLUME_STATUS_ATTACHING).await?;
            let command = script(cx, "attach_volume")
                .arg(instance_id)
                .arg(volume.id)
                .arg(volume.local_path())
                .arg(&volume.uuid);
            cx.dispatch(Control::inter(hyper), command)
                .await
                .map_err(|e| e.context(ErrorKind::VolumeAttachFailed, "Failed to attach volume"))?;
            tracing::info!(volume = volume.id, instance = instance_id, "Requested volume attach");
        }
        Some(Attachment::Detach { instance_id, hyper }) => {
            set_status(conn, volume.id, VOLUME_STATUS_DETACHING).await?;
            let command = script(cx, "detach_volume")
                .arg(instance_id)
                .arg(volume.id)
                .arg(&volume.uuid);
            cx.dispatch(Control::inter(hyper), command)
                .await
                .map_err(|e| e.context(ErrorKind::VolumeDetachFailed, "Failed to detach volume"))?;
            tracing::info!(volume = volume.id, instance = instance_id, "Requested volume detach");
        }
        None => {}
    }

    load(conn, volume.id).await
}

/// Grow a volume. Growing a boot volume also grows its instance's disk.
pub async fn resize(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    id: i64,
    req: &ResizeVolumeRequest,
) -> AdminResult<Volume> {
    let volume = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, volume.owner, "resize this volume")?;
    if volume.is_error() {
        return Err(AdminError::new(
            ErrorKind::VolumeInvalidState,
            "Volume is in error state",
        ));
    }
    if volume.is_busy() {
        return Err(AdminError::new(ErrorKind::VolumeIsBusy, "Volume is busy"));
    }
    check_size(req.size)?;
    if req.size <= volume.size {
        return Err(AdminError::new(
            ErrorKind::VolumeInvalidSize,
            "The size must be greater than the current size",
        ));
    }
    let hyper = if volume.instance_id > 0 {
        instance::load(conn, volume.instance_id).await?.hyper
    } else {
        -1
    };

    let ts = now();
    sqlx::query("UPDATE volumes SET size = ?, status = ?, updated_at = ? WHERE id = ?")
        .bind(req.size)
        .bind(VOLUME_STATUS_RESIZING)
        .bind(&ts)
        .bind(volume.id)
        .execute(&mut *conn)
        .await?;
    if volume.booting {
        sqlx::query("UPDATE instances SET disk = ?, updated_at = ? WHERE id = ?")
            .bind(req.size)
            .bind(&ts)
            .bind(volume.instance_id)
            .execute(&mut *conn)
            .await?;
    }

    let command = script(cx, "resize_volume")
        .arg(volume.id)
        .arg(&volume.uuid)
        .arg(req.size)
        .arg(volume.booting)
        .arg(volume.instance_id);
    cx.dispatch(Control::inter(hyper), command)
        .await
        .map_err(|e| e.context(ErrorKind::VolumeUpdateFailed, "Failed to resize volume"))?;

    tracing::info!(volume = volume.id, from = volume.size, to = req.size, "Requested volume resize");
    load(conn, volume.id).await
}

/// Soft delete a detached data volume and have any host clear its storage
pub async fn delete(cx: &AdminContext<'_>, conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    let volume = get(cx, conn, id).await?;
    cx.member
        .require_owner(Role::Writer, volume.owner, "delete this volume")?;
    if volume.booting {
        return Err(AdminError::new(
            ErrorKind::VolumeIsInUse,
            "Boot volumes are deleted with their instance",
        ));
    }
    if volume.is_busy() || volume.is_attached() {
        return Err(AdminError::new(
            ErrorKind::VolumeIsBusy,
            format!("Volume {} is busy, status: {}", volume.name, volume.status),
        ));
    }

    let ts = now();
    sqlx::query("UPDATE volumes SET deleted_at = ?, updated_at = ? WHERE id = ?")
        .bind(&ts)
        .bind(&ts)
        .bind(volume.id)
        .execute(&mut *conn)
        .await?;

    let command = script(cx, "clear_volume")
        .arg(volume.id)
        .arg(&volume.uuid)
        .arg(volume.local_path());
    cx.dispatch(Control::inter(-1), command)
        .await
        .map_err(|e| e.context(ErrorKind::VolumeDeleteFailed, "Failed to delete volume"))?;

    tracing::info!(volume = volume.id, name = %volume.name, "Volume deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Agent reports
// ---------------------------------------------------------------------------

async fn set_status(conn: &mut SqliteConnection, id: i64, status: &str) -> AdminResult<()> {
    sqlx::query("UPDATE volumes SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply a `create_volume` report: the storage location and outcome
pub async fn record_create(
    conn: &mut SqliteConnection,
    id: i64,
    path: &str,
    status: &str,
) -> AdminResult<()> {
    load(conn, id).await?;
    sqlx::query("UPDATE volumes SET path = ?, status = ?, updated_at = ? WHERE id = ?")
        .bind(path)
        .bind(status)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply an `attach_volume` report
pub async fn record_attach(
    conn: &mut SqliteConnection,
    instance_id: i64,
    id: i64,
    target: &str,
) -> AdminResult<()> {
    load(conn, id).await?;
    instance::load(conn, instance_id).await?;
    sqlx::query("UPDATE volumes SET instance_id = ?, target = ?, status = ?, updated_at = ? WHERE id = ?")
        .bind(instance_id)
        .bind(target)
        .bind(VOLUME_STATUS_ATTACHED)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// An attach that did not happen leaves the volume available again
pub async fn record_attach_failed(conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    load(conn, id).await?;
    set_status(conn, id, VOLUME_STATUS_AVAILABLE).await
}

/// Apply a `detach_volume` report
pub async fn record_detach(conn: &mut SqliteConnection, id: i64) -> AdminResult<()> {
    load(conn, id).await?;
    sqlx::query("UPDATE volumes SET instance_id = 0, target = '', status = ?, updated_at = ? WHERE id = ?")
        .bind(VOLUME_STATUS_AVAILABLE)
        .bind(now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply a `resize_volume` report. Anything but `error` settles the volume
/// back to attached or available.
pub async fn record_resize(conn: &mut SqliteConnection, id: i64, status: &str) -> AdminResult<()> {
    let volume = load(conn, id).await?;
    let status = if status == VOLUME_STATUS_ERROR {
        VOLUME_STATUS_ERROR
    } else if volume.instance_id != 0 {
        VOLUME_STATUS_ATTACHED
    } else {
        VOLUME_STATUS_AVAILABLE
    };
    set_status(conn, id, status).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::admin::Membership;
    use crate::db::{CreateInstanceRequest, Instance};

    const GIB: i64 = 1024 * 1024 * 1024;

    async fn member(fx: &Fixture, conn: &mut SqliteConnection) -> Membership {
        fx.org_member(conn, "acme", Role::Writer).await.1
    }

    async fn data_volume(
        fx: &Fixture,
        conn: &mut SqliteConnection,
        member: &Membership,
        size: i64,
    ) -> Volume {
        let volume = create(
            &fx.cx(member),
            conn,
            &CreateVolumeRequest {
                name: "data".to_string(),
                size,
            },
        )
        .await
        .unwrap();
        record_create(conn, volume.id, &format!("local:///volumes/volume-{}.qcow2", volume.id), "available")
            .await
            .unwrap();
        load(conn, volume.id).await.unwrap()
    }

    /// Instance placed on hyper 3
    async fn running_instance(fx: &Fixture, conn: &mut SqliteConnection, member: &Membership) -> Instance {
        let zone = fx.hyper(conn, 3, "zone-a").await;
        let router = fx.router(conn, member, zone).await;
        let subnet = fx.internal_subnet(conn, member, "10.20.0.0/24", router.id).await;
        let image = fx.image(conn, "ubuntu", "linux", GIB).await;
        let flavor = fx.flavor(conn, "small", 2, 2048, 40).await;
        let (instances, _) = instance::create(
            &fx.cx(member),
            conn,
            &CreateInstanceRequest {
                count: 1,
                hostname: "db".to_string(),
                image_id: image.id,
                flavor_id: Some(flavor.id),
                cpu: None,
                memory: None,
                disk: None,
                zone_id: zone,
                subnet_id: subnet.id,
                hyper_id: None,
                userdata: None,
                root_passwd: None,
                login_port: None,
            },
        )
        .await
        .unwrap();
        instance::record_launch(conn, instances[0].id, "running", 3, "").await.unwrap();
        instance::load(conn, instances[0].id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_dispatches_to_any_host() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;

        let volume = create(
            &fx.cx(&member),
            &mut conn,
            &CreateVolumeRequest {
                name: "data".to_string(),
                size: 20,
            },
        )
        .await
        .unwrap();
        assert_eq!(volume.status, VOLUME_STATUS_PENDING);
        assert!(!volume.booting);

        let calls = fx.recorder.calls_for("create_volume_local");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "inter=");
        assert!(calls[0]
            .1
            .ends_with(&format!("'{}' '20' '{}'", volume.id, volume.uuid)));

        record_create(&mut conn, volume.id, "local:///volumes/v.qcow2", "available")
            .await
            .unwrap();
        let volume = get(&fx.cx(&member), &mut conn, volume.id).await.unwrap();
        assert_eq!(volume.status, VOLUME_STATUS_AVAILABLE);
        assert_eq!(volume.local_path(), "/volumes/v.qcow2");
    }

    #[tokio::test]
    async fn test_create_validation() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);

        for size in [0, instance::MAX_DISK_GIB + 1] {
            let err = create(
                &cx,
                &mut conn,
                &CreateVolumeRequest {
                    name: "data".to_string(),
                    size,
                },
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind, ErrorKind::VolumeInvalidSize);
        }

        let reader = Membership {
            role: Role::Reader,
            ..member.clone()
        };
        let err = create(
            &fx.cx(&reader),
            &mut conn,
            &CreateVolumeRequest {
                name: "data".to_string(),
                size: 10,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert!(fx.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let inst = running_instance(&fx, &mut conn, &member).await;
        let volume = data_volume(&fx, &mut conn, &member, 10).await;

        let attaching = update(
            &cx,
            &mut conn,
            volume.id,
            &UpdateVolumeRequest {
                name: Some("logs".to_string()),
                instance_id: Some(inst.id),
            },
        )
        .await
        .unwrap();
        assert_eq!(attaching.status, VOLUME_STATUS_ATTACHING);
        assert_eq!(attaching.name, "logs");
        assert_eq!(attaching.instance_id, 0);
        let calls = fx.recorder.calls_for("attach_volume_local");
        assert_eq!(calls[0].0, "inter=3");
        assert!(calls[0].1.ends_with(&format!(
            "'{}' '{}' '/volumes/volume-{}.qcow2' '{}'",
            inst.id, volume.id, volume.id, volume.uuid
        )));

        record_attach(&mut conn, inst.id, volume.id, "vdb").await.unwrap();
        let attached = load(&mut conn, volume.id).await.unwrap();
        assert_eq!(attached.instance_id, inst.id);
        assert_eq!(attached.target, "vdb");
        assert!(attached.is_attached());
        assert_eq!(instance::detail(&cx, &mut conn, inst.id).await.unwrap().volumes.len(), 2);

        let err = delete(&cx, &mut conn, volume.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeIsBusy);

        update(
            &cx,
            &mut conn,
            volume.id,
            &UpdateVolumeRequest {
                name: None,
                instance_id: Some(0),
            },
        )
        .await
        .unwrap();
        let calls = fx.recorder.calls_for("detach_volume_local");
        assert_eq!(calls[0].0, "inter=3");
        assert!(calls[0]
            .1
            .ends_with(&format!("'{}' '{}' '{}'", inst.id, volume.id, volume.uuid)));
        assert_eq!(load(&mut conn, volume.id).await.unwrap().status, VOLUME_STATUS_DETACHING);

        record_detach(&mut conn, volume.id).await.unwrap();
        let detached = load(&mut conn, volume.id).await.unwrap();
        assert_eq!(detached.instance_id, 0);
        assert_eq!(detached.status, VOLUME_STATUS_AVAILABLE);
        assert!(detached.target.is_empty());
    }

    #[tokio::test]
    async fn test_attach_rules() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let inst = running_instance(&fx, &mut conn, &member).await;
        let boot = boot_volume(&mut conn, inst.id).await.unwrap();
        assert_eq!(boot.target, "vda");

        let detach = UpdateVolumeRequest {
            name: None,
            instance_id: Some(0),
        };
        let err = update(&cx, &mut conn, boot.id, &detach).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BootVolumeCannotDetach);
        let err = update(
            &cx,
            &mut conn,
            boot.id,
            &UpdateVolumeRequest {
                name: None,
                instance_id: Some(inst.id + 1),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeIsInUse);

        // still pending on the agent
        let pending = create(
            &cx,
            &mut conn,
            &CreateVolumeRequest {
                name: "scratch".to_string(),
                size: 5,
            },
        )
        .await
        .unwrap();
        let attach = UpdateVolumeRequest {
            name: None,
            instance_id: Some(inst.id),
        };
        let err = update(&cx, &mut conn, pending.id, &attach).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeInvalidState);

        // a bad name is caught before anything is dispatched
        let volume = data_volume(&fx, &mut conn, &member, 10).await;
        let err = update(
            &cx,
            &mut conn,
            volume.id,
            &UpdateVolumeRequest {
                name: Some("bad name!".to_string()),
                instance_id: Some(inst.id),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        assert!(fx.recorder.calls_for("attach_volume_local").is_empty());

        update(&cx, &mut conn, volume.id, &attach).await.unwrap();
        let err = update(&cx, &mut conn, volume.id, &attach).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeIsBusy);

        record_attach_failed(&mut conn, volume.id).await.unwrap();
        assert_eq!(load(&mut conn, volume.id).await.unwrap().status, VOLUME_STATUS_AVAILABLE);
    }

    #[tokio::test]
    async fn test_resize() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let volume = data_volume(&fx, &mut conn, &member, 10).await;

        let err = resize(&cx, &mut conn, volume.id, &ResizeVolumeRequest { size: 10 })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeInvalidSize);

        let resized = resize(&cx, &mut conn, volume.id, &ResizeVolumeRequest { size: 30 })
            .await
            .unwrap();
        assert_eq!(resized.size, 30);
        assert_eq!(resized.status, VOLUME_STATUS_RESIZING);
        let calls = fx.recorder.calls_for("resize_volume_local");
        assert_eq!(calls[0].0, "inter=");
        assert!(calls[0]
            .1
            .ends_with(&format!("'{}' '{}' '30' 'false' '0'", volume.id, volume.uuid)));

        let err = resize(&cx, &mut conn, volume.id, &ResizeVolumeRequest { size: 40 })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeIsBusy);

        record_resize(&mut conn, volume.id, "done").await.unwrap();
        assert_eq!(load(&mut conn, volume.id).await.unwrap().status, VOLUME_STATUS_AVAILABLE);
    }

    #[tokio::test]
    async fn test_resize_boot_volume_grows_instance() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let inst = running_instance(&fx, &mut conn, &member).await;
        let boot = boot_volume(&mut conn, inst.id).await.unwrap();

        resize(&cx, &mut conn, boot.id, &ResizeVolumeRequest { size: 80 })
            .await
            .unwrap();
        assert_eq!(instance::load(&mut conn, inst.id).await.unwrap().disk, 80);
        let calls = fx.recorder.calls_for("resize_volume_local");
        assert_eq!(calls[0].0, "inter=3");
        assert!(calls[0]
            .1
            .ends_with(&format!("'{}' '{}' '80' 'true' '{}'", boot.id, boot.uuid, inst.id)));

        record_resize(&mut conn, boot.id, "error").await.unwrap();
        let boot = load(&mut conn, boot.id).await.unwrap();
        assert!(boot.is_error());
        let err = resize(&cx, &mut conn, boot.id, &ResizeVolumeRequest { size: 90 })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeInvalidState);
    }

    #[tokio::test]
    async fn test_delete() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let member = member(&fx, &mut conn).await;
        let cx = fx.cx(&member);
        let volume = data_volume(&fx, &mut conn, &member, 10).await;

        let (_, outsider) = fx.org_member(&mut conn, "globex", Role::Owner).await;
        let err = delete(&fx.cx(&outsider), &mut conn, volume.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeNotFound);

        delete(&cx, &mut conn, volume.id).await.unwrap();
        let calls = fx.recorder.calls_for("clear_volume_local");
        assert_eq!(calls[0].0, "inter=");
        assert!(calls[0].1.ends_with(&format!(
            "'{}' '{}' '/volumes/volume-{}.qcow2'",
            volume.id, volume.uuid, volume.id
        )));
        let err = get(&cx, &mut conn, volume.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VolumeNotFound);
        assert_eq!(list(&cx, &mut conn, &ListQuery::default()).await.unwrap().total, 0);
    }
}
