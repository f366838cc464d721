//! Images and flavors.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::{instance, AdminContext};
use crate::api::validation::{validate_name, validate_os_code};
use crate::db::{new_uuid, now, CreateFlavorRequest, CreateImageRequest, Flavor, Image};

pub async fn create_image(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateImageRequest,
) -> AdminResult<Image> {
    cx.member.require_admin("create images")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;
    validate_os_code(&req.os_code).map_err(AdminError::invalid)?;
    if req.size < 0 {
        return Err(AdminError::invalid("Image size cannot be negative"));
    }

    let id = sqlx::query(
        "INSERT INTO images (uuid, name, os_code, size, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_uuid())
    .bind(&req.name)
    .bind(&req.os_code)
    .bind(req.size)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    get_image(conn, id).await
}

pub async fn get_image(conn: &mut SqliteConnection, id: i64) -> AdminResult<Image> {
    sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::ImageNotFound, "Image not found")
}

pub async fn list_images(conn: &mut SqliteConnection) -> AdminResult<Vec<Image>> {
    Ok(sqlx::query_as::<_, Image>("SELECT * FROM images ORDER BY name")
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn create_flavor(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
    req: &CreateFlavorRequest,
) -> AdminResult<Flavor> {
    cx.member.require_admin("create flavors")?;
    validate_name(&req.name).map_err(AdminError::invalid)?;
    instance::check_sizing(req.cpu, req.memory, req.disk)?;

    let id = sqlx::query(
        "INSERT INTO flavors (name, cpu, memory, disk, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&req.name)
    .bind(req.cpu)
    .bind(req.memory)
    .bind(req.disk)
    .bind(now())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    get_flavor(conn, id).await
}

pub async fn get_flavor(conn: &mut SqliteConnection, id: i64) -> AdminResult<Flavor> {
    sqlx::query_as::<_, Flavor>("SELECT * FROM flavors WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::FlavorNotFound, "Flavor not found")
}

pub async fn list_flavors(conn: &mut SqliteConnection) -> AdminResult<Vec<Flavor>> {
    Ok(sqlx::query_as::<_, Flavor>("SELECT * FROM flavors ORDER BY cpu, memory, disk")
        .fetch_all(&mut *conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;
    use crate::db::Role;

    #[tokio::test]
    async fn test_images_and_flavors_are_admin_only() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let (_, owner) = fx.org_member(&mut conn, "acme", Role::Owner).await;

        let req = CreateImageRequest {
            name: "ubuntu-24.04".to_string(),
            os_code: "linux".to_string(),
            size: 2 * 1024 * 1024 * 1024,
        };
        let err = create_image(&fx.cx(&owner), &mut conn, &req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);

        let image = create_image(&fx.admin_cx(), &mut conn, &req).await.unwrap();
        assert_eq!(image.status, "available");
        assert!(!image.is_windows());

        let flavor = create_flavor(
            &fx.admin_cx(),
            &mut conn,
            &CreateFlavorRequest {
                name: "small".to_string(),
                cpu: 1,
                memory: 1024,
                disk: 20,
            },
        )
        .await
        .unwrap();
        assert_eq!(get_flavor(&mut conn, flavor.id).await.unwrap().disk, 20);
        assert_eq!(list_flavors(&mut conn).await.unwrap().len(), 1);
        assert_eq!(list_images(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_image_input() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let err = create_image(
            &fx.admin_cx(),
            &mut conn,
            &CreateImageRequest {
                name: "beos".to_string(),
                os_code: "beos".to_string(),
                size: 1,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);

        let err = get_image(&mut conn, 99).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ImageNotFound);
    }
}
