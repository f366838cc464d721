//! Zones and hypervisors, as reported by the agents.

use sqlx::SqliteConnection;

use super::error::{AdminError, AdminResult, ErrorKind, OptionExt};
use super::AdminContext;
use crate::db::{now, Hyper, Zone, HYPER_STATUS_READY};
use crate::dispatch::{format_group, GroupKind};

/// Host state reported by `hyper_status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HyperReport {
    pub hostid: i64,
    pub hostname: String,
    pub cpu: i64,
    pub total_cpu: i64,
    pub memory: i64,
    pub total_memory: i64,
    pub disk: i64,
    pub total_disk: i64,
    pub status: i64,
    pub host_ip: String,
    pub zone_name: String,
}

pub async fn get_zone(conn: &mut SqliteConnection, id: i64) -> AdminResult<Zone> {
    sqlx::query_as::<_, Zone>("SELECT * FROM zones WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::ZoneNotFound, "Zone not found")
}

pub async fn list_zones(cx: &AdminContext<'_>, conn: &mut SqliteConnection) -> AdminResult<Vec<Zone>> {
    cx.member.require_admin("list zones")?;
    Ok(sqlx::query_as::<_, Zone>("SELECT * FROM zones ORDER BY name")
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn list_hypers(
    cx: &AdminContext<'_>,
    conn: &mut SqliteConnection,
) -> AdminResult<Vec<Hyper>> {
    cx.member.require_admin("list hypervisors")?;
    Ok(sqlx::query_as::<_, Hyper>("SELECT * FROM hypers ORDER BY hostid")
        .fetch_all(&mut *conn)
        .await?)
}

pub async fn get_hyper(conn: &mut SqliteConnection, hostid: i64) -> AdminResult<Hyper> {
    sqlx::query_as::<_, Hyper>("SELECT * FROM hypers WHERE hostid = ?")
        .bind(hostid)
        .fetch_optional(&mut *conn)
        .await?
        .or_not_found(ErrorKind::HyperNotFound, "Hypervisor not found")
}

/// A hypervisor registered in `zone_id`
pub async fn get_hyper_in_zone(
    conn: &mut SqliteConnection,
    hostid: i64,
    zone_id: i64,
) -> AdminResult<Hyper> {
    let hyper = get_hyper(conn, hostid).await?;
    if zone_id > 0 && hyper.zone_id != zone_id {
        return Err(AdminError::invalid(format!(
            "Hypervisor {} is not in zone {}",
            hostid, zone_id
        )));
    }
    Ok(hyper)
}

/// Ready host ids of a zone (zone 0 means any zone), minus `skip`
pub async fn zone_hyper_ids(
    conn: &mut SqliteConnection,
    zone_id: i64,
    skip: i64,
) -> AdminResult<Vec<i64>> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT hostid FROM hypers
        WHERE status = ? AND hostid != ? AND (? = 0 OR zone_id = ?)
        ORDER BY hostid
        "#,
    )
    .bind(HYPER_STATUS_READY)
    .bind(skip)
    .bind(zone_id)
    .bind(zone_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

/// `group-zone-<zone>:<ids>` of the ready hosts of a zone
pub async fn zone_hyper_group(
    conn: &mut SqliteConnection,
    zone_id: i64,
    skip: i64,
) -> AdminResult<String> {
    let ids = zone_hyper_ids(conn, zone_id, skip).await?;
    if ids.is_empty() {
        return Err(AdminError::new(
            ErrorKind::NoQualifiedHypervisor,
            "No qualified hypervisor",
        ));
    }
    Ok(format_group(GroupKind::Zone, zone_id, &ids))
}

pub async fn upsert_zone_by_name(conn: &mut SqliteConnection, name: &str) -> AdminResult<Zone> {
    sqlx::query("INSERT INTO zones (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
        .bind(name)
        .bind(now())
        .execute(&mut *conn)
        .await?;
    Ok(sqlx::query_as::<_, Zone>("SELECT * FROM zones WHERE name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?)
}

pub async fn upsert_hyper(conn: &mut SqliteConnection, report: &HyperReport) -> AdminResult<Hyper> {
    let zone_id = if report.zone_name.is_empty() {
        0
    } else {
        upsert_zone_by_name(conn, &report.zone_name).await?.id
    };
    let ts = now();

    sqlx::query(
        r#"
        INSERT INTO hypers (hostid, hostname, zone_id, status, host_ip, cpu, total_cpu,
                            memory, total_memory, disk, total_disk, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(hostid) DO UPDATE SET
            hostname = excluded.hostname,
            zone_id = excluded.zone_id,
            status = excluded.status,
            host_ip = excluded.host_ip,
            cpu = excluded.cpu,
            total_cpu = excluded.total_cpu,
            memory = excluded.memory,
            total_memory = excluded.total_memory,
            disk = excluded.disk,
            total_disk = excluded.total_disk,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(report.hostid)
    .bind(&report.hostname)
    .bind(zone_id)
    .bind(report.status)
    .bind(&report.host_ip)
    .bind(report.cpu)
    .bind(report.total_cpu)
    .bind(report.memory)
    .bind(report.total_memory)
    .bind(report.disk)
    .bind(report.total_disk)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?;

    get_hyper(conn, report.hostid).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::testing::Fixture;

    #[tokio::test]
    async fn test_upsert_hyper_updates_in_place() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;

        let mut report = HyperReport {
            hostid: 3,
            hostname: "hyper-3".to_string(),
            status: 1,
            zone_name: "zone-a".to_string(),
            total_cpu: 32,
            ..Default::default()
        };
        let first = upsert_hyper(&mut conn, &report).await.unwrap();
        report.cpu = 8;
        report.status = 0;
        let second = upsert_hyper(&mut conn, &report).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.cpu, 8);
        assert!(!second.is_ready());
        assert_eq!(get_zone(&mut conn, second.zone_id).await.unwrap().name, "zone-a");
    }

    #[tokio::test]
    async fn test_zone_group_skips_and_filters() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 1, "zone-a").await;
        fx.hyper(&mut conn, 2, "zone-a").await;
        fx.hyper(&mut conn, 5, "zone-b").await;

        assert_eq!(
            zone_hyper_group(&mut conn, zone, -1).await.unwrap(),
            format!("group-zone-{}:1,2", zone)
        );
        assert_eq!(
            zone_hyper_group(&mut conn, zone, 1).await.unwrap(),
            format!("group-zone-{}:2", zone)
        );
        assert_eq!(zone_hyper_group(&mut conn, 0, 2).await.unwrap(), "group-zone-0:1,5");
    }

    #[tokio::test]
    async fn test_empty_zone_group_fails() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone = fx.hyper(&mut conn, 1, "zone-a").await;

        let err = zone_hyper_group(&mut conn, zone, 1).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoQualifiedHypervisor);
    }

    #[tokio::test]
    async fn test_hyper_must_be_in_zone() {
        let fx = Fixture::new().await;
        let mut conn = fx.conn().await;
        let zone_a = fx.hyper(&mut conn, 1, "zone-a").await;
        let zone_b = fx.hyper(&mut conn, 2, "zone-b").await;

        assert!(get_hyper_in_zone(&mut conn, 1, zone_a).await.is_ok());
        let err = get_hyper_in_zone(&mut conn, 1, zone_b).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameter);
        let err = get_hyper_in_zone(&mut conn, 42, zone_a).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::HyperNotFound);
    }
}
