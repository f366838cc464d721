mod models;

pub use models::*;

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

pub type DbPool = SqlitePool;

/// Execute a SQL migration file, properly handling comments
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in sql.split(';') {
        // Strip SQL comment lines (lines starting with --)
        let cleaned: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        let trimmed = cleaned.trim();
        if !trimmed.is_empty() {
            sqlx::query(trimmed).execute(pool).await?;
        }
    }
    Ok(())
}

pub async fn init(data_dir: &Path) -> Result<DbPool> {
    let db_path = data_dir.join("stratus.db");
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    info!("Initializing database at {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    // Enable WAL mode for better concurrency
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// Single-connection in-memory database with the schema applied.
///
/// The connection is never recycled, since every new SQLite memory connection
/// starts out empty.
pub async fn init_in_memory() -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations...");

    // Migration 001: Organizations, users, sessions, audit log
    execute_sql(pool, include_str!("../../migrations/001_tenancy.sql")).await?;

    // Migration 002: Hypervisors and networking rows
    execute_sql(pool, include_str!("../../migrations/002_network.sql")).await?;

    // Migration 003: Load balancers
    let has_load_balancers: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='load_balancers'",
    )
    .fetch_optional(pool)
    .await?;
    if has_load_balancers.is_none() {
        execute_sql(pool, include_str!("../../migrations/003_load_balancers.sql")).await?;
    }

    // Migration 004: Instances and volumes
    let has_instances: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='instances'",
    )
    .fetch_optional(pool)
    .await?;
    if has_instances.is_none() {
        execute_sql(pool, include_str!("../../migrations/004_instances.sql")).await?;
    }

    // Migration 005: Volume path and target device
    let has_volume_path: Option<(String,)> =
        sqlx::query_as("SELECT name FROM pragma_table_info('volumes') WHERE name = 'path'")
            .fetch_optional(pool)
            .await?;
    if has_volume_path.is_none() {
        execute_sql(pool, include_str!("../../migrations/005_volume_paths.sql")).await?;
    }

    info!("Migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = init_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<String> = tables.into_iter().map(|(n,)| n).collect();

        for expected in [
            "addresses",
            "audit_logs",
            "backends",
            "instances",
            "listeners",
            "load_balancers",
            "members",
            "vrrp_instances",
            "volumes",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing table {}", expected);
        }

        let columns: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM pragma_table_info('volumes') WHERE name IN ('path', 'target')")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(columns.len(), 2);
    }
}
