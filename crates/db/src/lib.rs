mod builds;
mod problems;
mod tasks;

use anyhow::{Context, Result};
use commit_status_core::config::DbConfig;
use sqlx::{Pool, Sqlite, SqlitePool, migrate::MigrateDatabase};
use time::OffsetDateTime;

pub use tasks::{NewTask, Task};

/// Store shared by every node of the cluster: build snapshots, task rows and
/// system problems.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

#[inline]
fn to_millis(date: OffsetDateTime) -> i64 { (date.unix_timestamp_nanos() / 1_000_000) as i64 }

#[inline]
fn from_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[inline]
fn now_millis() -> i64 { to_millis(OffsetDateTime::now_utc()) }

#[cfg(test)]
pub(crate) mod testing {
    use commit_status_core::config::DbConfig;
    use tempfile::TempDir;

    use crate::Database;

    /// Opens a fresh on-disk database. Keep the directory alive for the duration of the test.
    pub async fn open() -> (TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
        let db = Database::new(&DbConfig { url }).await.unwrap();
        (dir, db)
    }
}
