//! SQLite-backed state store handle.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle to the download state database.
///
/// Owned by the orchestrator and passed by reference to the worker pool;
/// there is no process-wide singleton. The file lives under
/// `~/.config/sdm/state/app.db`.
#[derive(Clone)]
pub struct StateDb {
    pub(crate) pool: Pool<Sqlite>,
}

impl StateDb {
    /// Open (or create) the default state database and run migrations.
    pub async fn open_default() -> Result<Self> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("sdm")?;
        let state_dir = xdg_dirs.get_config_home().join("state");
        tokio::fs::create_dir_all(&state_dir).await?;
        Self::open_at(&state_dir.join("app.db")).await
    }

    /// Open (or create) a state database at an explicit path.
    pub async fn open_at(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let db = StateDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// In-memory database for tests. A single connection, or the pool would
    /// hand back a different empty database per checkout.
    pub async fn open_memory() -> Result<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse::<SqliteConnectOptions>()?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = StateDb { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Close the pool. A fresh handle may be opened again afterwards.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                dest_path TEXT NOT NULL,
                filename TEXT NOT NULL,
                status TEXT NOT NULL,
                total_size INTEGER NOT NULL DEFAULT 0,
                downloaded INTEGER NOT NULL DEFAULT 0,
                url_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                paused_at INTEGER,
                completed_at INTEGER,
                time_taken_ms INTEGER NOT NULL DEFAULT 0,
                elapsed_ms INTEGER NOT NULL DEFAULT 0,
                mirrors TEXT NOT NULL DEFAULT '[]',
                chunk_bitmap BLOB NOT NULL DEFAULT x'',
                actual_chunk_size INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                download_id TEXT NOT NULL
                    REFERENCES downloads(id) ON DELETE CASCADE,
                offset INTEGER NOT NULL,
                length INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_download ON tasks(download_id);",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
