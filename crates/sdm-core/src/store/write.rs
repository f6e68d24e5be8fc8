//! State store write operations.

use anyhow::Result;

use super::db::{unix_timestamp, StateDb};
use super::types::{url_hash, DownloadEntry, DownloadState, DownloadStatus};

/// Task rows inserted per statement when persisting pending ranges.
const TASK_INSERT_BATCH: usize = 50;

impl StateDb {
    /// Persist a full download state in one transaction: upsert the
    /// `downloads` row, replace its `tasks` rows (batch-inserted), done.
    pub async fn save_state(&self, state: &DownloadState) -> Result<()> {
        let entry = &state.entry;
        let mirrors_json = serde_json::to_string(&entry.mirrors)?;
        let elapsed_ms = (state.elapsed_ns / 1_000_000) as i64;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                url_hash, created_at, paused_at, completed_at, time_taken_ms,
                elapsed_ms, mirrors, chunk_bitmap, actual_chunk_size
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(id) DO UPDATE SET
                url = excluded.url,
                dest_path = excluded.dest_path,
                filename = excluded.filename,
                status = excluded.status,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                url_hash = excluded.url_hash,
                paused_at = excluded.paused_at,
                completed_at = excluded.completed_at,
                time_taken_ms = excluded.time_taken_ms,
                elapsed_ms = excluded.elapsed_ms,
                mirrors = excluded.mirrors,
                chunk_bitmap = excluded.chunk_bitmap,
                actual_chunk_size = excluded.actual_chunk_size
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.url)
        .bind(&entry.dest_path)
        .bind(&entry.filename)
        .bind(entry.status.as_str())
        .bind(entry.total_size as i64)
        .bind(entry.downloaded as i64)
        .bind(url_hash(&entry.url))
        .bind(state.created_at)
        .bind(state.paused_at)
        .bind(entry.completed_at)
        .bind(entry.time_taken_ms)
        .bind(elapsed_ms)
        .bind(mirrors_json)
        .bind(&state.chunk_bitmap)
        .bind(state.actual_chunk_size as i64)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tasks WHERE download_id = ?1")
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;

        for batch in state.tasks.chunks(TASK_INSERT_BATCH) {
            let mut sql =
                String::from("INSERT INTO tasks (download_id, offset, length) VALUES ");
            sql.push_str(
                &std::iter::repeat("(?, ?, ?)")
                    .take(batch.len())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            let mut query = sqlx::query(&sql);
            for task in batch {
                query = query
                    .bind(&entry.id)
                    .bind(task.offset as i64)
                    .bind(task.length as i64);
            }
            query.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Insert a new entry into the master list (no tasks yet).
    pub async fn add_to_master_list(&self, entry: &DownloadEntry) -> Result<()> {
        let mirrors_json = serde_json::to_string(&entry.mirrors)?;
        sqlx::query(
            r#"
            INSERT INTO downloads (
                id, url, dest_path, filename, status, total_size, downloaded,
                url_hash, created_at, time_taken_ms, mirrors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.url)
        .bind(&entry.dest_path)
        .bind(&entry.filename)
        .bind(entry.status.as_str())
        .bind(entry.total_size as i64)
        .bind(entry.downloaded as i64)
        .bind(url_hash(&entry.url))
        .bind(unix_timestamp())
        .bind(entry.time_taken_ms)
        .bind(mirrors_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete one download; its tasks cascade in the same statement.
    pub async fn remove_from_master_list(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM downloads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: &str, status: DownloadStatus) -> Result<()> {
        let completed_at = if status == DownloadStatus::Completed {
            Some(unix_timestamp())
        } else {
            None
        };
        let paused_at = if status == DownloadStatus::Paused {
            Some(unix_timestamp())
        } else {
            None
        };
        sqlx::query(
            r#"
            UPDATE downloads
            SET status = ?1,
                completed_at = COALESCE(?2, completed_at),
                paused_at = COALESCE(?3, paused_at)
            WHERE id = ?4
            "#,
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(paused_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every non-terminal download paused (graceful shutdown).
    pub async fn pause_all(&self) -> Result<u64> {
        let now = unix_timestamp();
        let r = sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'paused', paused_at = ?1
            WHERE status IN ('queued', 'downloading', 'pausing')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Queue every paused download for pickup.
    pub async fn resume_all(&self) -> Result<u64> {
        let r = sqlx::query(
            r#"
            UPDATE downloads
            SET status = 'queued'
            WHERE status = 'paused'
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(r.rows_affected())
    }

    /// Remove all completed rows; returns how many were deleted.
    pub async fn remove_completed(&self) -> Result<u64> {
        let r = sqlx::query("DELETE FROM downloads WHERE status = 'completed'")
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }
}
