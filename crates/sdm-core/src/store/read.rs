//! State store read operations.

use anyhow::Result;
use sqlx::Row;

use super::db::StateDb;
use super::types::{DownloadEntry, DownloadState, DownloadStatus};
use crate::task::Task;

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadEntry> {
    let mirrors_json: String = row.get("mirrors");
    let mirrors: Vec<String> = serde_json::from_str(&mirrors_json).unwrap_or_default();
    let status: String = row.get("status");
    Ok(DownloadEntry {
        id: row.get("id"),
        url: row.get("url"),
        dest_path: row.get("dest_path"),
        filename: row.get("filename"),
        status: DownloadStatus::from_str(&status),
        total_size: row.get::<i64, _>("total_size") as u64,
        downloaded: row.get::<i64, _>("downloaded") as u64,
        completed_at: row.get("completed_at"),
        time_taken_ms: row.get("time_taken_ms"),
        url_hash: row.get("url_hash"),
        mirrors,
    })
}

fn state_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DownloadState> {
    Ok(DownloadState {
        entry: entry_from_row(row)?,
        created_at: row.get("created_at"),
        paused_at: row.get("paused_at"),
        elapsed_ns: row.get::<i64, _>("elapsed_ms") as u64 * 1_000_000,
        chunk_bitmap: row.get("chunk_bitmap"),
        actual_chunk_size: row.get::<i64, _>("actual_chunk_size") as u64,
        tasks: Vec::new(),
    })
}

const STATE_COLUMNS: &str = "id, url, dest_path, filename, status, total_size, downloaded, \
     url_hash, created_at, paused_at, completed_at, time_taken_ms, elapsed_ms, \
     mirrors, chunk_bitmap, actual_chunk_size";

impl StateDb {
    async fn tasks_for(&self, id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT offset, length FROM tasks WHERE download_id = ?1 ORDER BY offset ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Task::new(r.get::<i64, _>("offset") as u64, r.get::<i64, _>("length") as u64))
            .collect())
    }

    /// Most recent non-completed state for (url, dest_path), with its tasks.
    pub async fn load_state(&self, url: &str, dest_path: &str) -> Result<Option<DownloadState>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM downloads \
             WHERE url = ?1 AND dest_path = ?2 AND status != 'completed' \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(url)
            .bind(dest_path)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut state = state_from_row(&row)?;
        state.tasks = self.tasks_for(&state.entry.id).await?;
        Ok(Some(state))
    }

    /// Full state by id, with its tasks.
    pub async fn load_state_by_id(&self, id: &str) -> Result<Option<DownloadState>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM downloads WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut state = state_from_row(&row)?;
        state.tasks = self.tasks_for(&state.entry.id).await?;
        Ok(Some(state))
    }

    /// Batch load by id (resume-all flows). Missing ids are skipped.
    pub async fn load_states(&self, ids: &[String]) -> Result<Vec<DownloadState>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(state) = self.load_state_by_id(id).await? {
                out.push(state);
            }
        }
        Ok(out)
    }

    /// All master-list entries, newest first.
    pub async fn list_all(&self) -> Result<Vec<DownloadEntry>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM downloads ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn load_paused(&self) -> Result<Vec<DownloadEntry>> {
        self.list_by_status(DownloadStatus::Paused).await
    }

    pub async fn load_completed(&self) -> Result<Vec<DownloadEntry>> {
        self.list_by_status(DownloadStatus::Completed).await
    }

    async fn list_by_status(&self, status: DownloadStatus) -> Result<Vec<DownloadEntry>> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM downloads WHERE status = ?1 \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// One entry by id.
    pub async fn get(&self, id: &str) -> Result<Option<DownloadEntry>> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM downloads WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Whether any non-completed entry exists for this URL (duplicate check
    /// via the url hash index).
    pub async fn has_download(&self, url: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM downloads WHERE url_hash = ?1 AND url = ?2 \
             AND status != 'completed'",
        )
        .bind(super::types::url_hash(url))
        .bind(url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }
}
