//! Worker pool: admission, lifecycle verbs, and event fan-out.
//!
//! Owns every download the orchestrator added. Up to the configured number
//! run at once; the rest queue FIFO and are promoted whenever a slot frees
//! (completion, error, pause, or delete). All verbs are async; the actual
//! transfer runs on blocking threads inside the per-download task.

mod handle;
mod run;

#[cfg(test)]
mod tests;

pub use handle::{DownloadConfig, DownloadSnapshot, RequestContext};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SdmConfig;
use crate::error::DownloadError;
use crate::events::{DownloadEvent, EventBus};
use crate::storage::incomplete_path;
use crate::store::{DownloadStatus, StateDb};

use self::handle::DownloadHandle;

pub(crate) struct PoolInner {
    cfg: SdmConfig,
    db: Option<StateDb>,
    events: EventBus,
    downloads: Mutex<HashMap<String, DownloadHandle>>,
    /// FIFO admission order for queued ids.
    queued: Mutex<VecDeque<String>>,
}

impl PoolInner {
    fn db(&self) -> Result<&StateDb, DownloadError> {
        self.db.as_ref().ok_or(DownloadError::DatabaseNotConfigured)
    }
}

/// Bounded scheduler over concurrent downloads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// `db` is optional: without it the pool still downloads, but pause
    /// state does not survive the process.
    pub fn new(cfg: SdmConfig, db: Option<StateDb>) -> Self {
        Self::with_events(cfg, db, EventBus::new())
    }

    /// Like `new`, but publishing into a broadcaster the orchestrator owns
    /// (shared with its other transports).
    pub fn with_events(cfg: SdmConfig, db: Option<StateDb>, events: EventBus) -> Self {
        WorkerPool {
            inner: Arc::new(PoolInner {
                cfg,
                db,
                events,
                downloads: Mutex::new(HashMap::new()),
                queued: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn events(&self) -> EventBus {
        self.inner.events.clone()
    }

    /// A fresh config carrying this pool's runtime defaults.
    pub fn new_download(
        &self,
        url: impl Into<String>,
        output_dir: impl Into<std::path::PathBuf>,
    ) -> DownloadConfig {
        let mut config = DownloadConfig::new(url, output_dir);
        config.runtime = self.inner.cfg.runtime.clone();
        config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Admit a download or queue it when every slot is taken. Returns the id.
    pub async fn add(&self, config: DownloadConfig) -> Result<String, DownloadError> {
        let id = config.id.clone();
        let mut map = self.inner.downloads.lock().await;
        if map.contains_key(&id) {
            return Err(DownloadError::InvalidInput(format!(
                "download {id} already tracked"
            )));
        }
        let handle = DownloadHandle::new(config);
        let filename = handle.filename.clone();
        let has_slot = map.values().filter(|h| h.is_active()).count()
            < self.inner.cfg.max_concurrent_downloads;
        map.insert(id.clone(), handle);

        if has_slot {
            self.spawn_locked(&mut map, &id);
        } else {
            self.inner.queued.lock().await.push_back(id.clone());
            if let Some(db) = &self.inner.db {
                let entry = run::provisional_entry(map.get(&id).unwrap(), DownloadStatus::Queued);
                if let Err(e) = db.add_to_master_list(&entry).await {
                    tracing::warn!(id, error = %e, "failed to persist queued entry");
                }
            }
            self.inner.events.publish(DownloadEvent::Queued {
                id: id.clone(),
                filename,
            });
        }
        Ok(id)
    }

    fn spawn_locked(&self, map: &mut HashMap<String, DownloadHandle>, id: &str) {
        if let Some(h) = map.get_mut(id) {
            h.status = DownloadStatus::Downloading;
            h.announce_started = true;
            let inner = Arc::clone(&self.inner);
            let id = id.to_string();
            h.join = Some(tokio::spawn(run::run_download(inner, id)));
        }
    }

    /// Pause one download. Returns true when the id was found. Waits until
    /// every worker has exited and the remaining tasks are persisted.
    pub async fn pause(&self, id: &str) -> bool {
        let (progress, join) = {
            let mut map = self.inner.downloads.lock().await;
            let Some(h) = map.get_mut(id) else {
                return false;
            };
            match h.status {
                DownloadStatus::Downloading => {
                    h.status = DownloadStatus::Pausing;
                    h.progress.set_pausing(true);
                    (Arc::clone(&h.progress), h.join.take())
                }
                DownloadStatus::Queued => {
                    h.status = DownloadStatus::Paused;
                    self.inner.queued.lock().await.retain(|q| q != id);
                    if let Some(db) = &self.inner.db {
                        let _ = db.update_status(id, DownloadStatus::Paused).await;
                    }
                    self.inner.events.publish(DownloadEvent::Paused {
                        id: id.to_string(),
                        downloaded: 0,
                    });
                    return true;
                }
                // Repeated pause: no state change, no event.
                _ => return true,
            }
        };
        if let Some(db) = &self.inner.db {
            if !progress.is_done() {
                let _ = db.update_status(id, DownloadStatus::Pausing).await;
            }
        }
        progress.pause();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.promote_next().await;
        true
    }

    /// Resume a paused, still-tracked download. Cold resume (fresh process)
    /// goes through `add` with `is_resume` instead.
    pub async fn resume(&self, id: &str) -> Result<(), DownloadError> {
        let mut map = self.inner.downloads.lock().await;
        {
            let Some(h) = map.get_mut(id) else {
                return Err(DownloadError::NotFound);
            };
            if h.progress.is_pausing() {
                return Err(DownloadError::InvalidInput(
                    "pause still in progress".to_string(),
                ));
            }
            if h.status != DownloadStatus::Paused {
                return Err(DownloadError::NotFound);
            }
            if !h.progress.resume() {
                return Err(DownloadError::InvalidInput(
                    "pause still in progress".to_string(),
                ));
            }
        }

        let has_slot = map.values().filter(|v| v.is_active()).count()
            < self.inner.cfg.max_concurrent_downloads;
        let h = map.get_mut(id).unwrap();
        if has_slot {
            self.inner.events.publish(DownloadEvent::Resumed {
                id: id.to_string(),
            });
            h.status = DownloadStatus::Downloading;
            h.announce_started = false;
            let inner = Arc::clone(&self.inner);
            let id = id.to_string();
            h.join = Some(tokio::spawn(run::run_download(inner, id)));
        } else {
            let filename = h.filename.clone();
            h.status = DownloadStatus::Queued;
            self.inner.queued.lock().await.push_back(id.to_string());
            self.inner.events.publish(DownloadEvent::Queued {
                id: id.to_string(),
                filename,
            });
        }
        Ok(())
    }

    /// Cancel and remove one download: stop workers, delete the incomplete
    /// file and the store row. Idempotent; emits at most one removal event.
    pub async fn delete(&self, id: &str) -> Result<bool, DownloadError> {
        let removed = {
            let mut map = self.inner.downloads.lock().await;
            map.remove(id)
        };
        self.inner.queued.lock().await.retain(|q| q != id);

        let Some(mut h) = removed else {
            return Ok(false);
        };

        if h.is_active() {
            h.progress.cancel_transfer();
            if let Some(join) = h.join.take() {
                let _ = join.await;
            }
        }

        if let Some(dest) = &h.dest_path {
            let _ = tokio::fs::remove_file(incomplete_path(dest)).await;
        }
        if let Some(db) = &self.inner.db {
            if let Err(e) = db.remove_from_master_list(id).await {
                tracing::warn!(id, error = %e, "failed to remove store row");
            }
        }
        self.inner.events.publish(DownloadEvent::Removed {
            id: id.to_string(),
            filename: h.filename.clone(),
        });
        self.promote_next().await;
        Ok(true)
    }

    /// Alias for `delete`.
    pub async fn cancel(&self, id: &str) -> Result<bool, DownloadError> {
        self.delete(id).await
    }

    /// Snapshot of every tracked config.
    pub async fn get_all(&self) -> Vec<DownloadConfig> {
        let map = self.inner.downloads.lock().await;
        map.values().map(|h| h.config.clone()).collect()
    }

    /// One-row status view.
    pub async fn get_status(&self, id: &str) -> Option<DownloadSnapshot> {
        let map = self.inner.downloads.lock().await;
        let h = map.get(id)?;
        let snap = h.progress.get_progress();
        Some(DownloadSnapshot {
            id: h.config.id.clone(),
            url: h.config.url.clone(),
            filename: h.filename.clone(),
            status: h.status,
            total_size: snap.total_size,
            downloaded: snap.downloaded,
            speed_bps: snap.session_speed_bps(),
            elapsed_ns: snap.total_elapsed.as_nanos() as u64,
            connections: snap.connections,
        })
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.downloads.lock().await;
        map.values().filter(|h| h.is_active()).count()
    }

    /// Whether a non-terminal download for this URL is tracked.
    pub async fn has_download(&self, url: &str) -> bool {
        let map = self.inner.downloads.lock().await;
        map.values()
            .any(|h| h.config.url == url && !h.status.is_terminal())
    }

    /// Park every queued entry as paused, then pause every active download
    /// and wait for its workers to exit. Queued entries go first so a
    /// finishing pause cannot promote fresh work mid-shutdown.
    pub async fn graceful_shutdown(&self) {
        let active_ids: Vec<String> = {
            let mut map = self.inner.downloads.lock().await;
            let mut queued = self.inner.queued.lock().await;
            for id in queued.drain(..) {
                if let Some(h) = map.get_mut(&id) {
                    h.status = DownloadStatus::Paused;
                }
                if let Some(db) = &self.inner.db {
                    let _ = db.update_status(&id, DownloadStatus::Paused).await;
                }
            }
            map.values()
                .filter(|h| h.is_active())
                .map(|h| h.config.id.clone())
                .collect()
        };
        for id in active_ids {
            self.pause(&id).await;
        }
    }

    /// Promote the earliest queued entry into a free slot.
    async fn promote_next(&self) {
        let mut map = self.inner.downloads.lock().await;
        let active = map.values().filter(|h| h.is_active()).count();
        if active >= self.inner.cfg.max_concurrent_downloads {
            return;
        }
        let mut queued = self.inner.queued.lock().await;
        while let Some(id) = queued.pop_front() {
            let eligible = map
                .get(&id)
                .map(|h| h.status == DownloadStatus::Queued)
                .unwrap_or(false);
            if eligible {
                drop(queued);
                self.spawn_locked(&mut map, &id);
                return;
            }
        }
    }

    pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
        WorkerPool { inner }
    }

    /// Every persisted entry, newest first.
    pub async fn persisted_entries(&self) -> Result<Vec<crate::store::DownloadEntry>, DownloadError> {
        self.inner.db()?.list_all().await.map_err(db_error)
    }

    /// Persisted state (with pending tasks) for one id.
    pub async fn persisted_state(
        &self,
        id: &str,
    ) -> Result<crate::store::DownloadState, DownloadError> {
        self.inner
            .db()?
            .load_state_by_id(id)
            .await
            .map_err(db_error)?
            .ok_or(DownloadError::NotFound)
    }

    /// Drop completed rows from the store; returns how many were removed.
    pub async fn remove_completed(&self) -> Result<u64, DownloadError> {
        self.inner.db()?.remove_completed().await.map_err(db_error)
    }
}

fn db_error(e: anyhow::Error) -> DownloadError {
    DownloadError::Io(std::io::Error::other(e.to_string()))
}
