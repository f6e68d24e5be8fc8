//! The per-download task: probe, resolve, persist, run, conclude.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::downloader::{DownloadOutcome, Downloader, SavedProgress, TransferPlan};
use crate::error::DownloadError;
use crate::events::DownloadEvent;
use crate::probe::{self, ProbeOptions, ProbeResult};
use crate::progress::{MirrorStatus, ProgressState};
use crate::store::{url_hash, DownloadEntry, DownloadState, DownloadStatus};

use super::handle::{DownloadConfig, DownloadHandle};
use super::PoolInner;

/// Drive one download from probe to a terminal or paused state, then let
/// the pool promote the next queued entry.
pub(super) async fn run_download(inner: Arc<PoolInner>, id: String) {
    let Some((config, progress, announce_started, warm)) = ({
        let mut map = inner.downloads.lock().await;
        map.get_mut(&id).map(|h| {
            let announce = h.announce_started;
            h.announce_started = false;
            let warm = if h.remaining.is_empty() {
                None
            } else {
                Some(SavedProgress {
                    tasks: h.remaining.clone(),
                    chunk_size: h.chunk_size,
                    bitmap: h.bitmap.clone(),
                })
            };
            (h.config.clone(), Arc::clone(&h.progress), announce, warm)
        })
    }) else {
        return;
    };

    let finished = Arc::new(AtomicBool::new(false));
    spawn_cancel_watcher(&inner, &id, &config, &finished);

    let result = prepare_and_run(&inner, &id, &config, &progress, announce_started, warm).await;
    finished.store(true, Ordering::Release);

    if let Err(e) = result {
        conclude_error(&inner, &id, e).await;
    }

    super::WorkerPool::from_inner(Arc::clone(&inner))
        .promote_next()
        .await;
}

/// Forward an external cancellation flag into a delete.
fn spawn_cancel_watcher(
    inner: &Arc<PoolInner>,
    id: &str,
    config: &DownloadConfig,
    finished: &Arc<AtomicBool>,
) {
    let Some(flag) = config.request.cancel.clone() else {
        return;
    };
    let pool = super::WorkerPool::from_inner(Arc::clone(inner));
    let id = id.to_string();
    let finished = Arc::clone(finished);
    tokio::spawn(async move {
        loop {
            if finished.load(Ordering::Acquire) {
                return;
            }
            if flag.load(Ordering::Acquire) {
                let _ = pool.delete(&id).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    });
}

async fn prepare_and_run(
    inner: &Arc<PoolInner>,
    id: &str,
    config: &DownloadConfig,
    progress: &Arc<ProgressState>,
    announce_started: bool,
    warm: Option<SavedProgress>,
) -> Result<(), DownloadError> {
    // Probe the mirror set; fall back to a single-connection plan when no
    // mirror honors ranges but the primary is reachable.
    let opts = ProbeOptions::from_runtime(&config.runtime, config.request.headers.clone());
    let mirrors = config.mirrors.clone();
    let batch = {
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || probe::probe_mirrors(&mirrors, &opts))
            .await
            .map_err(|e| DownloadError::Transport(format!("probe task: {e}")))?
    };

    let (range_supported, lead, statuses) = if batch.valid.is_empty() {
        let primary = config.url.clone();
        let single = {
            let opts = opts.clone();
            tokio::task::spawn_blocking(move || probe::probe_url(&primary, &opts))
                .await
                .map_err(|e| DownloadError::Transport(format!("probe task: {e}")))??
        };
        let statuses = vec![MirrorStatus::active(&config.url)];
        (single.range_supported, single, statuses)
    } else {
        let mut statuses: Vec<MirrorStatus> = batch
            .valid
            .iter()
            .map(|p| MirrorStatus::active(&p.url))
            .collect();
        for (url, reason) in &batch.failures {
            statuses.push(MirrorStatus {
                url: url.clone(),
                active: false,
                error: Some(reason.clone()),
            });
        }
        let lead = pick_lead(&batch.valid, &config.url);
        (true, lead, statuses)
    };

    // Resolve filename and destination.
    let filename = lead.suggested_filename(config.filename_hint.as_deref(), id);
    let dest_path = config
        .dest_path
        .clone()
        .unwrap_or_else(|| config.output_dir.join(&filename));

    // Cold resume pulls the saved ranges; a warm (in-memory) resume wins.
    let mut total = lead.total_size;
    let mut saved = warm;
    if saved.is_none() && config.is_resume {
        if let Some(db) = &inner.db {
            let state = match db.load_state_by_id(id).await {
                Ok(Some(s)) => Some(s),
                _ => db
                    .load_state(&config.url, &dest_path.to_string_lossy())
                    .await
                    .ok()
                    .flatten(),
            };
            if let Some(state) = state {
                if state.entry.status == DownloadStatus::Completed {
                    return Err(DownloadError::AlreadyCompleted);
                }
                progress.restore(
                    state.entry.downloaded,
                    Duration::from_nanos(state.elapsed_ns),
                );
                if state.entry.total_size > 0 {
                    total = state.entry.total_size;
                }
                saved = Some(SavedProgress {
                    tasks: state.tasks,
                    chunk_size: state.actual_chunk_size,
                    bitmap: state.chunk_bitmap,
                });
            }
        }
    }

    progress.set_total_size(total);
    progress.set_mirrors(&statuses);

    {
        let mut map = inner.downloads.lock().await;
        if let Some(h) = map.get_mut(id) {
            h.filename = filename.clone();
            h.dest_path = Some(dest_path.clone());
        } else {
            // Deleted while probing.
            return Ok(());
        }
    }

    // The row must never claim bytes that are not on disk: a fresh
    // download starts with the whole file pending.
    let initial_tasks = match &saved {
        Some(s) => s.tasks.clone(),
        None if total > 0 => vec![crate::task::Task::new(0, total)],
        None => Vec::new(),
    };
    persist_running(inner, id, config, progress, &filename, &dest_path, initial_tasks).await;

    if announce_started {
        inner.events.publish(DownloadEvent::Started {
            id: id.to_string(),
            url: config.url.clone(),
            filename: filename.clone(),
            total,
            dest_path: dest_path.to_string_lossy().into_owned(),
        });
    }

    let downloader = Downloader {
        id: id.to_string(),
        cfg: config.runtime.clone().sanitized(),
        progress: Arc::clone(progress),
        events: inner.events.clone(),
        headers: config.request.headers.clone(),
        dest_path: dest_path.clone(),
    };
    let plan = TransferPlan {
        total_size: total,
        range_supported,
        saved,
    };
    let mut transfer = tokio::task::spawn_blocking(move || downloader.run(&plan));

    // Periodic crash checkpoint: the bitmap is the authoritative resume
    // record, so a killed process restarts from the last persisted chunks.
    let joined = if inner.db.is_some() {
        let mut tick = tokio::time::interval(CHECKPOINT_INTERVAL);
        loop {
            tokio::select! {
                res = &mut transfer => break res,
                _ = tick.tick() => {
                    checkpoint(inner, id, config, progress, &filename, &dest_path).await;
                }
            }
        }
    } else {
        (&mut transfer).await
    };
    let outcome = joined.map_err(|e| DownloadError::Transport(format!("download task: {e}")))??;

    conclude_ok(inner, id, config, progress, &filename, &dest_path, outcome).await;
    Ok(())
}

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// Persist chunk-granular progress mid-flight. Partial chunks count as
/// remaining, so a resumed transfer can only over-fetch, never skip bytes.
async fn checkpoint(
    inner: &Arc<PoolInner>,
    id: &str,
    config: &DownloadConfig,
    progress: &Arc<ProgressState>,
    filename: &str,
    dest_path: &PathBuf,
) {
    let Some(db) = &inner.db else {
        return;
    };
    let (bitmap, width) = progress.get_bitmap();
    if width == 0 {
        return;
    }
    let Ok(bm) = crate::progress::ChunkBitmap::from_bytes(
        &bitmap,
        progress.total_size(),
        progress.chunk_size(),
    ) else {
        return;
    };
    let mut state = build_state(
        config,
        progress,
        filename,
        dest_path,
        DownloadStatus::Downloading,
        bm.remaining_tasks(),
    );
    state.entry.downloaded = bm.completed_bytes();
    if let Err(e) = db.save_state(&state).await {
        tracing::warn!(id, error = %e, "progress checkpoint failed");
    }
}

/// Prefer the primary URL's probe when it survived; else the first valid.
fn pick_lead(valid: &[ProbeResult], primary: &str) -> ProbeResult {
    valid
        .iter()
        .find(|p| p.url == primary)
        .unwrap_or(&valid[0])
        .clone()
}

/// Build the entry used before the probe has resolved anything.
pub(super) fn provisional_entry(handle: &DownloadHandle, status: DownloadStatus) -> DownloadEntry {
    let config = &handle.config;
    DownloadEntry {
        id: config.id.clone(),
        url: config.url.clone(),
        dest_path: config
            .dest_path
            .clone()
            .unwrap_or_else(|| config.output_dir.join(&handle.filename))
            .to_string_lossy()
            .into_owned(),
        filename: handle.filename.clone(),
        status,
        total_size: 0,
        downloaded: 0,
        completed_at: None,
        time_taken_ms: 0,
        url_hash: url_hash(&config.url),
        mirrors: config.mirrors.clone(),
    }
}

fn build_state(
    config: &DownloadConfig,
    progress: &ProgressState,
    filename: &str,
    dest_path: &PathBuf,
    status: DownloadStatus,
    tasks: Vec<crate::task::Task>,
) -> DownloadState {
    let snap = progress.get_progress();
    let (bitmap, _) = progress.get_bitmap();
    DownloadState {
        entry: DownloadEntry {
            id: config.id.clone(),
            url: config.url.clone(),
            dest_path: dest_path.to_string_lossy().into_owned(),
            filename: filename.to_string(),
            status,
            total_size: snap.total_size,
            downloaded: snap.downloaded,
            completed_at: None,
            time_taken_ms: snap.total_elapsed.as_millis() as i64,
            url_hash: url_hash(&config.url),
            mirrors: config.mirrors.clone(),
        },
        created_at: crate::store::db::unix_timestamp(),
        paused_at: None,
        elapsed_ns: snap.total_elapsed.as_nanos() as u64,
        chunk_bitmap: bitmap,
        actual_chunk_size: progress.chunk_size(),
        tasks,
    }
}

/// Store failures on the hot path are logged, never fatal to the transfer.
async fn persist_running(
    inner: &Arc<PoolInner>,
    id: &str,
    config: &DownloadConfig,
    progress: &Arc<ProgressState>,
    filename: &str,
    dest_path: &PathBuf,
    pending: Vec<crate::task::Task>,
) {
    if let Some(db) = &inner.db {
        let state = build_state(
            config,
            progress,
            filename,
            dest_path,
            DownloadStatus::Downloading,
            pending,
        );
        if let Err(e) = db.save_state(&state).await {
            tracing::warn!(id, error = %e, "failed to persist running state");
        }
    }
}

async fn conclude_ok(
    inner: &Arc<PoolInner>,
    id: &str,
    config: &DownloadConfig,
    progress: &Arc<ProgressState>,
    filename: &str,
    dest_path: &PathBuf,
    outcome: DownloadOutcome,
) {
    match outcome {
        DownloadOutcome::Completed => {
            let snap = progress.get_progress();
            if let Some(db) = &inner.db {
                let mut state = build_state(
                    config,
                    progress,
                    filename,
                    dest_path,
                    DownloadStatus::Completed,
                    Vec::new(),
                );
                state.entry.completed_at = Some(crate::store::db::unix_timestamp());
                if let Err(e) = db.save_state(&state).await {
                    tracing::warn!(id, error = %e, "failed to persist completion");
                }
            }
            {
                let mut map = inner.downloads.lock().await;
                if let Some(h) = map.get_mut(id) {
                    h.status = DownloadStatus::Completed;
                    h.remaining.clear();
                }
            }
            inner.events.publish(DownloadEvent::Complete {
                id: id.to_string(),
                filename: filename.to_string(),
                elapsed: snap.total_elapsed.as_nanos() as u64,
                total: snap.total_size,
            });
        }
        DownloadOutcome::Paused { remaining } => {
            let snap = progress.get_progress();
            if let Some(db) = &inner.db {
                let mut state = build_state(
                    config,
                    progress,
                    filename,
                    dest_path,
                    DownloadStatus::Paused,
                    remaining.clone(),
                );
                state.paused_at = Some(crate::store::db::unix_timestamp());
                if let Err(e) = db.save_state(&state).await {
                    tracing::warn!(id, error = %e, "failed to persist paused state");
                }
            }
            {
                let mut map = inner.downloads.lock().await;
                if let Some(h) = map.get_mut(id) {
                    h.status = DownloadStatus::Paused;
                    h.remaining = remaining;
                    h.chunk_size = progress.chunk_size();
                    h.bitmap = progress.get_bitmap().0;
                }
            }
            progress.set_pausing(false);
            inner.events.publish(DownloadEvent::Paused {
                id: id.to_string(),
                downloaded: snap.downloaded,
            });
        }
        DownloadOutcome::Cancelled { .. } => {
            // Delete owns cleanup and the removal event.
            progress.set_pausing(false);
        }
    }
}

async fn conclude_error(inner: &Arc<PoolInner>, id: &str, err: DownloadError) {
    tracing::warn!(id, error = %err, "download ended in error");
    let filename = {
        let mut map = inner.downloads.lock().await;
        match map.get_mut(id) {
            Some(h) => {
                h.status = DownloadStatus::Error;
                h.progress.set_error(err.to_string());
                h.filename.clone()
            }
            None => return,
        }
    };
    if let Some(db) = &inner.db {
        let _ = db.update_status(id, DownloadStatus::Error).await;
    }
    inner.events.publish(DownloadEvent::Error {
        id: id.to_string(),
        filename,
        err: err.to_string(),
    });
}
