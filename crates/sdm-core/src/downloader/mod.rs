//! Concurrent downloader: one coordinator per download.
//!
//! Sizes chunks, spawns workers that drain the task queue, runs the health
//! loop, steals work for idle connections, races shadow duplicates through
//! the end-game, and finalizes the destination file. Runs on plain OS
//! threads; the worker pool bridges it with `spawn_blocking`.

mod endgame;
mod fetch;
mod health;
mod mirrors;
mod sizing;
mod steal;
mod worker;

pub use sizing::{chunk_size, connection_count, plan_tasks};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RuntimeConfig;
use crate::error::DownloadError;
use crate::events::{DownloadEvent, EventBus};
use crate::progress::{ChunkStatus, ProgressState};
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::storage::DestFile;
use crate::task::{ByteWatermark, Task};

use self::mirrors::MirrorPicker;

/// Supervision tick.
const TICK: Duration = Duration::from_millis(250);
/// Health loop cadence.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// End-game arms once fewer tasks than this remain queued.
const ENDGAME_QUEUE_THRESHOLD: usize = 2;
/// Workers racing one task group, duplicates included.
const SHADOWS_PER_TASK: usize = 2;
/// Worker-side progress batching.
const WORKER_BATCH_BYTES: u64 = 256 * 1024;
const WORKER_BATCH_INTERVAL: Duration = Duration::from_millis(150);
/// Minimum spacing between progress events for one download.
const EMIT_INTERVAL: Duration = Duration::from_millis(150);

/// How a coordinated download ended, short of a failure.
#[derive(Debug)]
pub enum DownloadOutcome {
    Completed,
    /// User pause; `remaining` is the coalesced set of unwritten ranges.
    Paused { remaining: Vec<Task> },
    /// Delete or shutdown-without-persist.
    Cancelled { remaining: Vec<Task> },
}

/// What the probe (or the saved state) established up front.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub total_size: u64,
    pub range_supported: bool,
    /// Pending ranges and bitmap from the state store, for resume.
    pub saved: Option<SavedProgress>,
}

#[derive(Debug, Clone)]
pub struct SavedProgress {
    pub tasks: Vec<Task>,
    pub chunk_size: u64,
    pub bitmap: Vec<u8>,
}

/// Shared state for one running download.
pub(crate) struct DownloadCtx {
    pub cfg: RuntimeConfig,
    pub id: String,
    pub progress: Arc<ProgressState>,
    pub queue: Arc<TaskQueue>,
    pub dest: DestFile,
    pub events: EventBus,
    pub headers: HashMap<String, String>,
    pub mirrors: MirrorPicker,
    pub retry_policy: RetryPolicy,
    pub epoch: Instant,
    /// Workers fetch with Range headers; false on the single-connection path.
    pub ranged: bool,
    cancel: AtomicBool,
    active: Mutex<Vec<Arc<crate::task::ActiveTask>>>,
    watermarks: Mutex<HashMap<u64, Arc<ByteWatermark>>>,
    /// Origins with a shadow pushed and not yet resolved.
    shadowed: Mutex<std::collections::HashSet<u64>>,
    fatal: Mutex<Option<DownloadError>>,
    emit_gate: Mutex<Instant>,
}

impl DownloadCtx {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Stop everything: pause, delete, or fatal error all funnel here.
    pub fn request_stop(&self) {
        self.cancel.store(true, Ordering::Release);
        self.queue.close();
        for active in self.active.lock().unwrap().iter() {
            active.cancel();
        }
    }

    pub fn stopping(&self) -> bool {
        self.cancelled() || self.fatal.lock().unwrap().is_some()
    }

    /// Record the first fatal error and stop the download.
    pub fn set_fatal(&self, err: DownloadError) {
        {
            let mut fatal = self.fatal.lock().unwrap();
            if fatal.is_none() {
                tracing::warn!(id = %self.id, error = %err, "download failed");
                *fatal = Some(err);
            }
        }
        self.request_stop();
    }

    pub fn register(&self, active: &Arc<crate::task::ActiveTask>) {
        self.active.lock().unwrap().push(Arc::clone(active));
    }

    pub fn unregister(&self, active: &Arc<crate::task::ActiveTask>) {
        self.active
            .lock()
            .unwrap()
            .retain(|a| !Arc::ptr_eq(a, active));
    }

    pub fn active_snapshot(&self) -> Vec<Arc<crate::task::ActiveTask>> {
        self.active.lock().unwrap().clone()
    }

    /// Watermark for a task's group; shadows share their victim's counter
    /// so racing writes credit each byte once.
    pub fn counter_for(&self, task: &Task) -> Arc<ByteWatermark> {
        let mut map = self.watermarks.lock().unwrap();
        Arc::clone(
            map.entry(task.origin)
                .or_insert_with(|| Arc::new(ByteWatermark::new(task.offset))),
        )
    }

    /// Publish a batched progress event, rate-limited per download.
    pub fn maybe_emit_progress(&self, force: bool) {
        {
            let mut gate = self.emit_gate.lock().unwrap();
            if !force && gate.elapsed() < EMIT_INTERVAL {
                return;
            }
            *gate = Instant::now();
        }
        let snap = self.progress.get_progress();
        let (bitmap, width) = self.progress.get_bitmap();
        self.events.publish(DownloadEvent::Progress {
            id: self.id.clone(),
            downloaded: snap.downloaded,
            total: snap.total_size,
            speed_bps: snap.session_speed_bps(),
            elapsed_ns: snap.total_elapsed.as_nanos() as u64,
            active_connections: snap.connections,
            chunk_bitmap: if bitmap.is_empty() { None } else { Some(bitmap) },
            bitmap_width: if width == 0 { None } else { Some(width) },
        });
    }
}

/// Coordinator for one download.
pub struct Downloader {
    pub id: String,
    pub cfg: RuntimeConfig,
    pub progress: Arc<ProgressState>,
    pub events: EventBus,
    pub headers: HashMap<String, String>,
    /// Final destination; the in-progress file carries the suffix.
    pub dest_path: PathBuf,
}

impl Downloader {
    /// Run the transfer to completion, pause, cancel, or failure. Blocking;
    /// call from a blocking-capable thread.
    pub fn run(&self, plan: &TransferPlan) -> Result<DownloadOutcome, DownloadError> {
        let total = plan.total_size;
        let incomplete = crate::storage::incomplete_path(&self.dest_path);
        let resume = plan.saved.is_some() && incomplete.exists();
        if plan.saved.is_some() && !resume {
            tracing::warn!(id = %self.id, "incomplete file missing; restarting from scratch");
            self.progress.restore(0, Duration::ZERO);
        }
        // A saved record without an installed bitmap is from before any
        // byte moved; plan it as a fresh start.
        let saved = if resume {
            plan.saved.as_ref().filter(|s| s.chunk_size > 0)
        } else {
            None
        };
        let dest = if resume {
            DestFile::open_existing(&incomplete)?
        } else {
            DestFile::create(&incomplete, total)?
        };

        // Empty resources have nothing to schedule.
        if total == 0 && plan.range_supported {
            dest.sync()?;
            dest.finalize(&self.dest_path)?;
            self.progress.set_done();
            return Ok(DownloadOutcome::Completed);
        }

        if !plan.range_supported && self.progress.downloaded() > 0 {
            // A range-less server replays the body from byte zero on every
            // attempt; resumed counters must start over with it.
            let elapsed = self.progress.get_progress().total_elapsed;
            self.progress.restore(0, elapsed);
        }

        let mirror_count = self
            .progress
            .get_mirrors()
            .iter()
            .filter(|m| m.active)
            .count();

        let (workers, tasks, chunk) =
            self.plan_layout(total, plan.range_supported, saved, mirror_count);

        // The bitmap must be installed before any worker starts.
        if total > 0 {
            match saved {
                Some(saved) => {
                    self.progress
                        .load_bitmap(&saved.bitmap, total, saved.chunk_size)
                        .map_err(|e| DownloadError::InvalidInput(e.to_string()))?;
                    self.progress.recalculate_progress(&tasks);
                }
                None => {
                    self.progress
                        .init_bitmap(total, chunk)
                        .map_err(|e| DownloadError::InvalidInput(e.to_string()))?;
                }
            }
        }
        // Also restarts the session clock for this activation.
        self.progress.set_total_size(total);

        let queue = Arc::new(TaskQueue::new());
        let ctx = Arc::new(DownloadCtx {
            cfg: self.cfg.clone(),
            id: self.id.clone(),
            progress: Arc::clone(&self.progress),
            queue: Arc::clone(&queue),
            dest,
            events: self.events.clone(),
            headers: self.headers.clone(),
            mirrors: MirrorPicker::new(
                Arc::clone(&self.progress),
                self.cfg.max_connections_per_host,
            ),
            retry_policy: RetryPolicy::with_max_attempts(self.cfg.max_task_retries.max(1)),
            epoch: Instant::now(),
            ranged: plan.range_supported,
            cancel: AtomicBool::new(false),
            active: Mutex::new(Vec::new()),
            watermarks: Mutex::new(HashMap::new()),
            shadowed: Mutex::new(std::collections::HashSet::new()),
            fatal: Mutex::new(None),
            emit_gate: Mutex::new(Instant::now()),
        });

        // Pause reaches the workers through this hook. A pause requested
        // before the hook existed (during probing) must still win.
        {
            let hook_ctx = Arc::clone(&ctx);
            self.progress.set_cancel_hook(move || hook_ctx.request_stop());
        }
        if self.progress.is_paused() {
            ctx.request_stop();
        }

        queue.push_multiple(tasks);

        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || worker::worker_loop(ctx, worker_id))
            })
            .collect();

        self.supervise(&ctx, &handles);

        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(id = %self.id, "worker thread panicked");
            }
        }
        self.progress.clear_cancel_hook();
        ctx.maybe_emit_progress(true);

        self.conclude(&ctx)
    }

    /// Worker count, initial tasks, and bitmap chunk size for this plan.
    fn plan_layout(
        &self,
        total: u64,
        range_supported: bool,
        saved: Option<&SavedProgress>,
        mirror_count: usize,
    ) -> (usize, Vec<Task>, u64) {
        if !range_supported {
            // Single connection, one task spanning the whole resource
            // (unbounded when the size is unknown).
            let length = if total > 0 { total } else { u64::MAX };
            return (1, vec![Task::new(0, length)], self.cfg.min_chunk_size);
        }
        if let Some(saved) = saved {
            let workers = connection_count(total, mirror_count, &self.cfg)
                .min(saved.tasks.len().max(1));
            return (workers, saved.tasks.clone(), saved.chunk_size);
        }
        let n = connection_count(total, mirror_count, &self.cfg);
        let chunk = chunk_size(total, n, &self.cfg);
        let tasks = plan_tasks(total, chunk);
        let workers = n.min(tasks.len().max(1));
        (workers, tasks, chunk)
    }

    /// Coordinator loop: completion detection, health checks, stealing,
    /// end-game, mirror recovery, progress events.
    fn supervise(&self, ctx: &Arc<DownloadCtx>, workers: &[std::thread::JoinHandle<()>]) {
        let mut last_health = Instant::now();
        loop {
            std::thread::sleep(TICK);

            if ctx.stopping() {
                break;
            }
            if ctx.queue.is_drained() {
                ctx.queue.close();
                break;
            }
            if workers.iter().all(|w| w.is_finished()) {
                // Work remains but nobody is left to do it.
                ctx.set_fatal(DownloadError::Transport(
                    "workers exited without completing the transfer".to_string(),
                ));
                break;
            }

            if last_health.elapsed() >= HEALTH_CHECK_INTERVAL {
                let dt = last_health.elapsed();
                last_health = Instant::now();
                health::run_health_check(ctx, dt);
            }

            // Idle capacity goes to stealing first; shadows only race the
            // tails nothing can be stolen from.
            if steal::steal_for_idle(ctx) == 0 {
                endgame::maybe_shadow(ctx);
            }

            for url in ctx.mirrors.due_reprobes(Instant::now()) {
                self.spawn_reprobe(ctx, url);
            }

            ctx.maybe_emit_progress(false);
        }
    }

    fn spawn_reprobe(&self, ctx: &Arc<DownloadCtx>, url: String) {
        let ctx = Arc::clone(ctx);
        let opts = crate::probe::ProbeOptions::from_runtime(&ctx.cfg, ctx.headers.clone());
        std::thread::spawn(move || match crate::probe::probe_url(&url, &opts) {
            Ok(probe) if probe.range_supported => ctx.mirrors.mark_recovered(&url),
            Ok(_) => tracing::debug!(url, "re-probe: still no range support"),
            Err(e) => tracing::debug!(url, error = %e, "re-probe failed"),
        });
    }

    fn conclude(&self, ctx: &Arc<DownloadCtx>) -> Result<DownloadOutcome, DownloadError> {
        if let Some(err) = ctx.fatal.lock().unwrap().take() {
            self.progress.set_error(err.to_string());
            self.progress.bank_session_elapsed();
            return Err(err);
        }

        if ctx.cancelled() {
            let mut remaining = ctx.queue.drain_remaining();
            for active in ctx.active_snapshot() {
                if let Some(rest) = active.unfinished_range() {
                    remaining.push(rest);
                }
            }
            let remaining = sizing::coalesce(remaining);
            self.progress.bank_session_elapsed();
            return if self.progress.is_paused() {
                Ok(DownloadOutcome::Paused { remaining })
            } else {
                Ok(DownloadOutcome::Cancelled { remaining })
            };
        }

        // Completion.
        let downloaded = self.progress.downloaded();
        let total = self.progress.total_size();
        if total > 0 && downloaded != total {
            let err = DownloadError::Transport(format!(
                "transfer accounting mismatch: wrote {downloaded} of {total} bytes"
            ));
            self.progress.set_error(err.to_string());
            return Err(err);
        }
        if total == 0 {
            // Unknown size on the single-connection path: now we know.
            self.progress.set_total_size(downloaded);
        }
        self.progress
            .update_chunk_status(0, self.progress.total_size(), ChunkStatus::Completed);
        ctx.dest.sync()?;
        ctx.dest.finalize(&self.dest_path)?;
        self.progress.bank_session_elapsed();
        self.progress.set_done();
        tracing::info!(id = %self.id, bytes = downloaded, "download complete");
        Ok(DownloadOutcome::Completed)
    }
}
