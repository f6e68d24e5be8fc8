//! Shared per-download progress state.
//!
//! One object mutated by every worker, the health controller, the event
//! publisher, and the persistence layer. Counters and flags are atomics;
//! list-shaped fields (mirrors, bitmap) and composite snapshots sit behind
//! a single mutex each.

mod bitmap;

pub use bitmap::{ChunkBitmap, ChunkStatus};

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::task::Task;

/// Health of one mirror URL during a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStatus {
    pub url: String,
    pub active: bool,
    pub error: Option<String>,
}

impl MirrorStatus {
    pub fn active(url: impl Into<String>) -> Self {
        MirrorStatus {
            url: url.into(),
            active: true,
            error: None,
        }
    }
}

/// One consistent progress reading.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub downloaded: u64,
    pub total_size: u64,
    /// Elapsed across all sessions, including the current one.
    pub total_elapsed: Duration,
    /// Elapsed since the current session started.
    pub session_elapsed: Duration,
    pub connections: usize,
    pub session_start_bytes: u64,
}

impl ProgressSnapshot {
    /// Mean transfer speed of the current session in bytes/sec.
    pub fn session_speed_bps(&self) -> f64 {
        let secs = self.session_elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.downloaded.saturating_sub(self.session_start_bytes)) as f64 / secs
    }
}

#[derive(Debug)]
struct SessionClock {
    session_start: Instant,
    saved_elapsed: Duration,
}

type CancelHook = Box<dyn Fn() + Send + Sync>;

/// Mutable shared record for one active download.
pub struct ProgressState {
    id: String,
    total_size: AtomicU64,
    downloaded: AtomicU64,
    session_start_bytes: AtomicU64,
    active_workers: AtomicUsize,
    done: AtomicBool,
    paused: AtomicBool,
    pausing: AtomicBool,
    clock: Mutex<SessionClock>,
    last_error: Mutex<Option<String>>,
    cancel_hook: Mutex<Option<CancelHook>>,
    mirrors: Mutex<Vec<MirrorStatus>>,
    bitmap: Mutex<ChunkBitmap>,
}

impl ProgressState {
    pub fn new(id: impl Into<String>) -> Self {
        ProgressState {
            id: id.into(),
            total_size: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            session_start_bytes: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            pausing: AtomicBool::new(false),
            clock: Mutex::new(SessionClock {
                session_start: Instant::now(),
                saved_elapsed: Duration::ZERO,
            }),
            last_error: Mutex::new(None),
            cancel_hook: Mutex::new(None),
            mirrors: Mutex::new(Vec::new()),
            bitmap: Mutex::new(ChunkBitmap::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set the file size and restart the session clock.
    pub fn set_total_size(&self, n: u64) {
        self.total_size.store(n, Ordering::Release);
        self.sync_session_start();
    }

    pub fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    /// Re-anchor the session: session-start bytes become the current
    /// downloaded count and the session clock restarts. Called on resume.
    pub fn sync_session_start(&self) {
        let mut clock = self.clock.lock().unwrap();
        self.session_start_bytes
            .store(self.downloaded.load(Ordering::Acquire), Ordering::Release);
        clock.session_start = Instant::now();
    }

    /// Fold the just-finished session into the saved elapsed total.
    pub fn bank_session_elapsed(&self) {
        let mut clock = self.clock.lock().unwrap();
        let session = clock.session_start.elapsed();
        clock.saved_elapsed += session;
        clock.session_start = Instant::now();
    }

    /// Restore counters from a persisted record (cold resume).
    pub fn restore(&self, downloaded: u64, saved_elapsed: Duration) {
        self.downloaded.store(downloaded, Ordering::Release);
        self.session_start_bytes.store(downloaded, Ordering::Release);
        let mut clock = self.clock.lock().unwrap();
        clock.saved_elapsed = saved_elapsed;
        clock.session_start = Instant::now();
    }

    pub fn add_downloaded(&self, n: u64) -> u64 {
        self.downloaded.fetch_add(n, Ordering::AcqRel) + n
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn worker_started(&self) -> usize {
        self.active_workers.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn worker_stopped(&self) -> usize {
        self.active_workers.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn connections(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Request pause: flips the flag and fires the registered cancel hook.
    /// A finished download cannot be paused.
    pub fn pause(&self) {
        if self.is_done() {
            return;
        }
        self.paused.store(true, Ordering::Release);
        if let Some(hook) = self.cancel_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    /// Stop the transfer without marking it paused (delete, shutdown).
    pub fn cancel_transfer(&self) {
        if let Some(hook) = self.cancel_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    /// Clear the paused flag. Refused while workers are still draining from
    /// a previous pause request.
    pub fn resume(&self) -> bool {
        if self.is_pausing() {
            return false;
        }
        self.paused.store(false, Ordering::Release);
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_pausing(&self, pausing: bool) {
        self.pausing.store(pausing, Ordering::Release);
    }

    pub fn is_pausing(&self) -> bool {
        self.pausing.load(Ordering::Acquire)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::Release);
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.last_error.lock().unwrap() = Some(message.into());
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn set_cancel_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.cancel_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn clear_cancel_hook(&self) {
        *self.cancel_hook.lock().unwrap() = None;
    }

    /// One consistent reading of the counters and clocks.
    pub fn get_progress(&self) -> ProgressSnapshot {
        let clock = self.clock.lock().unwrap();
        let session_elapsed = clock.session_start.elapsed();
        ProgressSnapshot {
            downloaded: self.downloaded.load(Ordering::Acquire),
            total_size: self.total_size.load(Ordering::Acquire),
            total_elapsed: clock.saved_elapsed + session_elapsed,
            session_elapsed,
            connections: self.active_workers.load(Ordering::Acquire),
            session_start_bytes: self.session_start_bytes.load(Ordering::Acquire),
        }
    }

    /// Replace the mirror list (deep copy in).
    pub fn set_mirrors(&self, list: &[MirrorStatus]) {
        *self.mirrors.lock().unwrap() = list.to_vec();
    }

    /// Snapshot of the mirror list (deep copy out).
    pub fn get_mirrors(&self) -> Vec<MirrorStatus> {
        self.mirrors.lock().unwrap().clone()
    }

    /// Mark one mirror inactive with a reason; unknown URLs are ignored.
    pub fn mark_mirror_inactive(&self, url: &str, error: impl Into<String>) {
        let mut mirrors = self.mirrors.lock().unwrap();
        if let Some(m) = mirrors.iter_mut().find(|m| m.url == url) {
            m.active = false;
            m.error = Some(error.into());
        }
    }

    /// Mark one mirror active again (successful re-probe).
    pub fn mark_mirror_active(&self, url: &str) {
        let mut mirrors = self.mirrors.lock().unwrap();
        if let Some(m) = mirrors.iter_mut().find(|m| m.url == url) {
            m.active = true;
            m.error = None;
        }
    }

    /// Allocate the chunk bitmap. Idempotent for identical parameters;
    /// different parameters reinitialize.
    pub fn init_bitmap(&self, total_size: u64, chunk_size: u64) -> anyhow::Result<()> {
        let mut bm = self.bitmap.lock().unwrap();
        if !bm.is_empty() && bm.total_size() == total_size && bm.chunk_size() == chunk_size {
            return Ok(());
        }
        *bm = ChunkBitmap::new(total_size, chunk_size)?;
        Ok(())
    }

    /// Install a previously serialized bitmap (cold resume).
    pub fn load_bitmap(&self, bytes: &[u8], total_size: u64, chunk_size: u64) -> anyhow::Result<()> {
        let mut bm = self.bitmap.lock().unwrap();
        *bm = ChunkBitmap::from_bytes(bytes, total_size, chunk_size)?;
        Ok(())
    }

    /// Monotone status update for every chunk overlapping the byte range.
    pub fn update_chunk_status(&self, offset: u64, length: u64, status: ChunkStatus) {
        self.bitmap.lock().unwrap().update_range(offset, length, status);
    }

    /// Copy of the packed bitmap and its chunk width.
    pub fn get_bitmap(&self) -> (Vec<u8>, usize) {
        let bm = self.bitmap.lock().unwrap();
        (bm.to_bytes(), bm.width())
    }

    pub fn chunk_size(&self) -> u64 {
        self.bitmap.lock().unwrap().chunk_size()
    }

    /// Rebuild the bitmap from the set of not-yet-downloaded ranges.
    pub fn recalculate_progress(&self, remaining: &[Task]) {
        self.bitmap.lock().unwrap().recalculate(remaining);
    }
}

impl std::fmt::Debug for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressState")
            .field("id", &self.id)
            .field("total_size", &self.total_size())
            .field("downloaded", &self.downloaded())
            .field("connections", &self.connections())
            .field("paused", &self.is_paused())
            .field("pausing", &self.is_pausing())
            .field("done", &self.is_done())
            .finish()
    }
}
