//! Byte-range tasks and their in-flight state.
//!
//! A `Task` is a half-open byte range handed to one worker. An `ActiveTask`
//! is the live record of a worker fetching a task: its write frontier, its
//! steal-adjustable upper bound, activity timestamps, and smoothed speed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::CHUNK_ALIGN;

/// Round `n` down to the nearest multiple of the 4 KiB alignment.
pub fn align_down(n: u64) -> u64 {
    n - (n % CHUNK_ALIGN)
}

/// A byte range `[offset, offset + length)` to fetch.
///
/// `origin` identifies the task group for end-game shadowing: ordinary tasks
/// carry `origin == offset`; a shadow duplicate inherits the origin of the
/// task it races. `retries` travels with the range across re-pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub offset: u64,
    pub length: u64,
    pub origin: u64,
    pub retries: u32,
}

impl Task {
    pub fn new(offset: u64, length: u64) -> Self {
        Task {
            offset,
            length,
            origin: offset,
            retries: 0,
        }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// HTTP Range header value (inclusive end): `bytes=offset-(end-1)`.
    pub fn range_header_value(&self) -> String {
        if self.length == 0 {
            "bytes=0-0".to_string()
        } else {
            format!("bytes={}-{}", self.offset, self.end() - 1)
        }
    }
}

/// EMA-smoothed transfer speed with silence decay.
#[derive(Debug)]
pub struct SpeedEma {
    alpha: f64,
    bps: f64,
    primed: bool,
}

impl SpeedEma {
    pub fn new(alpha: f64) -> Self {
        SpeedEma {
            alpha,
            bps: 0.0,
            primed: false,
        }
    }

    /// Fold one bytes-per-second sample into the average.
    pub fn update(&mut self, sample_bps: f64) {
        if self.primed {
            self.bps = self.alpha * sample_bps + (1.0 - self.alpha) * self.bps;
        } else {
            self.bps = sample_bps;
            self.primed = true;
        }
    }

    /// Current speed; a worker silent for more than 2 s is decayed toward
    /// zero proportionally so stale EMAs do not mask a stall.
    pub fn read(&self, since_activity: Duration) -> f64 {
        const SILENCE: Duration = Duration::from_secs(2);
        if since_activity > SILENCE {
            self.bps * (SILENCE.as_secs_f64() / since_activity.as_secs_f64())
        } else {
            self.bps
        }
    }
}

/// High-watermark byte counter shared by all members of one task group.
///
/// During end-game two workers race the same range; crediting `downloaded`
/// through the watermark counts each distinct byte exactly once.
#[derive(Debug)]
pub struct ByteWatermark {
    high: AtomicU64,
}

impl ByteWatermark {
    pub fn new(start: u64) -> Self {
        ByteWatermark {
            high: AtomicU64::new(start),
        }
    }

    /// Record that `[start, end)` is now written; returns the count of bytes
    /// not previously credited to any group member.
    pub fn credit(&self, start: u64, end: u64) -> u64 {
        let mut cur = self.high.load(Ordering::Acquire);
        loop {
            if end <= cur {
                return 0;
            }
            match self
                .high
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return end - cur.max(start),
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn high(&self) -> u64 {
        self.high.load(Ordering::Acquire)
    }
}

/// Outcome of a steal attempt against one active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealOutcome {
    Stole(Task),
    NothingToSteal,
}

/// In-flight state for one worker's current task.
///
/// Reads are lock-free; every mutation of the `(current, reserved, stop_at)`
/// triple goes through `range_lock` so a steal can never cut below a write
/// that is already in flight.
pub struct ActiveTask {
    pub task: Task,
    pub worker_id: usize,
    range_lock: Mutex<()>,
    current: AtomicU64,
    reserved: AtomicU64,
    stop_at: AtomicU64,
    last_synced: AtomicU64,
    last_activity_ns: AtomicU64,
    window_bytes: AtomicU64,
    cancelled: AtomicBool,
    started_at: Instant,
    epoch: Instant,
    speed: Mutex<SpeedEma>,
    counter: Arc<ByteWatermark>,
}

impl ActiveTask {
    pub fn new(
        task: Task,
        worker_id: usize,
        epoch: Instant,
        speed_ema_alpha: f64,
        counter: Arc<ByteWatermark>,
    ) -> Self {
        let now_ns = epoch.elapsed().as_nanos() as u64;
        ActiveTask {
            worker_id,
            range_lock: Mutex::new(()),
            current: AtomicU64::new(task.offset),
            reserved: AtomicU64::new(task.offset),
            stop_at: AtomicU64::new(task.end()),
            last_synced: AtomicU64::new(task.offset),
            last_activity_ns: AtomicU64::new(now_ns),
            window_bytes: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            started_at: Instant::now(),
            epoch,
            speed: Mutex::new(SpeedEma::new(speed_ema_alpha)),
            counter,
            task,
        }
    }

    pub fn current_offset(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub fn stop_at(&self) -> u64 {
        self.stop_at.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u64 {
        self.stop_at().saturating_sub(self.current_offset())
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// True once the worker has written anything for this attempt.
    pub fn has_progressed(&self) -> bool {
        self.current_offset() > self.task.offset
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn counter(&self) -> &Arc<ByteWatermark> {
        &self.counter
    }

    /// Reserve up to `want` bytes starting at the current write frontier.
    /// Returns the absolute offset and length to write, or `None` when the
    /// range is exhausted (stop reached, possibly shrunk by a steal).
    pub fn reserve(&self, want: u64) -> Option<(u64, u64)> {
        let _g = self.range_lock.lock().unwrap();
        let cur = self.current.load(Ordering::Relaxed);
        let stop = self.stop_at.load(Ordering::Relaxed);
        let n = want.min(stop.saturating_sub(cur));
        if n == 0 {
            return None;
        }
        self.reserved.store(cur + n, Ordering::Relaxed);
        Some((cur, n))
    }

    /// Commit `n` written bytes: advance the frontier and refresh activity.
    /// Returns the number of bytes newly credited against the group
    /// watermark (zero when a faster shadow already wrote them).
    pub fn commit(&self, n: u64) -> u64 {
        let _g = self.range_lock.lock().unwrap();
        let cur = self.current.load(Ordering::Relaxed);
        self.current.store(cur + n, Ordering::Release);
        self.window_bytes.fetch_add(n, Ordering::Relaxed);
        self.touch();
        self.counter.credit(cur, cur + n)
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&self) {
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        self.last_activity_ns.store(now_ns, Ordering::Release);
    }

    /// Duration since the last byte (or explicit touch) on this task.
    pub fn since_activity(&self) -> Duration {
        let now_ns = self.epoch.elapsed().as_nanos() as u64;
        let last = self.last_activity_ns.load(Ordering::Acquire);
        Duration::from_nanos(now_ns.saturating_sub(last))
    }

    /// Split off the right half of the remaining range for an idle worker.
    ///
    /// Never shrinks `stop_at` below the write frontier or below a reserved
    /// in-flight write; never grows it. The victim's remaining range and the
    /// stolen task stay disjoint and their union is unchanged.
    pub fn try_steal(&self, min_chunk_size: u64) -> StealOutcome {
        let _g = self.range_lock.lock().unwrap();
        let cur = self.current.load(Ordering::Relaxed);
        let stop = self.stop_at.load(Ordering::Relaxed);
        let remaining = stop.saturating_sub(cur);
        if remaining < 2 * min_chunk_size {
            return StealOutcome::NothingToSteal;
        }
        let half = align_down(remaining / 2);
        if half < min_chunk_size {
            return StealOutcome::NothingToSteal;
        }
        let new_stop = cur + half;
        if new_stop < self.reserved.load(Ordering::Relaxed) {
            return StealOutcome::NothingToSteal;
        }
        self.stop_at.store(new_stop, Ordering::Release);
        let mut stolen = Task::new(new_stop, stop - new_stop);
        stolen.retries = self.task.retries;
        StealOutcome::Stole(stolen)
    }

    /// The not-yet-written tail of this task, for re-pushing after a cancel
    /// or a transient failure. `None` when everything was written.
    pub fn unfinished_range(&self) -> Option<Task> {
        let cur = self.current_offset();
        let stop = self.stop_at();
        if cur >= stop {
            return None;
        }
        let mut t = Task::new(cur, stop - cur);
        t.origin = self.task.origin;
        t.retries = self.task.retries;
        Some(t)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Drain the rolling-window byte counter (called once per speed sample).
    pub fn take_window_bytes(&self) -> u64 {
        self.window_bytes.swap(0, Ordering::AcqRel)
    }

    pub fn update_speed(&self, sample_bps: f64) {
        self.speed.lock().unwrap().update(sample_bps);
    }

    /// Smoothed speed with silence decay applied.
    pub fn speed_bps(&self) -> f64 {
        self.speed.lock().unwrap().read(self.since_activity())
    }

    /// Byte frontier of the last durable checkpoint.
    pub fn last_synced(&self) -> u64 {
        self.last_synced.load(Ordering::Acquire)
    }

    pub fn mark_synced(&self, offset: u64) {
        self.last_synced.store(offset, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(task: Task) -> ActiveTask {
        ActiveTask::new(task, 0, Instant::now(), 0.3, Arc::new(ByteWatermark::new(task.offset)))
    }

    #[test]
    fn task_range_header() {
        let t = Task::new(0, 99);
        assert_eq!(t.range_header_value(), "bytes=0-98");
        let t = Task::new(42, 1);
        assert_eq!(t.range_header_value(), "bytes=42-42");
    }

    #[test]
    fn reserve_and_commit_advance_frontier() {
        let at = active(Task::new(0, 1000));
        let (off, n) = at.reserve(256).unwrap();
        assert_eq!((off, n), (0, 256));
        assert_eq!(at.commit(n), 256);
        assert_eq!(at.current_offset(), 256);
        let (off, n) = at.reserve(4096).unwrap();
        assert_eq!(off, 256);
        assert_eq!(n, 744);
        at.commit(n);
        assert!(at.reserve(1).is_none());
        assert!(at.is_finished());
    }

    #[test]
    fn steal_splits_aligned_half_and_preserves_union() {
        let at = active(Task::new(0, 16 * 1024 * 1024));
        // Advance a little so the split is not trivially at the midpoint.
        let (_, n) = at.reserve(1_000_000).unwrap();
        at.commit(n);

        let before_cur = at.current_offset();
        let before_stop = at.stop_at();
        match at.try_steal(2 * 1024 * 1024) {
            StealOutcome::Stole(t) => {
                assert_eq!(at.stop_at(), t.offset);
                assert_eq!(t.end(), before_stop);
                assert!(t.offset > before_cur);
                assert!((t.offset - before_cur) % CHUNK_ALIGN == 0);
                assert!(t.length >= 2 * 1024 * 1024);
            }
            StealOutcome::NothingToSteal => panic!("expected a steal"),
        }
    }

    #[test]
    fn steal_refuses_small_remainders() {
        let at = active(Task::new(0, 3 * 1024 * 1024));
        assert_eq!(
            at.try_steal(2 * 1024 * 1024),
            StealOutcome::NothingToSteal
        );
    }

    #[test]
    fn steal_never_cuts_reserved_write() {
        let at = active(Task::new(0, 8192 + 4096));
        // Reserve nearly the whole range, simulating a large in-flight write.
        let (_, n) = at.reserve(9000).unwrap();
        assert_eq!(at.try_steal(4096), StealOutcome::NothingToSteal);
        at.commit(n);
    }

    #[test]
    fn watermark_credits_each_byte_once() {
        let w = ByteWatermark::new(100);
        assert_eq!(w.credit(100, 200), 100);
        // A slower shadow re-writing the same bytes credits nothing.
        assert_eq!(w.credit(100, 150), 0);
        assert_eq!(w.credit(150, 250), 50);
        assert_eq!(w.high(), 250);
    }

    #[test]
    fn unfinished_range_carries_origin_and_retries() {
        let mut t = Task::new(4096, 8192);
        t.origin = 0;
        t.retries = 2;
        let at = ActiveTask::new(t, 3, Instant::now(), 0.3, Arc::new(ByteWatermark::new(0)));
        let (_, n) = at.reserve(1024).unwrap();
        at.commit(n);
        let rest = at.unfinished_range().unwrap();
        assert_eq!(rest.offset, 4096 + 1024);
        assert_eq!(rest.end(), 4096 + 8192);
        assert_eq!(rest.origin, 0);
        assert_eq!(rest.retries, 2);
    }

    #[test]
    fn speed_ema_decays_when_silent() {
        let mut ema = SpeedEma::new(0.5);
        ema.update(1000.0);
        assert_eq!(ema.read(Duration::from_millis(100)), 1000.0);
        let decayed = ema.read(Duration::from_secs(4));
        assert!(decayed < 1000.0 && decayed > 0.0);
    }
}
