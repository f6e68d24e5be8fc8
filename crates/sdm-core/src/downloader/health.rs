//! Per-worker health controller.
//!
//! Every second: fold the rolling byte windows into each worker's speed
//! EMA, compute the fleet mean, then preempt workers that stalled or that
//! crawl far below their peers. A preempted worker's tail range goes back
//! on the queue (the worker itself re-pushes it when its fetch aborts).

use std::sync::Arc;
use std::time::Duration;

use super::DownloadCtx;

/// Session must be at least this old before its global speed substitutes
/// for a missing per-worker mean.
const GLOBAL_SPEED_MIN_SESSION: Duration = Duration::from_secs(5);

pub(super) fn run_health_check(ctx: &Arc<DownloadCtx>, dt: Duration) {
    let actives = ctx.active_snapshot();
    if actives.is_empty() {
        return;
    }

    // Phase 1: speed samples and the fleet mean.
    let dt_secs = dt.as_secs_f64().max(0.001);
    for active in &actives {
        let sample = active.take_window_bytes() as f64 / dt_secs;
        active.update_speed(sample);
    }
    let speeds: Vec<f64> = actives.iter().map(|a| a.speed_bps()).collect();
    let mut mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
    if speeds.iter().filter(|s| **s > 0.0).count() < 2 {
        let snap = ctx.progress.get_progress();
        if snap.session_elapsed >= GLOBAL_SPEED_MIN_SESSION {
            mean = snap.session_speed_bps();
        }
    }

    // Phase 2: per-worker guards.
    let only_active = actives.len() == 1;
    for active in &actives {
        if active.is_cancelled() {
            continue;
        }
        if active.started_at().elapsed() < ctx.cfg.slow_worker_grace() {
            continue;
        }

        // Stall guard: fires even when measured speed is zero. A worker
        // that never wrote a byte this attempt gets triple the allowance
        // (connection setup, slow first byte); the last worker standing
        // gets double on top.
        let mut timeout = ctx.cfg.stall_timeout();
        let never_progressed = !active.has_progressed();
        let relief_applies =
            active.task.retries == 0 || ctx.cfg.stall_no_progress_after_retry;
        if never_progressed && relief_applies {
            timeout *= 3;
        }
        if only_active {
            timeout *= 2;
        }
        if active.since_activity() >= timeout {
            tracing::debug!(
                id = %ctx.id,
                worker = active.worker_id,
                offset = active.current_offset(),
                "stalled worker preempted"
            );
            active.cancel();
            continue;
        }

        // Straggler guard.
        if mean > 0.0 && active.speed_bps() < ctx.cfg.slow_worker_threshold * mean {
            tracing::debug!(
                id = %ctx.id,
                worker = active.worker_id,
                speed = active.speed_bps(),
                mean,
                "slow worker preempted"
            );
            active.cancel();
        }
    }
}
