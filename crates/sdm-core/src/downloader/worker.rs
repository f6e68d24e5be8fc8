//! Worker protocol: drain the queue, fetch ranges, retry, hand back tails.

use std::sync::Arc;
use std::time::Duration;

use crate::error::DownloadError;
use crate::retry::ErrorKind;
use crate::task::{ActiveTask, Task};

use super::endgame;
use super::fetch::{fetch_range, FetchEnd, FetchError};
use super::DownloadCtx;

/// Sleep quantum while backing off, so cancellation stays responsive.
const BACKOFF_SLICE: Duration = Duration::from_millis(100);

pub(super) fn worker_loop(ctx: Arc<DownloadCtx>, worker_id: usize) {
    ctx.progress.worker_started();
    tracing::debug!(id = %ctx.id, worker = worker_id, "worker started");
    loop {
        if ctx.stopping() {
            break;
        }
        let Some(task) = ctx.queue.pop() else {
            break;
        };
        if ctx.stopping() {
            // Hand the task back for pause persistence.
            ctx.queue.push(task);
            ctx.queue.task_done();
            break;
        }
        run_task(&ctx, worker_id, task);
    }
    ctx.progress.worker_stopped();
    tracing::debug!(id = %ctx.id, worker = worker_id, "worker exited");
}

/// Fetch one task to the end, retrying transient failures in place.
/// Releases the task exactly once on every path out.
fn run_task(ctx: &Arc<DownloadCtx>, worker_id: usize, mut task: Task) {
    loop {
        let counter = ctx.counter_for(&task);
        if counter.high() >= task.end() {
            // A shadow group member already finished this range while the
            // duplicate sat in the queue.
            ctx.queue.task_done();
            return;
        }

        let Some(lease) = ctx.mirrors.acquire() else {
            if wait_for_mirror(ctx, &mut task) {
                continue;
            }
            if ctx.stopping() {
                // Keep the range for pause persistence.
                ctx.queue.push(task);
            }
            ctx.queue.task_done();
            return;
        };

        let active = Arc::new(ActiveTask::new(
            task,
            worker_id,
            ctx.epoch,
            ctx.cfg.speed_ema_alpha,
            counter,
        ));
        ctx.register(&active);
        let result = fetch_range(ctx, &active, &lease.url, ctx.ranged);
        ctx.unregister(&active);

        match result {
            Ok(FetchEnd::Complete) => {
                endgame::clean_up_shadows(ctx, active.task.origin, worker_id);
                drop(lease);
                ctx.queue.task_done();
                return;
            }
            Ok(FetchEnd::Cancelled) => {
                drop(lease);
                handle_cancelled(ctx, &active);
                ctx.queue.task_done();
                return;
            }
            Err(e) => {
                demote_mirror_if_warranted(ctx, &lease.url, &e);
                drop(lease);
                match next_attempt(ctx, &active, &e) {
                    Some(next) => task = next,
                    None => {
                        ctx.queue.task_done();
                        return;
                    }
                }
            }
        }
    }
}

/// Preempted mid-fetch. A pause keeps the tail for persistence via the
/// queue; a health preemption re-queues it for another worker; a losing
/// shadow whose range the winner already covered is simply dropped.
fn handle_cancelled(ctx: &Arc<DownloadCtx>, active: &ActiveTask) {
    let Some(rest) = active.unfinished_range() else {
        return;
    };
    if !ctx.stopping() && active.counter().high() >= active.stop_at() {
        return;
    }
    ctx.queue.push(rest);
}

/// Hosts that refuse ranges, answer >= 400, or fail at the TCP level are
/// taken out of rotation (the background re-probe may bring them back).
fn demote_mirror_if_warranted(ctx: &Arc<DownloadCtx>, url: &str, e: &FetchError) {
    let demote = matches!(
        e.kind(),
        ErrorKind::RangeUnsupported | ErrorKind::Connection | ErrorKind::Other
    ) || matches!(e, FetchError::Http(_));
    if demote && !matches!(e, FetchError::Storage(_)) {
        ctx.mirrors.mark_failed(url, e.to_string());
    }
}

/// Decide what happens after a failed attempt: the trimmed task to retry
/// (after backoff), or `None` when the worker is done with it (fatal set or
/// stop requested).
fn next_attempt(ctx: &Arc<DownloadCtx>, active: &ActiveTask, e: &FetchError) -> Option<Task> {
    if e.is_fatal() {
        ctx.set_fatal(match e {
            FetchError::ByteMismatch { requested, got } => DownloadError::ByteMismatch {
                requested: format!("offset {requested}"),
                got: format!("offset {got}"),
            },
            other => DownloadError::Transport(other.to_string()),
        });
        return None;
    }

    let mut task = if ctx.ranged {
        match active.unfinished_range() {
            Some(rest) => rest,
            None => return None,
        }
    } else {
        // Without range support the server restarts at byte zero, so the
        // attempt must too; the group watermark keeps the count exact.
        active.task
    };
    task.retries += 1;

    if task.retries > ctx.cfg.max_task_retries {
        ctx.set_fatal(DownloadError::RetriesExhausted {
            attempts: task.retries,
            last: e.to_string(),
        });
        return None;
    }

    if e.kind() == ErrorKind::RangeUnsupported {
        if ctx.mirrors.exhausted() {
            ctx.set_fatal(DownloadError::RangeUnsupported);
            return None;
        }
        // Another mirror may honor ranges; try it right away.
        return Some(task);
    }

    tracing::debug!(
        id = %ctx.id,
        offset = task.offset,
        attempt = task.retries,
        error = %e,
        "task attempt failed, backing off"
    );
    if !sleep_backoff(ctx, ctx.retry_policy.backoff(task.retries)) {
        ctx.queue.push(task);
        return None;
    }
    Some(task)
}

/// No leasable mirror right now. Saturated hosts clear quickly; a fully
/// demoted mirror set burns a retry per wait so a dead swarm ends the
/// download instead of spinning forever.
fn wait_for_mirror(ctx: &Arc<DownloadCtx>, task: &mut Task) -> bool {
    if ctx.mirrors.exhausted() {
        task.retries += 1;
        if task.retries > ctx.cfg.max_task_retries {
            ctx.set_fatal(DownloadError::RetriesExhausted {
                attempts: task.retries,
                last: "no active mirror".to_string(),
            });
            return false;
        }
        return sleep_backoff(ctx, ctx.retry_policy.backoff(task.retries));
    }
    sleep_backoff(ctx, BACKOFF_SLICE)
}

/// Sleep in small slices; false when the download stopped meanwhile.
fn sleep_backoff(ctx: &Arc<DownloadCtx>, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if ctx.stopping() {
            return false;
        }
        let slice = remaining.min(BACKOFF_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !ctx.stopping()
}
