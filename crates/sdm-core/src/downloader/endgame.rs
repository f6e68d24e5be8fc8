//! End-game shadowing: race duplicates of the last in-flight ranges.
//!
//! Near the tail of a download the queue runs dry while a few ranges are
//! still in flight, possibly on the slowest connections. Idle workers get
//! duplicate tasks covering those live ranges; the group watermark keeps
//! the byte accounting exact, and the first member to finish cancels the
//! rest of its group.

use std::sync::Arc;

use crate::task::{ActiveTask, Task};

use super::{DownloadCtx, ENDGAME_QUEUE_THRESHOLD, SHADOWS_PER_TASK};

/// True when another live task shares this task's group.
pub(super) fn in_shadow_group(ctx: &Arc<DownloadCtx>, active: &ActiveTask) -> bool {
    group_size(ctx, active.task.origin) > 1
}

fn group_size(ctx: &Arc<DownloadCtx>, origin: u64) -> usize {
    ctx.active_snapshot()
        .iter()
        .filter(|a| a.task.origin == origin && !a.is_cancelled())
        .count()
}

/// Push shadow duplicates when the queue is nearly dry and workers idle.
///
/// Each under-populated group gets at most one duplicate per pass, covering
/// the victim's remaining range at this instant; duplication stops once the
/// group has `SHADOWS_PER_TASK` members or no workers are idle.
pub(super) fn maybe_shadow(ctx: &Arc<DownloadCtx>) {
    if ctx.queue.len() >= ENDGAME_QUEUE_THRESHOLD {
        return;
    }
    let mut budget = ctx.queue.idle_workers();
    if budget == 0 {
        return;
    }

    let mut actives = ctx.active_snapshot();
    actives.retain(|a| !a.is_cancelled() && a.remaining() > 0);
    // Shadow the slowest tails first: largest remaining range.
    actives.sort_by_key(|a| std::cmp::Reverse(a.remaining()));

    for victim in actives {
        if budget == 0 {
            break;
        }
        let origin = victim.task.origin;
        if group_size(ctx, origin) >= SHADOWS_PER_TASK {
            continue;
        }
        if !ctx.shadowed.lock().unwrap().insert(origin) {
            // Already has a shadow queued or racing.
            continue;
        }
        let offset = victim.current_offset();
        let stop = victim.stop_at();
        if offset >= stop {
            ctx.shadowed.lock().unwrap().remove(&origin);
            continue;
        }
        let mut shadow = Task::new(offset, stop - offset);
        shadow.origin = origin;
        tracing::debug!(
            id = %ctx.id,
            victim = victim.worker_id,
            offset,
            length = shadow.length,
            "pushing end-game shadow"
        );
        ctx.queue.push(shadow);
        budget -= 1;
    }
}

/// A group member finished its range: cancel every other live member.
pub(super) fn clean_up_shadows(ctx: &Arc<DownloadCtx>, origin: u64, winner_worker: usize) {
    ctx.shadowed.lock().unwrap().remove(&origin);
    for active in ctx.active_snapshot() {
        if active.task.origin == origin && active.worker_id != winner_worker {
            tracing::debug!(
                id = %ctx.id,
                loser = active.worker_id,
                winner = winner_worker,
                origin,
                "cancelling losing shadow"
            );
            active.cancel();
        }
    }
}
