//! Work stealing for idle connections.

use std::sync::Arc;

use crate::task::StealOutcome;

use super::{endgame, DownloadCtx};

/// When the queue is dry and workers sit idle, split the fattest remaining
/// ranges in half and queue the tails. Tasks already racing shadows are
/// left alone. Returns how many tasks were created.
pub(super) fn steal_for_idle(ctx: &Arc<DownloadCtx>) -> usize {
    if !ctx.queue.is_empty() {
        return 0;
    }
    let idle = ctx.queue.idle_workers();
    if idle == 0 {
        return 0;
    }

    let mut candidates = ctx.active_snapshot();
    candidates.retain(|a| !a.is_cancelled() && !endgame::in_shadow_group(ctx, a));
    // Largest remaining range first.
    candidates.sort_by_key(|a| std::cmp::Reverse(a.remaining()));

    let mut stolen = 0usize;
    for victim in candidates {
        if stolen >= idle {
            break;
        }
        match victim.try_steal(ctx.cfg.min_chunk_size) {
            StealOutcome::Stole(task) => {
                tracing::debug!(
                    id = %ctx.id,
                    victim = victim.worker_id,
                    offset = task.offset,
                    length = task.length,
                    "stole tail range for idle worker"
                );
                ctx.queue.push(task);
                stolen += 1;
            }
            StealOutcome::NothingToSteal => {}
        }
    }
    stolen
}
