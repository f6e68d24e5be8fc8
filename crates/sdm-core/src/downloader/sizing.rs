//! Connection count and chunk planning.

use crate::config::{RuntimeConfig, CHUNK_ALIGN};
use crate::task::{align_down, Task};

/// Connection count for a download: bounded by the per-host limit, by the
/// mirror set, and by how many minimum-size chunks the file even has.
pub fn connection_count(total_size: u64, mirror_count: usize, cfg: &RuntimeConfig) -> usize {
    let per_host = cfg.max_connections_per_host.max(1);
    let by_mirrors = mirror_count.max(1) * per_host;
    let by_size = (total_size / cfg.min_chunk_size.max(1)) as usize;
    per_host.min(by_mirrors).min(by_size.max(1))
}

/// Chunk size for the bitmap and initial task layout.
///
/// Parallel mode: an even split across connections, aligned down to 4 KiB
/// and floored at the configured minimum. Sequential mode: the minimum.
pub fn chunk_size(total_size: u64, connections: usize, cfg: &RuntimeConfig) -> u64 {
    if cfg.sequential {
        return cfg.min_chunk_size;
    }
    let mut chunk = align_down(total_size / connections.max(1) as u64);
    chunk = chunk.max(cfg.min_chunk_size);
    if chunk == 0 {
        chunk = CHUNK_ALIGN;
    }
    chunk
}

/// Generate tasks left to right at multiples of `chunk`; the last task takes
/// the remainder so lengths sum exactly to `total_size`. Zero-size files get
/// no tasks at all.
pub fn plan_tasks(total_size: u64, chunk: u64) -> Vec<Task> {
    if total_size == 0 || chunk == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(total_size.div_ceil(chunk) as usize);
    let mut offset = 0u64;
    while offset < total_size {
        let length = chunk.min(total_size - offset);
        out.push(Task::new(offset, length));
        offset += length;
    }
    out
}

/// Merge overlapping or adjacent ranges into a minimal disjoint set,
/// ordered by offset. End-game shadows can leave duplicated ranges behind
/// on pause; persistence wants their union.
pub fn coalesce(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|t| t.offset);
    let mut out: Vec<Task> = Vec::with_capacity(tasks.len());
    for task in tasks {
        if task.length == 0 {
            continue;
        }
        match out.last_mut() {
            Some(prev) if task.offset <= prev.end() => {
                let end = prev.end().max(task.end());
                prev.length = end - prev.offset;
            }
            _ => out.push(Task::new(task.offset, task.length)),
        }
    }
    out
}
