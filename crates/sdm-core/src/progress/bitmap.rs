//! Two-bit chunk status bitmap.
//!
//! One cell per fixed-size chunk, packed four cells per byte little-endian:
//! chunk `i` occupies bits `2*(i % 4) .. 2*(i % 4) + 2` of byte `i / 4`.
//! Cells move only forward (Pending → Downloading → Completed); the packed
//! buffer serializes to the state store and drives progress visualization.

use crate::config::CHUNK_ALIGN;
use crate::task::Task;

/// Per-chunk download status. The numeric values are the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChunkStatus {
    Pending = 0,
    Downloading = 1,
    Completed = 2,
}

impl ChunkStatus {
    fn from_bits(b: u8) -> ChunkStatus {
        match b & 0b11 {
            0 => ChunkStatus::Pending,
            1 => ChunkStatus::Downloading,
            _ => ChunkStatus::Completed,
        }
    }
}

/// Packed chunk bitmap for one download.
#[derive(Debug, Clone, Default)]
pub struct ChunkBitmap {
    bytes: Vec<u8>,
    width: usize,
    chunk_size: u64,
    total_size: u64,
}

impl ChunkBitmap {
    /// Allocate `ceil(total_size / chunk_size)` pending cells.
    /// `chunk_size` must be a positive multiple of the 4 KiB alignment.
    pub fn new(total_size: u64, chunk_size: u64) -> anyhow::Result<Self> {
        if chunk_size == 0 || chunk_size % CHUNK_ALIGN != 0 {
            anyhow::bail!("chunk size {} is not a positive multiple of {}", chunk_size, CHUNK_ALIGN);
        }
        let width = total_size.div_ceil(chunk_size) as usize;
        Ok(ChunkBitmap {
            bytes: vec![0u8; width.div_ceil(4)],
            width,
            chunk_size,
            total_size,
        })
    }

    /// Rehydrate from a serialized buffer. Extra bytes are ignored; missing
    /// bytes read as pending.
    pub fn from_bytes(bytes: &[u8], total_size: u64, chunk_size: u64) -> anyhow::Result<Self> {
        let mut bm = ChunkBitmap::new(total_size, chunk_size)?;
        let copy = bytes.len().min(bm.bytes.len());
        bm.bytes[..copy].copy_from_slice(&bytes[..copy]);
        Ok(bm)
    }

    /// True when never initialized (zero chunks).
    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    /// Count of chunks.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Copy of the packed buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn get(&self, chunk: usize) -> ChunkStatus {
        if chunk >= self.width {
            return ChunkStatus::Pending;
        }
        let shift = 2 * (chunk % 4);
        ChunkStatus::from_bits(self.bytes[chunk / 4] >> shift)
    }

    /// Raise one cell; transitions are monotone so a completed chunk is
    /// never demoted.
    fn raise(&mut self, chunk: usize, status: ChunkStatus) {
        if chunk >= self.width || self.get(chunk) >= status {
            return;
        }
        let shift = 2 * (chunk % 4);
        let byte = &mut self.bytes[chunk / 4];
        *byte = (*byte & !(0b11 << shift)) | ((status as u8) << shift);
    }

    /// Exclusive end of `chunk` in bytes (the last chunk may be short).
    fn chunk_end(&self, chunk: usize) -> u64 {
        ((chunk as u64 + 1) * self.chunk_size).min(self.total_size)
    }

    /// Mark every chunk overlapping `[offset, offset + length)`.
    ///
    /// For `Completed`, only chunks fully covered by the range complete;
    /// boundary chunks that the range merely touches become `Downloading`.
    /// Offsets outside the file are clamped. Total: never fails.
    pub fn update_range(&mut self, offset: u64, length: u64, status: ChunkStatus) {
        if self.width == 0 || length == 0 || status == ChunkStatus::Pending {
            return;
        }
        let start = offset.min(self.total_size);
        let end = offset.saturating_add(length).min(self.total_size);
        if start >= end {
            return;
        }
        let first = (start / self.chunk_size) as usize;
        let last = ((end - 1) / self.chunk_size) as usize;
        for chunk in first..=last.min(self.width - 1) {
            let c_start = chunk as u64 * self.chunk_size;
            let c_end = self.chunk_end(chunk);
            let covered = start <= c_start && end >= c_end;
            match status {
                ChunkStatus::Completed if covered => self.raise(chunk, ChunkStatus::Completed),
                _ => self.raise(chunk, ChunkStatus::Downloading),
            }
        }
    }

    /// Rebuild the map from the set of not-yet-downloaded ranges (cold
    /// resume): chunks untouched by any remaining range are completed,
    /// chunks fully inside one range are pending, boundary chunks are
    /// downloading.
    pub fn recalculate(&mut self, remaining: &[Task]) {
        let mut cells = vec![ChunkStatus::Completed; self.width];
        for task in remaining {
            let start = task.offset.min(self.total_size);
            let end = task.end().min(self.total_size);
            if start >= end {
                continue;
            }
            let first = (start / self.chunk_size) as usize;
            let last = ((end - 1) / self.chunk_size) as usize;
            for chunk in first..=last.min(self.width.saturating_sub(1)) {
                let c_start = chunk as u64 * self.chunk_size;
                let c_end = self.chunk_end(chunk);
                let inside = start <= c_start && end >= c_end;
                let next = if inside {
                    ChunkStatus::Pending
                } else {
                    ChunkStatus::Downloading
                };
                if next < cells[chunk] {
                    cells[chunk] = next;
                }
            }
        }
        self.bytes = vec![0u8; self.width.div_ceil(4)];
        for (i, status) in cells.into_iter().enumerate() {
            self.raise(i, status);
        }
    }

    /// Byte ranges not yet fully written, as contiguous runs of
    /// not-completed chunks. Over-covers in-flight partial chunks, which is
    /// the safe direction for a crash checkpoint: re-downloading a partial
    /// chunk rewrites identical bytes.
    pub fn remaining_tasks(&self) -> Vec<Task> {
        let mut out: Vec<Task> = Vec::new();
        for chunk in 0..self.width {
            if self.get(chunk) == ChunkStatus::Completed {
                continue;
            }
            let start = chunk as u64 * self.chunk_size;
            let end = self.chunk_end(chunk);
            match out.last_mut() {
                Some(prev) if prev.end() == start => prev.length = end - prev.offset,
                _ => out.push(Task::new(start, end - start)),
            }
        }
        out
    }

    /// Sum of bytes in completed chunks.
    pub fn completed_bytes(&self) -> u64 {
        (0..self.width)
            .filter(|&c| self.get(c) == ChunkStatus::Completed)
            .map(|c| self.chunk_end(c) - c as u64 * self.chunk_size)
            .sum()
    }
}
