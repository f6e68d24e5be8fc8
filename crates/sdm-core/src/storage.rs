//! Destination-file lifecycle.
//!
//! The in-progress file lives at `<final-path>.sdm`, preallocated sparse to
//! the full size. Workers share one handle and write disjoint ranges with
//! positional writes; completion atomically renames onto the final path.

use anyhow::{Context, Result};
use std::fs::File;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffix appended to the final path while the download is in flight.
pub const INCOMPLETE_SUFFIX: &str = ".sdm";

/// Path for the in-progress file: `file.iso` → `file.iso.sdm`.
pub fn incomplete_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(INCOMPLETE_SUFFIX);
    PathBuf::from(o)
}

/// Shared handle to the in-progress download file. Clone freely; every
/// `write_at` is an independent pwrite, safe from any thread.
#[derive(Clone)]
pub struct DestFile {
    file: Arc<File>,
    path: PathBuf,
}

impl DestFile {
    /// Create the in-progress file and preallocate it sparse to `total_size`.
    /// Truncates any stale file at the same path.
    pub fn create(incomplete: &Path, total_size: u64) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(incomplete)
            .with_context(|| format!("create incomplete file: {}", incomplete.display()))?;
        let dest = DestFile {
            file: Arc::new(file),
            path: incomplete.to_path_buf(),
        };
        dest.preallocate(total_size)?;
        Ok(dest)
    }

    /// Open an existing in-progress file for resume; never truncates.
    pub fn open_existing(incomplete: &Path) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(incomplete)
            .with_context(|| format!("open incomplete file: {}", incomplete.display()))?;
        Ok(DestFile {
            file: Arc::new(file),
            path: incomplete.to_path_buf(),
        })
    }

    /// Preallocate `size` bytes. On Unix tries `posix_fallocate` for real
    /// block allocation; falls back to `set_len` on failure or non-Unix.
    fn preallocate(&self, size: u64) -> Result<()> {
        #[cfg(unix)]
        {
            let fd = self.file.as_raw_fd();
            let r = unsafe { libc::posix_fallocate(fd, 0, size as libc::off_t) };
            if r == 0 {
                return Ok(());
            }
            tracing::debug!(errno = r, "posix_fallocate failed, falling back to set_len");
        }
        self.file.set_len(size).context("preallocate file")?;
        Ok(())
    }

    /// Write `data` at `offset` without touching the file cursor.
    #[cfg(unix)]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let n = self
                .file
                .write_at(&data[written..], offset + written as u64)
                .context("positional write failed")?;
            if n == 0 {
                anyhow::bail!("short write at offset {}", offset + written as u64);
            }
            written += n;
        }
        Ok(())
    }

    /// Non-Unix fallback: seek + write on a cloned handle. Not used on the
    /// supported platform.
    #[cfg(not(unix))]
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = (*self.file).try_clone()?;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(data)?;
        Ok(())
    }

    /// Flush file data to disk. Call before `finalize` for durability.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().context("sync failed")?;
        Ok(())
    }

    /// Path of the in-progress file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically rename onto `final_path`. The handle stays valid (same
    /// inode); callers stop writing once the download is complete.
    pub fn finalize(&self, final_path: &Path) -> Result<()> {
        std::fs::rename(&self.path, final_path).with_context(|| {
            format!("rename {} to {}", self.path.display(), final_path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn incomplete_path_appends_suffix() {
        let p = incomplete_path(Path::new("file.iso"));
        assert_eq!(p.to_string_lossy(), "file.iso.sdm");
        let p2 = incomplete_path(Path::new("/tmp/archive.zip"));
        assert_eq!(p2.to_string_lossy(), "/tmp/archive.zip.sdm");
    }

    #[test]
    fn create_write_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("output.bin");
        let ip = incomplete_path(&final_path);

        let dest = DestFile::create(&ip, 100).unwrap();
        dest.write_at(0, b"hello").unwrap();
        dest.write_at(50, b"world").unwrap();
        dest.write_at(95, b"xy").unwrap();
        dest.sync().unwrap();
        dest.finalize(&final_path).unwrap();

        assert!(!ip.exists());
        assert!(final_path.exists());
        let mut f = std::fs::File::open(&final_path).unwrap();
        let mut buf = vec![0u8; 100];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[0..5], b"hello");
        assert_eq!(&buf[50..55], b"world");
        assert_eq!(&buf[95..97], b"xy");
    }

    #[test]
    fn reopen_preserves_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let ip = dir.path().join("out.bin.sdm");
        let dest = DestFile::create(&ip, 20).unwrap();
        dest.write_at(4, b"abcd").unwrap();
        dest.sync().unwrap();
        drop(dest);

        let dest = DestFile::open_existing(&ip).unwrap();
        dest.write_at(10, b"efgh").unwrap();
        dest.sync().unwrap();
        let mut f = std::fs::File::open(&ip).unwrap();
        let mut buf = vec![0u8; 20];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[4..8], b"abcd");
        assert_eq!(&buf[10..14], b"efgh");
    }

    #[test]
    fn concurrent_clones_write_disjoint_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let ip = dir.path().join("c.sdm");
        let dest = DestFile::create(&ip, 16).unwrap();
        let d2 = dest.clone();
        let h = std::thread::spawn(move || d2.write_at(8, b"BBBBBBBB").unwrap());
        dest.write_at(0, b"AAAAAAAA").unwrap();
        h.join().unwrap();
        let mut f = std::fs::File::open(&ip).unwrap();
        let mut buf = vec![0u8; 16];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..8], b"AAAAAAAA");
        assert_eq!(&buf[8..], b"BBBBBBBB");
    }

    #[test]
    fn zero_length_file() {
        let dir = tempfile::tempdir().unwrap();
        let final_path = dir.path().join("empty.bin");
        let ip = incomplete_path(&final_path);
        let dest = DestFile::create(&ip, 0).unwrap();
        dest.finalize(&final_path).unwrap();
        assert_eq!(std::fs::metadata(&final_path).unwrap().len(), 0);
    }
}
