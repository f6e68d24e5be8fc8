//! Types used by the persistent state store.

use sha2::{Digest, Sha256};

use crate::task::Task;

/// Lifecycle state of a download, stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Pausing,
    Paused,
    Completed,
    Error,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Pausing => "pausing",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => DownloadStatus::Queued,
            "downloading" => DownloadStatus::Downloading,
            "pausing" => DownloadStatus::Pausing,
            "paused" => DownloadStatus::Paused,
            "completed" => DownloadStatus::Completed,
            _ => DownloadStatus::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Error)
    }
}

/// One row of the master download list.
#[derive(Debug, Clone)]
pub struct DownloadEntry {
    pub id: String,
    pub url: String,
    pub dest_path: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded: u64,
    /// Unix seconds; set on completion.
    pub completed_at: Option<i64>,
    /// Wall time of the whole download in milliseconds.
    pub time_taken_ms: i64,
    /// First 8 bytes of SHA-256(url), hex. Fast duplicate lookup only,
    /// never an identity.
    pub url_hash: String,
    pub mirrors: Vec<String>,
}

/// Full persisted record: entry plus everything cold resume needs.
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub entry: DownloadEntry,
    pub created_at: i64,
    pub paused_at: Option<i64>,
    /// Total elapsed across sessions in nanoseconds. Stored in the database
    /// as milliseconds and widened back on load.
    pub elapsed_ns: u64,
    pub chunk_bitmap: Vec<u8>,
    pub actual_chunk_size: u64,
    /// Byte ranges still to fetch. Disjoint; empty once completed.
    pub tasks: Vec<Task>,
}

/// First 8 bytes (16 hex chars) of SHA-256 over the URL.
pub fn url_hash(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            DownloadStatus::Queued,
            DownloadStatus::Downloading,
            DownloadStatus::Pausing,
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Error,
        ] {
            assert_eq!(DownloadStatus::from_str(s.as_str()), s);
        }
        assert_eq!(DownloadStatus::from_str("garbage"), DownloadStatus::Error);
    }

    #[test]
    fn url_hash_is_16_hex_chars() {
        let h = url_hash("https://example.com/file.iso");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        // Stable across calls, distinct across URLs.
        assert_eq!(h, url_hash("https://example.com/file.iso"));
        assert_ne!(h, url_hash("https://example.com/other.iso"));
    }
}
