//! Per-download configuration and pool-side bookkeeping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::progress::ProgressState;
use crate::store::DownloadStatus;
use crate::task::Task;

/// Caller-supplied context for one add request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Extra HTTP headers sent on every request of this download.
    pub headers: HashMap<String, String>,
    /// Caller-controlled cancellation; behaves like delete when flipped.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Everything needed to start (or resume) one download.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// 128-bit UUID, lowercase hex with dashes.
    pub id: String,
    /// Primary URL.
    pub url: String,
    /// Ordered mirror candidates, primary included.
    pub mirrors: Vec<String>,
    pub output_dir: PathBuf,
    /// Preferred filename; wins over everything the probe suggests.
    pub filename_hint: Option<String>,
    /// Full destination path; set on resume so the same file is reused.
    pub dest_path: Option<PathBuf>,
    pub is_resume: bool,
    pub request: RequestContext,
    pub runtime: RuntimeConfig,
}

impl DownloadConfig {
    pub fn new(url: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        DownloadConfig {
            id: uuid::Uuid::new_v4().to_string(),
            mirrors: vec![url.clone()],
            url,
            output_dir: output_dir.into(),
            filename_hint: None,
            dest_path: None,
            is_resume: false,
            request: RequestContext::default(),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn with_mirrors(mut self, mirrors: Vec<String>) -> Self {
        let mut all = vec![self.url.clone()];
        all.extend(mirrors.into_iter().filter(|m| *m != self.url));
        self.mirrors = all;
        self
    }

    /// Best-effort filename before the probe has run.
    pub fn provisional_filename(&self) -> String {
        if let Some(hint) = &self.filename_hint {
            if !hint.is_empty() {
                return hint.clone();
            }
        }
        if let Some(dest) = &self.dest_path {
            if let Some(name) = dest.file_name() {
                return name.to_string_lossy().into_owned();
            }
        }
        crate::probe::filename::from_url_path(&self.url)
            .unwrap_or_else(|| crate::probe::filename::synthesized(&self.id))
    }
}

/// Pool-side record of one download.
pub(super) struct DownloadHandle {
    pub config: DownloadConfig,
    pub progress: Arc<ProgressState>,
    pub status: DownloadStatus,
    /// Resolved after the probe.
    pub filename: String,
    pub dest_path: Option<PathBuf>,
    /// Warm-resume data captured at pause.
    pub remaining: Vec<Task>,
    pub chunk_size: u64,
    pub bitmap: Vec<u8>,
    /// Emit `download-started` (admission) rather than nothing (resume).
    pub announce_started: bool,
    pub join: Option<tokio::task::JoinHandle<()>>,
}

impl DownloadHandle {
    pub fn new(config: DownloadConfig) -> Self {
        let progress = Arc::new(ProgressState::new(config.id.clone()));
        DownloadHandle {
            filename: config.provisional_filename(),
            dest_path: config.dest_path.clone(),
            progress,
            config,
            status: DownloadStatus::Queued,
            remaining: Vec::new(),
            chunk_size: 0,
            bitmap: Vec::new(),
            announce_started: false,
            join: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Downloading | DownloadStatus::Pausing
        )
    }
}

/// One-row status view for UIs.
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    pub id: String,
    pub url: String,
    pub filename: String,
    pub status: DownloadStatus,
    pub total_size: u64,
    pub downloaded: u64,
    pub speed_bps: f64,
    pub elapsed_ns: u64,
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_id_is_lowercase_hyphenated_uuid() {
        let cfg = DownloadConfig::new("https://example.com/f.iso", "/tmp");
        assert_eq!(cfg.id.len(), 36);
        assert_eq!(cfg.id.matches('-').count(), 4);
        assert!(cfg.id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn mirrors_keep_primary_first_and_dedup() {
        let cfg = DownloadConfig::new("https://a/f", "/tmp").with_mirrors(vec![
            "https://b/f".to_string(),
            "https://a/f".to_string(),
            "https://c/f".to_string(),
        ]);
        assert_eq!(cfg.mirrors, vec!["https://a/f", "https://b/f", "https://c/f"]);
    }

    #[test]
    fn provisional_filename_order() {
        let mut cfg = DownloadConfig::new("https://example.com/pub/disk.img", "/tmp");
        assert_eq!(cfg.provisional_filename(), "disk.img");
        cfg.dest_path = Some(PathBuf::from("/data/renamed.img"));
        assert_eq!(cfg.provisional_filename(), "renamed.img");
        cfg.filename_hint = Some("hinted.img".to_string());
        assert_eq!(cfg.provisional_filename(), "hinted.img");
    }
}
