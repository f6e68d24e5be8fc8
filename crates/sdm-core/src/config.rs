use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Byte alignment for chunk sizing, steal split points, and bitmap chunks.
pub const CHUNK_ALIGN: u64 = 4096;

/// Immutable per-download tuning. Built from `SdmConfig` defaults at add time
/// and fixed for the lifetime of the download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum concurrent HTTP connections per host (clamped to 1..=64).
    pub max_connections_per_host: usize,
    /// User-Agent sent on every request.
    pub user_agent: String,
    /// Optional proxy URL handed to the transport.
    pub proxy: Option<String>,
    /// Download chunks in order using the minimum chunk size.
    pub sequential: bool,
    /// Minimum task length in bytes; must be a positive multiple of 4 KiB.
    pub min_chunk_size: u64,
    /// Per-worker read buffer size in bytes.
    pub worker_buffer_size: usize,
    /// Transient-failure budget per task before the download turns fatal.
    pub max_task_retries: u32,
    /// A worker slower than `threshold * mean` of its peers is preempted (0..1).
    pub slow_worker_threshold: f64,
    /// Workers younger than this are exempt from health checks.
    pub slow_worker_grace_ms: u64,
    /// No byte activity for this long cancels the worker.
    pub stall_timeout_ms: u64,
    /// Whether the tripled no-progress stall allowance also applies to
    /// retries of the same range, not just the first attempt.
    pub stall_no_progress_after_retry: bool,
    /// EMA smoothing factor for per-worker speed (0..1).
    pub speed_ema_alpha: f64,
    /// Optional per-worker receive-rate cap in bytes/sec (0 = uncapped).
    pub max_worker_rate_bps: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: 8,
            user_agent: format!("sdm/{}", env!("CARGO_PKG_VERSION")),
            proxy: None,
            sequential: false,
            min_chunk_size: 2 * 1024 * 1024,
            worker_buffer_size: 256 * 1024,
            max_task_retries: 5,
            slow_worker_threshold: 0.25,
            slow_worker_grace_ms: 5_000,
            stall_timeout_ms: 10_000,
            stall_no_progress_after_retry: true,
            speed_ema_alpha: 0.3,
            max_worker_rate_bps: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn slow_worker_grace(&self) -> Duration {
        Duration::from_millis(self.slow_worker_grace_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Clamp out-of-range fields instead of failing: connection count into
    /// 1..=64, ratios into 0..1, chunk size onto the 4 KiB alignment.
    pub fn sanitized(mut self) -> Self {
        self.max_connections_per_host = self.max_connections_per_host.clamp(1, 64);
        self.slow_worker_threshold = self.slow_worker_threshold.clamp(0.0, 1.0);
        self.speed_ema_alpha = self.speed_ema_alpha.clamp(0.01, 1.0);
        if self.min_chunk_size < CHUNK_ALIGN {
            self.min_chunk_size = CHUNK_ALIGN;
        }
        self.min_chunk_size -= self.min_chunk_size % CHUNK_ALIGN;
        if self.worker_buffer_size == 0 {
            self.worker_buffer_size = 64 * 1024;
        }
        self
    }
}

/// Engine configuration loaded from `~/.config/sdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdmConfig {
    /// Downloads allowed to run at once; the rest queue FIFO.
    pub max_concurrent_downloads: usize,
    /// Defaults applied to each new download.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Default for SdmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            runtime: RuntimeConfig::default(),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
