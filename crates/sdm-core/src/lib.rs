//! sdm-core: multi-connection segmented HTTP/HTTPS download engine.
//!
//! Turns one URL (or a set of mirrors) for a range-capable resource into
//! many concurrent byte-range fetches against a single preallocated file,
//! with work stealing, end-game shadow racing, per-worker health policing,
//! and byte-accurate pause/resume persisted in SQLite.

pub mod config;
pub mod logging;

pub mod downloader;
pub mod error;
pub mod events;
pub mod probe;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod task;

pub use config::{RuntimeConfig, SdmConfig};
pub use error::DownloadError;
pub use events::{DownloadEvent, EventBus};
pub use scheduler::{DownloadConfig, RequestContext, WorkerPool};
pub use store::StateDb;
