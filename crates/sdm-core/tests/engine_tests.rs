//! Coordinator-level tests against the local range server.

mod common;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sdm_core::downloader::{DownloadOutcome, Downloader, SavedProgress, TransferPlan};
use sdm_core::events::EventBus;
use sdm_core::progress::{ChunkBitmap, MirrorStatus, ProgressState};
use sdm_core::RuntimeConfig;

use common::range_server::{self, patterned_body, RangeServerOptions};

fn test_runtime() -> RuntimeConfig {
    RuntimeConfig {
        max_connections_per_host: 4,
        min_chunk_size: 64 * 1024,
        worker_buffer_size: 32 * 1024,
        max_task_retries: 4,
        slow_worker_grace_ms: 5_000,
        stall_timeout_ms: 10_000,
        // Never preempt on relative speed in tests; localhost jitter lies.
        slow_worker_threshold: 0.0,
        ..RuntimeConfig::default()
    }
}

fn engine(
    dir: &tempfile::TempDir,
    urls: &[String],
    cfg: RuntimeConfig,
) -> (Downloader, Arc<ProgressState>, PathBuf) {
    let progress = Arc::new(ProgressState::new("test-dl"));
    let mirrors: Vec<MirrorStatus> = urls.iter().map(MirrorStatus::active).collect();
    progress.set_mirrors(&mirrors);
    let dest_path = dir.path().join("out.bin");
    let downloader = Downloader {
        id: "test-dl".to_string(),
        cfg,
        progress: Arc::clone(&progress),
        events: EventBus::new(),
        headers: HashMap::new(),
        dest_path: dest_path.clone(),
    };
    (downloader, progress, dest_path)
}

fn read_file(path: &PathBuf) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[test]
fn even_split_download_is_byte_exact() {
    let body = patterned_body(1024 * 1024 + 123);
    let url = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();
    let (dl, progress, dest) = engine(&dir, &[url], test_runtime());

    let plan = TransferPlan {
        total_size: body.len() as u64,
        range_supported: true,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));

    assert_eq!(read_file(&dest), body);
    let snap = progress.get_progress();
    assert_eq!(snap.downloaded, body.len() as u64);
    assert_eq!(snap.total_size, body.len() as u64);
    assert!(progress.is_done());

    // Every chunk ends up completed.
    let (bytes, width) = progress.get_bitmap();
    assert!(width > 0);
    let bm = ChunkBitmap::from_bytes(&bytes, body.len() as u64, progress.chunk_size()).unwrap();
    assert_eq!(bm.completed_bytes(), body.len() as u64);

    // The incomplete file is gone after the atomic rename.
    assert!(!sdm_core::storage::incomplete_path(&dest).exists());
}

#[test]
fn zero_size_resource_completes_immediately() {
    let url = range_server::start(Vec::new());
    let dir = tempfile::tempdir().unwrap();
    let (dl, progress, dest) = engine(&dir, &[url], test_runtime());

    let plan = TransferPlan {
        total_size: 0,
        range_supported: true,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 0);
    assert!(progress.is_done());
}

#[test]
fn range_unsupported_uses_single_connection_path() {
    let body = patterned_body(300 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            support_ranges: false,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let (dl, progress, dest) = engine(&dir, &[url], test_runtime());

    let plan = TransferPlan {
        total_size: body.len() as u64,
        range_supported: false,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(read_file(&dest), body);
    assert_eq!(progress.downloaded(), body.len() as u64);
}

#[test]
fn throttled_transfer_still_completes_exactly() {
    let body = patterned_body(768 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            throttle_bps: 512 * 1024,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_runtime();
    cfg.max_connections_per_host = 3;
    let (dl, progress, dest) = engine(&dir, &[url], cfg);

    let plan = TransferPlan {
        total_size: body.len() as u64,
        range_supported: true,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(read_file(&dest), body);
    assert_eq!(progress.downloaded(), body.len() as u64);
}

#[test]
fn pause_persists_exact_remainder_and_resume_completes() {
    let body = patterned_body(2 * 1024 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            throttle_bps: 400 * 1024,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let (dl, progress, dest) = engine(&dir, &[url.clone()], test_runtime());
    let total = body.len() as u64;

    let plan = TransferPlan {
        total_size: total,
        range_supported: true,
        saved: None,
    };
    let progress2 = Arc::clone(&progress);
    let handle = std::thread::spawn(move || dl.run(&plan));
    std::thread::sleep(Duration::from_millis(600));
    progress2.pause();
    let outcome = handle.join().unwrap().unwrap();

    let remaining = match outcome {
        DownloadOutcome::Paused { remaining } => remaining,
        other => panic!("expected pause, got {other:?}"),
    };
    assert!(!remaining.is_empty(), "paused mid-flight must leave work");
    let left: u64 = remaining.iter().map(|t| t.length).sum();
    let downloaded = progress.downloaded();
    assert_eq!(
        downloaded + left,
        total,
        "written + remaining must cover the file exactly"
    );
    // Ranges are disjoint and ordered.
    for pair in remaining.windows(2) {
        assert!(pair[0].offset + pair[0].length <= pair[1].offset);
    }

    // Resume with the persisted ranges; bytes already on disk stay put.
    let saved = SavedProgress {
        tasks: remaining,
        chunk_size: progress.chunk_size(),
        bitmap: progress.get_bitmap().0,
    };
    progress.set_pausing(false);
    assert!(progress.resume());
    let dl2 = Downloader {
        id: "test-dl".to_string(),
        cfg: test_runtime(),
        progress: Arc::clone(&progress),
        events: EventBus::new(),
        headers: HashMap::new(),
        dest_path: dest.clone(),
    };
    let plan2 = TransferPlan {
        total_size: total,
        range_supported: true,
        saved: Some(saved),
    };
    let outcome = dl2.run(&plan2).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(read_file(&dest), body);
    assert_eq!(progress.downloaded(), total);
}

#[test]
fn mirror_failover_mid_download() {
    let body = patterned_body(1024 * 1024);
    // Primary dies on its first requests; the mirror stays healthy.
    let flaky = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            fail_first: 3,
            ..RangeServerOptions::default()
        },
    );
    let healthy = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_runtime();
    cfg.max_connections_per_host = 2;
    let (dl, progress, dest) = engine(&dir, &[flaky, healthy], cfg);

    let plan = TransferPlan {
        total_size: body.len() as u64,
        range_supported: true,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(read_file(&dest), body);
    assert_eq!(progress.downloaded(), body.len() as u64);
}

#[test]
fn leading_server_errors_are_retried() {
    let body = patterned_body(512 * 1024);
    let primary = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            fail_first: 2,
            ..RangeServerOptions::default()
        },
    );
    // A second mirror keeps the pool alive while the primary recovers.
    let mirror = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_runtime();
    cfg.max_connections_per_host = 2;
    let (dl, _, dest) = engine(&dir, &[primary, mirror], cfg);

    let plan = TransferPlan {
        total_size: body.len() as u64,
        range_supported: true,
        saved: None,
    };
    let outcome = dl.run(&plan).unwrap();
    assert!(matches!(outcome, DownloadOutcome::Completed));
    assert_eq!(read_file(&dest), body);
}
