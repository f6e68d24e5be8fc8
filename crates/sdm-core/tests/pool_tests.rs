//! End-to-end worker pool tests: events, persistence, cold resume.

mod common;

use std::time::Duration;

use sdm_core::events::DownloadEvent;
use sdm_core::store::{DownloadStatus, StateDb};
use sdm_core::{DownloadConfig, RuntimeConfig, SdmConfig, WorkerPool};

use common::range_server::{self, patterned_body, RangeServerOptions};

fn pool_config() -> SdmConfig {
    SdmConfig {
        max_concurrent_downloads: 2,
        runtime: RuntimeConfig {
            max_connections_per_host: 3,
            min_chunk_size: 64 * 1024,
            worker_buffer_size: 32 * 1024,
            slow_worker_threshold: 0.0,
            ..RuntimeConfig::default()
        },
    }
}

fn download(url: &str, dir: &tempfile::TempDir) -> DownloadConfig {
    let mut cfg = DownloadConfig::new(url, dir.path());
    cfg.runtime = pool_config().runtime;
    cfg
}

/// Wait for a terminal-ish event for `id`, failing the test on error events.
async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<DownloadEvent>,
    id: &str,
    want: fn(&DownloadEvent) -> bool,
) -> DownloadEvent {
    let deadline = Duration::from_secs(30);
    tokio::time::timeout(deadline, async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.download_id() != id {
                continue;
            }
            if let DownloadEvent::Error { err, .. } = &event {
                panic!("download failed: {err}");
            }
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn download_lifecycle_events_and_persistence() {
    let body = patterned_body(700 * 1024);
    let url = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();
    let db = StateDb::open_memory().await.unwrap();
    let pool = WorkerPool::new(pool_config(), Some(db.clone()));
    let mut rx = pool.subscribe();

    let id = pool.add(download(&url, &dir)).await.unwrap();

    let started = wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Started { .. })).await;
    let DownloadEvent::Started { total, filename, .. } = started else {
        unreachable!()
    };
    assert_eq!(total, body.len() as u64);
    assert_eq!(filename, "file");

    let complete = wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Complete { .. })).await;
    let DownloadEvent::Complete { total, .. } = complete else {
        unreachable!()
    };
    assert_eq!(total, body.len() as u64);

    let written = std::fs::read(dir.path().join("file")).unwrap();
    assert_eq!(written, body);

    let entry = db.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
    assert_eq!(entry.downloaded, body.len() as u64);
    assert!(entry.completed_at.is_some());

    let snap = pool.get_status(&id).await.unwrap();
    assert_eq!(snap.status, DownloadStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_then_warm_resume_round_trip() {
    let body = patterned_body(2 * 1024 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            throttle_bps: 400 * 1024,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let db = StateDb::open_memory().await.unwrap();
    let pool = WorkerPool::new(pool_config(), Some(db.clone()));
    let mut rx = pool.subscribe();

    let id = pool.add(download(&url, &dir)).await.unwrap();
    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Started { .. })).await;
    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Progress { .. })).await;

    assert!(pool.pause(&id).await);
    let paused = wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Paused { .. })).await;
    let DownloadEvent::Paused { downloaded, .. } = paused else {
        unreachable!()
    };
    assert!(downloaded < body.len() as u64);

    // The store has the row, its counters, and the pending ranges.
    let state = db.load_state_by_id(&id).await.unwrap().unwrap();
    assert_eq!(state.entry.status, DownloadStatus::Paused);
    assert_eq!(state.entry.downloaded, downloaded);
    assert!(!state.tasks.is_empty());
    let left: u64 = state.tasks.iter().map(|t| t.length).sum();
    assert_eq!(downloaded + left, body.len() as u64);

    pool.resume(&id).await.unwrap();
    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Resumed { .. })).await;
    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Complete { .. })).await;

    let written = std::fs::read(dir.path().join("file")).unwrap();
    assert_eq!(written, body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_resume_in_fresh_pool_is_byte_identical() {
    let body = patterned_body(2 * 1024 * 1024);
    let url = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            throttle_bps: 400 * 1024,
            ..RangeServerOptions::default()
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");

    // First process: start, pause mid-flight, drop everything.
    let (id, dest_path) = {
        let db = StateDb::open_at(&db_path).await.unwrap();
        let pool = WorkerPool::new(pool_config(), Some(db.clone()));
        let mut rx = pool.subscribe();
        let id = pool.add(download(&url, &dir)).await.unwrap();
        wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Started { .. })).await;
        wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Progress { .. })).await;
        assert!(pool.pause(&id).await);
        wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Paused { .. })).await;
        let state = db.load_state_by_id(&id).await.unwrap().unwrap();
        assert!(!state.tasks.is_empty());
        db.close().await;
        (id, state.entry.dest_path)
    };

    // Second process: same id, resume from the store only.
    let db = StateDb::open_at(&db_path).await.unwrap();
    let pool = WorkerPool::new(pool_config(), Some(db.clone()));
    let mut rx = pool.subscribe();
    let mut cfg = download(&url, &dir);
    cfg.id = id.clone();
    cfg.is_resume = true;
    cfg.dest_path = Some(dest_path.clone().into());
    pool.add(cfg).await.unwrap();

    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Complete { .. })).await;
    let written = std::fs::read(&dest_path).unwrap();
    assert_eq!(written, body);

    let entry = db.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, DownloadStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_without_ranges_fails_over_to_mirror() {
    let body = patterned_body(10 * 64 * 1024);
    let primary = range_server::start_with_options(
        body.clone(),
        RangeServerOptions {
            support_ranges: false,
            ..RangeServerOptions::default()
        },
    );
    let mirror = range_server::start(body.clone());
    let dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(pool_config(), None);
    let mut rx = pool.subscribe();

    let cfg = download(&primary, &dir).with_mirrors(vec![mirror]);
    let id = pool.add(cfg).await.unwrap();

    let started = wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Started { .. })).await;
    let DownloadEvent::Started { total, .. } = started else {
        unreachable!()
    };
    assert_eq!(total, body.len() as u64);

    wait_for(&mut rx, &id, |e| matches!(e, DownloadEvent::Complete { .. })).await;
    let written = std::fs::read(dir.path().join("file")).unwrap();
    assert_eq!(written, body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_download_is_promoted_fifo() {
    let body = patterned_body(256 * 1024);
    let url_a = range_server::start(body.clone());
    let url_b = range_server::start(body.clone());
    let url_c = range_server::start(body.clone());
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();

    let cfg = SdmConfig {
        max_concurrent_downloads: 1,
        ..pool_config()
    };
    let pool = WorkerPool::new(cfg, None);
    let mut rx = pool.subscribe();

    let a = pool.add(download(&url_a, &dir_a)).await.unwrap();
    let b = pool.add(download(&url_b, &dir_b)).await.unwrap();
    let c = pool.add(download(&url_c, &dir_c)).await.unwrap();

    // b and c queue behind a, and start in add order.
    wait_for(&mut rx, &b, |e| matches!(e, DownloadEvent::Queued { .. })).await;
    wait_for(&mut rx, &c, |e| matches!(e, DownloadEvent::Queued { .. })).await;
    wait_for(&mut rx, &a, |e| matches!(e, DownloadEvent::Complete { .. })).await;

    let started_b = wait_for(&mut rx, &b, |e| matches!(e, DownloadEvent::Started { .. })).await;
    assert_eq!(started_b.download_id(), b);
    wait_for(&mut rx, &b, |e| matches!(e, DownloadEvent::Complete { .. })).await;
    wait_for(&mut rx, &c, |e| matches!(e, DownloadEvent::Complete { .. })).await;

    for (dir, _) in [(&dir_a, &a), (&dir_b, &b), (&dir_c, &c)] {
        let written = std::fs::read(dir.path().join("file")).unwrap();
        assert_eq!(written, body);
    }
}
