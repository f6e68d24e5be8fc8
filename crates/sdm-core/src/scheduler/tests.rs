//! Pool verb tests that need no network: a zero-slot pool keeps every
//! download queued, which exercises admission, pause, resume, and delete
//! bookkeeping deterministically.

use super::*;
use crate::config::SdmConfig;
use crate::events::DownloadEvent;

fn queue_only_pool() -> WorkerPool {
    let cfg = SdmConfig {
        max_concurrent_downloads: 0,
        ..SdmConfig::default()
    };
    WorkerPool::new(cfg, None)
}

fn config(url: &str) -> DownloadConfig {
    DownloadConfig::new(url, "/tmp/sdm-test")
}

#[tokio::test]
async fn add_queues_when_no_slot_and_emits_queued() {
    let pool = queue_only_pool();
    let mut rx = pool.subscribe();
    let id = pool.add(config("https://example.com/a.bin")).await.unwrap();

    match rx.recv().await.unwrap() {
        DownloadEvent::Queued { id: got, filename } => {
            assert_eq!(got, id);
            assert_eq!(filename, "a.bin");
        }
        other => panic!("expected queued event, got {other:?}"),
    }
    let snap = pool.get_status(&id).await.unwrap();
    assert_eq!(snap.status, crate::store::DownloadStatus::Queued);
    assert_eq!(pool.active_count().await, 0);
}

#[tokio::test]
async fn duplicate_add_is_rejected() {
    let pool = queue_only_pool();
    let cfg = config("https://example.com/a.bin");
    let cfg2 = cfg.clone();
    pool.add(cfg).await.unwrap();
    assert!(matches!(
        pool.add(cfg2).await,
        Err(DownloadError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn has_download_tracks_url() {
    let pool = queue_only_pool();
    pool.add(config("https://example.com/a.bin")).await.unwrap();
    assert!(pool.has_download("https://example.com/a.bin").await);
    assert!(!pool.has_download("https://example.com/b.bin").await);
}

#[tokio::test]
async fn pause_unknown_id_returns_false() {
    let pool = queue_only_pool();
    assert!(!pool.pause("nope").await);
}

#[tokio::test]
async fn pause_queued_then_resume_requeues() {
    let pool = queue_only_pool();
    let mut rx = pool.subscribe();
    let id = pool.add(config("https://example.com/a.bin")).await.unwrap();
    let _ = rx.recv().await.unwrap(); // queued

    assert!(pool.pause(&id).await);
    match rx.recv().await.unwrap() {
        DownloadEvent::Paused { downloaded, .. } => assert_eq!(downloaded, 0),
        other => panic!("expected paused event, got {other:?}"),
    }

    // Repeated pause: no state change, no new event.
    assert!(pool.pause(&id).await);

    pool.resume(&id).await.unwrap();
    // Zero slots: resume lands back in the queue.
    match rx.recv().await.unwrap() {
        DownloadEvent::Queued { id: got, .. } => assert_eq!(got, id),
        other => panic!("expected queued event, got {other:?}"),
    }
}

#[tokio::test]
async fn resume_unknown_or_unpaused_is_not_found() {
    let pool = queue_only_pool();
    assert!(matches!(
        pool.resume("nope").await,
        Err(DownloadError::NotFound)
    ));
    let id = pool.add(config("https://example.com/a.bin")).await.unwrap();
    // Still queued, not paused.
    assert!(matches!(
        pool.resume(&id).await,
        Err(DownloadError::NotFound)
    ));
}

#[tokio::test]
async fn delete_is_idempotent_and_emits_once() {
    let pool = queue_only_pool();
    let mut rx = pool.subscribe();
    let id = pool.add(config("https://example.com/a.bin")).await.unwrap();
    let _ = rx.recv().await.unwrap(); // queued

    assert!(pool.delete(&id).await.unwrap());
    match rx.recv().await.unwrap() {
        DownloadEvent::Removed { id: got, .. } => assert_eq!(got, id),
        other => panic!("expected removed event, got {other:?}"),
    }
    // Second delete: no-op, no event.
    assert!(!pool.delete(&id).await.unwrap());
    assert!(rx.try_recv().is_err());
    assert!(pool.get_status(&id).await.is_none());
}

#[tokio::test]
async fn store_ops_without_db_are_distinguishable() {
    let pool = queue_only_pool();
    assert!(matches!(
        pool.remove_completed().await,
        Err(DownloadError::DatabaseNotConfigured)
    ));
    assert!(matches!(
        pool.persisted_entries().await,
        Err(DownloadError::DatabaseNotConfigured)
    ));
    assert!(matches!(
        pool.persisted_state("x").await,
        Err(DownloadError::DatabaseNotConfigured)
    ));
}

#[tokio::test]
async fn graceful_shutdown_parks_queued_entries() {
    let pool = queue_only_pool();
    let a = pool.add(config("https://example.com/a.bin")).await.unwrap();
    let b = pool.add(config("https://example.com/b.bin")).await.unwrap();
    pool.graceful_shutdown().await;
    for id in [a, b] {
        let snap = pool.get_status(&id).await.unwrap();
        assert_eq!(snap.status, crate::store::DownloadStatus::Paused);
    }
}

#[tokio::test]
async fn get_all_returns_configs() {
    let pool = queue_only_pool();
    pool.add(config("https://example.com/a.bin")).await.unwrap();
    pool.add(config("https://example.com/b.bin")).await.unwrap();
    let all = pool.get_all().await;
    assert_eq!(all.len(), 2);
}
