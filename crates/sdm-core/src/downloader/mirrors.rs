//! Mirror rotation and recovery.
//!
//! Workers lease a mirror round-robin from the set currently marked active,
//! skipping hosts whose per-host connection budget is full. A mirror that
//! fails is demoted and re-probed in the background on an exponential
//! schedule with a bounded attempt budget.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::progress::ProgressState;

/// Re-probe attempts per demoted mirror per session.
pub(crate) const MIRROR_REPROBE_MAX_ATTEMPTS: u32 = 5;

const REPROBE_BASE: Duration = Duration::from_secs(2);
const REPROBE_CAP: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ReprobeEntry {
    attempts: u32,
    next_at: Instant,
}

#[derive(Debug, Default)]
struct PickerInner {
    rr: usize,
    counts: HashMap<String, usize>,
    reprobe: HashMap<String, ReprobeEntry>,
}

/// Round-robin mirror selector with per-host connection accounting.
pub(crate) struct MirrorPicker {
    progress: Arc<ProgressState>,
    max_per_host: usize,
    inner: Arc<Mutex<PickerInner>>,
}

/// A leased connection slot on one mirror; returns the slot on drop.
pub(crate) struct MirrorLease {
    pub url: String,
    host: String,
    inner: Arc<Mutex<PickerInner>>,
}

impl Drop for MirrorLease {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(n) = inner.counts.get_mut(&self.host) {
            *n = n.saturating_sub(1);
        }
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|h| match u.port() {
                Some(p) => format!("{h}:{p}"),
                None => h.to_string(),
            })
        })
        .unwrap_or_else(|| url.to_string())
}

impl MirrorPicker {
    pub fn new(progress: Arc<ProgressState>, max_per_host: usize) -> Self {
        MirrorPicker {
            progress,
            max_per_host: max_per_host.max(1),
            inner: Arc::new(Mutex::new(PickerInner::default())),
        }
    }

    /// Lease the next active mirror whose host still has capacity.
    pub fn acquire(&self) -> Option<MirrorLease> {
        let mirrors: Vec<String> = self
            .progress
            .get_mirrors()
            .into_iter()
            .filter(|m| m.active)
            .map(|m| m.url)
            .collect();
        if mirrors.is_empty() {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        for i in 0..mirrors.len() {
            let idx = (inner.rr + i) % mirrors.len();
            let url = &mirrors[idx];
            let host = host_of(url);
            let in_use = inner.counts.get(&host).copied().unwrap_or(0);
            if in_use >= self.max_per_host {
                continue;
            }
            *inner.counts.entry(host.clone()).or_insert(0) += 1;
            inner.rr = (idx + 1) % mirrors.len();
            return Some(MirrorLease {
                url: url.clone(),
                host,
                inner: Arc::clone(&self.inner),
            });
        }
        None
    }

    /// Demote a mirror and put it on the re-probe schedule.
    pub fn mark_failed(&self, url: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(url, %reason, "mirror demoted");
        self.progress.mark_mirror_inactive(url, reason);
        let mut inner = self.inner.lock().unwrap();
        inner.reprobe.entry(url.to_string()).or_insert(ReprobeEntry {
            attempts: 0,
            next_at: Instant::now() + REPROBE_BASE,
        });
    }

    /// Promote a mirror back after a successful re-probe.
    pub fn mark_recovered(&self, url: &str) {
        tracing::debug!(url, "mirror recovered");
        self.progress.mark_mirror_active(url);
        self.inner.lock().unwrap().reprobe.remove(url);
    }

    /// Demoted mirrors due for a re-probe now. Each returned URL has its
    /// attempt counter advanced and its next slot pushed out on the backoff
    /// curve; a mirror past the attempt budget is never returned again.
    pub fn due_reprobes(&self, now: Instant) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut due = Vec::new();
        for (url, entry) in inner.reprobe.iter_mut() {
            if entry.attempts >= MIRROR_REPROBE_MAX_ATTEMPTS || entry.next_at > now {
                continue;
            }
            entry.attempts += 1;
            let backoff = REPROBE_BASE
                .saturating_mul(1 << entry.attempts.min(6))
                .min(REPROBE_CAP);
            entry.next_at = now + backoff;
            due.push(url.clone());
        }
        due
    }

    /// True when no active mirror remains.
    pub fn exhausted(&self) -> bool {
        !self.progress.get_mirrors().iter().any(|m| m.active)
    }
}
