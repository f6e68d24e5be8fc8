//! Concurrent validation of mirror candidates.

use std::collections::{HashMap, HashSet};

use super::{probe_url, ProbeOptions, ProbeResult};

/// Result of probing a set of mirror candidates.
#[derive(Debug, Default)]
pub struct MirrorProbeOutcome {
    /// Range-capable mirrors, in input order (primary stays first when it
    /// survives). Deduplicated.
    pub valid: Vec<ProbeResult>,
    /// Rejected URL → human-readable reason.
    pub failures: HashMap<String, String>,
}

/// Probe every candidate concurrently with the options' bounded timeout.
///
/// Only mirrors that answered 206 with a usable total make `valid`; probe
/// failures and range-incapable servers land in `failures`. Never persists
/// state; the caller decides whether enough mirrors survived.
pub fn probe_mirrors(urls: &[String], opts: &ProbeOptions) -> MirrorProbeOutcome {
    let mut seen = HashSet::new();
    let candidates: Vec<String> = urls
        .iter()
        .filter(|u| seen.insert(u.as_str()))
        .cloned()
        .collect();

    let handles: Vec<_> = candidates
        .iter()
        .map(|url| {
            let url = url.clone();
            let opts = opts.clone();
            std::thread::spawn(move || {
                let res = probe_url(&url, &opts);
                (url, res)
            })
        })
        .collect();

    let mut outcome = MirrorProbeOutcome::default();
    for handle in handles {
        let Ok((url, res)) = handle.join() else {
            continue;
        };
        match res {
            Ok(probe) if probe.range_supported => outcome.valid.push(probe),
            Ok(_) => {
                tracing::debug!(url = %url, "mirror rejected: no range support");
                outcome
                    .failures
                    .insert(url, "no byte-range support".to_string());
            }
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "mirror probe failed");
                outcome.failures.insert(url, e.to_string());
            }
        }
    }

    // Joins complete in spawn order, which is input order, so `valid`
    // already preserves the caller's ordering.
    outcome
}
