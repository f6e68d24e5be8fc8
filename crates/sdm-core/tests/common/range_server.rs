//! Minimal HTTP/1.1 server with Range support for integration tests.
//!
//! Serves a single static body from a background thread, one thread per
//! connection. Options inject the failure modes the engine must survive:
//! range support withheld, leading 5xx bursts, per-connection throttling.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Respond 500 to this many GETs before behaving normally.
    pub fail_first: usize,
    /// Cap each connection to roughly this many bytes/sec (0 = unlimited).
    pub throttle_bps: u64,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            fail_first: 0,
            throttle_bps: 0,
        }
    }
}

/// Starts a server serving `body`; returns its URL (path `/file`).
/// Runs until the process exits.
pub fn start(body: Vec<u8>) -> String {
    start_with_options(body, RangeServerOptions::default())
}

pub fn start_with_options(body: Vec<u8>, opts: RangeServerOptions) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let body = Arc::new(body);
    let failures_left = Arc::new(AtomicUsize::new(opts.fail_first));
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let body = Arc::clone(&body);
            let opts = opts.clone();
            let failures_left = Arc::clone(&failures_left);
            thread::spawn(move || handle(stream, &body, &opts, &failures_left));
        }
    });
    format!("http://127.0.0.1:{port}/file")
}

fn handle(
    mut stream: std::net::TcpStream,
    body: &[u8],
    opts: &RangeServerOptions,
    failures_left: &AtomicUsize,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, range) = parse_request(request);
    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }

    if failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
        .is_ok()
    {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    let total = body.len() as u64;
    if total == 0 {
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    }
    let (status, content_range, slice) = match range {
        Some((start, end_incl)) if opts.support_ranges => {
            let start = start.min(total);
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl {
                let _ = stream.write_all(
                    format!(
                        "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    )
                    .as_bytes(),
                );
                return;
            }
            let slice = &body[start as usize..=(end_incl as usize)];
            (
                "206 Partial Content",
                Some(format!("bytes {start}-{end_incl}/{total}")),
                slice,
            )
        }
        _ => ("200 OK", None, body),
    };

    let accept_ranges = if opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };
    let range_header = content_range
        .map(|v| format!("Content-Range: {v}\r\n"))
        .unwrap_or_default();
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\n{range_header}{accept_ranges}Connection: close\r\n\r\n",
        slice.len()
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    if opts.throttle_bps == 0 {
        let _ = stream.write_all(slice);
        return;
    }
    // Throttled body: 16 KiB slices paced to the requested rate.
    let step = 16 * 1024usize;
    let pause = Duration::from_secs_f64(step as f64 / opts.throttle_bps as f64);
    for chunk in slice.chunks(step) {
        if stream.write_all(chunk).is_err() {
            return;
        }
        thread::sleep(pause);
    }
}

/// Returns (method, optional (start, end_inclusive) from `Range: bytes=X-Y`).
fn parse_request(request: &str) -> (&str, Option<(u64, u64)>) {
    let mut method = "";
    let mut range = None;
    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if method.is_empty() {
            method = line.split_whitespace().next().unwrap_or("");
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                let value = value.trim();
                if let Some(bytes) = value.strip_prefix("bytes=") {
                    if let Some((a, b)) = bytes.split_once('-') {
                        let start = a.trim().parse::<u64>().unwrap_or(0);
                        let end_incl = if b.trim().is_empty() {
                            u64::MAX
                        } else {
                            b.trim().parse::<u64>().unwrap_or(0)
                        };
                        range = Some((start, end_incl));
                    }
                }
            }
        }
    }
    (method, range)
}

/// Deterministic pseudo-random body so corruption shows up in comparisons.
pub fn patterned_body(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut state = 0x2545f491_u32;
    for _ in 0..len {
        state = state.wrapping_mul(1664525).wrapping_add(1013904223);
        out.push((state >> 24) as u8);
    }
    out
}
