//! One HTTP range fetch, streamed into positional writes.
//!
//! Each worker drives a `curl::easy::Easy2` with a handler that reserves a
//! slice of its active task, writes it at the absolute file offset, credits
//! the downloaded counter through the task group's watermark, and keeps the
//! chunk bitmap current. The progress callback is the preemption point: the
//! health loop or a pause flips a flag and the transfer aborts at the next
//! libcurl tick.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use curl::easy::{Easy2, Handler, WriteError};

use crate::progress::ChunkStatus;
use crate::retry::{classify_curl_error, classify_http_status, ErrorKind};
use crate::task::ActiveTask;

use super::{DownloadCtx, WORKER_BATCH_BYTES, WORKER_BATCH_INTERVAL};

/// How a fetch ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FetchEnd {
    /// The active task's range is fully written (or was shrunk to done).
    Complete,
    /// Preempted: download cancel, pause, or per-worker health cancel.
    Cancelled,
}

/// Why a fetch failed.
#[derive(Debug)]
pub(super) enum FetchError {
    Transport(curl::Error),
    Http(u32),
    /// Server ignored the Range header (200 to a ranged request).
    RangeUnsupported,
    /// Server answered a different range than requested. Fatal.
    ByteMismatch { requested: u64, got: u64 },
    /// Disk write failed. Fatal.
    Storage(String),
    /// Transfer ended before the range was delivered; retryable.
    ShortBody { expected: u64, received: u64 },
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Transport(e) => classify_curl_error(e),
            FetchError::Http(code) => classify_http_status(*code),
            FetchError::RangeUnsupported => ErrorKind::RangeUnsupported,
            FetchError::ByteMismatch { .. } => ErrorKind::ByteMismatch,
            FetchError::Storage(_) => ErrorKind::Other,
            FetchError::ShortBody { .. } => ErrorKind::Connection,
        }
    }

    /// Errors that must stop the whole download rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::ByteMismatch { .. } | FetchError::Storage(_))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "{e}"),
            FetchError::Http(code) => write!(f, "HTTP {code}"),
            FetchError::RangeUnsupported => write!(f, "server ignored byte range"),
            FetchError::ByteMismatch { requested, got } => {
                write!(f, "range mismatch: requested offset {requested}, got {got}")
            }
            FetchError::Storage(e) => write!(f, "storage: {e}"),
            FetchError::ShortBody { expected, received } => {
                write!(f, "short body: expected {expected} bytes, got {received}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stop {
    None,
    Finished,
    Cancelled,
    RangeUnsupported,
    ByteMismatch { got: u64 },
    HttpError(u32),
    Storage(String),
}

struct RangeHandler {
    ctx: Arc<DownloadCtx>,
    active: Arc<ActiveTask>,
    ranged: bool,
    requested_offset: u64,
    status: u32,
    content_range_start: Option<u64>,
    header_checked: bool,
    stop: Stop,
    batch_bytes: u64,
    batch_started: Instant,
}

impl RangeHandler {
    fn new(ctx: Arc<DownloadCtx>, active: Arc<ActiveTask>, ranged: bool) -> Self {
        let requested_offset = active.current_offset();
        RangeHandler {
            ctx,
            active,
            ranged,
            requested_offset,
            status: 0,
            content_range_start: None,
            header_checked: false,
            stop: Stop::None,
            batch_bytes: 0,
            batch_started: Instant::now(),
        }
    }

    /// Validate status line and Content-Range before the first byte lands.
    fn check_response(&mut self) -> bool {
        self.header_checked = true;
        if self.status >= 400 {
            self.stop = Stop::HttpError(self.status);
            return false;
        }
        if self.ranged {
            match self.status {
                206 => match self.content_range_start {
                    Some(start) if start == self.requested_offset => true,
                    Some(start) => {
                        self.stop = Stop::ByteMismatch { got: start };
                        false
                    }
                    None => true,
                },
                200 => {
                    self.stop = Stop::RangeUnsupported;
                    false
                }
                _ => true,
            }
        } else {
            true
        }
    }

    fn publish_batch(&mut self, n: u64) {
        self.batch_bytes += n;
        if self.batch_bytes >= WORKER_BATCH_BYTES
            || self.batch_started.elapsed() >= WORKER_BATCH_INTERVAL
        {
            self.ctx.maybe_emit_progress(false);
            self.batch_bytes = 0;
            self.batch_started = Instant::now();
        }
    }
}

impl Handler for RangeHandler {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.stop != Stop::None {
            return Ok(0);
        }
        if self.ctx.cancelled() || self.active.is_cancelled() {
            self.stop = Stop::Cancelled;
            return Ok(0);
        }
        if !self.header_checked && !self.check_response() {
            return Ok(0);
        }

        let mut consumed = 0usize;
        while consumed < data.len() {
            let want = (data.len() - consumed) as u64;
            let Some((offset, n)) = self.active.reserve(want) else {
                self.stop = Stop::Finished;
                // Short count aborts the rest of the body.
                return Ok(consumed);
            };
            let slice = &data[consumed..consumed + n as usize];
            if let Err(e) = self.ctx.dest.write_at(offset, slice) {
                self.stop = Stop::Storage(e.to_string());
                return Ok(consumed);
            }
            let credited = self.active.commit(n);
            if credited > 0 {
                self.ctx.progress.add_downloaded(credited);
            }
            // Interior chunks complete as the contiguous frontier crosses
            // them; the touched tail stays marked in-flight.
            self.ctx.progress.update_chunk_status(
                self.requested_offset,
                self.active.current_offset() - self.requested_offset,
                ChunkStatus::Completed,
            );
            consumed += n as usize;
            self.publish_batch(n);
        }
        Ok(consumed)
    }

    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(line) = std::str::from_utf8(data) {
            let line = line.trim();
            if line.starts_with("HTTP/") {
                // New response (redirect hop): reset what we learned.
                self.status = line
                    .split_whitespace()
                    .nth(1)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                self.content_range_start = None;
                self.header_checked = false;
            } else if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    self.content_range_start = parse_range_start(value);
                }
            }
        }
        true
    }

    fn progress(&mut self, _dltotal: f64, _dlnow: f64, _ultotal: f64, _ulnow: f64) -> bool {
        if self.ctx.cancelled() || self.active.is_cancelled() {
            self.stop = Stop::Cancelled;
            return false;
        }
        true
    }
}

fn parse_range_start(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, _) = rest.split_once('/')?;
    let (a, _) = range.split_once('-')?;
    a.trim().parse().ok()
}

/// Fetch `[active.current_offset(), active.stop_at())` from `url`.
pub(super) fn fetch_range(
    ctx: &Arc<DownloadCtx>,
    active: &Arc<ActiveTask>,
    url: &str,
    ranged: bool,
) -> Result<FetchEnd, FetchError> {
    let start_offset = active.current_offset();
    let stop_at = active.stop_at();
    let known_end = stop_at != u64::MAX;

    let handler = RangeHandler::new(Arc::clone(ctx), Arc::clone(active), ranged);
    let mut easy = Easy2::new(handler);

    let cfg = &ctx.cfg;
    easy.get(true).map_err(FetchError::Transport)?;
    easy.url(url).map_err(FetchError::Transport)?;
    easy.useragent(&cfg.user_agent).map_err(FetchError::Transport)?;
    easy.follow_location(true).map_err(FetchError::Transport)?;
    easy.connect_timeout(Duration::from_secs(30))
        .map_err(FetchError::Transport)?;
    // The health loop owns stall policy; this is only a backstop against a
    // transfer wedged for an entire session.
    easy.timeout(Duration::from_secs(3600))
        .map_err(FetchError::Transport)?;
    easy.progress(true).map_err(FetchError::Transport)?;
    easy.buffer_size(cfg.worker_buffer_size)
        .map_err(FetchError::Transport)?;
    if cfg.max_worker_rate_bps > 0 {
        easy.max_recv_speed(cfg.max_worker_rate_bps)
            .map_err(FetchError::Transport)?;
    }
    if let Some(proxy) = &cfg.proxy {
        easy.proxy(proxy).map_err(FetchError::Transport)?;
    }
    if ranged {
        easy.range(&format!("{}-{}", start_offset, stop_at.saturating_sub(1)))
            .map_err(FetchError::Transport)?;
    }
    if !ctx.headers.is_empty() {
        let mut list = curl::easy::List::new();
        for (k, v) in &ctx.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))
                .map_err(FetchError::Transport)?;
        }
        easy.http_headers(list).map_err(FetchError::Transport)?;
    }

    let perform_result = easy.perform();
    let status = easy.response_code().unwrap_or(0);
    let handler = easy.get_ref();
    let stop = handler.stop.clone();

    match stop {
        Stop::Cancelled => return Ok(FetchEnd::Cancelled),
        Stop::Finished => return Ok(FetchEnd::Complete),
        Stop::RangeUnsupported => return Err(FetchError::RangeUnsupported),
        Stop::ByteMismatch { got } => {
            return Err(FetchError::ByteMismatch {
                requested: start_offset,
                got,
            })
        }
        Stop::HttpError(code) => return Err(FetchError::Http(code)),
        Stop::Storage(msg) => return Err(FetchError::Storage(msg)),
        Stop::None => {}
    }

    if let Err(e) = perform_result {
        if e.is_aborted_by_callback() {
            return Ok(FetchEnd::Cancelled);
        }
        return Err(FetchError::Transport(e));
    }

    if status >= 400 {
        return Err(FetchError::Http(status));
    }

    if active.is_finished() {
        return Ok(FetchEnd::Complete);
    }
    if !known_end {
        // Unbounded single-connection fetch: EOF is completion.
        return Ok(FetchEnd::Complete);
    }
    Err(FetchError::ShortBody {
        expected: stop_at - start_offset,
        received: active.current_offset() - start_offset,
    })
}
