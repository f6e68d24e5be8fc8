//! HTTP probing: size, range capability, filename, content type.
//!
//! A probe is a `GET` with `Range: bytes=0-0` (not `HEAD`; some servers
//! answer HEAD dishonestly or not at all). A 206 with a valid
//! `Content-Range` total proves range capability; a 200 falls back to
//! `Content-Length`. Probes are best-effort and never persist state.

mod batch;
pub mod filename;
mod parse;

pub use batch::{probe_mirrors, MirrorProbeOutcome};

use std::collections::HashMap;
use std::str;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::error::DownloadError;

/// Connection options shared by single and batch probes.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub user_agent: String,
    pub headers: HashMap<String, String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            user_agent: format!("sdm/{}", env!("CARGO_PKG_VERSION")),
            headers: HashMap::new(),
            proxy: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ProbeOptions {
    pub fn from_runtime(cfg: &RuntimeConfig, headers: HashMap<String, String>) -> Self {
        ProbeOptions {
            user_agent: cfg.user_agent.clone(),
            headers,
            proxy: cfg.proxy.clone(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// What a probe learned about one URL.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// URL as requested.
    pub url: String,
    /// URL after following redirects.
    pub final_url: String,
    /// Total resource size in bytes (0 when the server did not say).
    pub total_size: u64,
    /// True when the server honored the byte-range request.
    pub range_supported: bool,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ProbeResult {
    /// Best-effort filename per the resolution order: caller hint,
    /// Content-Disposition, final URL path segment, synthesized name.
    pub fn suggested_filename(&self, hint: Option<&str>, id: &str) -> String {
        filename::resolve(
            hint,
            self.content_disposition.as_deref(),
            &self.final_url,
            id,
        )
    }
}

/// Probe one URL. On 403/405/416 to the ranged request, retries once
/// without the Range header before giving up.
pub fn probe_url(url: &str, opts: &ProbeOptions) -> Result<ProbeResult, DownloadError> {
    validate_scheme(url)?;

    let first = request(url, opts, true)?;
    let (code, lines, final_url) = match first.0 {
        403 | 405 | 416 => request(url, opts, false)?,
        _ => first,
    };

    if code >= 400 {
        return Err(DownloadError::ProtocolStatus(code));
    }

    let h = parse::parse_headers(&lines);
    let (total_size, range_supported) = match code {
        206 => {
            let total = h.content_range_total.ok_or_else(|| {
                DownloadError::Transport("206 response without a Content-Range total".into())
            })?;
            (total, true)
        }
        _ => (h.content_length.unwrap_or(0), false),
    };

    Ok(ProbeResult {
        url: url.to_string(),
        final_url,
        total_size,
        range_supported,
        content_type: h.content_type,
        content_disposition: h.content_disposition,
    })
}

fn validate_scheme(url: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| DownloadError::InvalidInput(format!("bad URL {url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(DownloadError::InvalidInput(format!(
            "unsupported URL scheme: {other}"
        ))),
    }
}

/// One GET, headers collected, body discarded. Returns the status code of
/// the final (post-redirect) response, its header lines, and the final URL.
fn request(
    url: &str,
    opts: &ProbeOptions,
    with_range: bool,
) -> Result<(u32, Vec<String>, String), DownloadError> {
    let mut lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.get(true).map_err(transport)?;
    easy.url(url).map_err(transport)?;
    easy.useragent(&opts.user_agent).map_err(transport)?;
    easy.follow_location(true).map_err(transport)?;
    easy.connect_timeout(Duration::from_secs(15)).map_err(transport)?;
    easy.timeout(opts.timeout).map_err(transport)?;
    if let Some(proxy) = &opts.proxy {
        easy.proxy(proxy).map_err(transport)?;
    }
    if with_range {
        easy.range("0-0").map_err(transport)?;
    }
    if !opts.headers.is_empty() {
        let mut list = curl::easy::List::new();
        for (k, v) in &opts.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim()))
                .map_err(transport)?;
        }
        easy.http_headers(list).map_err(transport)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    let s = s.trim_end();
                    // A status line starts a fresh response (redirect hop).
                    if s.starts_with("HTTP/") {
                        lines.clear();
                    }
                    lines.push(s.to_string());
                }
                true
            })
            .map_err(transport)?;
        transfer
            // Headers are all we want; abort as soon as a body byte shows up.
            .write_function(|_| Ok(0))
            .map_err(transport)?;
        if let Err(e) = transfer.perform() {
            if !e.is_write_error() {
                return Err(transport(e));
            }
        }
    }

    let code = easy.response_code().map_err(transport)?;
    let final_url = easy
        .effective_url()
        .ok()
        .flatten()
        .unwrap_or(url)
        .to_string();
    Ok((code, lines, final_url))
}

fn transport(e: curl::Error) -> DownloadError {
    DownloadError::Transport(e.to_string())
}
