//! Parse probe response header lines.

/// Key headers extracted from a probe response.
#[derive(Debug, Clone, Default)]
pub(super) struct ProbeHeaders {
    pub content_length: Option<u64>,
    pub content_range_total: Option<u64>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

/// Parse `Content-Range: bytes A-B/TOTAL` into (first, last, total).
/// `total` is `None` for an unknown length (`*`).
pub(super) fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (range, total) = rest.split_once('/')?;
    let (a, b) = range.split_once('-')?;
    let first = a.trim().parse::<u64>().ok()?;
    let last = b.trim().parse::<u64>().ok()?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    Some((first, last, total))
}

/// Parse collected header lines of the final response.
pub(super) fn parse_headers(lines: &[String]) -> ProbeHeaders {
    let mut out = ProbeHeaders::default();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    out.content_length = Some(n);
                }
            }
            if name.eq_ignore_ascii_case("content-range") {
                if let Some((_, _, total)) = parse_content_range(value) {
                    out.content_range_total = total;
                }
            }
            if name.eq_ignore_ascii_case("content-type") {
                out.content_type = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("content-disposition") {
                out.content_disposition = Some(value.to_string());
            }
        }
    }
    out
}
