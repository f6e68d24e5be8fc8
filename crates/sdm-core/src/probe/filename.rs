//! Best-effort filename resolution for a probed URL.
//!
//! Order: caller hint, `Content-Disposition` (`filename*` then `filename`),
//! last path segment of the final URL, synthesized `download-<id>.bin`.

/// Extract the filename from a raw `Content-Disposition` header value.
///
/// Supports `filename="quoted"`, bare `filename=token`, and RFC 5987
/// `filename*=UTF-8''percent-encoded`; `filename*` wins when both appear.
pub fn from_content_disposition(header_value: &str) -> Option<String> {
    let mut fallback: Option<String> = None;

    for param in header_value.trim().split(';') {
        let param = param.trim();
        if let Some((name, v)) = param.split_once('=') {
            let name = name.trim().to_ascii_lowercase();
            let v = v.trim();

            if name == "filename*" {
                if let Some(rest) = v
                    .strip_prefix("UTF-8''")
                    .or_else(|| v.strip_prefix("utf-8''"))
                {
                    let decoded = percent_decode(rest);
                    if !decoded.is_empty() {
                        return Some(decoded);
                    }
                }
            }

            if name == "filename" {
                let unquoted = if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
                    unescape_quoted(&v[1..v.len() - 1])
                } else {
                    v.to_string()
                };
                if !unquoted.is_empty() {
                    fallback = Some(unquoted);
                }
            }
        }
    }

    fallback
}

/// Last path segment of a URL, if any.
pub fn from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path().split('/').filter(|s| !s.is_empty()).last()?;
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Fallback name when nothing else resolves.
pub fn synthesized(id: &str) -> String {
    format!("download-{id}.bin")
}

/// Resolve per the precedence order above.
pub fn resolve(
    hint: Option<&str>,
    content_disposition: Option<&str>,
    final_url: &str,
    id: &str,
) -> String {
    if let Some(hint) = hint {
        if !hint.is_empty() {
            return hint.to_string();
        }
    }
    if let Some(cd) = content_disposition {
        if let Some(name) = from_content_disposition(cd) {
            return name;
        }
    }
    if let Some(name) = from_url_path(final_url) {
        return name;
    }
    synthesized(id)
}

fn unescape_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(chars.next().unwrap());
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::new();
    let mut bytes = input.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(high), Some(low)) => out.push(high << 4 | low),
                _ => out.push(b'%'),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
