//! Response assembly: `send_mime` header synthesis, error pages, directory
//! listings, and the small string-formatting helpers thttpd calls
//! `defang` and `show_size`.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ServerConfig;
use crate::http::mime::ContentEncoding;
use crate::http::range::ByteRange;

const SERVER_TOKEN: &str = "thttpd_core";

pub struct ResponseWriter {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ResponseWriter {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: Vec::new() }
    }

    pub fn header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.body = bytes;
        self
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Serializes the status line, headers, and body into one contiguous
    /// buffer so the caller can hand it to the socket in a single write.
    pub fn into_bytes(self, status_text: &str) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, status_text).into_bytes();
        for (k, v) in &self.headers {
            out.extend_from_slice(format!("{k}: {v}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        414 => "URI Too Long",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn http_date(epoch_secs: i64) -> String {
    httpdate_from_epoch(epoch_secs)
}

// Minimal RFC 1123 formatter; avoids pulling in a date-formatting crate
// for one call site.
fn httpdate_from_epoch(epoch: i64) -> String {
    const DAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"]; // epoch 0 was a Thursday
    const MONTHS: [&str; 12] =
        ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];
    let days_since_epoch = epoch.div_euclid(86400);
    let secs_of_day = epoch.rem_euclid(86400);
    let hour = secs_of_day / 3600;
    let min = (secs_of_day % 3600) / 60;
    let sec = secs_of_day % 60;
    let weekday = DAYS[(days_since_epoch.rem_euclid(7)) as usize];

    let (y, m, d) = civil_from_days(days_since_epoch);
    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        weekday,
        d,
        MONTHS[(m - 1) as usize],
        y,
        hour,
        min,
        sec
    )
}

fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Builds the full response header block thttpd's `send_mime` assembles:
/// status line fields, `Date`, `Last-Modified`, caching headers, and an
/// optional byte-range promotion to 206.
#[allow(clippy::too_many_arguments)]
pub fn send_mime(
    status: u16,
    content_type: &str,
    encoding: ContentEncoding,
    length: u64,
    mtime: Option<i64>,
    range: Option<ByteRange>,
    full_size: u64,
    cfg: &ServerConfig,
) -> ResponseWriter {
    let (status, length, range_header) = match (status, range) {
        (200, Some(r)) => (
            206,
            r.end - r.start + 1,
            Some(format!("bytes {}-{}/{}", r.start, r.end, full_size)),
        ),
        _ => (status, length, None),
    };

    let mut resp = ResponseWriter::new(status);
    resp.header("Server", SERVER_TOKEN)
        .header("Date", http_date(now_unix() as i64))
        .header(
            "Last-Modified",
            http_date(mtime.unwrap_or(now_unix() as i64)),
        )
        .header("Accept-Ranges", "bytes")
        .header("Connection", "close")
        .header("Content-Type", content_type)
        .header("Content-Length", length.to_string());

    if status >= 400 {
        resp.header("Cache-Control", "no-cache,no-store");
    } else if let Some(max_age) = cfg.max_age {
        resp.header("Cache-Control", format!("max-age={max_age}"))
            .header("Expires", http_date(now_unix() as i64 + max_age as i64));
    }

    if let Some(enc) = encoding.as_header_value() {
        resp.header("Content-Encoding", enc);
    }
    if let Some(range_value) = range_header {
        resp.header("Content-Range", range_value);
    }
    if let Some(p3p) = &cfg.p3p {
        resp.header("P3P", p3p.clone());
    }

    resp
}

/// Escapes `<` and `>` for safe interpolation into an HTML error body,
/// truncating the input so the expanded output never exceeds `dfsize`
/// bytes — each escape can grow the source by at most 4 bytes (`<` → 5
/// chars), so truncating the input at `dfsize - 5` bounds the output.
pub fn defang(input: &str, dfsize: usize) -> String {
    let cap = dfsize.saturating_sub(5);
    let mut out = String::with_capacity(cap);
    for c in input.chars() {
        if out.len() >= cap {
            break;
        }
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
    out
}

/// Human-readable size with K/M/G suffixes at 1024-byte boundaries. No
/// thousands separators for the plain-byte case.
pub fn show_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        bytes.to_string()
    }
}

/// Builds the minimal HTML body for an error response, looking first for a
/// configured per-status error page under the server's error directory.
pub fn error_body(status: u16, detail: &str, cfg: Option<&Arc<ServerConfig>>) -> Vec<u8> {
    if let Some(cfg) = cfg {
        if let Some(rel) = cfg.error_pages.get(&status) {
            if let Some(dir) = &cfg.error_dir {
                let path = Path::new(dir).join(rel.trim_start_matches('/'));
                if let Ok(content) = std::fs::read(path) {
                    return content;
                }
            }
        }
    }
    let safe_detail = defang(detail, 256);
    format!(
        "<html><head><title>{code} {text}</title></head><body>\n\
         <h1>{text}</h1>\n<p>{safe_detail}</p>\n</body></html>\n",
        code = status,
        text = status_text(status),
        safe_detail = safe_detail,
    )
    .into_bytes()
}

pub fn generate_autoindex(dir: &Path, url_path: &str) -> Vec<u8> {
    let mut html = format!(
        "<html><head><title>Index of {url}</title></head><body>\n<h1>Index of {url}</h1>\n<ul>\n",
        url = defang(url_path, 512)
    );
    if let Ok(entries) = dir.read_dir() {
        let mut names: Vec<String> =
            entries.flatten().filter_map(|e| e.file_name().into_string().ok()).collect();
        names.sort();
        for name in names {
            let safe_name = defang(&name, 512);
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a></li>\n",
                safe_name,
                safe_name
            ));
        }
    }
    html.push_str("</ul>\n</body></html>\n");
    html.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defang_escapes_angle_brackets() {
        assert_eq!(defang("<script>", 100), "&lt;script&gt;");
    }

    #[test]
    fn defang_truncates_to_budget() {
        let long = "a".repeat(50);
        let out = defang(&long, 10);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn show_size_boundaries() {
        assert_eq!(show_size(512), "512");
        assert_eq!(show_size(2048), "2.0K");
        assert_eq!(show_size(5 * 1024 * 1024), "5.0M");
    }

    #[test]
    fn http_date_known_epoch() {
        assert_eq!(httpdate_from_epoch(784111777), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
