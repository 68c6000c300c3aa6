//! Request framing and parsing. Framing recognizes when enough bytes have
//! arrived to constitute a full request — either an HTTP/0.9 single line
//! (`METHOD SP URL` followed by a line terminator) or an HTTP/1.x
//! request (`METHOD SP URL SP VERSION` followed by a header block and a
//! blank line) — before the slower field-by-field parse runs.

use std::collections::HashMap;
use std::str::FromStr;

use super::method::Method;
use crate::http::date::parse_http_date;
use crate::http::resolve::{de_dotdot, escapes_root, percent_decode};

pub const MAX_REQUEST_LINE_AND_HEADERS: usize = 1 << 16;
const MAX_ACCUMULATED_HEADER_VALUE: usize = 5000;

#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    MalformedRequestLine,
    UnknownMethod,
    UriNotAbsolutePath,
    PathEscapesRoot,
    BadHostHeader,
    MissingHost,
    RequestTooLarge,
}

impl ParseError {
    pub fn status_code(&self) -> u16 {
        match self {
            ParseError::UnknownMethod => 501,
            ParseError::RequestTooLarge => 414,
            _ => 400,
        }
    }
}

#[derive(Debug)]
pub struct ParsedRequest {
    pub method: Method,
    pub raw_url: String,
    pub decoded_path: String,
    pub query: Option<String>,
    pub version: Option<(u8, u8)>,
    pub headers: HashMap<String, String>,
    pub host: Option<String>,
    pub content_length: Option<u64>,
    pub if_modified_since: i64,
    pub keep_alive_hint: bool,
}

impl ParsedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn is_http_1_1(&self) -> bool {
        matches!(self.version, Some((1, 1)))
    }
}

pub enum ParseOutcome {
    Complete(ParsedRequest),
    Failed(ParseError),
}

#[derive(Default)]
pub struct RequestParser {
    // Reserved for future pipelined-request bookkeeping; framing is
    // stateless across calls today since a connection only ever has one
    // in-flight request (see conn::Connection — persistent responses are
    // out of scope).
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks for a complete request at the front of `buf`. On success or
    /// hard failure, drains the consumed bytes from `buf` and returns
    /// `Some`. Returns `None` if more bytes are needed.
    pub fn feed(&mut self, buf: &mut Vec<u8>) -> Option<ParseOutcome> {
        match scan_frame(buf) {
            FrameResult::NeedMore => {
                if buf.len() > MAX_REQUEST_LINE_AND_HEADERS {
                    buf.clear();
                    Some(ParseOutcome::Failed(ParseError::RequestTooLarge))
                } else {
                    None
                }
            }
            FrameResult::Bad => {
                buf.clear();
                Some(ParseOutcome::Failed(ParseError::MalformedRequestLine))
            }
            FrameResult::Found(end) => {
                let raw: Vec<u8> = buf.drain(..end).collect();
                Some(match parse_request(&raw) {
                    Ok(req) => ParseOutcome::Complete(req),
                    Err(e) => ParseOutcome::Failed(e),
                })
            }
        }
    }
}

enum FrameResult {
    NeedMore,
    Bad,
    Found(usize),
}

fn find_line_end(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..].iter().position(|&b| b == b'\n').map(|i| from + i + 1)
}

fn scan_frame(buf: &[u8]) -> FrameResult {
    let Some(first_end) = find_line_end(buf, 0) else {
        return FrameResult::NeedMore;
    };
    let line = strip_terminator(&buf[..first_end]);
    let words = line.split(|&b| b == b' ' || b == b'\t').filter(|w| !w.is_empty()).count();

    match words {
        2 => FrameResult::Found(first_end),
        3 => find_headers_end(buf, first_end).map_or(FrameResult::NeedMore, FrameResult::Found),
        0 | 1 if buf.len() > MAX_REQUEST_LINE_AND_HEADERS => FrameResult::Bad,
        0 | 1 => FrameResult::NeedMore,
        _ => FrameResult::Bad,
    }
}

fn find_headers_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some(i + 4);
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    &line[..end]
}

fn parse_request(raw: &[u8]) -> Result<ParsedRequest, ParseError> {
    let text_end = find_line_end(raw, 0).unwrap_or(raw.len());
    let request_line = String::from_utf8_lossy(strip_terminator(&raw[..text_end]));
    let mut parts = request_line.split_whitespace();
    let method_tok = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let url_tok = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let proto_tok = parts.next();

    let method = Method::from_str(method_tok).map_err(|_| ParseError::UnknownMethod)?;

    let version = match proto_tok {
        None => None,
        Some(p) => Some(parse_protocol_version(p)?),
    };

    let (host_from_url, path_part) = split_absolute_form(url_tok, version);
    if !path_part.starts_with('/') {
        return Err(ParseError::UriNotAbsolutePath);
    }

    let (path_only, query) = match path_part.split_once('?') {
        Some((p, q)) => (p, Some(q.to_string())),
        None => (path_part, None),
    };

    let decoded = percent_decode(path_only);
    let canon = de_dotdot(&decoded);
    if escapes_root(&canon) {
        return Err(ParseError::PathEscapesRoot);
    }

    let headers = parse_headers(&raw[text_end..]);

    let host_header = headers.get("host").cloned();
    let host = match &host_header {
        Some(h) => Some(validate_host(h)?),
        None => host_from_url.clone(),
    };
    if matches!(version, Some((1, 1))) && host.is_none() {
        return Err(ParseError::MissingHost);
    }

    let content_length = headers.get("content-length").and_then(|v| v.parse().ok());
    let if_modified_since = headers
        .get("if-modified-since")
        .map(|v| parse_http_date(v))
        .unwrap_or(-1);
    let keep_alive_hint = headers
        .get("connection")
        .map(|v| v.to_ascii_lowercase().contains("keep-alive"))
        .unwrap_or(false);

    Ok(ParsedRequest {
        method,
        raw_url: url_tok.to_string(),
        decoded_path: format!("/{}", canon),
        query,
        version,
        headers,
        host,
        content_length,
        if_modified_since,
        keep_alive_hint,
    })
}

fn parse_protocol_version(tok: &str) -> Result<(u8, u8), ParseError> {
    let rest = tok.strip_prefix("HTTP/").ok_or(ParseError::MalformedRequestLine)?;
    let (maj, min) = rest.split_once('.').ok_or(ParseError::MalformedRequestLine)?;
    let maj: u8 = maj.parse().map_err(|_| ParseError::MalformedRequestLine)?;
    let min: u8 = min.parse().map_err(|_| ParseError::MalformedRequestLine)?;
    Ok((maj, min))
}

fn split_absolute_form(url: &str, version: Option<(u8, u8)>) -> (Option<String>, &str) {
    if let Some(rest) = url.strip_prefix("http://") {
        if matches!(version, Some((1, 1))) {
            if let Some(slash) = rest.find('/') {
                return (Some(rest[..slash].to_ascii_lowercase()), &rest[slash..]);
            }
            return (Some(rest.to_ascii_lowercase()), "/");
        }
    }
    (None, url)
}

fn validate_host(host_header: &str) -> Result<String, ParseError> {
    let hostname = host_header.split(':').next().unwrap_or("");
    if hostname.starts_with('/') || hostname.starts_with('.') {
        return Err(ParseError::BadHostHeader);
    }
    Ok(hostname.to_ascii_lowercase())
}

const RECOGNIZED_HEADERS: &[&str] = &[
    "referer",
    "referrer",
    "user-agent",
    "host",
    "accept",
    "accept-encoding",
    "accept-language",
    "if-modified-since",
    "cookie",
    "range",
    "if-range",
    "content-type",
    "content-length",
    "authorization",
    "connection",
];

fn parse_headers(block: &[u8]) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut offset = 0;
    while offset < block.len() {
        let Some(line_end) = find_line_end(block, offset) else {
            break;
        };
        let line = strip_terminator(&block[offset..line_end]);
        offset = line_end;
        if line.is_empty() {
            break;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_ascii_lowercase();
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();

        if !RECOGNIZED_HEADERS.iter().any(|h| *h == name.as_str()) {
            continue;
        }

        let key = if name == "referrer" { "referer".to_string() } else { name };
        headers
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
                existing.truncate(MAX_ACCUMULATED_HEADER_VALUE);
            })
            .or_insert(value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> ParsedRequest {
        let mut buf = bytes.to_vec();
        let mut parser = RequestParser::new();
        match parser.feed(&mut buf) {
            Some(ParseOutcome::Complete(req)) => req,
            Some(ParseOutcome::Failed(e)) => panic!("parse failed: {:?}", e),
            None => panic!("needed more data"),
        }
    }

    #[test]
    fn simple_get() {
        let req = parse(b"GET /hello.txt HTTP/1.0\r\nHost: x\r\n\r\n");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.decoded_path, "/hello.txt");
        assert_eq!(req.version, Some((1, 0)));
    }

    #[test]
    fn http_09_single_line() {
        let req = parse(b"GET /index.html\n");
        assert_eq!(req.version, None);
        assert_eq!(req.decoded_path, "/index.html");
    }

    #[test]
    fn needs_more_data() {
        let mut buf = b"GET /x HTTP/1.1\r\nHost: a".to_vec();
        let mut parser = RequestParser::new();
        assert!(parser.feed(&mut buf).is_none());
    }

    #[test]
    fn unknown_method_is_501() {
        let mut buf = b"FROB /x HTTP/1.0\r\n\r\n".to_vec();
        let mut parser = RequestParser::new();
        match parser.feed(&mut buf) {
            Some(ParseOutcome::Failed(e)) => assert_eq!(e.status_code(), 501),
            other => panic!("expected failure, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn path_traversal_is_400() {
        let mut buf = b"GET /%2e%2e/%2e%2e/etc/passwd HTTP/1.0\r\n\r\n".to_vec();
        let mut parser = RequestParser::new();
        match parser.feed(&mut buf) {
            Some(ParseOutcome::Failed(e)) => assert_eq!(e.status_code(), 400),
            other => panic!("expected failure, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn http_11_without_host_is_400() {
        let mut buf = b"GET /x HTTP/1.1\r\n\r\n".to_vec();
        let mut parser = RequestParser::new();
        match parser.feed(&mut buf) {
            Some(ParseOutcome::Failed(e)) => assert_eq!(e.status_code(), 400),
            other => panic!("expected failure, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn range_header_parsed() {
        let req = parse(b"GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=10-19\r\n\r\n");
        assert_eq!(req.header("range"), Some("bytes=10-19"));
    }
}
