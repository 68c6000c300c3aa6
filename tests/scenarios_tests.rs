//! End-to-end scenario tests exercising the request → resolve → response
//! pipeline through its pure functions, without going through sockets.

use std::io::Write;

use thttpd_core::config::ServerConfig;
use thttpd_core::http::mime::{mime_type_for, ContentEncoding};
use thttpd_core::http::range::parse_range;
use thttpd_core::http::request::{ParseOutcome, RequestParser};
use thttpd_core::http::resolve::resolve_under_root;
use thttpd_core::http::response::{send_mime, status_text};

fn parse(bytes: &[u8]) -> thttpd_core::http::request::ParsedRequest {
    let mut buf = bytes.to_vec();
    match RequestParser::new().feed(&mut buf) {
        Some(ParseOutcome::Complete(req)) => req,
        other => panic!("expected a complete parse, got {:?}", other.is_some()),
    }
}

/// S1: a plain static file is served byte-for-byte with the right
/// Content-Length and a 200 status line.
#[test]
fn s1_static_file_byte_fidelity() {
    let dir = tempfile::tempdir().unwrap();
    let mut f = std::fs::File::create(dir.path().join("hello.txt")).unwrap();
    f.write_all(b"Hello, world\n").unwrap();
    drop(f);

    let req = parse(b"GET /hello.txt HTTP/1.0\r\n\r\n");
    let root = dir.path();
    let resolved = resolve_under_root(root, &req.decoded_path, true).unwrap();
    let body = std::fs::read(&resolved).unwrap();

    assert_eq!(body, b"Hello, world\n");
    assert_eq!(body.len(), 13);

    let cfg = ServerConfig::default();
    let resp = send_mime(
        200,
        mime_type_for("hello.txt"),
        ContentEncoding::Identity,
        body.len() as u64,
        Some(0),
        None,
        body.len() as u64,
        &cfg,
    );
    let bytes = resp.into_bytes(status_text(200));
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("Content-Length: 13\r\n"));
    assert!(text.ends_with("Hello, world\n"));
}

/// S2: requesting a directory without a trailing slash calls for a 302 to
/// the slash-terminated form; the caller (server.rs) builds that redirect
/// straight off the parsed raw URL.
#[test]
fn s2_directory_without_trailing_slash_needs_redirect() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("docs")).unwrap();

    let req = parse(b"GET /docs HTTP/1.0\r\n\r\n");
    assert!(!req.raw_url.ends_with('/'));
    let resolved = resolve_under_root(dir.path(), &req.decoded_path, true).unwrap();
    assert!(resolved.is_dir());

    let location = format!("{}/", req.raw_url);
    assert_eq!(location, "/docs/");
}

/// S3: a `../` escape that survives canonicalization past the root is
/// rejected by the parser itself with 400, before any filesystem lookup.
#[test]
fn s3_path_traversal_is_rejected_at_parse_time() {
    let mut buf = b"GET /%2e%2e/%2e%2e/etc/passwd HTTP/1.0\r\n\r\n".to_vec();
    match RequestParser::new().feed(&mut buf) {
        Some(ParseOutcome::Failed(e)) => assert_eq!(e.status_code(), 400),
        other => panic!("expected a parse failure, got {:?}", other.is_some()),
    }
}

/// S4: a single-range GET against a 100-byte file is promoted to 206 with
/// a matching Content-Range and a body containing only the requested span.
#[test]
fn s4_byte_range_request() {
    let dir = tempfile::tempdir().unwrap();
    let full: Vec<u8> = (0u8..100).collect();
    std::fs::write(dir.path().join("f"), &full).unwrap();

    let req = parse(b"GET /f HTTP/1.1\r\nHost: x\r\nRange: bytes=10-19\r\n\r\n");
    let range = parse_range(req.header("range").unwrap(), full.len() as u64).unwrap();
    assert_eq!(range.start, 10);
    assert_eq!(range.end, 19);

    let body = &full[range.start as usize..=range.end as usize];
    assert_eq!(body, &(10u8..=19).collect::<Vec<u8>>()[..]);

    let cfg = ServerConfig::default();
    let resp = send_mime(
        200,
        "application/octet-stream",
        ContentEncoding::Identity,
        body.len() as u64,
        Some(0),
        Some(range),
        full.len() as u64,
        &cfg,
    );
    assert_eq!(resp.status, 206);
    let bytes = resp.into_bytes(status_text(206));
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("Content-Range: bytes 10-19/100\r\n"));
    assert!(text.contains("Content-Length: 10\r\n"));
}
