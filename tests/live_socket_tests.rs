//! Drives a real `CoreContext` over live TCP sockets, the way
//! `examples/kill-ux-01-server/tests/server_chunked.rs` exercises its
//! server: bind in a background thread, connect from the test thread, and
//! assert on the bytes that come back over the wire.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use thttpd_core::config::{RouteConfig, ServerConfig};
use thttpd_core::server::CoreContext;

fn spawn_server(cfg: ServerConfig) {
    thread::spawn(move || {
        let mut ctx = CoreContext::bind(vec![cfg]).expect("bind");
        ctx.run().ok();
    });
    thread::sleep(Duration::from_millis(150));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    stream
}

fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
        if buf.len() < 65536 {
            continue;
        }
        break;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[test]
fn serves_a_static_file_over_a_live_connection() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), b"hello from disk\n").unwrap();

    let port = 18181;
    let cfg = ServerConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        server_name: "localhost".to_string(),
        default_server: true,
        routes: vec![RouteConfig { root: dir.path().to_string_lossy().into_owned(), ..Default::default() }],
        ..Default::default()
    };
    spawn_server(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.ends_with("hello from disk\n"), "response: {response}");
}

#[test]
fn rejects_request_with_disallowed_referrer() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("secret.txt"), b"top secret\n").unwrap();

    let port = 18182;
    let cfg = ServerConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        server_name: "localhost".to_string(),
        default_server: true,
        routes: vec![RouteConfig { root: dir.path().to_string_lossy().into_owned(), ..Default::default() }],
        referrer_url_pattern: Some("http://localhost/*".to_string()),
        ..Default::default()
    };
    spawn_server(cfg);

    let mut stream = connect(port);
    stream
        .write_all(
            b"GET /secret.txt HTTP/1.1\r\nHost: localhost\r\nReferer: http://evil.example/x\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 403"), "response: {response}");
}

#[test]
fn allows_request_with_matching_referrer() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("open.txt"), b"not secret\n").unwrap();

    let port = 18183;
    let cfg = ServerConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        server_name: "localhost".to_string(),
        default_server: true,
        routes: vec![RouteConfig { root: dir.path().to_string_lossy().into_owned(), ..Default::default() }],
        referrer_url_pattern: Some("http://localhost/*".to_string()),
        ..Default::default()
    };
    spawn_server(cfg);

    let mut stream = connect(port);
    stream
        .write_all(
            b"GET /open.txt HTTP/1.1\r\nHost: localhost\r\nReferer: http://localhost/index.html\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
}

/// Generates a real `crypt(3)` DES hash at test run time (rather than
/// hardcoding a platform-specific digest) so the auth round-trip is
/// self-consistent wherever the test actually executes.
#[cfg(unix)]
fn crypt_hash(password: &str, salt: &str) -> String {
    extern "C" {
        fn crypt(key: *const libc::c_char, salt: *const libc::c_char) -> *mut libc::c_char;
    }
    let key = std::ffi::CString::new(password).unwrap();
    let salt = std::ffi::CString::new(salt).unwrap();
    unsafe {
        let result = crypt(key.as_ptr(), salt.as_ptr());
        assert!(!result.is_null());
        std::ffi::CStr::from_ptr(result).to_string_lossy().into_owned()
    }
}

#[test]
#[cfg(unix)]
fn basic_auth_challenges_then_accepts_correct_credentials() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("private.txt"), b"members only\n").unwrap();
    let hash = crypt_hash("swordfish", "ab");
    std::fs::write(dir.path().join(".htpasswd"), format!("alice:{hash}\n")).unwrap();

    let port = 18184;
    let cfg = ServerConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        server_name: "localhost".to_string(),
        default_server: true,
        routes: vec![RouteConfig { root: dir.path().to_string_lossy().into_owned(), ..Default::default() }],
        ..Default::default()
    };
    spawn_server(cfg);

    // No credentials -> 401 with a challenge.
    let mut stream = connect(port);
    stream
        .write_all(b"GET /private.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 401"), "response: {response}");
    assert!(response.to_ascii_lowercase().contains("www-authenticate"), "response: {response}");

    // Wrong password -> still 401.
    let mut stream = connect(port);
    let auth = base64_encode(b"alice:wrongpass");
    stream
        .write_all(
            format!(
                "GET /private.txt HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {auth}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 401"), "response: {response}");

    // Correct credentials -> 200 with the file body.
    let mut stream = connect(port);
    let auth = base64_encode(b"alice:swordfish");
    stream
        .write_all(
            format!(
                "GET /private.txt HTTP/1.1\r\nHost: localhost\r\nAuthorization: Basic {auth}\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();
    let response = read_response(&mut stream);
    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.ends_with("members only\n"), "response: {response}");
}

fn base64_encode(input: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in input.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(ALPHABET[(b0 >> 2) as usize] as char);
        out.push(ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[(b2 & 0x3f) as usize] as char } else { '=' });
    }
    out
}

#[test]
#[cfg(unix)]
fn invokes_cgi_script_and_relays_its_output() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("hello.cgi");
    std::fs::write(
        &script_path,
        "#!/bin/sh\nprintf 'Content-Type: text/plain\\r\\n\\r\\nhi from cgi\\n'\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&script_path, perms).unwrap();

    let port = 18185;
    let cfg = ServerConfig {
        host: "127.0.0.1".to_string(),
        ports: vec![port],
        server_name: "localhost".to_string(),
        default_server: true,
        routes: vec![RouteConfig { root: dir.path().to_string_lossy().into_owned(), ..Default::default() }],
        cgi_pattern: Some("*.cgi".to_string()),
        ..Default::default()
    };
    spawn_server(cfg);

    let mut stream = connect(port);
    stream
        .write_all(b"GET /hello.cgi HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    thread::sleep(Duration::from_millis(200));
    let response = read_response(&mut stream);

    assert!(response.starts_with("HTTP/1.1 200"), "response: {response}");
    assert!(response.ends_with("hi from cgi\n"), "response: {response}");
}
