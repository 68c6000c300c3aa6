//! CGI/1.1 subprocess supervision: environment assembly, fork/exec,
//! parsed-headers vs. non-parsed-headers output handling, and
//! timeout-based reaping.

use std::collections::HashMap;
use std::io::Write as _;
use std::os::fd::FromRawFd;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Instant;

use mio::net::UnixStream;

use crate::http::request::ParsedRequest;

pub const HEADER_SCAN_LIMIT: usize = 1 << 16;

#[derive(Debug, PartialEq, Eq)]
pub enum CgiOutputState {
    /// Accumulating bytes looking for the blank-line header terminator.
    ScanningHeaders,
    /// Headers resolved (or skipped for nph-/raw passthrough); streaming
    /// the remaining bytes straight through.
    StreamingBody,
}

pub struct CgiProcess {
    pub child: std::process::Child,
    pub out_pipe: UnixStream,
    pub in_pipe: Option<UnixStream>,
    pub output_state: CgiOutputState,
    pub header_buf: Vec<u8>,
    pub raw_passthrough: bool,
    pub started_at: Instant,
    pub body_remaining: u64,
}

/// Builds the CGI/1.1 environment variable set for `req`, mirroring
/// thttpd's `cgi_interpose_input`/`add_cgi_vars` variable list.
pub fn build_cgi_env(
    req: &ParsedRequest,
    server_name: &str,
    server_port: u16,
    script_name: &str,
    path_info: &str,
    path_translated: &str,
    remote_addr: &str,
    auth_user: Option<&str>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("SERVER_SOFTWARE".into(), "thttpd_core".into());
    env.insert("SERVER_NAME".into(), server_name.into());
    env.insert("SERVER_PORT".into(), server_port.to_string());
    env.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
    env.insert("REQUEST_METHOD".into(), req.method.as_str().into());
    env.insert("PATH_INFO".into(), path_info.into());
    env.insert("PATH_TRANSLATED".into(), path_translated.into());
    env.insert("SCRIPT_NAME".into(), script_name.into());
    env.insert("QUERY_STRING".into(), req.query.clone().unwrap_or_default());
    env.insert("REMOTE_ADDR".into(), remote_addr.into());

    if let Some(ct) = req.header("content-type") {
        env.insert("CONTENT_TYPE".into(), ct.to_string());
    }
    if let Some(len) = req.content_length {
        env.insert("CONTENT_LENGTH".into(), len.to_string());
    }
    if let Some(user) = auth_user {
        env.insert("AUTH_TYPE".into(), "Basic".into());
        env.insert("REMOTE_USER".into(), user.to_string());
    }

    for (k, v) in &req.headers {
        let var = format!("HTTP_{}", k.to_ascii_uppercase().replace('-', "_"));
        env.insert(var, v.clone());
    }

    env
}

/// Splits a query string into a decoded argv vector the way thttpd's
/// CGI launcher does: if the query contains no `=`, it's treated as a
/// `+`-joined list of percent-encoded words; otherwise the script alone
/// is passed (the query is left for the CGI to read from
/// `QUERY_STRING`).
pub fn cgi_argv(script_path: &str, query: Option<&str>) -> Vec<String> {
    let mut argv = vec![script_path.to_string()];
    if let Some(q) = query {
        if !q.is_empty() && !q.contains('=') {
            for word in q.split('+') {
                argv.push(crate::http::resolve::percent_decode(word));
            }
        }
    }
    argv
}

/// Spawns the CGI child with stdio wired through pipes. Returns the
/// process handle plus `mio`-pollable ends of the output (and, for
/// methods carrying a body, input) pipes. The script's binary name
/// starting with `nph-` (or the request entirely lacking MIME headers in
/// its own output — decided once bytes start arriving) marks the
/// response as passed straight through with no header rewriting.
pub fn spawn_cgi(
    script_path: &Path,
    working_dir: &Path,
    argv: &[String],
    env: &HashMap<String, String>,
    needs_stdin: bool,
) -> std::io::Result<CgiProcess> {
    let file_name = script_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let raw_passthrough = file_name.starts_with("nph-");

    let mut cmd = Command::new(script_path);
    cmd.args(&argv[1..])
        .current_dir(working_dir)
        .env_clear()
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    cmd.stdin(if needs_stdin { Stdio::piped() } else { Stdio::null() });

    let mut child = cmd.spawn()?;

    let stdout = child.stdout.take().expect("piped stdout");
    let out_pipe = wrap_pipe_as_unix_stream(stdout)?;

    let in_pipe = if needs_stdin {
        let stdin = child.stdin.take().expect("piped stdin");
        Some(wrap_pipe_as_unix_stream(stdin)?)
    } else {
        None
    };

    Ok(CgiProcess {
        child,
        out_pipe,
        in_pipe,
        output_state: if raw_passthrough {
            CgiOutputState::StreamingBody
        } else {
            CgiOutputState::ScanningHeaders
        },
        header_buf: Vec::new(),
        raw_passthrough,
        started_at: Instant::now(),
        body_remaining: 0,
    })
}

/// `std::process::{ChildStdin, ChildStdout}` and `mio::net::UnixStream`
/// are both thin wrappers over a raw fd; reusing the pipe fd as a
/// `UnixStream` lets the same readiness oracle registration path handle
/// CGI pipes and client sockets uniformly, the same trick the teacher's
/// interposer plumbing relies on.
fn wrap_pipe_as_unix_stream<T: std::os::fd::IntoRawFd>(handle: T) -> std::io::Result<UnixStream> {
    let fd = handle.into_raw_fd();
    set_nonblocking(fd)?;
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    Ok(UnixStream::from_std(std_stream))
}

fn set_nonblocking(fd: std::os::fd::RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Feeds new stdout bytes through the output interposer state machine.
/// While scanning headers, accumulates into `header_buf` until a blank
/// line is found, at which point it derives a status code (`Status:` /
/// `Location:` / default 200) and returns the synthesized status line +
/// remaining headers + any body bytes that arrived after the blank line
/// in the same read. Once streaming, bytes pass straight into the
/// returned body chunk.
pub fn process_cgi_stdout(proc: &mut CgiProcess, new_data: &[u8]) -> (Option<Vec<u8>>, Vec<u8>) {
    if proc.raw_passthrough || proc.output_state == CgiOutputState::StreamingBody {
        return (None, new_data.to_vec());
    }

    proc.header_buf.extend_from_slice(new_data);
    let Some(pos) = find_blank_line(&proc.header_buf) else {
        if proc.header_buf.len() > HEADER_SCAN_LIMIT {
            // Runaway header block: give up distinguishing headers from
            // body and just start streaming what we have.
            proc.output_state = CgiOutputState::StreamingBody;
            let body = std::mem::take(&mut proc.header_buf);
            return (None, body);
        }
        return (None, Vec::new());
    };

    let (header_bytes, delim_len) = pos;
    let header_text = String::from_utf8_lossy(&proc.header_buf[..header_bytes]).into_owned();
    let body_start = proc.header_buf[header_bytes + delim_len..].to_vec();
    proc.output_state = CgiOutputState::StreamingBody;
    proc.header_buf.clear();

    let (status, headers) = parse_cgi_headers(&header_text);
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, crate::http::response::status_text(status));
    for (k, v) in &headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");

    (Some(out.into_bytes()), body_start)
}

fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find_subsequence(buf, b"\r\n\r\n") {
        Some((pos, 4))
    } else {
        find_subsequence(buf, b"\n\n").map(|pos| (pos, 2))
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_cgi_headers(text: &str) -> (u16, Vec<(String, String)>) {
    let mut status = 200;
    let mut headers = Vec::new();
    let mut saw_location = false;
    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        match key.as_str() {
            "status" => {
                status = value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
            }
            "location" => {
                saw_location = true;
                headers.push((key, value));
            }
            _ => headers.push((key, value)),
        }
    }
    if saw_location && status == 200 {
        status = 302;
    }
    (status, headers)
}

/// Input interposer: writes up to `Content-Length` bytes to the child's
/// stdin, draining any already-buffered prefix first.
pub fn feed_cgi_stdin(proc: &mut CgiProcess, data: &[u8]) -> std::io::Result<usize> {
    match &mut proc.in_pipe {
        Some(pipe) => pipe.write(data),
        None => Ok(0),
    }
}

pub fn close_cgi_stdin(proc: &mut CgiProcess) {
    proc.in_pipe = None;
}
