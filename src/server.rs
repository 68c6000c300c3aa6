//! The main loop and `CoreContext`: the single process-wide bag of mutable
//! state (listeners, connection arena, throttle table, mapped-file cache,
//! timer wheel) that the original keeps as C statics. Everything here runs
//! on one thread; the only blocking point is `Oracle::wait`.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::cache::MappedFileCache;
use crate::cgi;
use crate::config::ServerConfig;
use crate::conn::{Action, ConnArena, ConnId, ConnState};
use crate::glob::glob_match;
use crate::http::auth::{decode_basic_credentials, verify_password, AuthCache};
use crate::http::date::parse_http_date;
use crate::http::mime::{mime_type_for, ContentEncoding};
use crate::http::range::parse_range;
use crate::http::request::{ParseOutcome, ParsedRequest};
use crate::http::resolve::{expand_tilde, resolve_under_root};
use crate::http::response::{error_body, generate_autoindex, send_mime, status_text};
use crate::http::Method;
use crate::oracle::Oracle;
use crate::signals;
use crate::throttle::ThrottleTable;
use crate::timer::{TimerKind, TimerWheel};

const LISTENER_TOKEN_BASE: usize = 0;
const CONN_TOKEN_BASE: usize = 1 << 20;
const CGI_OUT_TOKEN_BASE: usize = 1 << 21;
const CGI_IN_TOKEN_BASE: usize = 1 << 22;
const IDLE_READ_TIMELIMIT: Duration = Duration::from_secs(60);
const IDLE_SEND_TIMELIMIT: Duration = Duration::from_secs(300);
const LINGER_TIME: Duration = Duration::from_secs(2);
const OCCASIONAL_TIME: Duration = Duration::from_secs(60);
const THROTTLE_PERIOD: Duration = Duration::from_secs(5);
const CGI_TIMELIMIT: Duration = Duration::from_secs(30);

pub struct CoreContext {
    listeners: Vec<TcpListener>,
    configs: Vec<Arc<ServerConfig>>,
    conns: ConnArena,
    oracle: Oracle,
    timers: TimerWheel,
    cache: MappedFileCache,
    throttles: ThrottleTable,
    auth_cache: AuthCache,
    cgi_running: usize,
    shutting_down: bool,
}

impl CoreContext {
    pub fn bind(configs: Vec<ServerConfig>) -> crate::error::Result<Self> {
        let oracle = Oracle::new(1024)?;
        let mut listeners = Vec::new();
        let configs: Vec<Arc<ServerConfig>> = configs.into_iter().map(Arc::new).collect();

        let mut throttle_rules = Vec::new();
        for cfg in &configs {
            for t in &cfg.throttles {
                throttle_rules.push((t.pattern.clone(), t.max_limit, t.min_limit.unwrap_or(0)));
            }
        }

        for cfg in &configs {
            for &port in &cfg.ports {
                let addr: SocketAddr = format!("{}:{}", cfg.host, port).parse()?;
                let mut listener = TcpListener::bind(addr)?;
                let token = Token(LISTENER_TOKEN_BASE + listeners.len());
                oracle.add(&mut listener, token, Interest::READABLE)?;
                tracing::info!(%addr, "listening");
                listeners.push(listener);
            }
        }

        Ok(Self {
            listeners,
            configs,
            conns: ConnArena::new(),
            oracle,
            timers: TimerWheel::new(),
            cache: MappedFileCache::new(256 * 1024 * 1024, 2048),
            throttles: ThrottleTable::new(throttle_rules),
            auth_cache: AuthCache::new(),
            cgi_running: 0,
            shutting_down: false,
        })
    }

    pub fn run(&mut self) -> crate::error::Result<()> {
        signals::install();
        self.timers.create_periodic(OCCASIONAL_TIME, TimerKind::Occasional);
        self.timers.create_periodic(THROTTLE_PERIOD, TimerKind::Throttle);

        loop {
            if signals::take_reopen_logs() {
                tracing::info!("reopen-logs signal received (no-op: tracing writes to stderr)");
            }
            if signals::take_shutdown_requested() {
                self.shutting_down = true;
            }

            let timeout = self.timers.next_timeout_ms().map(Duration::from_millis);
            if let Err(e) = self.oracle.wait(timeout) {
                tracing::error!(error = %e, "oracle wait failed, terminating");
                return Err(e.into());
            }

            let events: Vec<(Token, bool, bool)> =
                self.oracle.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

            for (token, readable, writable) in events {
                if token.0 < CONN_TOKEN_BASE {
                    self.accept_loop(token.0);
                } else if token.0 < CGI_OUT_TOKEN_BASE {
                    let id = ConnId(token.0 - CONN_TOKEN_BASE);
                    self.dispatch(id, readable, writable);
                } else if token.0 < CGI_IN_TOKEN_BASE {
                    if readable {
                        self.handle_cgi_stdout_readable(ConnId(token.0 - CGI_OUT_TOKEN_BASE));
                    }
                } else if writable {
                    self.pump_cgi_stdin(ConnId(token.0 - CGI_IN_TOKEN_BASE));
                }
            }

            self.run_timers();

            if self.shutting_down && self.conns.is_empty() {
                tracing::info!("drained all connections, exiting");
                return Ok(());
            }
        }
    }

    fn accept_loop(&mut self, listener_idx: usize) {
        loop {
            match self.listeners[listener_idx].accept() {
                Ok((stream, peer)) => self.accept_one(stream, peer),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.shutting_down {
            return;
        }
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);
        let configs = self.configs.clone();
        let id = self.conns.insert(stream, configs, peer, local_port);
        let conn = self.conns.get_mut(id).unwrap();
        let token = Token(CONN_TOKEN_BASE + id.0);
        if let Err(e) = self.oracle.add(&mut conn.stream, token, Interest::READABLE) {
            tracing::warn!(error = %e, "failed to register accepted connection");
            self.conns.remove(id);
            return;
        }
        let idle = self.timers.create(IDLE_READ_TIMELIMIT, TimerKind::IdleRead(id));
        let conn = self.conns.get_mut(id).unwrap();
        conn.idle_timer = Some(idle);
        tracing::debug!(%peer, conn = id.0, "accepted connection");
    }

    fn dispatch(&mut self, id: ConnId, readable: bool, writable: bool) {
        if self.conns.get(id).is_none() {
            return;
        }
        let state = self.conns.get(id).unwrap().state;
        match state {
            ConnState::Reading if readable => self.handle_read(id),
            // Pausing is reserved for a connection whose throttle share has
            // dropped to zero; nothing currently drives a connection into
            // it, but dispatch treats it like Sending so it isn't stranded
            // if a future throttle policy starts using it.
            ConnState::Sending | ConnState::Pausing if writable => self.handle_write(id),
            ConnState::Lingering if readable => self.handle_linger_read(id),
            _ => {}
        }
    }

    fn handle_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        conn.touch();
        let eof = conn.read_available();
        if eof {
            conn.closed = true;
        }

        let Some(conn) = self.conns.get_mut(id) else { return };
        let is_cgi = matches!(conn.action, Action::Cgi(_));
        if is_cgi {
            self.pump_cgi_stdin(id);
            if eof {
                self.close_connection(id);
            }
            return;
        }

        let outcome = conn.try_parse();
        match outcome {
            Some(ParseOutcome::Complete(req)) => self.serve_request(id, req),
            Some(ParseOutcome::Failed(err)) => {
                let status = err.status_code();
                self.respond_error(id, status, &format!("{err:?}"));
            }
            None => {
                if eof {
                    self.close_connection(id);
                }
            }
        }
    }

    fn serve_request(&mut self, id: ConnId, req: ParsedRequest) {
        let Some(conn) = self.conns.get(id) else { return };
        let cfg = conn.resolve_config(req.host.as_deref());

        if !req.method.is_allowed(&["GET", "HEAD", "POST", "PUT", "DELETE", "TRACE"].map(String::from)) {
            self.respond_error(id, 501, "method not implemented");
            return;
        }

        if !check_referrer(&req, &cfg) {
            self.respond_error(id, 403, "referrer rejected");
            return;
        }

        let mut root_string = cfg.root_for(&req);
        let mut effective_path = req.decoded_path.clone();
        let mut tilde_applied = false;

        if let Some(postfix) = &cfg.tilde_user_postfix {
            if let Some(tail) = effective_path.trim_start_matches('/').strip_prefix('~') {
                match expand_tilde(&format!("~{tail}"), postfix) {
                    Some((mapped, _user)) => {
                        root_string = "/".to_string();
                        effective_path = format!("/{}", mapped.trim_start_matches('/'));
                        tilde_applied = true;
                    }
                    None => {
                        self.respond_error(id, 404, "unknown user");
                        return;
                    }
                }
            }
        }

        if !tilde_applied && cfg.vhost {
            if let Some(host) = req.host.as_deref() {
                let hostname = host.split(':').next().unwrap_or(host);
                root_string = format!("{}/{}", root_string.trim_end_matches('/'), hostname);
            }
        }

        let root = Path::new(&root_string);
        let Some(resolved) = resolve_under_root(root, &effective_path, cfg.symlink_check) else {
            self.respond_error(id, 403, "path escapes document root");
            return;
        };

        let meta = match std::fs::metadata(&resolved) {
            Ok(m) => m,
            Err(_) => {
                self.respond_error(id, 404, "not found");
                return;
            }
        };

        let auth_dir: &Path = if meta.is_dir() { &resolved } else { resolved.parent().unwrap_or(root) };
        if !self.check_auth(id, auth_dir, root, &req, &cfg) {
            return;
        }

        if meta.is_dir() {
            if !req.raw_url.ends_with('/') {
                self.respond_redirect(id, format!("{}/", req.raw_url));
                return;
            }
            if let Some(index_path) = find_index_file(&resolved, &cfg.index_files) {
                self.serve_static(id, &index_path, &req, &cfg);
            } else if cfg.routes.iter().any(|r| r.autoindex) {
                self.serve_autoindex(id, &resolved, &req.decoded_path);
            } else {
                self.respond_error(id, 403, "directory listing disabled");
            }
            return;
        }

        if let Some(pattern) = &cfg.cgi_pattern {
            if glob_match(pattern, &req.decoded_path) {
                self.serve_cgi(id, &resolved, &req, &cfg);
                return;
            }
        }

        if !matches!(req.method, Method::Get | Method::Head) {
            self.respond_error(id, 501, "method not implemented for static content");
            return;
        }

        self.serve_static(id, &resolved, &req, &cfg);
    }

    fn serve_static(&mut self, id: ConnId, path: &Path, req: &ParsedRequest, cfg: &ServerConfig) {
        let wants_gzip = req
            .header("accept-encoding")
            .is_some_and(|v| v.split(',').any(|e| e.trim().eq_ignore_ascii_case("gzip")));
        let gz_path = gzip_companion_path(path);
        let (serve_path, encoding) = if wants_gzip && gz_path.is_file() {
            (gz_path, ContentEncoding::Gzip)
        } else {
            (path.to_path_buf(), ContentEncoding::Identity)
        };

        let meta = match std::fs::metadata(&serve_path) {
            Ok(m) => m,
            Err(_) => {
                self.respond_error(id, 404, "not found");
                return;
            }
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if req.if_modified_since >= 0 && req.if_modified_since >= mtime {
            let Some(conn) = self.conns.get_mut(id) else { return };
            let resp = send_mime(304, "text/plain", ContentEncoding::Identity, 0, Some(mtime), None, 0, cfg);
            conn.queue_bytes(&resp.into_bytes(status_text(304)));
            self.finish_headers_only(id);
            return;
        }

        // A Range header is only honored when If-Range (if present) still
        // matches the current mtime; otherwise the full entity is served.
        let range_ok = match req.header("if-range") {
            None => true,
            Some(v) => {
                let parsed = parse_http_date(v);
                parsed >= 0 && parsed == mtime
            }
        };

        match self.cache.map(&serve_path) {
            Ok(address) => {
                let bytes = address.as_bytes();
                let full_size = bytes.len() as u64;
                let range = if range_ok { req.header("range").and_then(|r| parse_range(r, full_size)) } else { None };
                let mime = mime_type_for(path.to_string_lossy().as_ref());

                let body: Vec<u8> = match range {
                    Some(r) => bytes[r.start as usize..=r.end as usize].to_vec(),
                    None => bytes.to_vec(),
                };
                self.cache.unmap(&serve_path);

                let filename = path.to_string_lossy().to_string();
                let Some(binding) = self.throttles.bind(&filename, id) else {
                    self.respond_error(id, 503, "throttle rate exceeded");
                    return;
                };

                let is_head = matches!(req.method, Method::Head);
                let Some(conn) = self.conns.get_mut(id) else {
                    self.throttles.unbind(&binding, id);
                    return;
                };
                conn.throttle_binding = Some(binding);
                let resp = send_mime(
                    200,
                    mime,
                    encoding,
                    body.len() as u64,
                    Some(mtime),
                    range,
                    full_size,
                    cfg,
                );
                let status = resp.status;
                let mut bytes_out = resp.into_bytes(status_text(status));
                if !is_head {
                    bytes_out.extend_from_slice(&body);
                }
                conn.queue_bytes(&bytes_out);
                self.begin_send(id);
            }
            Err(_) => self.respond_error(id, 500, "failed to map file"),
        }
    }

    fn serve_autoindex(&mut self, id: ConnId, dir: &Path, url_path: &str) {
        let body = generate_autoindex(dir, url_path);
        let Some(conn) = self.conns.get_mut(id) else { return };
        let mut header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        header.extend_from_slice(&body);
        conn.queue_bytes(&header);
        self.begin_send(id);
    }

    fn respond_redirect(&mut self, id: ConnId, location: String) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        let bytes = format!(
            "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )
        .into_bytes();
        conn.queue_bytes(&bytes);
        self.begin_send(id);
    }

    fn respond_error(&mut self, id: ConnId, status: u16, detail: &str) {
        let Some(conn) = self.conns.get(id) else { return };
        let cfg = conn.configs.first().cloned();
        let body = error_body(status, detail, cfg.as_ref());
        let Some(conn) = self.conns.get_mut(id) else { return };
        let mut header = format!(
            "HTTP/1.1 {status} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status_text(status),
            body.len()
        )
        .into_bytes();
        header.extend_from_slice(&body);
        conn.queue_bytes(&header);
        self.begin_send(id);
    }

    fn finish_headers_only(&mut self, id: ConnId) {
        self.begin_send(id);
    }

    fn begin_send(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        conn.state = ConnState::Sending;
        if let Some(t) = conn.idle_timer.take() {
            self.timers.cancel(t);
        }
        let timer = self.timers.create(IDLE_SEND_TIMELIMIT, TimerKind::IdleSend(id));
        conn.idle_timer = Some(timer);
        let token = Token(CONN_TOKEN_BASE + id.0);
        let _ = self.oracle.modify(&mut conn.stream, token, Interest::WRITABLE);
    }

    fn handle_write(&mut self, id: ConnId) {
        let binding = self.conns.get(id).and_then(|c| c.throttle_binding);
        let budget = binding.map(|b| b.max_limit).unwrap_or(u64::MAX).min(1 << 20);
        let Some(conn) = self.conns.get_mut(id) else { return };
        let result = conn.write_budgeted(budget);
        match result {
            Ok(written) => {
                if written > 0 {
                    if let Some(b) = binding {
                        self.throttles.record_bytes(&b, written);
                    }
                }
            }
            Err(_) => {
                if let Some(conn) = self.conns.get_mut(id) {
                    conn.closed = true;
                }
            }
        }
        let Some(conn) = self.conns.get(id) else { return };
        if conn.write_buf.is_empty() && !matches!(conn.action, Action::Cgi(_)) {
            if conn.closed {
                self.close_connection(id);
            } else {
                self.begin_linger(id);
            }
        }
    }

    /// Shuts down the write half and gives the client a grace period to
    /// send any trailing bytes before the connection is torn down, rather
    /// than tearing down immediately and risking an RST on data the client
    /// was still writing.
    fn begin_linger(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        if let Some(t) = conn.idle_timer.take() {
            self.timers.cancel(t);
        }
        conn.begin_linger(Instant::now() + LINGER_TIME);
        let timer = self.timers.create(LINGER_TIME, TimerKind::Linger(id));
        let Some(conn) = self.conns.get_mut(id) else { return };
        conn.linger_timer = Some(timer);
        let token = Token(CONN_TOKEN_BASE + id.0);
        let _ = self.oracle.modify(&mut conn.stream, token, Interest::READABLE);
    }

    fn handle_linger_read(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        let mut buf = [0u8; 512];
        match conn.stream.read(&mut buf) {
            Ok(0) => self.close_connection(id),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => self.close_connection(id),
        }
    }

    fn run_timers(&mut self) {
        for kind in self.timers.run() {
            match kind {
                TimerKind::IdleRead(id) => self.timeout_connection(id, 408),
                TimerKind::IdleSend(id) => self.close_connection(id),
                TimerKind::Linger(id) => self.close_connection(id),
                TimerKind::CgiTimeout(id) => self.kill_cgi(id),
                TimerKind::Throttle => {
                    self.throttles.periodic_update();
                    for (conn_id, binding) in self.throttles.rebalance() {
                        if let Some(conn) = self.conns.get_mut(conn_id) {
                            conn.throttle_binding = Some(binding);
                        }
                    }
                }
                TimerKind::Occasional => self.cache.cleanup(),
            }
        }
    }

    fn timeout_connection(&mut self, id: ConnId, status: u16) {
        if self.conns.get(id).is_some() {
            self.respond_error(id, status, "idle timeout");
        }
    }

    fn deregister_cgi(&mut self, proc: &mut cgi::CgiProcess) {
        let _ = self.oracle.del(&mut proc.out_pipe);
        if let Some(mut in_pipe) = proc.in_pipe.take() {
            let _ = self.oracle.del(&mut in_pipe);
        }
        self.cgi_running = self.cgi_running.saturating_sub(1);
    }

    fn kill_cgi(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        if let Action::Cgi(proc) = &mut conn.action {
            let _ = proc.child.kill();
            let _ = proc.child.wait();
        }
        if let Action::Cgi(mut proc) = std::mem::replace(&mut conn.action, Action::None) {
            self.deregister_cgi(&mut proc);
        }
        let Some(conn) = self.conns.get_mut(id) else { return };
        conn.cgi_timer = None;
        conn.closed = true;
    }

    fn close_connection(&mut self, id: ConnId) {
        if let Some(mut conn) = self.conns.remove(id) {
            if let Some(binding) = conn.throttle_binding.take() {
                self.throttles.unbind(&binding, id);
            }
            if let Some(t) = conn.idle_timer.take() {
                self.timers.cancel(t);
            }
            if let Some(t) = conn.linger_timer.take() {
                self.timers.cancel(t);
            }
            if let Some(t) = conn.cgi_timer.take() {
                self.timers.cancel(t);
            }
            let _ = self.oracle.del(&mut conn.stream);
            if let Action::Cgi(mut proc) = std::mem::replace(&mut conn.action, Action::None) {
                self.deregister_cgi(&mut proc);
                let _ = proc.child.kill();
                let _ = proc.child.wait();
            }
        }
    }

    fn check_auth(&mut self, id: ConnId, dir: &Path, root: &Path, req: &ParsedRequest, cfg: &ServerConfig) -> bool {
        let mut auth_file = dir.join(&cfg.auth_filename);
        if !auth_file.is_file() {
            if cfg.global_passwd {
                auth_file = root.join(&cfg.auth_filename);
            }
            if !auth_file.is_file() {
                return true;
            }
        }

        let Some((user, pass)) = req.header("authorization").and_then(decode_basic_credentials) else {
            self.challenge_auth(id, cfg);
            return false;
        };

        let Some(hash) = self.auth_cache.lookup(&auth_file, &user) else {
            self.challenge_auth(id, cfg);
            return false;
        };

        if !verify_password(&pass, &hash) {
            self.challenge_auth(id, cfg);
            return false;
        }

        if let Some(conn) = self.conns.get_mut(id) {
            conn.auth_user = Some(user);
        }
        true
    }

    fn challenge_auth(&mut self, id: ConnId, cfg: &ServerConfig) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        let body = b"<html><head><title>401 Unauthorized</title></head><body>\n\
                      <h1>Unauthorized</h1>\n</body></html>\n";
        let mut bytes = format!(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"{}\"\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            cfg.server_name,
            body.len(),
        )
        .into_bytes();
        bytes.extend_from_slice(body);
        conn.queue_bytes(&bytes);
        self.begin_send(id);
    }

    /// Launches a CGI subprocess for `script_path`. Scoped to requests whose
    /// body (if any) is already fully buffered by the time headers finish
    /// parsing, or arrives afterward via ordinary socket reads — there's no
    /// support here for a request whose body interleaves with a response
    /// already streaming back, which a real concurrent CGI pipeline would
    /// need.
    fn serve_cgi(&mut self, id: ConnId, script_path: &Path, req: &ParsedRequest, cfg: &ServerConfig) {
        if self.cgi_running >= cfg.cgi_limit {
            self.respond_error(id, 503, "cgi concurrency limit reached");
            return;
        }
        let Some(conn) = self.conns.get(id) else { return };
        let server_name = req.host.clone().unwrap_or_else(|| cfg.server_name.clone());
        let server_port = conn.local_port;
        let remote_addr = conn.peer.ip().to_string();
        let auth_user = conn.auth_user.clone();

        let path_translated = script_path.to_string_lossy().into_owned();
        let working_dir = script_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        let needs_stdin = req.content_length.unwrap_or(0) > 0;

        let env = cgi::build_cgi_env(
            req,
            &server_name,
            server_port,
            &req.decoded_path,
            "",
            &path_translated,
            &remote_addr,
            auth_user.as_deref(),
        );
        let argv = cgi::cgi_argv(&path_translated, req.query.as_deref());

        let mut proc = match cgi::spawn_cgi(script_path, &working_dir, &argv, &env, needs_stdin) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, path = %path_translated, "cgi spawn failed");
                self.respond_error(id, 500, "cgi launch failed");
                return;
            }
        };
        proc.body_remaining = req.content_length.unwrap_or(0);

        let out_token = Token(CGI_OUT_TOKEN_BASE + id.0);
        if let Err(e) = self.oracle.add(&mut proc.out_pipe, out_token, Interest::READABLE) {
            tracing::warn!(error = %e, "failed to register cgi stdout");
            self.respond_error(id, 500, "cgi registration failed");
            return;
        }

        self.cgi_running += 1;
        let timer = self.timers.create(CGI_TIMELIMIT, TimerKind::CgiTimeout(id));

        let Some(conn) = self.conns.get_mut(id) else { return };
        conn.cgi_timer = Some(timer);
        conn.action = Action::Cgi(proc);
        self.pump_cgi_stdin(id);

        let Some(conn) = self.conns.get_mut(id) else { return };
        if let Action::Cgi(proc) = &mut conn.action {
            if let Some(in_pipe) = proc.in_pipe.as_mut() {
                let in_token = Token(CGI_IN_TOKEN_BASE + id.0);
                let _ = self.oracle.add(in_pipe, in_token, Interest::WRITABLE);
            }
        }
    }

    /// Feeds whatever's left of the request body (already in `read_buf`,
    /// or fed incrementally as the client sends more) into the CGI
    /// process's stdin, closing it once `Content-Length` bytes are in.
    fn pump_cgi_stdin(&mut self, id: ConnId) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        if conn.read_buf.is_empty() {
            return;
        }
        let Action::Cgi(proc) = &mut conn.action else { return };
        if proc.body_remaining == 0 {
            return;
        }
        let take = conn.read_buf.len().min(proc.body_remaining as usize);
        let chunk = conn.read_buf[..take].to_vec();
        match cgi::feed_cgi_stdin(proc, &chunk) {
            Ok(written) => {
                conn.read_buf.drain(..written);
                proc.body_remaining -= written as u64;
                if proc.body_remaining == 0 {
                    cgi::close_cgi_stdin(proc);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => conn.closed = true,
        }
    }

    fn handle_cgi_stdout_readable(&mut self, id: ConnId) {
        let mut new_data = Vec::new();
        let mut eof = false;
        if let Some(conn) = self.conns.get_mut(id) {
            if let Action::Cgi(proc) = &mut conn.action {
                let mut buf = [0u8; 8192];
                loop {
                    match proc.out_pipe.read(&mut buf) {
                        Ok(0) => {
                            eof = true;
                            break;
                        }
                        Ok(n) => new_data.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(_) => {
                            eof = true;
                            break;
                        }
                    }
                }
            }
        }

        if let Some(conn) = self.conns.get_mut(id) {
            if let Action::Cgi(proc) = &mut conn.action {
                let (header, body) = cgi::process_cgi_stdout(proc, &new_data);
                if let Some(h) = header {
                    conn.queue_bytes(&h);
                }
                conn.queue_bytes(&body);
            }
        }

        if eof {
            let mut finished_proc = None;
            if let Some(conn) = self.conns.get_mut(id) {
                if let Action::Cgi(proc) = std::mem::replace(&mut conn.action, Action::None) {
                    finished_proc = Some(proc);
                }
            }
            if let Some(mut proc) = finished_proc {
                let _ = proc.child.wait();
                self.deregister_cgi(&mut proc);
            }
            if let Some(conn) = self.conns.get_mut(id) {
                if let Some(t) = conn.cgi_timer.take() {
                    self.timers.cancel(t);
                }
            }
        }

        if self.conns.get(id).is_some_and(|c| !c.write_buf.is_empty()) {
            self.begin_send(id);
            // The client socket may already have shown up writable in this
            // same readiness batch; flush immediately instead of waiting
            // for the next `wait()` to notice.
            if self.oracle.check(Token(CONN_TOKEN_BASE + id.0)) {
                self.handle_write(id);
            }
        }
    }
}

fn find_index_file(dir: &Path, names: &[String]) -> Option<PathBuf> {
    names.iter().map(|n| dir.join(n)).find(|p| p.is_file())
}

fn gzip_companion_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".gz");
    PathBuf::from(s)
}

/// Extracts and lowercases the host (no port) from an absolute
/// `http://`/`https://` URL, as found in a `Referer` header.
fn extract_host(url: &str) -> Option<String> {
    let rest = url.strip_prefix("http://").or_else(|| url.strip_prefix("https://"))?;
    let host_port = rest.split('/').next().unwrap_or(rest);
    let host = host_port.split(':').next().unwrap_or(host_port);
    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}

/// Rejects the request per `cfg.referrer_url_pattern`/`local_host_pattern`/
/// `no_empty_referrers`, when any of those are configured. An unconfigured
/// server (the common case) always passes.
fn check_referrer(req: &ParsedRequest, cfg: &ServerConfig) -> bool {
    if cfg.referrer_url_pattern.is_none() && cfg.local_host_pattern.is_none() && !cfg.no_empty_referrers {
        return true;
    }

    let Some(referer) = req.header("referer") else {
        return !cfg.no_empty_referrers;
    };

    if let Some(pattern) = &cfg.referrer_url_pattern {
        if glob_match(pattern, referer) {
            return true;
        }
    }

    if let Some(pattern) = &cfg.local_host_pattern {
        if let Some(host) = extract_host(referer) {
            if glob_match(pattern, &host) {
                return true;
            }
        }
    }

    cfg.referrer_url_pattern.is_none() && cfg.local_host_pattern.is_none()
}

impl ServerConfig {
    /// Resolves which configured route root applies; falls back to the
    /// server-level default when no route entry overrides it.
    pub fn root_for(&self, req: &ParsedRequest) -> String {
        self.routes
            .iter()
            .filter(|r| req.decoded_path.starts_with(&r.path))
            .max_by_key(|r| r.path.len())
            .map(|r| r.root.clone())
            .unwrap_or_else(|| self.routes.first().map(|r| r.root.clone()).unwrap_or_else(|| "./www".to_string()))
    }
}

pub fn startup_summary(ctx: &CoreContext) -> String {
    format!("{} listener(s), {} connection(s) active", ctx.listeners.len(), ctx.conns.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_for_picks_longest_matching_route_prefix() {
        let mut cfg = ServerConfig::default();
        cfg.routes = vec![
            crate::config::RouteConfig { path: "/".into(), root: "./www".into(), ..Default::default() },
            crate::config::RouteConfig { path: "/api".into(), root: "./api-root".into(), ..Default::default() },
        ];
        let req = ParsedRequest {
            method: Method::Get,
            raw_url: "/api/users".into(),
            decoded_path: "/api/users".into(),
            query: None,
            version: Some((1, 1)),
            headers: Default::default(),
            host: None,
            content_length: None,
            if_modified_since: -1,
            keep_alive_hint: false,
        };
        assert_eq!(cfg.root_for(&req), "./api-root");
    }

    fn req_with_referer(referer: Option<&str>) -> ParsedRequest {
        let mut headers = std::collections::HashMap::new();
        if let Some(r) = referer {
            headers.insert("referer".to_string(), r.to_string());
        }
        ParsedRequest {
            method: Method::Get,
            raw_url: "/x".into(),
            decoded_path: "/x".into(),
            query: None,
            version: Some((1, 1)),
            headers,
            host: None,
            content_length: None,
            if_modified_since: -1,
            keep_alive_hint: false,
        }
    }

    #[test]
    fn unconfigured_referrer_check_always_passes() {
        let cfg = ServerConfig::default();
        assert!(check_referrer(&req_with_referer(None), &cfg));
        assert!(check_referrer(&req_with_referer(Some("http://anywhere/x")), &cfg));
    }

    #[test]
    fn rejects_empty_referrer_when_required() {
        let mut cfg = ServerConfig::default();
        cfg.no_empty_referrers = true;
        assert!(!check_referrer(&req_with_referer(None), &cfg));
        assert!(check_referrer(&req_with_referer(Some("http://x/y")), &cfg));
    }

    #[test]
    fn matches_against_local_host_pattern() {
        let mut cfg = ServerConfig::default();
        cfg.local_host_pattern = Some("*.example.com".to_string());
        assert!(check_referrer(&req_with_referer(Some("http://www.example.com/page")), &cfg));
        assert!(!check_referrer(&req_with_referer(Some("http://evil.org/page")), &cfg));
    }

    #[test]
    fn extract_host_strips_scheme_port_and_path() {
        assert_eq!(extract_host("http://Example.com:8080/a/b"), Some("example.com".to_string()));
        assert_eq!(extract_host("not-a-url"), None);
    }

    #[test]
    fn gzip_companion_path_appends_gz_extension() {
        let p = gzip_companion_path(Path::new("/var/www/app.js"));
        assert_eq!(p, Path::new("/var/www/app.js.gz"));
    }
}
