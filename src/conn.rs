//! Connection pool and per-connection state machine.
//!
//! thttpd keeps one big `connects[]` array of `connecttab` structs indexed by
//! a file descriptor and threads a free-list through it via
//! `numfree`/`freeconnects`. We keep the same shape but swap the raw
//! pointer/fd indexing for an index-based arena (`Vec<Slot>` plus a
//! `free_head`), and the C `cnum` state enum becomes `ConnState`.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use mio::net::{TcpStream, UnixStream};

use crate::cgi::CgiProcess;
use crate::config::ServerConfig;
use crate::http::request::{ParseOutcome, RequestParser};
use crate::http::response::ResponseWriter;
use crate::throttle::ThrottleBinding;
use crate::timer::TimerId;

pub const READ_BUF_SIZE: usize = 8192;
pub const MAX_REQUEST_BUFFER: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Sending,
    Pausing,
    Lingering,
}

/// What's currently producing bytes for the send side of a connection.
pub enum Action {
    None,
    File { file: File, remaining: u64 },
    Cgi(CgiProcess),
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::None => write!(f, "Action::None"),
            Action::File { remaining, .. } => write!(f, "Action::File(remaining={remaining})"),
            Action::Cgi(_) => write!(f, "Action::Cgi"),
        }
    }
}

pub struct Connection {
    pub stream: TcpStream,
    pub state: ConnState,
    pub read_buf: Vec<u8>,
    pub write_buf: VecDeque<u8>,
    pub parser: RequestParser,
    pub response: Option<ResponseWriter>,
    pub action: Action,
    pub configs: Vec<Arc<ServerConfig>>,
    pub closed: bool,
    pub keep_alive: bool,
    pub bytes_sent_this_throttle_period: u64,
    pub throttle_binding: Option<ThrottleBinding>,
    pub idle_timer: Option<TimerId>,
    pub linger_timer: Option<TimerId>,
    pub linger_deadline: Option<Instant>,
    pub last_active: Instant,
    pub peer: SocketAddr,
    pub local_port: u16,
    pub cgi_timer: Option<TimerId>,
    pub auth_user: Option<String>,
}

impl Connection {
    fn reset_for_reuse(
        stream: TcpStream,
        configs: Vec<Arc<ServerConfig>>,
        peer: SocketAddr,
        local_port: u16,
    ) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            read_buf: Vec::new(),
            write_buf: VecDeque::new(),
            parser: RequestParser::new(),
            response: None,
            action: Action::None,
            configs,
            closed: false,
            keep_alive: true,
            bytes_sent_this_throttle_period: 0,
            throttle_binding: None,
            idle_timer: None,
            linger_timer: None,
            linger_deadline: None,
            last_active: Instant::now(),
            peer,
            local_port,
            cgi_timer: None,
            auth_user: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn resolve_config(&self, host_header: Option<&str>) -> Arc<ServerConfig> {
        if let Some(host) = host_header {
            let hostname = host.split(':').next().unwrap_or("");
            for cfg in &self.configs {
                if cfg.server_name == hostname {
                    return Arc::clone(cfg);
                }
            }
        }
        for cfg in &self.configs {
            if cfg.default_server {
                return Arc::clone(cfg);
            }
        }
        Arc::clone(&self.configs[0])
    }

    /// Drains the socket into `read_buf`. Returns `true` if the peer has
    /// closed (EOF) or a hard read error occurred.
    pub fn read_available(&mut self) -> bool {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => {
                    self.read_buf.extend_from_slice(&buf[..n]);
                    if self.read_buf.len() >= MAX_REQUEST_BUFFER {
                        return false;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }
    }

    /// Parses as many complete requests as are buffered, returning the
    /// parse outcome for the first pending one found (thttpd processes one
    /// request at a time per connection; pipelined bytes wait in
    /// `read_buf` until the response for the current request is sent).
    pub fn try_parse(&mut self) -> Option<ParseOutcome> {
        self.parser.feed(&mut self.read_buf)
    }

    /// Writes up to `max_bytes` of buffered output (the throttle-imposed
    /// budget for this tick). Returns `Ok(bytes_written)`; a `WouldBlock`
    /// is swallowed and reported as zero bytes written.
    pub fn write_budgeted(&mut self, max_bytes: u64) -> io::Result<u64> {
        if max_bytes == 0 || self.write_buf.is_empty() {
            return Ok(0);
        }
        let n = self.write_buf.len().min(max_bytes as usize);
        let (first, second) = self.write_buf.as_slices();
        let chunk: Vec<u8> = if n <= first.len() {
            first[..n].to_vec()
        } else {
            let mut v = first.to_vec();
            v.extend_from_slice(&second[..n - first.len()]);
            v
        };
        match self.stream.write(&chunk) {
            Ok(written) => {
                self.write_buf.drain(..written);
                Ok(written as u64)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.write_buf.extend(bytes.iter().copied());
    }

    pub fn begin_linger(&mut self, until: Instant) {
        let _ = self.stream.shutdown(Shutdown::Write);
        self.state = ConnState::Lingering;
        self.linger_deadline = Some(until);
    }

    pub fn cgi_interposer_streams(&self) -> Option<(&UnixStream, Option<&UnixStream>)> {
        match &self.action {
            Action::Cgi(proc) => Some((&proc.out_pipe, proc.in_pipe.as_ref())),
            _ => None,
        }
    }
}

enum Slot {
    Occupied(Connection),
    Free(Option<usize>),
}

/// Index-based connection arena. `free_head` threads a singly-linked free
/// list through vacated slots so `alloc`/`free` are O(1) with no shifting.
pub struct ConnArena {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    live_count: usize,
}

impl ConnArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    pub fn insert(
        &mut self,
        stream: TcpStream,
        configs: Vec<Arc<ServerConfig>>,
        peer: SocketAddr,
        local_port: u16,
    ) -> ConnId {
        let conn = Connection::reset_for_reuse(stream, configs, peer, local_port);
        self.live_count += 1;
        if let Some(idx) = self.free_head {
            let next_free = match &self.slots[idx] {
                Slot::Free(n) => *n,
                Slot::Occupied(_) => unreachable!("free list pointed at occupied slot"),
            };
            self.free_head = next_free;
            self.slots[idx] = Slot::Occupied(conn);
            ConnId(idx)
        } else {
            self.slots.push(Slot::Occupied(conn));
            ConnId(self.slots.len() - 1)
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        match self.slots.get(id.0) {
            Some(Slot::Occupied(c)) => Some(c),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Occupied(c)) => Some(c),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        if !matches!(self.slots.get(id.0), Some(Slot::Occupied(_))) {
            return None;
        }
        let prev = std::mem::replace(&mut self.slots[id.0], Slot::Free(self.free_head));
        self.free_head = Some(id.0);
        self.live_count -= 1;
        match prev {
            Slot::Occupied(c) => Some(c),
            Slot::Free(_) => None,
        }
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Occupied(_) => Some(ConnId(i)),
            Slot::Free(_) => None,
        })
    }
}

impl Default for ConnArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_stream() -> (TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let peer = client.local_addr().unwrap();
        client.set_nonblocking(true).unwrap();
        (TcpStream::from_std(client), peer)
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let mut arena = ConnArena::new();
        let (stream, peer) = mk_stream();
        let id = arena.insert(stream, vec![Arc::new(ServerConfig::default())], peer, 8080);
        assert_eq!(arena.len(), 1);
        assert!(arena.get(id).is_some());
        let removed = arena.remove(id);
        assert!(removed.is_some());
        assert_eq!(arena.len(), 0);
        assert!(arena.get(id).is_none());
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut arena = ConnArena::new();
        let (s1, p1) = mk_stream();
        let a = arena.insert(s1, vec![Arc::new(ServerConfig::default())], p1, 8080);
        arena.remove(a);
        let (s2, p2) = mk_stream();
        let b = arena.insert(s2, vec![Arc::new(ServerConfig::default())], p2, 8080);
        assert_eq!(a.0, b.0);
    }
}
