//! Readiness oracle: a thin wrapper over `mio::Poll` giving the rest of the
//! crate a single, runtime-polymorphic registration/wait interface rather
//! than threading `mio` types through every module (per the redesign note
//! on the original's compile-time kqueue/devpoll/poll/select selection —
//! `mio` already picks the best backend for the host at runtime).

use std::collections::HashSet;
use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

pub struct Oracle {
    poll: Poll,
    events: Events,
    ready: HashSet<Token>,
}

impl Oracle {
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
            ready: HashSet::new(),
        })
    }

    pub fn add(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn modify(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn del(&self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks until readiness events arrive or `timeout` elapses (`None`
    /// blocks indefinitely). Retries transparently on `EINTR`, matching
    /// the main loop's "on EINTR, restart" rule.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {
                    self.ready.clear();
                    self.ready.extend(self.events.iter().map(|e| e.token()));
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &mio::event::Event> {
        self.events.iter()
    }

    /// Reports whether `token` was ready in the most recent `wait()` batch.
    /// `mio::Events` has no native per-fd probe, so the oracle snapshots the
    /// ready set into a `HashSet` each `wait()` to answer this cheaply.
    pub fn check(&self, token: Token) -> bool {
        self.ready.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    #[test]
    fn register_and_wait_on_listener_readiness() {
        let mut oracle = Oracle::new(8).unwrap();
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        oracle.add(&mut listener, Token(0), Interest::READABLE).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();
        oracle.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(oracle.iter().any(|e| e.token() == Token(0)));
    }
}
