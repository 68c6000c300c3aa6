//! Timer wheel. A simple min-heap of absolute deadlines, keyed by a
//! monotonically increasing `TimerId`. Mirrors thttpd's `timers.c`: callers
//! `create` a timer with a kind and a duration, the event loop asks for
//! `next_timeout_ms` to size its poll wait, and `run` fires everything whose
//! deadline has passed.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::conn::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a fired timer means to the connection it is attached to. Replaces
/// the untyped `ClientData` union thttpd threads through its timer API.
#[derive(Debug, Clone, Copy)]
pub enum TimerKind {
    IdleRead(ConnId),
    IdleSend(ConnId),
    Linger(ConnId),
    CgiTimeout(ConnId),
    Throttle,
    Occasional,
}

struct Entry {
    id: TimerId,
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
    interval: Option<Duration>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline sorts
        // highest. Ties broken by insertion order (lower seq = earlier).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct TimerWheel {
    heap: BinaryHeap<Entry>,
    cancelled: std::collections::HashSet<TimerId>,
    next_id: u64,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: std::collections::HashSet::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    /// Schedules `kind` to fire `delay` from now. Returns an id that can be
    /// passed to `cancel`.
    pub fn create(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.push(Instant::now() + delay, kind, None)
    }

    /// Schedules `kind` to fire every `period`, first firing `period` from
    /// now. On each fire `run` re-pushes the same `TimerId` with its
    /// deadline advanced by `prev_deadline + period` rather than
    /// `now + period`, so a slow loop iteration doesn't push later fires
    /// further and further out — the wheel's phase doesn't drift under load.
    pub fn create_periodic(&mut self, period: Duration, kind: TimerKind) -> TimerId {
        self.push(Instant::now() + period, kind, Some(period))
    }

    fn push(&mut self, deadline: Instant, kind: TimerKind, interval: Option<Duration>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { id, deadline, seq, kind, interval });
        id
    }

    /// Marks a timer as dead. The entry is lazily dropped out of the heap
    /// the next time it would otherwise fire, rather than searched for and
    /// removed immediately — cancellation is expected to be common and
    /// cheap, not rare.
    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Milliseconds until the next live timer fires, or `None` if the
    /// wheel is empty — callers pass this straight to the readiness
    /// oracle's wait timeout.
    pub fn next_timeout_ms(&mut self) -> Option<u64> {
        self.drop_cancelled_head();
        self.heap.peek().map(|e| {
            let now = Instant::now();
            if e.deadline <= now {
                0
            } else {
                (e.deadline - now).as_millis() as u64
            }
        })
    }

    /// Pops and returns every timer whose deadline has passed. Periodic
    /// timers are immediately re-pushed under the same `TimerId` so a
    /// `cancel()` issued after this call still reaches them.
    pub fn run(&mut self) -> Vec<TimerKind> {
        let now = Instant::now();
        let mut fired = Vec::new();
        loop {
            self.drop_cancelled_head();
            match self.heap.peek() {
                Some(e) if e.deadline <= now => {
                    let entry = self.heap.pop().unwrap();
                    fired.push(entry.kind);
                    if let Some(interval) = entry.interval {
                        self.heap.push(Entry {
                            id: entry.id,
                            deadline: entry.deadline + interval,
                            seq: self.next_seq,
                            kind: entry.kind,
                            interval: Some(interval),
                        });
                        self.next_seq += 1;
                    }
                }
                _ => break,
            }
        }
        fired
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(e) = self.heap.peek() {
            if self.cancelled.remove(&e.id) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::new();
        wheel.create(Duration::from_millis(50), TimerKind::Occasional);
        wheel.create(Duration::from_millis(0), TimerKind::Throttle);
        std::thread::sleep(Duration::from_millis(10));
        let fired = wheel.run();
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], TimerKind::Throttle));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new();
        let id = wheel.create(Duration::from_millis(0), TimerKind::Occasional);
        wheel.cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        assert!(wheel.run().is_empty());
    }

    #[test]
    fn empty_wheel_has_no_timeout() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.next_timeout_ms(), None);
    }
}
