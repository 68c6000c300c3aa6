//! S6-style idle-timeout behavior: a connection's read timer fires within
//! its deadline window and nothing else fires early.

use std::time::Duration;

use thttpd_core::conn::ConnId;
use thttpd_core::timer::{TimerKind, TimerWheel};

#[test]
fn s6_idle_read_timer_fires_once_past_deadline() {
    let mut wheel = TimerWheel::new();
    let conn = ConnId(0);
    wheel.create(Duration::from_millis(20), TimerKind::IdleRead(conn));

    // Before the deadline, nothing should have fired yet.
    assert!(wheel.run().is_empty());

    std::thread::sleep(Duration::from_millis(30));
    let fired = wheel.run();
    assert_eq!(fired.len(), 1);
    assert!(matches!(fired[0], TimerKind::IdleRead(c) if c == conn));

    // Firing drains the entry; a second run before any new timer is
    // created finds nothing pending.
    assert!(wheel.run().is_empty());
}

#[test]
fn unrelated_timers_do_not_interfere_with_idle_deadline() {
    let mut wheel = TimerWheel::new();
    let conn = ConnId(7);
    let read_timer = wheel.create(Duration::from_millis(10), TimerKind::IdleRead(conn));
    wheel.create(Duration::from_secs(10), TimerKind::Occasional);

    std::thread::sleep(Duration::from_millis(15));
    let fired = wheel.run();
    assert_eq!(fired.len(), 1);
    assert!(matches!(fired[0], TimerKind::IdleRead(c) if c == conn));

    // The timer id from create() is only meaningful for cancellation; once
    // fired it's gone regardless of further cancel calls.
    wheel.cancel(read_timer);
}
