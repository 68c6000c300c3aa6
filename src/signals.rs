//! Signal handling. thttpd's original handlers only ever touched a few
//! `sig_atomic_t` globals and left the real work to the main loop; we keep
//! that shape with `AtomicBool`/`AtomicI32` statics set from async-signal-safe
//! handler functions registered via `libc::signal`.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static REOPEN_LOGS: AtomicBool = AtomicBool::new(false);
static REAP_CHILDREN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_term(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn handle_hup(_sig: libc::c_int) {
    REOPEN_LOGS.store(true, Ordering::SeqCst);
}

extern "C" fn handle_chld(_sig: libc::c_int) {
    REAP_CHILDREN.store(true, Ordering::SeqCst);
}

/// Installs the handlers thttpd installs at startup: `SIGTERM`/`SIGINT`
/// request an orderly shutdown, `SIGHUP` asks the main loop to reopen log
/// files and reread configuration, `SIGCHLD` flags that CGI children may be
/// reapable, and `SIGPIPE` is ignored so a client closing a socket mid-write
/// surfaces as an `EPIPE` error return rather than killing the process.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_term as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_term as libc::sighandler_t);
        libc::signal(libc::SIGHUP, handle_hup as libc::sighandler_t);
        libc::signal(libc::SIGCHLD, handle_chld as libc::sighandler_t);
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Returns `true` exactly once per received shutdown signal, clearing the
/// flag so the caller's event loop can poll it cheaply on every iteration.
pub fn take_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst)
}

pub fn take_reopen_logs() -> bool {
    REOPEN_LOGS.swap(false, Ordering::SeqCst)
}

pub fn take_reap_children() -> bool {
    REAP_CHILDREN.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        assert!(!take_shutdown_requested());
        assert!(!take_reopen_logs());
        assert!(!take_reap_children());
    }

    #[test]
    fn handler_sets_and_clears_flag() {
        handle_term(libc::SIGTERM);
        assert!(take_shutdown_requested());
        assert!(!take_shutdown_requested());
    }
}
