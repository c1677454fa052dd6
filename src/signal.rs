//! Installs the async-signal-safe trampoline that turns `SIGINT`/`SIGTERM`/`SIGQUIT`/`SIGPIPE`/
//! `SIGCHLD` into a single byte on the notification pipe.
//!
//! The handler itself must do nothing beyond a `write(2)`: no allocation, no locking, nothing
//! that isn't on the POSIX async-signal-safe list. State it needs (the pipe's write end) is
//! therefore stashed in a raw, process-wide `AtomicI32` rather than threaded through as a
//! closure capture, which signal handlers can't have.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::protocol::Notification;

static NOTIFY_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const HANDLED_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGPIPE,
    Signal::SIGCHLD,
];

fn notification_for(sig: Signal) -> Option<Notification> {
    match sig {
        Signal::SIGCHLD => Some(Notification::ReapRequest),
        Signal::SIGQUIT => Some(Notification::Quit),
        // SIGINT/SIGTERM/SIGPIPE are swallowed: the design leaves forwarding policy to the
        // client and the helper exits only when the main channel closes or SIGQUIT arrives.
        // They're still handled (rather than left at their default disposition) so the process
        // doesn't die to one of them before the main channel has a chance to close cleanly, but
        // no notification byte is written for them — there is nothing for the main loop to do.
        _ => None,
    }
}

extern "C" fn trampoline(raw_sig: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let fd = NOTIFY_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        if let Some(notification) = Signal::try_from(raw_sig).ok().and_then(notification_for) {
            let byte = [notification as u8];
            // SAFETY: write(2) is async-signal-safe. A failure here other than EPIPE (the
            // service has already exited and closed its end) indicates something is badly
            // wrong with process state and there is nothing safe left to do but abort.
            let n = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
            if n < 0 {
                let err = unsafe { *libc::__errno_location() };
                if err != libc::EPIPE {
                    unsafe { libc::abort() };
                }
            }
        }
    }
    unsafe { *libc::__errno_location() = saved_errno };
}

/// Installs the trampoline for every signal in [`HANDLED_SIGNALS`], preserving `SIG_IGN` where
/// the process already had it set (so that descendants which also ignore the signal by
/// inheritance keep doing so once they're execve'd).
///
/// # Safety
/// Must be called before any other thread is spawned that could race on signal disposition, and
/// `notify_write` must remain open for the rest of the process's life.
pub fn install(notify_write: Arc<OwnedFd>) {
    NOTIFY_WRITE_FD.store(notify_write.as_raw_fd(), Ordering::Relaxed);
    // Leaked deliberately: the signal handler needs this fd for the life of the process, and a
    // signal handler cannot safely participate in the normal Arc drop/refcount dance.
    std::mem::forget(notify_write);

    let action = SigAction::new(
        SigHandler::Handler(trampoline),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let chld_action = SigAction::new(
        SigHandler::Handler(trampoline),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );

    for &sig in &HANDLED_SIGNALS {
        // SAFETY: sigaction is async-signal-safe to call from a normal thread at startup, and
        // `action`'s only job is calling the async-signal-safe trampoline above.
        let previous = unsafe { signal::sigaction(sig, &action) };
        if let Ok(previous) = previous {
            if previous.handler() == SigHandler::SigIgn {
                // Restore SIG_IGN: preserving "ignore" across the install matches the design's
                // rule that children inherit ignore instead of picking up our handler.
                let _ = unsafe { signal::sigaction(sig, &previous) };
                continue;
            }
        }
        if sig == Signal::SIGCHLD {
            // Re-install using the NOCLDSTOP variant now that we know we're not preserving
            // SIG_IGN for this signal.
            let _ = unsafe { signal::sigaction(sig, &chld_action) };
        }
    }
}
