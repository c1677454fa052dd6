//! The notification pipe: the only way a signal handler or a subchannel worker thread wakes
//! [`crate::service::Service::run`].

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use log::error;
use nix::errno::Errno;

use crate::protocol::Notification;

/// A cloneable handle to the notification pipe's write end. Posting is a single `write(2)` of
/// one byte, restarted on `EINTR` — the same primitive the signal handler uses, so the same type
/// serves both async-signal-context and ordinary-thread callers.
#[derive(Clone)]
pub struct Notifier {
    write_fd: Arc<OwnedFd>,
}

impl Notifier {
    pub fn new(write_fd: Arc<OwnedFd>) -> Self {
        Self { write_fd }
    }

    /// Posts `kind`. A saturated pipe buffer is not an error: the main loop drains and coalesces
    /// whatever is there on its next wake, so at-least-once delivery is preserved regardless of
    /// how many bytes are actually queued.
    ///
    /// A write failure other than the pipe being gone (`EPIPE`, meaning the service has already
    /// exited) indicates something is deeply wrong with process state and is fatal, matching the
    /// design's rule that a notification-pipe write failure aborts the process.
    pub fn post(&self, kind: Notification) {
        let byte = [kind as u8];
        loop {
            match nix::unistd::write(self.write_fd.as_raw_fd(), &byte) {
                Ok(_) => return,
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) => return,
                Err(e) => {
                    error!("notification pipe write failed fatally: {e}");
                    std::process::abort();
                }
            }
        }
    }
}
