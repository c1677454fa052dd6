//! The main loop: demultiplexes the notification pipe and the main channel, dispatches incoming
//! subchannel-creation events, runs the reap loop, and coordinates graceful shutdown.

use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};

use crate::ancillary_socket::{AncillaryDataSocket, RecvOutcome};
use crate::child::{exit_status_from_wait, ChildProcessMap};
use crate::codec::ChildExitNotification;
use crate::notify::Notifier;
use crate::protocol::Notification;
use crate::resource;
use crate::signal as signal_setup;
use crate::subchannel::Subchannel;
use crate::subchannel_collection::SubchannelCollection;

/// Drives the helper for the lifetime of one connection to the client's main channel.
pub struct Service {
    main_channel: AncillaryDataSocket,
    notify_read: OwnedFd,
    notifier: Notifier,
    cancel_write: Option<OwnedFd>,
    subchannels: Arc<SubchannelCollection>,
    children: Arc<ChildProcessMap>,
    shutting_down: bool,
    exit_via_sigquit: bool,
}

impl Service {
    /// Creates the notification and cancellation pipes, wraps `main_channel_fd` with the
    /// cancellation pipe's read end, and installs the signal handler trampoline.
    pub fn initialize(main_channel_fd: OwnedFd) -> std::io::Result<Self> {
        let (notify_read, notify_write) = resource::create_pipe()?;
        let (cancel_read, cancel_write) = resource::create_pipe()?;
        let cancel_read = Arc::new(cancel_read);
        let notify_write = Arc::new(notify_write);

        let notifier = Notifier::new(notify_write.clone());
        signal_setup::install(notify_write);

        let main_channel = AncillaryDataSocket::new(main_channel_fd, cancel_read);

        Ok(Self {
            main_channel,
            notify_read,
            notifier,
            cancel_write: Some(cancel_write),
            subchannels: Arc::new(SubchannelCollection::new()),
            children: Arc::new(ChildProcessMap::new()),
            shutting_down: false,
            exit_via_sigquit: false,
        })
    }

    /// Runs until the main channel closes or `SIGQUIT` is received, then drains outstanding
    /// subchannels and auto-terminates marked children. Returns the process exit code.
    pub fn run(mut self) -> i32 {
        loop {
            if let Err(e) = self.poll_once() {
                error!("poll in main loop failed: {e}");
                self.initiate_shutdown();
            }
            if self.should_exit() {
                break;
            }
        }

        self.children.auto_terminate_all();
        info!("service shutting down, {} auto-terminated child scan complete", self.children.len());

        if self.exit_via_sigquit {
            // Re-raise SIGQUIT with its disposition restored to default, so that whatever
            // process started the helper observes a signal-terminated exit rather than a plain
            // exit(0) — matching ordinary SIGQUIT semantics for a process that didn't ignore it.
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: restoring the default disposition right before re-raising is safe; no
            // other thread touches signal disposition at this point in the loop's lifetime.
            let _ = unsafe { signal::sigaction(Signal::SIGQUIT, &default) };
            let _ = signal::raise(Signal::SIGQUIT);
        }
        0
    }

    fn should_exit(&self) -> bool {
        self.shutting_down && self.subchannels.is_empty()
    }

    fn poll_once(&mut self) -> std::io::Result<()> {
        let notify_fd = self.notify_read.as_fd();
        let main_fd = self.main_channel.as_fd();
        let watch_main = !self.shutting_down;
        let main_events = if self.main_channel.has_pending_data() {
            PollFlags::POLLIN | PollFlags::POLLOUT
        } else {
            PollFlags::POLLIN
        };

        let mut fds = vec![PollFd::new(notify_fd, PollFlags::POLLIN)];
        if watch_main {
            fds.push(PollFd::new(main_fd, main_events));
        }

        loop {
            match nix::poll::poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e)),
            }
        }

        let notify_revents = fds[0].revents().unwrap_or(PollFlags::empty());
        let main_revents = if watch_main {
            fds[1].revents().unwrap_or(PollFlags::empty())
        } else {
            PollFlags::empty()
        };
        drop(fds); // release the borrows of self.notify_read / self.main_channel before mutating

        if notify_revents.contains(PollFlags::POLLIN) {
            self.handle_notifications()?;
        }

        if watch_main {
            if main_revents.contains(PollFlags::POLLHUP) {
                info!("main channel closed by client, shutting down");
                self.initiate_shutdown();
            } else {
                if main_revents.contains(PollFlags::POLLIN) {
                    self.handle_incoming_subchannel()?;
                }
                if main_revents.contains(PollFlags::POLLOUT) && self.main_channel.has_pending_data() {
                    if let Err(e) = self.main_channel.flush(false) {
                        warn!("flushing main channel backlog failed: {e}");
                        self.initiate_shutdown();
                    }
                }
            }
        }
        Ok(())
    }

    /// Drains up to 256 notification bytes, coalescing repeats of the same kind into a single
    /// action — a saturated pipe means more bytes to drain, never more work to do per kind.
    fn handle_notifications(&mut self) -> std::io::Result<()> {
        let mut buf = [0u8; 256];
        let n = loop {
            match nix::unistd::read(self.notify_read.as_raw_fd(), &mut buf) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e)),
            }
        };
        let mut saw_quit = false;
        let mut saw_reap = false;
        let mut saw_subchannel_closed = false;
        for &byte in &buf[..n] {
            match Notification::from_u8(byte) {
                Some(Notification::Quit) => saw_quit = true,
                Some(Notification::ReapRequest) => saw_reap = true,
                Some(Notification::SubchannelClosed) => saw_subchannel_closed = true,
                None => warn!("unknown notification byte {byte}"),
            }
        }
        if saw_reap {
            self.reap_loop();
        }
        if saw_subchannel_closed {
            // Once shutting down, no more subchannels can be added and the cancellation pipe has
            // already fanned out to every worker, so every remaining handle is guaranteed to
            // finish promptly: block and drain the collection to empty rather than trusting
            // `is_finished()`, which can miss a worker that posted this very notification an
            // instant before returning and then never wake again (see `should_exit`).
            if self.shutting_down {
                self.subchannels.join_all();
            } else {
                self.subchannels.reap_finished();
            }
        }
        if saw_quit {
            self.exit_via_sigquit = true;
            self.initiate_shutdown();
        }
        Ok(())
    }

    /// Idempotent: shuts the main channel down and closes the cancellation pipe's write end,
    /// which fans out to every blocked subchannel worker as a synthetic disconnect.
    fn initiate_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.main_channel.shutdown();
        self.cancel_write = None; // dropping closes the fd
        debug!("shutdown initiated");
    }

    fn handle_incoming_subchannel(&mut self) -> std::io::Result<()> {
        let mut dummy = [0u8];
        match self.main_channel.recv(&mut dummy, true) {
            Ok(RecvOutcome::Eof) => {
                self.initiate_shutdown();
                return Ok(());
            }
            Ok(RecvOutcome::Data(_)) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }

        let Some(fd) = self.main_channel.take_received_fd() else {
            error!("main channel subchannel-creation event carried no fd; fatal protocol violation");
            self.initiate_shutdown();
            return Ok(());
        };
        if self.main_channel.has_stray_fds() {
            warn!("main channel passed more than one fd in a single subchannel-creation event");
        }

        let cancel_read = self.main_cancel_read_handle();
        let socket = AncillaryDataSocket::new(fd, cancel_read);
        let subchannel = Subchannel::new(socket, self.children.clone(), self.notifier.clone());
        let handle = thread::spawn(move || subchannel.run());
        self.subchannels.add(handle);
        Ok(())
    }

    fn main_cancel_read_handle(&self) -> Arc<OwnedFd> {
        // The main channel's own cancellation-pipe handle is reused for every subchannel: it's
        // the single process-wide cancellation primitive described by the design.
        self.main_channel.cancel_read_arc()
    }

    /// `waitid(P_ALL, WEXITED|WNOHANG|WNOWAIT)` peek-notify-erase-reap loop. The `WNOWAIT` peek
    /// lets the exit be published to the client and the map entry removed before the pid can be
    /// recycled by the kernel; an unknown pid stops the loop entirely rather than skipping it, so
    /// that ordering with a delayed registration from `spawn_process` is preserved.
    fn reap_loop(&mut self) {
        loop {
            let status = match waitid(
                Id::All,
                WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT,
            ) {
                Ok(s) => s,
                Err(Errno::ECHILD) => return,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitid in reap loop failed: {e}");
                    return;
                }
            };
            if matches!(status, WaitStatus::StillAlive) {
                return;
            }
            let Some((pid, exit_status)) = exit_status_from_wait(&status) else {
                return;
            };
            let Some(entry) = self.children.get_by_pid(pid) else {
                // A child died before its spawning subchannel finished registering it; stop and
                // wait for that subchannel's own delayed ReapRequest instead of reaping blind.
                return;
            };
            // SendBuffered -> Delete -> Reap, in that order: the client learns of the exit, then
            // the map entry is removed, then the zombie is actually reaped.
            if entry.should_notify_on_exit() {
                let notification = ChildExitNotification {
                    token: entry.token,
                    pid: pid.as_raw(),
                    status: exit_status,
                };
                if let Err(e) = self.main_channel.send_buffered(&notification.encode()) {
                    warn!("failed to post exit notification for pid {pid}: {e}");
                    self.initiate_shutdown();
                }
            }
            self.children.delete_by_pid(pid);
            ChildProcessMap::finish_reap(&entry);
        }
    }
}
