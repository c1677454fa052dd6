//! A stream Unix socket wrapper offering framed send/recv with `SCM_RIGHTS` fd passing, a
//! nonblocking send backlog, and cancellable blocking I/O.
//!
//! Every blocking operation here polls the socket together with the process-wide cancellation
//! pipe; closing that pipe's write end is the only way the helper cancels in-flight I/O, and it
//! fans out to every [`AncillaryDataSocket`] in the process simultaneously.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{
    self, ControlMessage, ControlMessageOwned, MsgFlags, RecvMsg,
};
use nix::sys::uio::IoSliceMut;

use crate::protocol::MAX_FDS_PER_CALL;
use crate::resource;
use crate::write_buffer::WriteBuffer;

/// Signals that the peer half-closed the connection, or that the cancellation pipe fired while
/// we were blocked. Both are reported as an orderly disconnect rather than a hard error, per the
/// design's "closure by the peer is not an error" rule; cancellation additionally synthesizes the
/// POSIX-conventional errno for the direction that was interrupted.
#[derive(Debug)]
pub enum RecvOutcome {
    Data(usize),
    Eof,
}

pub struct AncillaryDataSocket {
    fd: OwnedFd,
    cancel_read: Arc<OwnedFd>,
    backlog: WriteBuffer,
    received_fds: VecDeque<OwnedFd>,
}

impl AncillaryDataSocket {
    pub fn new(fd: OwnedFd, cancel_read: Arc<OwnedFd>) -> Self {
        Self {
            fd,
            cancel_read,
            backlog: WriteBuffer::new(),
            received_fds: VecDeque::new(),
        }
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Returns another handle to the process-wide cancellation pipe's read end, for constructing
    /// further sockets (each subchannel) that must cancel in step with this one.
    pub fn cancel_read_arc(&self) -> Arc<OwnedFd> {
        self.cancel_read.clone()
    }

    pub fn has_pending_data(&self) -> bool {
        self.backlog.has_pending_data()
    }

    /// Pops the next fd received via `SCM_RIGHTS` and not yet claimed by request parsing. An fd
    /// still queued after a request finishes parsing is a protocol violation.
    pub fn take_received_fd(&mut self) -> Option<OwnedFd> {
        self.received_fds.pop_front()
    }

    pub fn has_stray_fds(&self) -> bool {
        !self.received_fds.is_empty()
    }

    /// Blocks on `poll({socket, cancel_read})`; returns `Ok(true)` if the socket is ready for
    /// `events`, `Ok(false)` if the cancellation pipe fired first.
    fn wait_ready(&self, events: PollFlags) -> io::Result<bool> {
        loop {
            let mut fds = [
                PollFd::new(self.fd.as_fd(), events),
                PollFd::new(self.cancel_read.as_fd(), PollFlags::POLLIN),
            ];
            match nix::poll::poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
            let cancel_revents = fds[1].revents().unwrap_or(PollFlags::empty());
            if cancel_revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                return Ok(false);
            }
            let sock_revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if sock_revents.intersects(events | PollFlags::POLLHUP | PollFlags::POLLERR) {
                return Ok(true);
            }
        }
    }

    /// One socket write. Never returns `Ok(0)`; per POSIX that can only mean we asked to write
    /// zero bytes, so callers never do, and observing it from the kernel is treated as fatal by
    /// the caller (see the design's note on `send` returning 0).
    pub fn send(&self, buf: &[u8], nonblocking: bool) -> io::Result<usize> {
        if !nonblocking && !self.wait_ready(PollFlags::POLLOUT)? {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        loop {
            let flags = if nonblocking {
                MsgFlags::MSG_NOSIGNAL | MsgFlags::MSG_DONTWAIT
            } else {
                MsgFlags::MSG_NOSIGNAL
            };
            match socket::send(self.fd.as_raw_fd(), buf, flags) {
                Ok(n) => return Ok(n),
                Err(Errno::EINTR) => continue,
                Err(e @ (Errno::EAGAIN | Errno::EWOULDBLOCK)) => return Err(io::Error::from(e)),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    /// Attempts one write; any unsent tail goes to the backlog. Fails only when the connection
    /// is gone, never on backpressure.
    pub fn send_buffered(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.backlog.has_pending_data() {
            self.backlog.enqueue(buf);
            return self.flush(false).map(|_| ());
        }
        match self.send(buf, true) {
            Ok(n) => {
                if n < buf.len() {
                    self.backlog.enqueue(&buf[n..]);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.backlog.enqueue(buf);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the backlog via repeated nonblocking writes (or blocking ones, if `blocking`).
    pub fn flush(&mut self, blocking: bool) -> io::Result<()> {
        while self.backlog.has_pending_data() {
            let chunk = self.backlog.pending_data();
            match self.send(chunk, !blocking) {
                Ok(n) => self.backlog.dequeue(n),
                Err(e) if !blocking && e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drains the backlog, then performs restart-on-interrupt blocking writes until `buf` is
    /// fully sent.
    pub fn send_exact_bytes(&mut self, mut buf: &[u8]) -> io::Result<()> {
        self.flush(true)?;
        while !buf.is_empty() {
            let n = self.send(buf, false)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// `recvmsg` with room for up to [`MAX_FDS_PER_CALL`] fds. Any received fds are pushed onto
    /// the fd queue. A cmsg of a type other than `SCM_RIGHTS` is a protocol violation: the
    /// `recvmsg` is still drained (so we don't leak descriptors) and the caller is told to shut
    /// the connection down.
    pub fn recv(&mut self, buf: &mut [u8], nonblocking: bool) -> io::Result<RecvOutcome> {
        if !nonblocking && !self.wait_ready(PollFlags::POLLIN)? {
            return Ok(RecvOutcome::Eof);
        }
        let mut cmsg_space = nix::cmsg_space!([RawFd; MAX_FDS_PER_CALL]);
        loop {
            let flags = if nonblocking {
                MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_DONTWAIT
            } else {
                MsgFlags::MSG_CMSG_CLOEXEC
            };
            let mut iov = [IoSliceMut::new(buf)];
            let result: nix::Result<RecvMsg<'_, '_, ()>> =
                socket::recvmsg(self.fd.as_raw_fd(), &mut iov, Some(&mut cmsg_space), flags);
            match result {
                Ok(msg) => {
                    let n = msg.bytes;
                    let mut protocol_violation = false;
                    for cmsg in msg.cmsgs()? {
                        match cmsg {
                            ControlMessageOwned::ScmRights(fds) => {
                                for raw in fds {
                                    let owned = unsafe { resource::owned_from_raw(raw) };
                                    if !resource::has_atomic_cmsg_cloexec() {
                                        let _ = resource::set_cloexec_fallback(owned.as_fd());
                                    }
                                    self.received_fds.push_back(owned);
                                }
                            }
                            _ => protocol_violation = true,
                        }
                    }
                    if protocol_violation {
                        self.shutdown();
                        return Err(io::Error::from_raw_os_error(libc::ECONNRESET));
                    }
                    return if n == 0 {
                        Ok(RecvOutcome::Eof)
                    } else {
                        Ok(RecvOutcome::Data(n))
                    };
                }
                Err(Errno::EINTR) => continue,
                Err(e @ (Errno::EAGAIN | Errno::EWOULDBLOCK)) => return Err(io::Error::from(e)),
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    /// Blocking loop over [`Self::recv`] until `buf` is completely filled or the peer/
    /// cancellation pipe signals a disconnect.
    pub fn recv_exact_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.recv(&mut buf[filled..], false)? {
                RecvOutcome::Data(n) => filled += n,
                RecvOutcome::Eof => return Err(io::Error::from_raw_os_error(libc::ECONNRESET)),
            }
        }
        Ok(())
    }

    /// Sends `buf` plus exactly one fd as an `SCM_RIGHTS` ancillary message.
    pub fn send_with_fd(&self, buf: &[u8], fd: BorrowedFd<'_>) -> io::Result<()> {
        let iov = [std::io::IoSlice::new(buf)];
        let raw = fd.as_raw_fd();
        let fds = [raw];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        loop {
            match socket::sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::MSG_NOSIGNAL,
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = socket::shutdown(self.fd.as_raw_fd(), socket::Shutdown::Both);
    }
}
