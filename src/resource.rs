//! Low-level descriptor helpers: pipe/socketpair construction with an atomic close-on-exec flag
//! where the platform offers one, EINTR-restarting wrappers around the handful of raw syscalls
//! the rest of the crate needs, and the single-owner [`OwnedFd`] used everywhere a descriptor
//! changes hands.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType};
use nix::unistd;

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))] {
        const HAS_ATOMIC_CLOEXEC: bool = true;
    } else {
        const HAS_ATOMIC_CLOEXEC: bool = false;
    }
}

fn set_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(io::Error::from)
}

/// Creates a pipe whose both ends are close-on-exec, using `pipe2(O_CLOEXEC)` where available
/// and falling back to `pipe()` followed by `fcntl(F_SETFD, FD_CLOEXEC)` otherwise.
pub fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = if HAS_ATOMIC_CLOEXEC {
        unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?
    } else {
        let (r, w) = unistd::pipe().map_err(io::Error::from)?;
        set_cloexec(r.as_fd())?;
        set_cloexec(w.as_fd())?;
        (r, w)
    };
    Ok((read, write))
}

/// Creates a connected pair of `AF_UNIX`/`SOCK_STREAM` sockets, both close-on-exec.
pub fn create_socketpair() -> io::Result<(OwnedFd, OwnedFd)> {
    let flags = if HAS_ATOMIC_CLOEXEC {
        SockFlag::SOCK_CLOEXEC
    } else {
        SockFlag::empty()
    };
    let (a, b) = socket::socketpair(AddressFamily::Unix, SockType::Stream, None, flags)
        .map_err(io::Error::from)?;
    if !HAS_ATOMIC_CLOEXEC {
        set_cloexec(a.as_fd())?;
        set_cloexec(b.as_fd())?;
    }
    Ok((a, b))
}

/// Whether inbound `SCM_RIGHTS` file descriptors can be marked close-on-exec atomically via
/// `MSG_CMSG_CLOEXEC`. When this is `false`, [`crate::ancillary_socket::AncillaryDataSocket`]
/// falls back to applying `FD_CLOEXEC` to each received descriptor right after `recvmsg`.
pub fn has_atomic_cmsg_cloexec() -> bool {
    HAS_ATOMIC_CLOEXEC
}

pub fn set_cloexec_fallback(fd: BorrowedFd<'_>) -> io::Result<()> {
    if !HAS_ATOMIC_CLOEXEC {
        set_cloexec(fd)?;
    }
    Ok(())
}

/// Restarts `f` on `EINTR`. Used for every blocking syscall the service issues directly, mirroring
/// the restart-on-interrupt discipline the lower-level socket code in this crate already follows.
pub fn restarting<T>(mut f: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Duplicates a raw fd into an owned one that outlives whatever the caller got it from, without
/// consuming the caller's copy. Used for fds pulled from the SCM_RIGHTS queue, which are only
/// ever observed via [`RawFd`] at the `recvmsg` boundary.
///
/// # Safety
/// `fd` must be a currently-valid, open file descriptor.
pub unsafe fn owned_from_raw(fd: RawFd) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(fd) }
}
