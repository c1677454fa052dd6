//! Per-connection worker thread: parses requests off one socket, performs the fork/exec spawn
//! algorithm or a signal delivery, and writes the response back.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use log::{debug, warn};
use nix::unistd::{self, ForkResult, Pid};

use crate::ancillary_socket::{AncillaryDataSocket, RecvOutcome};
use crate::child::ChildProcessMap;
use crate::codec::{Reader, RequestHeader, Response};
use crate::error::{wire, HelperError, Result};
use crate::notify::Notifier;
use crate::protocol::{AbstractSignal, Command, SpawnFlags, MAX_MESSAGE_LENGTH};
use crate::resource;

/// Everything one subchannel worker thread needs for the lifetime of its connection.
pub struct Subchannel {
    socket: AncillaryDataSocket,
    children: Arc<ChildProcessMap>,
    notifier: Notifier,
}

impl Subchannel {
    pub fn new(socket: AncillaryDataSocket, children: Arc<ChildProcessMap>, notifier: Notifier) -> Self {
        Self { socket, children, notifier }
    }

    /// The worker thread body. Sends the creation handshake, then loops parsing requests until
    /// the peer disconnects or a fatal error occurs; either way, posts `SubchannelClosed` on the
    /// way out so the service re-evaluates whether shutdown can complete.
    pub fn run(mut self) {
        if let Err(e) = self.socket.send_exact_bytes(&Response::ok(0).encode()) {
            debug!("subchannel creation handshake failed: {e}");
            self.notifier.post(crate::protocol::Notification::SubchannelClosed);
            return;
        }
        loop {
            match self.serve_one_request() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(HelperError::Fatal(msg)) => {
                    warn!("subchannel worker hit a fatal error, closing connection: {msg}");
                    break;
                }
                Err(e) => {
                    warn!("subchannel worker I/O error, closing connection: {e}");
                    break;
                }
            }
        }
        self.socket.shutdown();
        self.notifier.post(crate::protocol::Notification::SubchannelClosed);
    }

    /// Parses and answers exactly one request. Returns `Ok(false)` on orderly peer disconnect.
    fn serve_one_request(&mut self) -> Result<bool> {
        let mut header_bytes = [0u8; RequestHeader::WIRE_LEN];
        match self.socket.recv(&mut header_bytes, false) {
            Ok(RecvOutcome::Eof) => return Ok(false),
            Ok(RecvOutcome::Data(n)) if n < header_bytes.len() => {
                self.fill_remaining(&mut header_bytes, n)?;
            }
            Ok(RecvOutcome::Data(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let header = RequestHeader::decode(header_bytes);

        if header.body_length > MAX_MESSAGE_LENGTH {
            self.drain_and_discard(header.body_length)?;
            self.respond(Response::error(libc::E2BIG))?;
            return Ok(true);
        }

        let mut body = vec![0u8; header.body_length as usize];
        self.socket.recv_exact_bytes(&mut body)?;

        let response = match Command::from_u32(header.command) {
            Some(Command::SpawnProcess) => self.handle_spawn(&body),
            Some(Command::SendSignal) => self.handle_signal(&body),
            None => Err(HelperError::protocol("unknown command", wire::INVALID_REQUEST)),
        };

        let response = match response {
            Ok(r) => r,
            Err(e) => Response::error(e.wire_code()),
        };
        self.respond(response)?;
        Ok(true)
    }

    fn fill_remaining(&mut self, buf: &mut [u8], already: usize) -> Result<()> {
        let mut filled = already;
        while filled < buf.len() {
            match self.socket.recv(&mut buf[filled..], false)? {
                RecvOutcome::Data(n) => filled += n,
                RecvOutcome::Eof => {
                    return Err(HelperError::protocol("connection closed mid-header", wire::INVALID_REQUEST))
                }
            }
        }
        Ok(())
    }

    /// Reads and discards `len` bytes so framing stays aligned after an oversized body is
    /// rejected, rather than desynchronizing the stream.
    fn drain_and_discard(&mut self, len: u32) -> Result<()> {
        let mut remaining = len as usize;
        let mut scratch = [0u8; 8192];
        while remaining > 0 {
            let take = remaining.min(scratch.len());
            match self.socket.recv(&mut scratch[..take], false)? {
                RecvOutcome::Data(n) => remaining -= n,
                RecvOutcome::Eof => return Ok(()),
            }
        }
        Ok(())
    }

    fn respond(&mut self, response: Response) -> Result<()> {
        self.socket.send_exact_bytes(&response.encode())?;
        Ok(())
    }

    fn handle_spawn(&mut self, body: &[u8]) -> Result<Response> {
        let mut r = Reader::new(body);
        let token = r.read_u64()?;
        let raw_flags = r.read_u32()?;
        let working_directory = r.read_string()?;
        let executable_path = r
            .read_string()?
            .ok_or_else(|| HelperError::protocol("executable path must not be null", wire::INVALID_REQUEST))?;
        let argv = r.read_string_array()?;
        let envp = r.read_string_array()?;
        r.finish()?;

        let flags = SpawnFlags::from_bits(raw_flags)
            .ok_or_else(|| HelperError::protocol("unknown spawn flag bits", wire::INVALID_REQUEST))?;

        let mut redirect_fds = Vec::with_capacity(3);
        for bit in [
            SpawnFlags::REDIRECT_STDIN,
            SpawnFlags::REDIRECT_STDOUT,
            SpawnFlags::REDIRECT_STDERR,
        ] {
            if flags.contains(bit) {
                let fd = self
                    .socket
                    .take_received_fd()
                    .ok_or_else(|| HelperError::protocol("redirection flag set without a passed fd", wire::INVALID_REQUEST))?;
                redirect_fds.push(fd);
            }
        }
        if self.socket.has_stray_fds() {
            return Err(HelperError::protocol("more fds passed than redirection flags requested", wire::INVALID_REQUEST));
        }

        let spec = SpawnSpec {
            token,
            working_directory,
            executable_path,
            argv,
            envp,
            redirect_fds,
            create_new_process_group: flags.contains(SpawnFlags::CREATE_NEW_PROCESS_GROUP),
            enable_auto_termination: flags.contains(SpawnFlags::ENABLE_AUTO_TERMINATION),
        };
        match spawn_process(spec, &self.children, &self.notifier) {
            Ok(pid) => Ok(Response::ok(pid.as_raw())),
            Err(SpawnError::Errno(errno)) => Ok(Response::error(errno as i32)),
            Err(SpawnError::Helper(e)) => Err(e),
        }
    }

    fn handle_signal(&mut self, body: &[u8]) -> Result<Response> {
        let mut r = Reader::new(body);
        let token = r.read_u64()?;
        let raw_signal = r.read_u32()?;
        r.finish()?;

        let signal = AbstractSignal::from_u32(raw_signal)
            .ok_or_else(|| HelperError::protocol("unknown abstract signal", wire::INVALID_REQUEST))?;

        let Some(entry) = self.children.get_by_token(token) else {
            // Presumed already reaped: idempotent success.
            return Ok(Response::ok(0));
        };
        entry.send_signal(signal.to_nix(), signal.also_send_cont())?;
        Ok(Response::ok(0))
    }
}

struct SpawnSpec {
    token: u64,
    working_directory: Option<String>,
    executable_path: String,
    argv: Vec<String>,
    envp: Vec<String>,
    /// In stdin, stdout, stderr order — only the fds for flags that were actually set.
    redirect_fds: Vec<OwnedFd>,
    create_new_process_group: bool,
    enable_auto_termination: bool,
}

enum SpawnError {
    /// A transient per-operation failure (`fork`, `exec`, `dup2`, `chdir`), reported to the
    /// caller as the spawn response's `err` field rather than killing the connection.
    Errno(nix::errno::Errno),
    Helper(HelperError),
}

impl From<HelperError> for SpawnError {
    fn from(e: HelperError) -> Self {
        Self::Helper(e)
    }
}

/// The fork/exec spawn algorithm: two close-on-exec pipes synchronize parent and child so that
/// (a) the child entry is registered before the child has any chance to exit, and (b) an `exec`
/// failure is reported back to the requester synchronously via the `err` field rather than
/// silently producing an exited child the caller never asked for.
fn spawn_process(spec: SpawnSpec, children: &Arc<ChildProcessMap>, notifier: &Notifier) -> std::result::Result<Pid, SpawnError> {
    let (proceed_read, proceed_write) = resource::create_pipe().map_err(io_to_spawn_error)?;
    let (exec_err_read, exec_err_write) = resource::create_pipe().map_err(io_to_spawn_error)?;

    // SAFETY: the child path below only calls async-signal-safe functions (dup2, chdir, setpgid,
    // read, write, execve, _exit) before either reaching execve or exiting; it performs no heap
    // allocation after the fork and never returns through this stack frame.
    let fork_result = unsafe { unistd::fork() }.map_err(SpawnError::Errno)?;

    match fork_result {
        ForkResult::Child => {
            drop(proceed_write);
            drop(exec_err_read);
            run_child(&spec, proceed_read, exec_err_write);
            // run_child never returns; _exit is always called.
            unreachable!("run_child must _exit before returning");
        }
        ForkResult::Parent { child } => {
            drop(proceed_read);
            drop(exec_err_write);
            // Register before releasing the child: this is what guarantees a SIGCHLD arriving
            // arbitrarily soon cannot observe an unknown pid.
            let entry = children
                .allocate(child, spec.token, spec.create_new_process_group, spec.enable_auto_termination)
                .map_err(SpawnError::Helper)?;
            // Covers the race where the child already died before this registration landed.
            notifier.post(crate::protocol::Notification::ReapRequest);

            if let Err(e) = unistd::write(proceed_write.as_raw_fd(), &[0u8]) {
                warn!("failed to release child {child}: {e}");
            }
            drop(proceed_write);

            let mut errno_buf = [0u8; 4];
            let read = read_exact_restarting(&exec_err_read, &mut errno_buf);
            match read {
                Ok(0) => Ok(child),
                Ok(_) => {
                    // The client already learns of this failure via the spawn response's `err`
                    // field; the stub child's later exit must not also surface an exit notification.
                    entry.suppress_exit_notification();
                    let errno = i32::from_le_bytes(errno_buf);
                    Err(SpawnError::Errno(nix::errno::Errno::from_raw(errno)))
                }
                Err(e) => Err(io_to_spawn_error(e)),
            }
        }
    }
}

fn io_to_spawn_error(e: std::io::Error) -> SpawnError {
    SpawnError::Errno(nix::errno::Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))
}

fn read_exact_restarting(fd: &OwnedFd, buf: &mut [u8]) -> std::io::Result<usize> {
    // Returns 0 on immediate EOF (meaning exec succeeded and closed this end via CLOEXEC),
    // or the number of bytes read otherwise (the peer's errno, little-endian).
    loop {
        match unistd::read(fd.as_raw_fd(), buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    }
}

/// Runs entirely in the forked child. Never returns: every path ends in `_exit`.
fn run_child(spec: &SpawnSpec, proceed_read: OwnedFd, exec_err_write: OwnedFd) -> ! {
    let report_and_die = |errno: nix::errno::Errno| -> ! {
        let bytes = (errno as i32).to_le_bytes();
        let _ = unistd::write(exec_err_write.as_raw_fd(), &bytes);
        unistd::_exit(1);
    };

    for (i, fd) in spec.redirect_fds.iter().enumerate() {
        let target = match i {
            0 => libc::STDIN_FILENO,
            1 => libc::STDOUT_FILENO,
            _ => libc::STDERR_FILENO,
        };
        if let Err(e) = unistd::dup2(fd.as_raw_fd(), target) {
            report_and_die(e);
        }
    }

    if let Some(dir) = &spec.working_directory {
        if let Err(e) = unistd::chdir(dir.as_str()) {
            report_and_die(e);
        }
    }

    // Block until the parent has registered us, so we can never exit unobserved.
    let mut one_byte = [0u8];
    match unistd::read(proceed_read.as_raw_fd(), &mut one_byte) {
        Ok(0) => unistd::_exit(1), // parent died before releasing us
        Ok(_) => {}
        Err(_) => unistd::_exit(1),
    }
    drop(proceed_read);

    if spec.create_new_process_group {
        if let Err(e) = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
            report_and_die(e);
        }
    }

    let argv0 = CString::new(spec.executable_path.as_str()).unwrap_or_default();
    let argv_c: Vec<CString> = spec.argv.iter().map(|a| CString::new(a.as_str()).unwrap_or_default()).collect();
    let envp_c: Vec<CString> = spec.envp.iter().map(|e| CString::new(e.as_str()).unwrap_or_default()).collect();
    let path = CString::new(spec.executable_path.as_str()).unwrap_or(argv0);

    let exec_result = unistd::execve(&path, &argv_c, &envp_c);
    // execve only returns on failure.
    let errno = exec_result.unwrap_err();
    report_and_die(errno);
}
