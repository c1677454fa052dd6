//! The registry of live children: a [`ChildProcessMap`] indexed by both OS pid and client
//! token, with per-entry locking that makes `SendSignal` safe against PID recycling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::{HelperError, Result};

/// Identity and lifecycle state of one live child, shared between the map's two indexes and
/// whichever subchannel spawned it.
pub struct ChildProcessState {
    pub pid: Pid,
    pub token: u64,
    pub created_new_process_group: bool,
    pub should_auto_terminate: bool,
    /// Guards `reaped`; serializes `send_signal` against `reap` so no signal is ever sent to a
    /// pid the kernel has already recycled.
    reaped: Mutex<bool>,
    /// Set when the spawn that created this entry failed in the child after fork (e.g. `exec`
    /// failure): the stub child still runs to `_exit(1)` and still gets reaped normally, but the
    /// client already learned about the failure via the spawn response, so the subsequent exit
    /// notification for it must be suppressed.
    suppress_exit_notification: Mutex<bool>,
}

impl ChildProcessState {
    fn new(pid: Pid, token: u64, created_new_process_group: bool, should_auto_terminate: bool) -> Self {
        Self {
            pid,
            token,
            created_new_process_group,
            should_auto_terminate,
            reaped: Mutex::new(false),
            suppress_exit_notification: Mutex::new(false),
        }
    }

    /// Marks this entry's eventual exit as one the client must not be told about, because the
    /// client already received a synchronous spawn failure for it.
    pub fn suppress_exit_notification(&self) {
        let mut flag = self.suppress_exit_notification.lock().unwrap_or_else(|e| e.into_inner());
        *flag = true;
    }

    pub fn should_notify_on_exit(&self) -> bool {
        !*self.suppress_exit_notification.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sends `sig` to the child (or its process group, if it was created with one), optionally
    /// followed by `SIGCONT` so a stopped target actually observes it. A signal to an
    /// already-reaped entry is a silent, successful no-op.
    pub fn send_signal(&self, sig: Signal, also_send_cont: bool) -> Result<()> {
        let reaped = self.reaped.lock().unwrap_or_else(|e| e.into_inner());
        if *reaped {
            return Ok(());
        }
        let target = if self.created_new_process_group {
            Pid::from_raw(-self.pid.as_raw())
        } else {
            self.pid
        };
        signal::kill(target, sig)?;
        if also_send_cont {
            signal::kill(target, Signal::SIGCONT)?;
        }
        Ok(())
    }

    /// Performs the real, reaping `waitid`. Must only be called by the service's reap loop,
    /// after the entry has already been removed from the map and the client has been notified
    /// of the exit — this ordering is what makes the map safe against the kernel recycling the
    /// pid the instant it's reaped.
    fn reap(&self) {
        let mut reaped = self.reaped.lock().unwrap_or_else(|e| e.into_inner());
        if *reaped {
            return;
        }
        match waitid(Id::Pid(self.pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG) {
            Ok(_) | Err(nix::errno::Errno::ECHILD) => {}
            Err(e) => warn!("waitid({}) during reap failed: {e}", self.pid),
        }
        *reaped = true;
    }
}

/// Two indexes over the live children, `by_pid` and `by_token`, kept in sync under one mutex.
#[derive(Default)]
pub struct ChildProcessMap {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_pid: HashMap<Pid, Arc<ChildProcessState>>,
    by_token: HashMap<u64, Arc<ChildProcessState>>,
}

impl ChildProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly-forked child. Must be called before the parent releases the child to
    /// run (before the "proceed" byte is written to its pipe) so that an arbitrarily-fast
    /// `SIGCHLD` can never observe an unknown pid.
    ///
    /// A duplicate pid is a fatal invariant violation: it can only mean a previous entry for the
    /// same pid was never removed before the kernel recycled it, which would make signal
    /// delivery unsafe from here on.
    pub fn allocate(
        &self,
        pid: Pid,
        token: u64,
        created_new_process_group: bool,
        should_auto_terminate: bool,
    ) -> Result<Arc<ChildProcessState>> {
        let entry = Arc::new(ChildProcessState::new(
            pid,
            token,
            created_new_process_group,
            should_auto_terminate,
        ));
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.by_pid.contains_key(&pid) {
            return Err(HelperError::fatal(format!(
                "duplicate registration for pid {pid} — a prior entry was reaped without being removed"
            )));
        }
        inner.by_pid.insert(pid, entry.clone());
        inner.by_token.insert(token, entry.clone());
        debug!("registered child pid={pid} token={token:#x}");
        Ok(entry)
    }

    pub fn get_by_pid(&self, pid: Pid) -> Option<Arc<ChildProcessState>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).by_pid.get(&pid).cloned()
    }

    pub fn get_by_token(&self, token: u64) -> Option<Arc<ChildProcessState>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_token
            .get(&token)
            .cloned()
    }

    /// Removes both indexes for the given pid, if present.
    pub fn delete_by_pid(&self, pid: Pid) -> Option<Arc<ChildProcessState>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner.by_pid.remove(&pid)?;
        inner.by_token.remove(&entry.token);
        Some(entry)
    }

    /// Performs the real `waitid` reap for a pid already removed from the map. Splitting removal
    /// (`delete_by_pid`) from reaping (`finish_reap`) is what lets the service publish the exit
    /// notification to the client strictly before the pid can be recycled by the OS.
    pub fn finish_reap(entry: &ChildProcessState) {
        entry.reap();
    }

    /// Sends `SIGTERM` then `SIGCONT` to every entry marked for auto-termination. Only safe to
    /// call once the service has stopped accepting new subchannels and the map is quiescent.
    pub fn auto_terminate_all(&self) {
        let entries: Vec<_> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.by_pid.values().cloned().collect()
        };
        for entry in entries {
            if !entry.should_auto_terminate {
                continue;
            }
            if let Err(e) = entry.send_signal(Signal::SIGTERM, true) {
                if !matches!(e, HelperError::Nix(nix::errno::Errno::ESRCH)) {
                    warn!("auto-termination of pid {} failed: {e}", entry.pid);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).by_pid.len()
    }
}

/// One `waitid(P_ALL, WEXITED|WNOHANG|WNOWAIT)` peek result, translated from [`WaitStatus`] into
/// the `status` convention the wire protocol uses (non-negative exit code, or `-signum`).
pub fn exit_status_from_wait(status: &WaitStatus) -> Option<(Pid, i32)> {
    match *status {
        WaitStatus::Exited(pid, code) => Some((pid, code)),
        WaitStatus::Signaled(pid, sig, _core_dumped) => Some((pid, -(sig as i32))),
        _ => None,
    }
}
