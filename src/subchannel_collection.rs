//! Registry of the worker threads currently servicing a subchannel, used solely to decide when
//! it's safe for [`crate::service::Service::run`] to return during a graceful shutdown.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::JoinHandle;

use log::warn;

/// Opaque identity of one subchannel, handed out by [`SubchannelCollection::add`].
pub type SubchannelId = u64;

#[derive(Default)]
pub struct SubchannelCollection {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: SubchannelId,
    handles: HashMap<SubchannelId, JoinHandle<()>>,
}

impl SubchannelCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker thread's handle and returns the id it's been filed under.
    pub fn add(&self, handle: JoinHandle<()>) -> SubchannelId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = inner.next_id;
        inner.next_id += 1;
        inner.handles.insert(id, handle);
        id
    }

    /// Removes and joins the worker for `id`.
    pub fn remove(&self, id: SubchannelId) {
        let handle = self.inner.lock().unwrap_or_else(|e| e.into_inner()).handles.remove(&id);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("subchannel worker {id} panicked");
            }
        }
    }

    /// Joins and removes every worker whose thread has already returned. Called by the service
    /// on a `SubchannelClosed` wake outside of shutdown — each worker posts that notification
    /// immediately before returning, at which point its `JoinHandle` is *usually* immediately
    /// joinable, but a handle that hasn't quite returned yet is simply left for the next wake
    /// rather than blocked on.
    pub fn reap_finished(&self) {
        let finished: Vec<SubchannelId> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .handles
                .iter()
                .filter(|(_, h)| h.is_finished())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in finished {
            self.remove(id);
        }
    }

    /// Joins and removes every remaining worker unconditionally, blocking on each one. Used only
    /// during shutdown, once no new subchannels can be added and the cancellation pipe has fanned
    /// out to every worker: every remaining handle is guaranteed to finish promptly, so blocking
    /// here (rather than trusting `is_finished()`) is what actually drains the collection down to
    /// empty instead of leaving a just-finishing worker behind for a notification that, once
    /// coalesced with others, never comes again.
    pub fn join_all(&self) {
        loop {
            let next = {
                let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                let id = match inner.handles.keys().next().copied() {
                    Some(id) => id,
                    None => return,
                };
                inner.handles.remove(&id).map(|h| (id, h))
            };
            let Some((id, handle)) = next else { return };
            if handle.join().is_err() {
                warn!("subchannel worker {id} panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SubchannelCollection {
    fn drop(&mut self) {
        let remaining = self.len();
        if remaining != 0 {
            warn!("subchannel collection dropped with {remaining} worker(s) still registered");
        }
    }
}
