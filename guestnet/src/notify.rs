//! Single-shot completion notifications.
//!
//! A [`Notify`] is the guest-visible end of an asynchronous operation: a
//! requester handle (used to acquire the owning context's lock) plus a
//! completion invoked at most once. Sessions keep at most one `Notify`
//! per operation kind in an `Option` slot, so "is one pending" is a plain
//! presence test and `Option::take` makes double completion impossible
//! even against a racing loop-thread completion.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use guestnet_core::SockResult;

/// Lock on the guest context that owns a requester. Completion callbacks
/// mutate guest-owned state, so they run with this lock held — acquired
/// immediately before the callback and released immediately after, never
/// across a blocking operation.
pub struct OwnerLock {
    lock: Mutex<()>,
}

impl OwnerLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap()
    }
}

/// Handle to the guest context requesting an operation.
#[derive(Clone)]
pub struct Requester {
    owner: Arc<OwnerLock>,
}

impl Requester {
    pub fn new(owner: Arc<OwnerLock>) -> Self {
        Self { owner }
    }

    pub fn owner(&self) -> &OwnerLock {
        &self.owner
    }
}

/// A single-shot completion slot bound to a requester.
pub struct Notify {
    requester: Requester,
    completer: Box<dyn FnOnce(SockResult) + Send>,
}

impl Notify {
    pub fn new<F>(requester: Requester, completer: F) -> Self
    where
        F: FnOnce(SockResult) + Send + 'static,
    {
        Self {
            requester,
            completer: Box::new(completer),
        }
    }

    /// Fulfills the notification under the requester's owner lock.
    /// Consuming `self` is what guarantees at-most-once delivery.
    pub fn complete(self, result: SockResult) {
        let _owner = self.requester.owner().lock();
        (self.completer)(result);
    }
}

/// One-shot event for loop-bridge round trips: the caller blocks until
/// the posted work (or a continuation it triggers) signals completion.
pub(crate) struct DoneEvent {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl DoneEvent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    pub(crate) fn set(&self) {
        let mut done = self.done.lock().unwrap();
        *done = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.condvar.wait(done).unwrap();
        }
    }
}
