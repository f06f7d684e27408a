//! The loop bridge: one background thread driving the host I/O reactor.
//!
//! All native handle access happens on this thread. Caller threads hand
//! it work through [`Looper::post`] (fire-and-forget, FIFO per bridge,
//! woken through the reactor's waker) or [`Looper::post_and_wait`]
//! (blocking round trip, used only where caller progress must serialize
//! with native handle creation/destruction: open and close).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use once_cell::sync::OnceCell;

use crate::notify::DoneEvent;
use crate::trace::trace_looper;

const WAKER_TOKEN: Token = Token(0);

/// Tuning knobs for a [`Looper`].
pub struct LooperConfig {
    pub events_capacity: usize,
    pub poll_timeout: Duration,
    pub thread_name: String,
}

impl Default for LooperConfig {
    fn default() -> Self {
        Self {
            events_capacity: 256,
            poll_timeout: Duration::from_millis(250),
            thread_name: "guestnet socket looper".to_string(),
        }
    }
}

pub(crate) type LoopWork = Box<dyn FnOnce() + Send + 'static>;

/// Readiness digest handed to a session when its token fires.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
}

/// Implemented by sessions registered with the reactor; invoked on the
/// loop thread only.
pub(crate) trait ReadyHandler: Send + Sync {
    fn on_ready(&self, ready: Readiness);
}

pub struct Looper {
    config: LooperConfig,
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    sender: Sender<LoopWork>,
    receiver: Receiver<LoopWork>,
    running: AtomicBool,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    next_token: AtomicUsize,
    handlers: Mutex<HashMap<Token, Arc<dyn ReadyHandler>>>,
}

impl Looper {
    pub fn new(config: LooperConfig) -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (sender, receiver) = unbounded();
        Ok(Arc::new(Self {
            config,
            poll: Mutex::new(poll),
            registry,
            waker,
            sender,
            receiver,
            running: AtomicBool::new(true),
            worker: Mutex::new(None),
            next_token: AtomicUsize::new(1),
            handlers: Mutex::new(HashMap::new()),
        }))
    }

    /// Starts the background thread if it is not running yet. Invoked
    /// lazily by the first socket open that needs the bridge.
    pub fn start(looper: &Arc<Looper>) -> io::Result<()> {
        let mut guard = looper.worker.lock().unwrap();
        if guard.is_some() || looper.is_shut_down() {
            return Ok(());
        }
        let worker = Arc::clone(looper);
        let handle = thread::Builder::new()
            .name(looper.config.thread_name.clone())
            .spawn(move || loop_worker(worker))?;
        *guard = Some(handle);
        Ok(())
    }

    /// True once [`Looper::shutdown`] has run; the bridge refuses work
    /// from then on and a fresh one must be created.
    pub fn is_shut_down(&self) -> bool {
        !self.running.load(AtomicOrdering::Acquire)
    }

    fn worker_alive(&self) -> bool {
        !self.is_shut_down() && self.worker.lock().unwrap().is_some()
    }

    /// Enqueues `work` to run exactly once on the loop thread, in FIFO
    /// order relative to other posts on this bridge. Never blocks.
    /// Returns false when the bridge is shut down (the work is dropped,
    /// releasing whatever it captured).
    pub fn post<F>(&self, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_shut_down() {
            if trace_looper() {
                eprintln!("guestnet looper: dropping work posted after shutdown");
            }
            return false;
        }
        if self.sender.send(Box::new(work)).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        if self.is_shut_down() {
            // Shutdown raced the send and the worker may already be
            // past its exit drain. Run whatever is queued here so
            // nothing is stranded on the channel.
            while let Ok(work) = self.receiver.try_recv() {
                work();
            }
        }
        true
    }

    /// Posts `work` and blocks until it has run. Falls back to running
    /// the work inline when the loop thread is not available (bridge not
    /// started or already shut down), so teardown paths cannot hang.
    pub fn post_and_wait<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.worker_alive() {
            work();
            return;
        }
        let slot = Arc::new(Mutex::new(Some(work)));
        let queued = Arc::clone(&slot);
        let event = DoneEvent::new();
        let signal = Arc::clone(&event);
        if self.post(move || {
            if let Some(work) = queued.lock().unwrap().take() {
                work();
            }
            signal.set();
        }) {
            event.wait();
        } else if let Some(work) = slot.lock().unwrap().take() {
            work();
        }
    }

    /// Stops the reactor: posts the stop signal, wakes the loop and joins
    /// the thread. The bridge is unusable afterwards; the process-wide
    /// default is recreated lazily by the next open.
    pub fn shutdown(&self) {
        if self.running.swap(false, AtomicOrdering::AcqRel) {
            let _ = self.waker.wake();
            let handle = { self.worker.lock().unwrap().take() };
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            self.handlers.lock().unwrap().clear();
        }
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub(crate) fn attach(&self, token: Token, handler: Arc<dyn ReadyHandler>) {
        self.handlers.lock().unwrap().insert(token, handler);
    }

    pub(crate) fn detach(&self, token: Token) {
        self.handlers.lock().unwrap().remove(&token);
    }

    pub(crate) fn register(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, token, interests)
    }

    pub(crate) fn reregister(
        &self,
        source: &mut dyn mio::event::Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interests)
    }

    pub(crate) fn deregister(&self, source: &mut dyn mio::event::Source) -> io::Result<()> {
        self.registry.deregister(source)
    }
}

fn loop_worker(looper: Arc<Looper>) {
    let mut events = Events::with_capacity(looper.config.events_capacity);
    loop {
        if looper.is_shut_down() {
            break;
        }
        {
            let mut poll = looper.poll.lock().unwrap();
            if let Err(err) = poll.poll(&mut events, Some(looper.config.poll_timeout)) {
                if err.kind() != io::ErrorKind::Interrupted && trace_looper() {
                    eprintln!("guestnet looper: poll failed: {err}");
                }
            }
        }
        // Run posted work before dispatching readiness so a session that
        // just armed delivery observes the event it asked for.
        while let Ok(work) = looper.receiver.try_recv() {
            work();
        }
        if looper.is_shut_down() {
            break;
        }
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let handler = {
                let handlers = looper.handlers.lock().unwrap();
                handlers.get(&event.token()).cloned()
            };
            let Some(handler) = handler else {
                continue;
            };
            let ready = Readiness {
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_error() || event.is_read_closed() || event.is_write_closed(),
            };
            if trace_looper() {
                eprintln!(
                    "guestnet looper: event token={} readable={} writable={} closed={}",
                    event.token().0,
                    ready.readable,
                    ready.writable,
                    ready.closed
                );
            }
            handler.on_ready(ready);
        }
    }
    // Run whatever was queued before the stop signal landed so blocked
    // round trips are released.
    while let Ok(work) = looper.receiver.try_recv() {
        work();
    }
}

static DEFAULT_LOOPER: OnceCell<Mutex<Option<Arc<Looper>>>> = OnceCell::new();

/// The process-wide default bridge, created lazily and replaced lazily
/// after an explicit shutdown. Sessions receive the instance by
/// injection rather than reaching for this directly.
pub fn default_looper() -> io::Result<Arc<Looper>> {
    let slot = DEFAULT_LOOPER.get_or_init(|| Mutex::new(None));
    let mut guard = slot.lock().unwrap();
    match guard.as_ref() {
        Some(looper) if !looper.is_shut_down() => Ok(Arc::clone(looper)),
        _ => {
            let looper = Looper::new(LooperConfig::default())?;
            *guard = Some(Arc::clone(&looper));
            Ok(looper)
        }
    }
}

/// Stops the process-wide default bridge, joining its thread. The next
/// open recreates a fresh one.
pub fn shutdown_default_looper() {
    if let Some(slot) = DEFAULT_LOOPER.get() {
        let taken = { slot.lock().unwrap().take() };
        if let Some(looper) = taken {
            looper.shutdown();
        }
    }
}
