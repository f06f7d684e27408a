//! Guest socket sessions.
//!
//! A [`SocketSession`] is the per-handle bridge object. Guest calls
//! arrive on arbitrary threads; `open` and `close` round-trip through
//! the loop thread, everything else schedules work and completes later
//! through the [`Notify`] the caller supplied. The native handle starts
//! as a plain non-blocking socket and is promoted to a reactor-
//! registered one the first time an operation needs readiness events.

use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use mio::{Interest, Token};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use guestnet_core::{
    GuestAddress, InterfaceInfo, SockResult, SocketKind, FAMILY_INET, FAMILY_INET6,
    OPT_ENUM_INTERFACES, OPT_FAMILY_INTERFACE_CONTROL, OPT_NEXT_INTERFACE, PROTOCOL_TCP,
    PROTOCOL_UDP, RECV_FLAG_DONT_WAIT_FULL,
};

use crate::accumulator::StreamAccumulator;
use crate::addr;
use crate::ifaces;
use crate::looper::{Looper, Readiness, ReadyHandler};
use crate::notify::Notify;
use crate::trace::trace_socket;

/// Destination buffer a receive fills. The session replaces its
/// contents with the delivered bytes.
pub type GuestBuffer = Arc<Mutex<Vec<u8>>>;

/// Out-parameter for transferred byte counts.
pub type GuestCounter = Arc<AtomicUsize>;

/// Optional data callback fired with the delivered length, before the
/// completion notify.
pub type RecvCallback = Box<dyn FnOnce(usize) + Send>;

const SCRATCH_CAPACITY: usize = 0x10000;

/// Parameters of a receive call.
pub struct ReceiveRequest {
    pub dest: GuestBuffer,
    pub want: usize,
    pub out_read: Option<GuestCounter>,
    pub flags: u32,
    pub filter: Option<GuestAddress>,
    pub on_data: Option<RecvCallback>,
}

enum Native {
    Closed,
    Pending(Socket),
    Tcp(mio::net::TcpStream),
    Udp(mio::net::UdpSocket),
}

impl Native {
    fn sockref(&self) -> Option<SockRef<'_>> {
        match self {
            Native::Closed => None,
            Native::Pending(sock) => Some(SockRef::from(sock)),
            Native::Tcp(stream) => Some(SockRef::from(stream)),
            Native::Udp(sock) => Some(SockRef::from(sock)),
        }
    }

    // A pending socket is not pollable yet.
    fn source_mut(&mut self) -> Option<&mut dyn mio::event::Source> {
        match self {
            Native::Closed | Native::Pending(_) => None,
            Native::Tcp(stream) => Some(stream),
            Native::Udp(sock) => Some(sock),
        }
    }
}

struct RecvTarget {
    notify: Notify,
    dest: GuestBuffer,
    want: usize,
    out_read: Option<GuestCounter>,
    take_available_only: bool,
    filter: Option<GuestAddress>,
    on_data: Option<RecvCallback>,
}

struct SendOp {
    notify: Notify,
    data: Vec<u8>,
    written: usize,
    dest: Option<SockAddr>,
}

struct SessionInner {
    kind: SocketKind,
    native: Native,
    token: Token,
    registered: bool,
    connect: Option<Notify>,
    send: Option<SendOp>,
    recv: Option<RecvTarget>,
    accumulator: StreamAccumulator,
    eof: bool,
    scratch: Vec<u8>,
    iface_snapshot: Option<Vec<InterfaceInfo>>,
    iface_cursor: usize,
}

impl SessionInner {
    fn is_open(&self) -> bool {
        !matches!(self.native, Native::Closed)
    }
}

/// A completion gathered while the session lock was held; executed
/// after the lock is released so callbacks can re-enter the session.
struct Finished {
    notify: Notify,
    result: SockResult,
    payload: Option<(GuestBuffer, Vec<u8>, Option<GuestCounter>)>,
    on_data: Option<RecvCallback>,
}

impl Finished {
    fn plain(notify: Notify, result: SockResult) -> Self {
        Self {
            notify,
            result,
            payload: None,
            on_data: None,
        }
    }

    fn run(self) {
        let mut delivered = 0;
        if let Some((dest, bytes, counter)) = self.payload {
            delivered = bytes.len();
            {
                let mut dest = dest.lock().unwrap();
                dest.clear();
                dest.extend_from_slice(&bytes);
            }
            if let Some(counter) = counter {
                counter.store(delivered, AtomicOrdering::Release);
            }
        }
        if let Some(on_data) = self.on_data {
            on_data(delivered);
        }
        self.notify.complete(self.result);
    }
}

fn deliver(target: RecvTarget, bytes: Vec<u8>) -> Finished {
    Finished {
        notify: target.notify,
        result: SockResult::None,
        payload: Some((target.dest, bytes, target.out_read)),
        on_data: target.on_data,
    }
}

struct SessionShared {
    looper: Arc<Looper>,
    inner: Mutex<SessionInner>,
}

pub struct SocketSession {
    shared: Arc<SessionShared>,
}

impl SocketSession {
    pub fn new(looper: Arc<Looper>) -> Self {
        let token = looper.next_token();
        Self {
            shared: Arc::new(SessionShared {
                looper,
                inner: Mutex::new(SessionInner {
                    kind: SocketKind::Stream,
                    native: Native::Closed,
                    token,
                    registered: false,
                    connect: None,
                    send: None,
                    recv: None,
                    accumulator: StreamAccumulator::default(),
                    eof: false,
                    scratch: Vec::new(),
                    iface_snapshot: None,
                    iface_cursor: 0,
                }),
            }),
        }
    }

    /// Creates the native handle. Blocks for the round trip through the
    /// loop thread. Only `Stream` over TCP and `Datagram` over UDP are
    /// accepted; an already-open session reports `InUse`.
    pub fn open(&self, family: u32, kind: SocketKind, protocol: u32) -> SockResult {
        let domain = match family {
            FAMILY_INET => Domain::IPV4,
            FAMILY_INET6 => Domain::IPV6,
            _ => return SockResult::Argument,
        };
        let (ty, proto) = match (kind, protocol) {
            (SocketKind::Stream, PROTOCOL_TCP) => (Type::STREAM, Protocol::TCP),
            (SocketKind::Datagram, PROTOCOL_UDP) => (Type::DGRAM, Protocol::UDP),
            _ => return SockResult::NotSupported,
        };
        if self.shared.inner.lock().unwrap().is_open() {
            return SockResult::InUse;
        }
        if self.shared.looper.is_shut_down() || Looper::start(&self.shared.looper).is_err() {
            return SockResult::NotReady;
        }
        let slot = Arc::new(Mutex::new(SockResult::NotReady));
        let shared = Arc::clone(&self.shared);
        let out = Arc::clone(&slot);
        self.shared.looper.post_and_wait(move || {
            *out.lock().unwrap() = open_on_loop(&shared, domain, ty, proto, kind);
        });
        let result = *slot.lock().unwrap();
        result
    }

    /// Binds the native handle. Native bind failures are not surfaced;
    /// the caller sees `None` as soon as the bind has been posted, and
    /// the native bind itself runs on the loop thread. An unopened
    /// session completes `NotReady` immediately.
    pub fn bind(&self, guest_addr: &GuestAddress, notify: Notify) {
        if !self.shared.inner.lock().unwrap().is_open() {
            notify.complete(SockResult::NotReady);
            return;
        }
        let shared = Arc::clone(&self.shared);
        let native_addr = addr::to_native(guest_addr);
        let posted = self.shared.looper.post(move || {
            let inner = shared.inner.lock().unwrap();
            if let Some(sock) = inner.native.sockref() {
                if let Err(err) = sock.bind(&native_addr) {
                    if trace_socket() {
                        eprintln!("guestnet socket: bind failed: {err}");
                    }
                }
            }
        });
        notify.complete(if posted {
            SockResult::None
        } else {
            SockResult::NotReady
        });
    }

    /// Connects to `guest_addr`. Datagram sessions complete on the next
    /// loop turn (connect just fixes the peer); stream sessions complete
    /// when the handshake resolves. A second connect while one is in
    /// flight completes `InUse`.
    pub fn connect(&self, guest_addr: &GuestAddress, notify: Notify) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.is_open() {
                drop(inner);
                notify.complete(SockResult::NotReady);
                return;
            }
            if inner.connect.is_some() {
                drop(inner);
                notify.complete(SockResult::InUse);
                return;
            }
            inner.connect = Some(notify);
        }
        let shared = Arc::clone(&self.shared);
        let native_addr = addr::to_native(guest_addr);
        if !self.shared.looper.post(move || {
            let mut finished = Vec::new();
            {
                let mut inner = shared.inner.lock().unwrap();
                start_connect(&mut inner, &native_addr, &mut finished);
                shared.sync_interest(&mut inner);
            }
            for item in finished {
                item.run();
            }
        }) {
            let taken = self.shared.inner.lock().unwrap().connect.take();
            if let Some(notify) = taken {
                notify.complete(SockResult::NotReady);
            }
        }
    }

    /// Queues `data` for transmission. The written count, when
    /// requested, is reported optimistically as the full length at call
    /// time. Unrecognized flags are ignored. A second send while one is
    /// in flight completes `InUse`.
    pub fn send(
        &self,
        data: &[u8],
        dest: Option<&GuestAddress>,
        flags: u32,
        out_written: Option<&GuestCounter>,
        notify: Notify,
    ) {
        if flags != 0 && trace_socket() {
            eprintln!("guestnet socket: ignoring send flags {flags:#x}");
        }
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.is_open() {
                drop(inner);
                notify.complete(SockResult::NotReady);
                return;
            }
            if inner.send.is_some() {
                drop(inner);
                notify.complete(SockResult::InUse);
                return;
            }
            if let Some(counter) = out_written {
                counter.store(data.len(), AtomicOrdering::Release);
            }
            inner.send = Some(SendOp {
                notify,
                data: data.to_vec(),
                written: 0,
                dest: dest.map(addr::to_native),
            });
        }
        let shared = Arc::clone(&self.shared);
        if !self.shared.looper.post(move || {
            let mut finished = Vec::new();
            {
                let mut inner = shared.inner.lock().unwrap();
                progress_send(&mut inner, &mut finished);
                shared.sync_interest(&mut inner);
            }
            for item in finished {
                item.run();
            }
        }) {
            let taken = { self.shared.inner.lock().unwrap().send.take() };
            if let Some(op) = taken {
                op.notify.complete(SockResult::NotReady);
            }
        }
    }

    /// Requests delivery of incoming data.
    ///
    /// Stream sessions accumulate and complete once `want` bytes are
    /// buffered, or as soon as anything is buffered when the request
    /// carries [`RECV_FLAG_DONT_WAIT_FULL`]. Datagram sessions complete
    /// on the next datagram whose source matches the filter, truncated
    /// to `want`. A second receive while one is pending completes
    /// `InUse` without disturbing the first.
    pub fn receive(&self, request: ReceiveRequest, notify: Notify) {
        if request.flags & !RECV_FLAG_DONT_WAIT_FULL != 0 && trace_socket() {
            eprintln!(
                "guestnet socket: ignoring receive flags {:#x}",
                request.flags & !RECV_FLAG_DONT_WAIT_FULL
            );
        }
        let target = RecvTarget {
            notify,
            dest: request.dest,
            want: request.want,
            out_read: request.out_read,
            take_available_only: request.flags & RECV_FLAG_DONT_WAIT_FULL != 0,
            filter: request.filter,
            on_data: request.on_data,
        };
        let mut finished = Vec::new();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            if !inner.is_open() {
                drop(inner);
                target.notify.complete(SockResult::NotReady);
                return;
            }
            if inner.recv.is_some() {
                drop(inner);
                target.notify.complete(SockResult::InUse);
                return;
            }
            inner.recv = Some(target);
            if inner.kind == SocketKind::Stream {
                // Buffered bytes can satisfy the request without a trip
                // through the loop.
                let eof = inner.eof;
                let SessionInner {
                    recv, accumulator, ..
                } = &mut *inner;
                satisfy_stream(recv, accumulator, eof, &mut finished);
            }
        }
        if !finished.is_empty() {
            for item in finished {
                item.run();
            }
            return;
        }
        let shared = Arc::clone(&self.shared);
        if !self.shared.looper.post(move || {
            let mut finished = Vec::new();
            {
                let mut inner = shared.inner.lock().unwrap();
                shared.sync_interest(&mut inner);
                pump_recv(&mut inner, &mut finished);
                shared.sync_interest(&mut inner);
            }
            for item in finished {
                item.run();
            }
        }) {
            let taken = { self.shared.inner.lock().unwrap().recv.take() };
            if let Some(target) = taken {
                target.notify.complete(SockResult::NotReady);
            }
        }
    }

    /// Completes a pending connect with `Cancel`. No-op when none is
    /// pending.
    pub fn cancel_connect(&self) {
        let taken = { self.shared.inner.lock().unwrap().connect.take() };
        if let Some(notify) = taken {
            notify.complete(SockResult::Cancel);
        }
        self.post_interest_sync();
    }

    /// Completes a pending send with `Cancel`. Bytes already written to
    /// the native handle stay written.
    pub fn cancel_send(&self) {
        let taken = { self.shared.inner.lock().unwrap().send.take() };
        if let Some(op) = taken {
            op.notify.complete(SockResult::Cancel);
        }
        self.post_interest_sync();
    }

    /// Completes a pending receive with `Cancel`; its data callback is
    /// dropped unfired. Already-accumulated stream bytes stay buffered
    /// for the next receive.
    pub fn cancel_receive(&self) {
        let taken = { self.shared.inner.lock().unwrap().recv.take() };
        if let Some(target) = taken {
            target.notify.complete(SockResult::Cancel);
        }
        self.post_interest_sync();
    }

    /// The native handle's bound address, translated back to guest
    /// form. `NotReady` when the session is unopened or the native
    /// query fails.
    pub fn local_name(&self) -> Result<GuestAddress, SockResult> {
        let inner = self.shared.inner.lock().unwrap();
        let Some(sock) = inner.native.sockref() else {
            return Err(SockResult::NotReady);
        };
        let native = sock.local_addr().map_err(|_| SockResult::NotReady)?;
        addr::from_native(&native).ok_or(SockResult::NotReady)
    }

    /// The connected peer's address, translated back to guest form.
    /// `NotReady` when the session is unopened, unconnected, or the
    /// native query fails.
    pub fn remote_name(&self) -> Result<GuestAddress, SockResult> {
        let inner = self.shared.inner.lock().unwrap();
        let Some(sock) = inner.native.sockref() else {
            return Err(SockResult::NotReady);
        };
        let native = sock.peer_addr().map_err(|_| SockResult::NotReady)?;
        addr::from_native(&native).ok_or(SockResult::NotReady)
    }

    /// Interface-control family: `OPT_ENUM_INTERFACES` captures a
    /// snapshot of the host's interfaces and resets the cursor. Other
    /// options complete `NotSupported`.
    pub fn set_option(&self, family: u32, option: u32, _value: &[u8]) -> SockResult {
        if family != OPT_FAMILY_INTERFACE_CONTROL {
            return SockResult::NotSupported;
        }
        match option {
            OPT_ENUM_INTERFACES => match ifaces::snapshot() {
                Ok(list) => {
                    let mut inner = self.shared.inner.lock().unwrap();
                    inner.iface_snapshot = Some(list);
                    inner.iface_cursor = 0;
                    SockResult::None
                }
                Err(err) => {
                    if trace_socket() {
                        eprintln!("guestnet socket: interface enumeration failed: {err}");
                    }
                    SockResult::General
                }
            },
            _ => SockResult::NotSupported,
        }
    }

    /// Interface-control family: `OPT_NEXT_INTERFACE` encodes the next
    /// snapshot entry into `out` (which must be exactly
    /// [`InterfaceInfo::WIRE_SIZE`] bytes) and advances the cursor.
    /// `NotReady` before any enumeration, `Eof` past the end.
    pub fn get_option(&self, family: u32, option: u32, out: &mut [u8]) -> SockResult {
        if family != OPT_FAMILY_INTERFACE_CONTROL {
            return SockResult::NotSupported;
        }
        match option {
            OPT_NEXT_INTERFACE => {
                let mut inner = self.shared.inner.lock().unwrap();
                let Some(snapshot) = inner.iface_snapshot.as_ref() else {
                    return SockResult::NotReady;
                };
                if inner.iface_cursor >= snapshot.len() {
                    return SockResult::Eof;
                }
                if out.len() != InterfaceInfo::WIRE_SIZE {
                    return SockResult::Argument;
                }
                snapshot[inner.iface_cursor].encode(out);
                inner.iface_cursor += 1;
                SockResult::None
            }
            _ => SockResult::NotSupported,
        }
    }

    /// Tears the session down: every pending operation completes
    /// `Cancel` on the caller thread, then the native handle is
    /// deregistered and dropped in a round trip through the loop.
    /// Idempotent; the session can be opened again afterwards.
    pub fn close(&self) {
        let (pending, was_open) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let mut pending: Vec<Notify> = Vec::new();
            if let Some(notify) = inner.connect.take() {
                pending.push(notify);
            }
            if let Some(op) = inner.send.take() {
                pending.push(op.notify);
            }
            if let Some(target) = inner.recv.take() {
                pending.push(target.notify);
            }
            (pending, inner.is_open())
        };
        for notify in pending {
            notify.complete(SockResult::Cancel);
        }
        if !was_open {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.shared.looper.post_and_wait(move || {
            let mut inner = shared.inner.lock().unwrap();
            if inner.registered {
                let looper = &shared.looper;
                if let Some(source) = inner.native.source_mut() {
                    if let Err(err) = looper.deregister(source) {
                        if trace_socket() {
                            eprintln!("guestnet socket: deregister failed: {err}");
                        }
                    }
                }
                inner.registered = false;
            }
            shared.looper.detach(inner.token);
            inner.native = Native::Closed;
            inner.eof = false;
            inner.accumulator = StreamAccumulator::default();
            inner.scratch = Vec::new();
        });
    }

    fn post_interest_sync(&self) {
        let shared = Arc::clone(&self.shared);
        let _ = self.shared.looper.post(move || {
            let mut inner = shared.inner.lock().unwrap();
            shared.sync_interest(&mut inner);
        });
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl SessionShared {
    /// Derives the interest set from pending operations and brings the
    /// reactor registration in line with it. Loop thread only.
    fn sync_interest(&self, inner: &mut SessionInner) {
        let readable = inner.recv.is_some();
        let writable = inner.connect.is_some() || inner.send.is_some();
        let desired = match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if desired.is_some() {
            promote(inner);
        }
        let token = inner.token;
        let registered = inner.registered;
        match (desired, inner.native.source_mut()) {
            (Some(interest), Some(source)) => {
                let outcome = if registered {
                    self.looper.reregister(source, token, interest)
                } else {
                    self.looper.register(source, token, interest)
                };
                match outcome {
                    Ok(()) => inner.registered = true,
                    Err(err) => {
                        if trace_socket() {
                            eprintln!("guestnet socket: (re)register failed: {err}");
                        }
                    }
                }
            }
            (None, Some(source)) => {
                if registered {
                    if let Err(err) = self.looper.deregister(source) {
                        if trace_socket() {
                            eprintln!("guestnet socket: deregister failed: {err}");
                        }
                    }
                    inner.registered = false;
                }
            }
            _ => {}
        }
    }
}

impl ReadyHandler for SessionShared {
    fn on_ready(&self, ready: Readiness) {
        let mut finished = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            if ready.writable || ready.closed {
                if inner.connect.is_some() {
                    let result = connect_outcome(&inner);
                    if let Some(notify) = inner.connect.take() {
                        finished.push(Finished::plain(notify, result));
                    }
                }
                progress_send(&mut inner, &mut finished);
            }
            if ready.readable || ready.closed {
                pump_recv(&mut inner, &mut finished);
            }
            self.sync_interest(&mut inner);
        }
        for item in finished {
            item.run();
        }
    }
}

fn open_on_loop(
    shared: &Arc<SessionShared>,
    domain: Domain,
    ty: Type,
    proto: Protocol,
    kind: SocketKind,
) -> SockResult {
    let socket = match Socket::new(domain, ty, Some(proto)) {
        Ok(socket) => socket,
        Err(err) => {
            if trace_socket() {
                eprintln!("guestnet socket: open failed: {err}");
            }
            return SockResult::NotReady;
        }
    };
    if let Err(err) = socket.set_nonblocking(true) {
        if trace_socket() {
            eprintln!("guestnet socket: set_nonblocking failed: {err}");
        }
        return SockResult::NotReady;
    }
    let mut inner = shared.inner.lock().unwrap();
    inner.kind = kind;
    inner.native = Native::Pending(socket);
    inner.registered = false;
    inner.eof = false;
    inner.accumulator = StreamAccumulator::default();
    inner.scratch = vec![0u8; SCRATCH_CAPACITY];
    shared
        .looper
        .attach(inner.token, Arc::clone(shared) as Arc<dyn ReadyHandler>);
    SockResult::None
}

fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn start_connect(inner: &mut SessionInner, native_addr: &SockAddr, finished: &mut Vec<Finished>) {
    // Canceled or closed before the loop got here.
    let Some(notify) = inner.connect.take() else {
        return;
    };
    let Some(sock) = inner.native.sockref() else {
        finished.push(Finished::plain(notify, SockResult::NotReady));
        return;
    };
    match sock.connect(native_addr) {
        Ok(()) => finished.push(Finished::plain(notify, SockResult::None)),
        Err(err) if inner.kind == SocketKind::Stream && connect_in_progress(&err) => {
            inner.connect = Some(notify);
        }
        Err(err) => finished.push(Finished::plain(notify, SockResult::from_native(&err))),
    }
}

fn connect_outcome(inner: &SessionInner) -> SockResult {
    let Some(sock) = inner.native.sockref() else {
        return SockResult::NotReady;
    };
    match sock.take_error() {
        Ok(None) => SockResult::None,
        Ok(Some(err)) => SockResult::from_native(&err),
        Err(err) => SockResult::from_native(&err),
    }
}

fn progress_send(inner: &mut SessionInner, finished: &mut Vec<Finished>) {
    let kind = inner.kind;
    let SessionInner { native, send, .. } = inner;
    if send.is_none() {
        return;
    }
    let Some(sock) = native.sockref() else {
        if let Some(op) = send.take() {
            finished.push(Finished::plain(op.notify, SockResult::NotReady));
        }
        return;
    };
    loop {
        let Some(op) = send.as_mut() else { return };
        let outcome = match &op.dest {
            Some(dest) => sock.send_to(&op.data[op.written..], dest),
            None => sock.send(&op.data[op.written..]),
        };
        match outcome {
            Ok(n) => {
                op.written += n;
                if kind == SocketKind::Datagram || op.written >= op.data.len() {
                    if let Some(op) = send.take() {
                        finished.push(Finished::plain(op.notify, SockResult::None));
                    }
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if trace_socket() {
                    eprintln!("guestnet socket: send failed: {err}");
                }
                if let Some(op) = send.take() {
                    finished.push(Finished::plain(op.notify, SockResult::General));
                }
                return;
            }
        }
    }
}

fn pump_recv(inner: &mut SessionInner, finished: &mut Vec<Finished>) {
    match inner.kind {
        SocketKind::Datagram => pump_datagram(inner, finished),
        SocketKind::Stream => pump_stream(inner, finished),
    }
}

fn pump_datagram(inner: &mut SessionInner, finished: &mut Vec<Finished>) {
    let SessionInner {
        native,
        recv,
        scratch,
        ..
    } = inner;
    let Native::Udp(udp) = native else { return };
    loop {
        if recv.is_none() {
            return;
        }
        match udp.recv_from(scratch.as_mut_slice()) {
            Ok((n, peer)) => {
                // Non-matching datagrams are discarded without
                // completing; the receive stays armed.
                let matches = match recv.as_ref().and_then(|t| t.filter.as_ref()) {
                    Some(filter) => addr::matches_socket_addr(filter, &peer),
                    None => true,
                };
                if !matches {
                    continue;
                }
                if let Some(target) = recv.take() {
                    let n = n.min(target.want);
                    finished.push(deliver(target, scratch[..n].to_vec()));
                }
                return;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                if trace_socket() {
                    eprintln!("guestnet socket: datagram delivery failed: {err}");
                }
                if let Some(target) = recv.take() {
                    finished.push(Finished::plain(target.notify, SockResult::General));
                }
                return;
            }
        }
    }
}

fn pump_stream(inner: &mut SessionInner, finished: &mut Vec<Finished>) {
    let eof_now;
    {
        let SessionInner {
            native,
            recv,
            accumulator,
            scratch,
            eof,
            ..
        } = inner;
        let Native::Tcp(stream) = native else { return };
        loop {
            let cap = scratch.len().min(accumulator.free());
            if cap == 0 {
                break;
            }
            match stream.read(&mut scratch[..cap]) {
                Ok(0) => {
                    *eof = true;
                    break;
                }
                Ok(n) => {
                    accumulator.push(&scratch[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    if trace_socket() {
                        eprintln!("guestnet socket: stream delivery failed: {err}");
                    }
                    if let Some(target) = recv.take() {
                        finished.push(Finished::plain(target.notify, SockResult::General));
                    }
                    return;
                }
            }
        }
        eof_now = *eof;
    }
    let SessionInner {
        recv, accumulator, ..
    } = inner;
    satisfy_stream(recv, accumulator, eof_now, finished);
}

fn satisfy_stream(
    recv: &mut Option<RecvTarget>,
    accumulator: &mut StreamAccumulator,
    eof: bool,
    finished: &mut Vec<Finished>,
) {
    let ready = match recv.as_ref() {
        None => return,
        Some(target) => {
            if target.take_available_only {
                !accumulator.is_empty()
            } else {
                // A full accumulator completes early rather than stall
                // a request larger than the buffer.
                accumulator.len() >= target.want || accumulator.free() == 0
            }
        }
    };
    if ready {
        if let Some(target) = recv.take() {
            let bytes = accumulator.pop(target.want);
            finished.push(deliver(target, bytes));
        }
        return;
    }
    if eof {
        if let Some(target) = recv.take() {
            finished.push(Finished::plain(target.notify, SockResult::Eof));
        }
    }
}

fn promote(inner: &mut SessionInner) {
    if !matches!(inner.native, Native::Pending(_)) {
        return;
    }
    let Native::Pending(socket) = std::mem::replace(&mut inner.native, Native::Closed) else {
        return;
    };
    inner.native = match inner.kind {
        SocketKind::Stream => Native::Tcp(mio::net::TcpStream::from_std(socket.into())),
        SocketKind::Datagram => Native::Udp(mio::net::UdpSocket::from_std(socket.into())),
    };
}
