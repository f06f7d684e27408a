//! End-to-end exercises against real loopback sockets, with plain std
//! sockets standing in for the remote peers.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use guestnet::{
    GuestAddress, GuestBuffer, InterfaceInfo, Looper, LooperConfig, Notify, OwnerLock,
    ReceiveRequest, Requester, SockResult, SocketKind, SocketSession, FAMILY_INET,
    OPT_ENUM_INTERFACES, OPT_FAMILY_INTERFACE_CONTROL, OPT_NEXT_INTERFACE, PROTOCOL_TCP,
    PROTOCOL_UDP, RECV_FLAG_DONT_WAIT_FULL,
};

const WAIT: Duration = Duration::from_secs(5);

fn fresh() -> (Arc<Looper>, SocketSession) {
    let looper = Looper::new(LooperConfig::default()).unwrap();
    Looper::start(&looper).unwrap();
    let session = SocketSession::new(Arc::clone(&looper));
    (looper, session)
}

fn notify_into(tx: mpsc::Sender<SockResult>) -> Notify {
    Notify::new(Requester::new(OwnerLock::new()), move |result| {
        let _ = tx.send(result);
    })
}

fn guest_of(addr: SocketAddr) -> GuestAddress {
    match addr {
        SocketAddr::V4(v4) => GuestAddress::v4(v4.ip().octets(), v4.port()),
        SocketAddr::V6(v6) => GuestAddress::v6(
            v6.ip().octets(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        ),
    }
}

fn request(dest: &GuestBuffer, want: usize, flags: u32) -> ReceiveRequest {
    ReceiveRequest {
        dest: Arc::clone(dest),
        want,
        out_read: None,
        flags,
        filter: None,
        on_data: None,
    }
}

fn bind_loopback(session: &SocketSession) -> GuestAddress {
    let (tx, rx) = mpsc::channel();
    session.bind(&GuestAddress::v4([127, 0, 0, 1], 0), notify_into(tx));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    // The native bind runs asynchronously on the loop thread; wait for
    // it before reading the bound address.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let local = session.local_name().unwrap();
        if local.port() != 0 {
            return local;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "native bind did not complete in time"
        );
        thread::yield_now();
    }
}

#[test]
fn udp_round_trip() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let local = bind_loopback(&session);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let out_read = Arc::new(AtomicUsize::new(usize::MAX));
    let (data_tx, data_rx) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    session.receive(
        ReceiveRequest {
            dest: Arc::clone(&dest),
            want: 64,
            out_read: Some(Arc::clone(&out_read)),
            flags: 0,
            filter: None,
            on_data: Some(Box::new(move |n| {
                let _ = data_tx.send(n);
            })),
        },
        notify_into(tx),
    );

    peer.send_to(b"ping", ("127.0.0.1", local.port())).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(data_rx.recv_timeout(WAIT).unwrap(), 4);
    assert_eq!(&*dest.lock().unwrap(), b"ping");
    assert_eq!(out_read.load(Ordering::Acquire), 4);

    let (tx, rx) = mpsc::channel();
    let peer_guest = guest_of(peer.local_addr().unwrap());
    session.send(b"pong", Some(&peer_guest), 0, None, notify_into(tx));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    let mut scratch = [0u8; 16];
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let (n, _) = peer.recv_from(&mut scratch).unwrap();
    assert_eq!(&scratch[..n], b"pong");

    session.close();
    looper.shutdown();
}

#[test]
fn bind_completes_before_the_loop_runs_it() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    // Stall the loop thread; the completion must not wait for it.
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    assert!(looper.post(move || {
        let _ = hold_rx.recv();
    }));
    let (tx, rx) = mpsc::channel();
    session.bind(&GuestAddress::v4([127, 0, 0, 1], 0), notify_into(tx));
    assert_eq!(rx.try_recv().unwrap(), SockResult::None);

    hold_tx.send(()).unwrap();
    session.close();
    looper.shutdown();
}

#[test]
fn datagram_filter_discards_other_sources() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let local = bind_loopback(&session);

    let noisy = UdpSocket::bind("127.0.0.1:0").unwrap();
    let wanted = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(
        ReceiveRequest {
            filter: Some(guest_of(wanted.local_addr().unwrap())),
            ..request(&dest, 64, 0)
        },
        notify_into(tx),
    );

    noisy
        .send_to(b"noise", ("127.0.0.1", local.port()))
        .unwrap();
    wanted
        .send_to(b"signal", ("127.0.0.1", local.port()))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"signal");

    session.close();
    looper.shutdown();
}

#[test]
fn datagram_delivery_truncates_to_request() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let local = bind_loopback(&session);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let out_read = Arc::new(AtomicUsize::new(usize::MAX));
    let (tx, rx) = mpsc::channel();
    session.receive(
        ReceiveRequest {
            out_read: Some(Arc::clone(&out_read)),
            ..request(&dest, 4, 0)
        },
        notify_into(tx),
    );

    peer.send_to(b"abcdefgh", ("127.0.0.1", local.port()))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"abcd");
    assert_eq!(out_read.load(Ordering::Acquire), 4);

    session.close();
    looper.shutdown();
}

#[test]
fn unrecognized_receive_flags_are_ignored() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let local = bind_loopback(&session);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(request(&dest, 64, 0x80), notify_into(tx));
    peer.send_to(b"still fine", ("127.0.0.1", local.port()))
        .unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"still fine");

    session.close();
    looper.shutdown();
}

#[test]
fn stream_accumulates_until_request_is_full() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Stream, PROTOCOL_TCP),
        SockResult::None
    );
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (tx, rx) = mpsc::channel();
    session.connect(&guest_of(listener.local_addr().unwrap()), notify_into(tx));
    let (mut peer, _) = listener.accept().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(
        session.remote_name().unwrap(),
        guest_of(listener.local_addr().unwrap())
    );

    // Three separate writes; the full-length request completes only once
    // ten bytes are buffered.
    use std::io::Write;
    peer.write_all(b"abc").unwrap();
    peer.write_all(b"defg").unwrap();
    peer.write_all(b"hijkl").unwrap();

    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(request(&dest, 10, 0), notify_into(tx));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"abcdefghij");

    // The leftover two bytes satisfy a take-available request at once.
    let (tx, rx) = mpsc::channel();
    session.receive(
        request(&dest, 64, RECV_FLAG_DONT_WAIT_FULL),
        notify_into(tx),
    );
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"kl");

    session.close();
    looper.shutdown();
}

#[test]
fn stream_receive_reports_eof() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Stream, PROTOCOL_TCP),
        SockResult::None
    );
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let (tx, rx) = mpsc::channel();
    session.connect(&guest_of(listener.local_addr().unwrap()), notify_into(tx));
    let (peer, _) = listener.accept().unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);

    drop(peer);
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(request(&dest, 10, 0), notify_into(tx));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::Eof);

    session.close();
    looper.shutdown();
}

#[test]
fn refused_connect_reports_server_busy() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Stream, PROTOCOL_TCP),
        SockResult::None
    );
    // Grab a port that is certainly closed.
    let addr = {
        let placeholder = TcpListener::bind("127.0.0.1:0").unwrap();
        placeholder.local_addr().unwrap()
    };
    let (tx, rx) = mpsc::channel();
    session.connect(&guest_of(addr), notify_into(tx));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::ServerBusy);

    session.close();
    looper.shutdown();
}

#[test]
fn close_cancels_pending_receive_once_and_session_reopens() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    bind_loopback(&session);

    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(request(&dest, 64, 0), notify_into(tx));
    session.close();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::Cancel);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // A closed session is a fresh one.
    session.close();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );

    session.close();
    looper.shutdown();
}

#[test]
fn close_cancels_every_pending_operation_exactly_once() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    bind_loopback(&session);
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_guest = guest_of(peer.local_addr().unwrap());

    // Stall the loop thread so connect, send and receive all stay
    // pending when close runs.
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    assert!(looper.post(move || {
        let _ = hold_rx.recv();
    }));
    let (connect_tx, connect_rx) = mpsc::channel();
    session.connect(&peer_guest, notify_into(connect_tx));
    let (send_tx, send_rx) = mpsc::channel();
    session.send(b"queued", Some(&peer_guest), 0, None, notify_into(send_tx));
    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (recv_tx, recv_rx) = mpsc::channel();
    session.receive(request(&dest, 64, 0), notify_into(recv_tx));

    // Close blocks on the loop for teardown, but cancels the pendings
    // on the calling thread first.
    let closer = thread::spawn(move || {
        session.close();
        session
    });
    assert_eq!(connect_rx.recv_timeout(WAIT).unwrap(), SockResult::Cancel);
    assert_eq!(send_rx.recv_timeout(WAIT).unwrap(), SockResult::Cancel);
    assert_eq!(recv_rx.recv_timeout(WAIT).unwrap(), SockResult::Cancel);
    hold_tx.send(()).unwrap();
    let session = closer.join().unwrap();

    assert!(connect_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(send_rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(recv_rx.recv_timeout(Duration::from_millis(200)).is_err());
    drop(session);
    looper.shutdown();
}

#[test]
fn cancel_receive_completes_cancel_exactly_once() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    bind_loopback(&session);

    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    session.receive(request(&dest, 64, 0), notify_into(tx));
    session.cancel_receive();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::Cancel);
    session.cancel_receive();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    session.close();
    looper.shutdown();
}

#[test]
fn second_receive_reports_in_use_without_disturbing_the_first() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let local = bind_loopback(&session);

    let dest: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (first_tx, first_rx) = mpsc::channel();
    session.receive(request(&dest, 64, 0), notify_into(first_tx));

    let other: GuestBuffer = Arc::new(Mutex::new(Vec::new()));
    let (second_tx, second_rx) = mpsc::channel();
    session.receive(request(&other, 64, 0), notify_into(second_tx));
    assert_eq!(second_rx.recv_timeout(WAIT).unwrap(), SockResult::InUse);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.send_to(b"still here", ("127.0.0.1", local.port()))
        .unwrap();
    assert_eq!(first_rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    assert_eq!(&*dest.lock().unwrap(), b"still here");

    session.close();
    looper.shutdown();
}

#[test]
fn second_connect_reports_in_use_while_the_first_is_queued() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_guest = guest_of(peer.local_addr().unwrap());

    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    assert!(looper.post(move || {
        let _ = hold_rx.recv();
    }));
    let (first_tx, first_rx) = mpsc::channel();
    session.connect(&peer_guest, notify_into(first_tx));
    let (second_tx, second_rx) = mpsc::channel();
    session.connect(&peer_guest, notify_into(second_tx));
    assert_eq!(second_rx.try_recv().unwrap(), SockResult::InUse);

    hold_tx.send(()).unwrap();
    assert_eq!(first_rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    session.close();
    looper.shutdown();
}

#[test]
fn second_send_reports_in_use_without_disturbing_the_first() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_guest = guest_of(peer.local_addr().unwrap());

    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    assert!(looper.post(move || {
        let _ = hold_rx.recv();
    }));
    let (first_tx, first_rx) = mpsc::channel();
    session.send(b"first", Some(&peer_guest), 0, None, notify_into(first_tx));
    let (second_tx, second_rx) = mpsc::channel();
    session.send(b"second", Some(&peer_guest), 0, None, notify_into(second_tx));
    assert_eq!(second_rx.try_recv().unwrap(), SockResult::InUse);

    hold_tx.send(()).unwrap();
    assert_eq!(first_rx.recv_timeout(WAIT).unwrap(), SockResult::None);
    let mut scratch = [0u8; 16];
    peer.set_read_timeout(Some(WAIT)).unwrap();
    let (n, _) = peer.recv_from(&mut scratch).unwrap();
    assert_eq!(&scratch[..n], b"first");
    session.close();
    looper.shutdown();
}

#[test]
fn send_reports_optimistic_written_count() {
    let (looper, session) = fresh();
    assert_eq!(
        session.open(FAMILY_INET, SocketKind::Datagram, PROTOCOL_UDP),
        SockResult::None
    );
    bind_loopback(&session);

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let peer_guest = guest_of(peer.local_addr().unwrap());
    let out_written = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    session.send(
        b"a dozen bytes",
        Some(&peer_guest),
        0,
        Some(&out_written),
        notify_into(tx),
    );
    // The count is reported at call time, before completion.
    assert_eq!(out_written.load(Ordering::Acquire), 13);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), SockResult::None);

    session.close();
    looper.shutdown();
}

#[test]
fn interface_enumeration_walks_to_eof() {
    let (looper, session) = fresh();
    assert_eq!(
        session.set_option(OPT_FAMILY_INTERFACE_CONTROL, OPT_ENUM_INTERFACES, &[]),
        SockResult::None
    );

    let mut short = [0u8; 8];
    assert_eq!(
        session.get_option(OPT_FAMILY_INTERFACE_CONTROL, OPT_NEXT_INTERFACE, &mut short),
        SockResult::Argument
    );

    let mut out = vec![0u8; InterfaceInfo::WIRE_SIZE];
    loop {
        match session.get_option(OPT_FAMILY_INTERFACE_CONTROL, OPT_NEXT_INTERFACE, &mut out) {
            SockResult::None => {
                let entry = InterfaceInfo::decode(&out).unwrap();
                assert!(entry.addr.is_some());
            }
            SockResult::Eof => break,
            other => panic!("unexpected result: {other:?}"),
        }
    }
    // The cursor stays at the end until re-enumeration.
    assert_eq!(
        session.get_option(OPT_FAMILY_INTERFACE_CONTROL, OPT_NEXT_INTERFACE, &mut out),
        SockResult::Eof
    );

    looper.shutdown();
}
