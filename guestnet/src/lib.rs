//! guestnet — a guest-socket-to-host-socket bridge.
//!
//! Exposes a synchronous-looking, completion-notified socket API
//! (open/bind/connect/send/receive/cancel/options) to a guest execution
//! context while all native network I/O runs on a single background loop
//! thread driving a `mio` reactor. Guest calls arrive on arbitrary
//! threads; only `open` and `close` block (a round trip through the
//! loop), everything else returns after scheduling work and completes
//! later through a single-shot [`Notify`] fired from the loop thread
//! under the requester's owner lock.

pub mod accumulator;
pub mod addr;
mod ifaces;
pub mod looper;
pub mod notify;
pub mod session;
mod trace;

pub use guestnet_core::{
    GuestAddress, InterfaceInfo, SockResult, SocketKind, FAMILY_INET, FAMILY_INET6,
    IFACE_STATUS_DOWN, IFACE_STATUS_UP, OPT_ENUM_INTERFACES, OPT_FAMILY_INTERFACE_CONTROL,
    OPT_NEXT_INTERFACE, PROTOCOL_TCP, PROTOCOL_UDP, RECV_FLAG_DONT_WAIT_FULL,
};

pub use looper::{default_looper, shutdown_default_looper, Looper, LooperConfig};
pub use notify::{Notify, OwnerLock, Requester};
pub use session::{GuestBuffer, GuestCounter, ReceiveRequest, RecvCallback, SocketSession};
