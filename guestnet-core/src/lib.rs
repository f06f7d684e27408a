//! Guest-visible data model for the guestnet socket bridge.
//!
//! Everything in this crate crosses the guest boundary: result codes,
//! socket addresses in the guest's neutral layout, the fixed-size network
//! interface record, and the identifier constants the guest protocol stack
//! uses to select families, protocols and options. The bridge itself lives
//! in the `guestnet` crate.

mod address;
mod iface;
mod result;

pub use address::GuestAddress;
pub use iface::{InterfaceInfo, IFACE_STATUS_DOWN, IFACE_STATUS_UP};
pub use result::SockResult;

/// Guest address family identifier for IPv4.
pub const FAMILY_INET: u32 = 0x0800;
/// Guest address family identifier for IPv6.
pub const FAMILY_INET6: u32 = 0x0806;

/// Guest protocol identifier for TCP.
pub const PROTOCOL_TCP: u32 = 6;
/// Guest protocol identifier for UDP.
pub const PROTOCOL_UDP: u32 = 17;

/// Receive flag bit: complete with whatever is available instead of
/// waiting for the full requested byte count.
pub const RECV_FLAG_DONT_WAIT_FULL: u32 = 0x01;

/// Option family for interface-control operations.
pub const OPT_FAMILY_INTERFACE_CONTROL: u32 = 0x0201;
/// Set-option id: (re)start a network interface enumeration snapshot.
pub const OPT_ENUM_INTERFACES: u32 = 0x0211;
/// Get-option id: fetch the interface at the cursor and advance.
pub const OPT_NEXT_INTERFACE: u32 = 0x0212;

/// The two socket shapes the bridge supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Connection-oriented byte stream (TCP).
    Stream,
    /// Connectionless datagrams (UDP).
    Datagram,
}
