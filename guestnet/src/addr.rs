//! Guest ↔ native socket address translation.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use guestnet_core::GuestAddress;
use socket2::SockAddr;

/// Converts a guest address into the native form the host stack consumes.
/// Pure and total for both families.
pub fn to_native(addr: &GuestAddress) -> SockAddr {
    SockAddr::from(to_socket_addr(addr))
}

pub(crate) fn to_socket_addr(addr: &GuestAddress) -> SocketAddr {
    match *addr {
        GuestAddress::V4 { port, addr } => {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(addr), port))
        }
        GuestAddress::V6 {
            port,
            addr,
            flow,
            scope,
        } => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(addr), port, flow, scope)),
    }
}

/// Converts a native address back into the guest layout. Returns `None`
/// for non-internet families; callers surface that as `Argument`.
pub fn from_native(addr: &SockAddr) -> Option<GuestAddress> {
    addr.as_socket().map(|std_addr| from_socket_addr(&std_addr))
}

pub(crate) fn from_socket_addr(addr: &SocketAddr) -> GuestAddress {
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

/// Datagram receive-filter comparison: family, port and raw bytes must
/// match, and for IPv6 the flow label and scope id as well.
pub(crate) fn matches_socket_addr(filter: &GuestAddress, candidate: &SocketAddr) -> bool {
    from_socket_addr(candidate) == *filter
}
