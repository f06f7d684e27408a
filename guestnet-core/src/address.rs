use crate::{FAMILY_INET, FAMILY_INET6};

/// A socket address in the guest's neutral layout.
///
/// IPv4 carries 4 raw address bytes and a port; IPv6 additionally carries
/// a flow label and a scope identifier. Equality compares every field the
/// guest can observe, which is also the datagram receive-filter contract:
/// for IPv6 a filter only matches when flow and scope agree too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestAddress {
    V4 {
        port: u16,
        addr: [u8; 4],
    },
    V6 {
        port: u16,
        addr: [u8; 16],
        flow: u32,
        scope: u32,
    },
}

impl GuestAddress {
    pub fn v4(addr: [u8; 4], port: u16) -> Self {
        GuestAddress::V4 { port, addr }
    }

    pub fn v6(addr: [u8; 16], port: u16, flow: u32, scope: u32) -> Self {
        GuestAddress::V6 {
            port,
            addr,
            flow,
            scope,
        }
    }

    /// The guest family tag for this address.
    pub fn family(&self) -> u32 {
        match self {
            GuestAddress::V4 { .. } => FAMILY_INET,
            GuestAddress::V6 { .. } => FAMILY_INET6,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            GuestAddress::V4 { port, .. } | GuestAddress::V6 { port, .. } => *port,
        }
    }

    /// Raw address bytes: 4 for IPv4, 16 for IPv6.
    pub fn raw_bytes(&self) -> &[u8] {
        match self {
            GuestAddress::V4 { addr, .. } => addr,
            GuestAddress::V6 { addr, .. } => addr,
        }
    }
}
