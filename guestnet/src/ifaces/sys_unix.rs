//! `getifaddrs` based enumeration for unix hosts.

use std::ffi::CStr;
use std::io;
use std::ptr;

use guestnet_core::{GuestAddress, InterfaceInfo, IFACE_STATUS_DOWN, IFACE_STATUS_UP};

// getifaddrs does not report these; use the common ethernet value and
// leave the speed metric unreported.
const DEFAULT_MTU: i32 = 1500;

pub(crate) fn snapshot() -> io::Result<Vec<InterfaceInfo>> {
    let mut list: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut list) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if let Some(info) = convert(entry) {
            out.push(info);
        }
    }
    unsafe { libc::freeifaddrs(list) };
    Ok(out)
}

fn convert(entry: &libc::ifaddrs) -> Option<InterfaceInfo> {
    // Entries without an inet/inet6 address (link-layer rows) are skipped.
    let addr = guest_addr(entry.ifa_addr)?;
    let name = unsafe { CStr::from_ptr(entry.ifa_name) }
        .to_string_lossy()
        .into_owned();
    let mut info = InterfaceInfo {
        name,
        status: if entry.ifa_flags & libc::IFF_UP as u32 != 0 {
            IFACE_STATUS_UP
        } else {
            IFACE_STATUS_DOWN
        },
        mtu: DEFAULT_MTU,
        addr: Some(addr),
        netmask: guest_addr(entry.ifa_netmask),
        ..InterfaceInfo::default()
    };
    if entry.ifa_flags & libc::IFF_BROADCAST as u32 != 0 {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            info.broadcast = guest_addr(entry.ifa_ifu);
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            info.broadcast = guest_addr(entry.ifa_dstaddr);
        }
    }
    Some(info)
}

fn guest_addr(sa: *const libc::sockaddr) -> Option<GuestAddress> {
    if sa.is_null() {
        return None;
    }
    unsafe {
        match i32::from((*sa).sa_family) {
            libc::AF_INET => {
                let sin = &*(sa as *const libc::sockaddr_in);
                Some(GuestAddress::v4(
                    sin.sin_addr.s_addr.to_ne_bytes(),
                    u16::from_be(sin.sin_port),
                ))
            }
            libc::AF_INET6 => {
                let sin6 = &*(sa as *const libc::sockaddr_in6);
                Some(GuestAddress::v6(
                    sin6.sin6_addr.s6_addr,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                ))
            }
            _ => None,
        }
    }
}
