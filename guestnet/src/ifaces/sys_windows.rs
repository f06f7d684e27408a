//! `GetAdaptersAddresses` based enumeration for windows hosts.

use std::io;
use std::ptr;

use guestnet_core::{GuestAddress, InterfaceInfo, IFACE_STATUS_DOWN, IFACE_STATUS_UP};
use windows_sys::Win32::Foundation::{ERROR_BUFFER_OVERFLOW, NO_ERROR};
use windows_sys::Win32::NetworkManagement::IpHelper::{
    ConvertLengthToIpv4Mask, GetAdaptersAddresses, GAA_FLAG_INCLUDE_GATEWAYS,
    IP_ADAPTER_ADDRESSES_LH,
};
use windows_sys::Win32::NetworkManagement::Ndis::IfOperStatusUp;
use windows_sys::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, AF_UNSPEC, SOCKADDR, SOCKADDR_IN, SOCKADDR_IN6,
};

pub(crate) fn snapshot() -> io::Result<Vec<InterfaceInfo>> {
    let mut size: u32 = 16 * 1024;
    let mut buf: Vec<u8>;
    loop {
        buf = vec![0u8; size as usize];
        let status = unsafe {
            GetAdaptersAddresses(
                AF_UNSPEC as u32,
                GAA_FLAG_INCLUDE_GATEWAYS,
                ptr::null_mut(),
                buf.as_mut_ptr() as *mut IP_ADAPTER_ADDRESSES_LH,
                &mut size,
            )
        };
        if status == NO_ERROR {
            break;
        }
        if status != ERROR_BUFFER_OVERFLOW {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        // size now holds the required length; retry with it.
    }

    let mut out = Vec::new();
    let mut adapter = buf.as_ptr() as *const IP_ADAPTER_ADDRESSES_LH;
    while !adapter.is_null() {
        let entry = unsafe { &*adapter };
        adapter = entry.Next;

        let name = wide_string(entry.FriendlyName);
        let status = if entry.OperStatus == IfOperStatusUp {
            IFACE_STATUS_UP
        } else {
            IFACE_STATUS_DOWN
        };
        let mut hardware_addr = [0u8; 8];
        let hw_len = (entry.PhysicalAddressLength as usize).min(hardware_addr.len());
        hardware_addr[..hw_len].copy_from_slice(&entry.PhysicalAddress[..hw_len]);

        let name_server = {
            let dns = entry.FirstDnsServerAddress;
            if dns.is_null() {
                None
            } else {
                guest_addr(unsafe { (*dns).Address.lpSockaddr })
            }
        };
        let gateway = {
            let gw = entry.FirstGatewayAddress;
            if gw.is_null() {
                None
            } else {
                guest_addr(unsafe { (*gw).Address.lpSockaddr })
            }
        };

        // One record per unicast address of the adapter.
        let mut unicast = entry.FirstUnicastAddress;
        while !unicast.is_null() {
            let entry_addr = unsafe { &*unicast };
            unicast = entry_addr.Next;
            let Some(addr) = guest_addr(entry_addr.Address.lpSockaddr) else {
                continue;
            };
            let mut info = InterfaceInfo {
                name: name.clone(),
                status,
                mtu: entry.Mtu as i32,
                speed_metric: (entry.ReceiveLinkSpeed / 1024) as i32,
                hardware_addr,
                hardware_addr_len: hw_len as u32,
                addr: Some(addr),
                name_server,
                gateway,
                ..InterfaceInfo::default()
            };
            if let GuestAddress::V4 { addr: ip, .. } = addr {
                let mut mask: u32 = 0;
                let prefix = u32::from(entry_addr.OnLinkPrefixLength);
                if unsafe { ConvertLengthToIpv4Mask(prefix, &mut mask) } == NO_ERROR {
                    let mask_bytes = mask.to_ne_bytes();
                    info.netmask = Some(GuestAddress::v4(mask_bytes, 0));
                    let mut bcast = [0u8; 4];
                    for (out_byte, (ip_byte, mask_byte)) in
                        bcast.iter_mut().zip(ip.iter().zip(mask_bytes.iter()))
                    {
                        *out_byte = ip_byte | !mask_byte;
                    }
                    info.broadcast = Some(GuestAddress::v4(bcast, 0));
                }
            }
            out.push(info);
        }
    }
    Ok(out)
}

fn wide_string(raw: *const u16) -> String {
    if raw.is_null() {
        return String::new();
    }
    let mut len = 0;
    unsafe {
        while *raw.add(len) != 0 {
            len += 1;
        }
        String::from_utf16_lossy(std::slice::from_raw_parts(raw, len))
    }
}

fn guest_addr(sa: *const SOCKADDR) -> Option<GuestAddress> {
    if sa.is_null() {
        return None;
    }
    unsafe {
        match (*sa).sa_family {
            AF_INET => {
                let sin = &*(sa as *const SOCKADDR_IN);
                Some(GuestAddress::v4(
                    sin.sin_addr.S_un.S_addr.to_ne_bytes(),
                    u16::from_be(sin.sin_port),
                ))
            }
            AF_INET6 => {
                let sin6 = &*(sa as *const SOCKADDR_IN6);
                Some(GuestAddress::v6(
                    sin6.sin6_addr.u.Byte,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.Anonymous.sin6_scope_id,
                ))
            }
            _ => None,
        }
    }
}
