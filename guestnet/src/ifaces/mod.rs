//! Host interface enumeration.
//!
//! Produces the snapshot behind the interface-control option family.
//! One record per host address entry, so multi-homed interfaces appear
//! once per address.

use std::io;

use guestnet_core::InterfaceInfo;

#[cfg(unix)]
mod sys_unix;
#[cfg(windows)]
mod sys_windows;

pub(crate) fn snapshot() -> io::Result<Vec<InterfaceInfo>> {
    #[cfg(unix)]
    {
        sys_unix::snapshot()
    }
    #[cfg(windows)]
    {
        sys_windows::snapshot()
    }
    #[cfg(not(any(unix, windows)))]
    {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_entries_carry_an_address() {
        let list = snapshot().unwrap();
        for entry in &list {
            assert!(!entry.name.is_empty());
            assert!(entry.addr.is_some());
        }
    }
}
