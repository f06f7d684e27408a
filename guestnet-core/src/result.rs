use std::io::{self, ErrorKind};

/// Guest-visible result codes.
///
/// Native errors are translated into this taxonomy at the point of origin,
/// on the loop thread, before they ever reach guest-visible state. The
/// mapping in [`SockResult::from_native`] is load-bearing for guest
/// compatibility and must not be reshuffled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockResult {
    /// Success.
    None,
    /// Native handle missing, or a native query failed.
    NotReady,
    /// An operation of this kind is already pending, or the socket is
    /// already open.
    InUse,
    /// Malformed address or buffer size.
    Argument,
    /// Unsupported family/protocol combination.
    NotSupported,
    PermissionDenied,
    AddressInUse,
    /// Connection refused by the peer.
    ServerBusy,
    TimedOut,
    /// Operation canceled by the guest.
    Cancel,
    /// Peer closed the connection / end of stream.
    Eof,
    /// Unclassified native failure.
    General,
}

impl SockResult {
    pub fn is_ok(self) -> bool {
        self == SockResult::None
    }

    /// Translates a native I/O error into the guest taxonomy.
    pub fn from_native(err: &io::Error) -> SockResult {
        match err.kind() {
            ErrorKind::PermissionDenied => SockResult::PermissionDenied,
            ErrorKind::AddrInUse => SockResult::AddressInUse,
            ErrorKind::AddrNotAvailable => SockResult::Argument,
            ErrorKind::ConnectionRefused => SockResult::ServerBusy,
            ErrorKind::TimedOut => SockResult::TimedOut,
            ErrorKind::Unsupported => SockResult::NotSupported,
            _ => Self::from_raw_os(err),
        }
    }

    // `io::ErrorKind` is lossy for a few of the codes the guest mapping
    // cares about, so fall back to the raw errno where the kind did not
    // classify.
    #[cfg(unix)]
    fn from_raw_os(err: &io::Error) -> SockResult {
        match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => SockResult::PermissionDenied,
            Some(libc::EADDRINUSE) => SockResult::AddressInUse,
            Some(libc::EADDRNOTAVAIL) => SockResult::Argument,
            Some(libc::EAFNOSUPPORT) => SockResult::NotSupported,
            Some(libc::ECONNREFUSED) => SockResult::ServerBusy,
            Some(libc::ENOTSUP) => SockResult::NotSupported,
            Some(libc::ETIMEDOUT) => SockResult::TimedOut,
            _ => SockResult::General,
        }
    }

    #[cfg(not(unix))]
    fn from_raw_os(_err: &io::Error) -> SockResult {
        SockResult::General
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping_matches_guest_taxonomy() {
        let cases = [
            (ErrorKind::PermissionDenied, SockResult::PermissionDenied),
            (ErrorKind::AddrInUse, SockResult::AddressInUse),
            (ErrorKind::AddrNotAvailable, SockResult::Argument),
            (ErrorKind::ConnectionRefused, SockResult::ServerBusy),
            (ErrorKind::TimedOut, SockResult::TimedOut),
            (ErrorKind::Unsupported, SockResult::NotSupported),
            (ErrorKind::Other, SockResult::General),
        ];
        for (kind, expected) in cases {
            let err = io::Error::new(kind, "test");
            assert_eq!(SockResult::from_native(&err), expected);
        }
    }

    #[cfg(unix)]
    #[test]
    fn raw_errno_fallback_classifies() {
        let err = io::Error::from_raw_os_error(libc::EAFNOSUPPORT);
        assert_eq!(SockResult::from_native(&err), SockResult::NotSupported);
        let err = io::Error::from_raw_os_error(libc::ECONNREFUSED);
        assert_eq!(SockResult::from_native(&err), SockResult::ServerBusy);
    }
}
