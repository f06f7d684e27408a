use std::sync::OnceLock;

pub(crate) fn trace_looper() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("GUESTNET_TRACE_LOOPER").as_deref() == Ok("1"))
}

pub(crate) fn trace_socket() -> bool {
    static TRACE: OnceLock<bool> = OnceLock::new();
    *TRACE.get_or_init(|| std::env::var("GUESTNET_TRACE_SOCKET").as_deref() == Ok("1"))
}
