use std::borrow::Cow;

use tokio::net::TcpStream;

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all interfaces". Tokio
/// bind APIs do not accept `":PORT"`, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Socket options for every tunneled TCP socket: Nagle off, no linger on close.
pub fn tune_stream(s: &TcpStream) {
    if let Err(err) = s.set_nodelay(true) {
        tracing::debug!(err = %err, "net: set_nodelay failed");
    }
    #[allow(deprecated)]
    let linger = s.set_linger(None);
    if let Err(err) = linger {
        tracing::debug!(err = %err, "net: set_linger failed");
    }
}
