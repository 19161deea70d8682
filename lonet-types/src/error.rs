use std::fmt;

fn with_errno(errno: i32, msg: &str) -> String {
    format!("[Errno {errno}] {msg}")
}

/// The well-defined-error taxonomy of lonet: an error whose identity already
/// conveys full meaning, so a wrapping context error never appends a cause
/// traceback for it (see [`VirtnetError::errno`]). The six errno-bearing
/// variants render with the `"[Errno N] ..."` prefix the reference
/// implementation's `net.error` uses, so a wrapped chain's leaf text matches
/// the OS-level error a real socket call would have produced.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum VirtnetError {
    #[error("{}", with_errno(libc::EBADFD, "network is down"))]
    NetworkDown,
    #[error("{}", with_errno(libc::EBADFD, "host is down"))]
    HostDown,
    #[error("{}", with_errno(libc::EBADFD, "socket is down"))]
    SocketDown,
    #[error("{}", with_errno(libc::EADDRINUSE, "address already in use"))]
    AddrInUse,
    #[error("{}", with_errno(libc::EADDRNOTAVAIL, "cannot listen on requested address"))]
    AddrNotAvailable,
    #[error("{}", with_errno(libc::ECONNREFUSED, "connection refused"))]
    ConnectionRefused,
    #[error("no such host")]
    NoSuchHost,
    #[error("host already registered")]
    HostAlreadyRegistered,
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl VirtnetError {
    /// The `errno` value from spec §6, or `None` for the three errors that
    /// have no OS-level equivalent.
    pub fn errno(&self) -> Option<i32> {
        match self {
            VirtnetError::NetworkDown | VirtnetError::HostDown | VirtnetError::SocketDown => {
                Some(libc::EBADFD)
            }
            VirtnetError::AddrInUse => Some(libc::EADDRINUSE),
            VirtnetError::AddrNotAvailable => Some(libc::EADDRNOTAVAIL),
            VirtnetError::ConnectionRefused => Some(libc::ECONNREFUSED),
            VirtnetError::NoSuchHost
            | VirtnetError::HostAlreadyRegistered
            | VirtnetError::ProtocolError(_) => None,
        }
    }

    /// The `"[Errno N] ..."`-prefixed display text, same as [`ToString`] —
    /// kept as a named method since call sites that specifically want the
    /// OS-error framing read better spelling it out.
    pub fn errno_display(&self) -> String {
        self.to_string()
    }
}

/// Walks `err`'s source chain and returns the deepest error, mirroring the
/// reference implementation's `xerr.cause`.
pub fn deepest_cause<'a>(err: &'a (dyn std::error::Error + 'static)) -> &'a (dyn std::error::Error + 'static) {
    let mut cur = err;
    while let Some(next) = cur.source() {
        cur = next;
    }
    cur
}

/// A type-erased, `Send + Sync` error. Used at the registry/virtnet seam
/// (connection pool factories, `Registry::query`) where a crate needs to
/// hand back "some `std::error::Error`" without naming a concrete type.
#[derive(Debug)]
pub struct AnyError(pub Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AnyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}
