//! Error kinds shared by every layer of the stack.
//!
//! Mirrors the signed `net_err_t` of the original course stack: one flat
//! enum of *kinds*, not a per-module error type. Inbound-path malformed
//! packets are dropped and logged rather than returned as errors — see the
//! call sites in `ipv4`, `arp`, `tcp::input`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Host primitive failure (driver open/close, clock, etc).
    Sys,
    /// A bounded object pool (pktbuf blocks/headers, socket table, ...) is exhausted.
    Mem,
    /// A bounded queue (fixq, netif in/out) is full.
    Full,
    /// A blocking wait exceeded its timeout.
    Tmo,
    /// No such resource (route, ARP entry, socket, reassembly record, ...).
    None,
    /// Malformed size argument (negative, too large, zero where disallowed).
    Size,
    /// Invalid argument.
    Param,
    /// The resource already exists (e.g. a bound address already in use).
    Exist,
    /// Call is invalid for the object's current state.
    State,
    /// Link-level I/O failure.
    Io,
    /// Requested option/feature isn't supported.
    NotSupport,
    /// Destination unreachable.
    Unreach,
    /// Checksum verification failed.
    Chksum,
    /// Socket is already connected.
    Connected,
    /// Peer reset the connection.
    Reset,
    /// Malformed packet.
    Broken,
    /// The worker installed a wait object; the caller should block on it.
    NeedWait,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetError::Sys => "system primitive failure",
            NetError::Mem => "out of resources",
            NetError::Full => "queue full",
            NetError::Tmo => "timed out",
            NetError::None => "not found",
            NetError::Size => "invalid size",
            NetError::Param => "invalid argument",
            NetError::Exist => "already exists",
            NetError::State => "invalid state for operation",
            NetError::Io => "link I/O error",
            NetError::NotSupport => "not supported",
            NetError::Unreach => "destination unreachable",
            NetError::Chksum => "checksum mismatch",
            NetError::Connected => "already connected",
            NetError::Reset => "connection reset",
            NetError::Broken => "malformed packet",
            NetError::NeedWait => "wait installed",
        };
        f.write_str(s)
    }
}

impl std::error::Error for NetError {}

pub type NetResult<T> = Result<T, NetError>;
