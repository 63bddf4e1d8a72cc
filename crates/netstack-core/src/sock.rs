//! Shared sock base and the per-socket wait-object rendezvous.
//!
//! The BSD-style API (`socket.rs`) packages every application call into a
//! work item posted to the worker; when a handler can't complete
//! synchronously (an empty TCP receive buffer, a pending `connect`), it
//! installs the caller's [`WaitObject`] and returns [`NetError::NeedWait`].
//! The API layer then blocks on that same wait object until the worker
//! wakes it — modeled here as a `crossbeam_channel::bounded(1)` rendezvous,
//! the same one-shot pattern the teacher's capture pipeline uses for its
//! relay threads.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{NetError, NetResult};
use crate::ipaddr::IpAddr;
use crate::mblock::Timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Raw,
    Dgram,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Icmp,
    Udp,
    Tcp,
}

/// One rendezvous: the worker wakes it exactly once with a result; the
/// waiting application thread blocks on `enter` until woken or timed out.
/// A socket may hold up to three (receive, send, connection).
pub struct WaitObject {
    tx: Sender<NetResult<()>>,
    rx: Receiver<NetResult<()>>,
}

impl WaitObject {
    pub fn new() -> WaitObject {
        let (tx, rx) = crossbeam_channel::bounded(1);
        WaitObject { tx, rx }
    }

    pub fn enter(&self, tmo: Timeout) -> NetResult<()> {
        match tmo {
            Timeout::NonBlocking => self.rx.try_recv().map_err(|_| NetError::Tmo).and_then(|r| r),
            Timeout::Forever => self.rx.recv().map_err(|_| NetError::Sys).and_then(|r| r),
            Timeout::Millis(ms) => self
                .rx
                .recv_timeout(Duration::from_millis(ms))
                .map_err(|e| match e {
                    RecvTimeoutError::Timeout => NetError::Tmo,
                    RecvTimeoutError::Disconnected => NetError::Sys,
                })
                .and_then(|r| r),
        }
    }

    /// Wakes the (single) waiter with `result`. A no-op if nobody is
    /// waiting yet — the result sits in the bounded(1) slot until `enter`
    /// is called.
    pub fn wake(&self, result: NetResult<()>) {
        let _ = self.tx.try_send(result);
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields common to every sock variant (raw/udp/tcp embed this as their
/// first field, per spec.md §3).
pub struct SockBase {
    pub family: Family,
    pub protocol: Protocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub rcv_tmo: Timeout,
    pub snd_tmo: Timeout,
    pub last_error: Option<NetError>,
    pub rcv_wait: WaitObject,
    pub snd_wait: WaitObject,
    pub conn_wait: WaitObject,
}

impl SockBase {
    pub fn new(family: Family, protocol: Protocol) -> SockBase {
        SockBase {
            family,
            protocol,
            local_ip: IpAddr::ANY,
            local_port: 0,
            remote_ip: IpAddr::ANY,
            remote_port: 0,
            rcv_tmo: Timeout::Forever,
            snd_tmo: Timeout::Forever,
            last_error: None,
            rcv_wait: WaitObject::new(),
            snd_wait: WaitObject::new(),
            conn_wait: WaitObject::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.remote_ip.is_any() && self.remote_port != 0
    }
}

/// `setsockopt` levels/options recognized per spec.md §4.10.
#[derive(Debug, Clone, Copy)]
pub enum SockOpt {
    RcvTimeoMs(u32),
    SndTimeoMs(u32),
    KeepAlive(bool),
    TcpKeepIdleS(u32),
    TcpKeepIntvlS(u32),
    TcpKeepCnt(u32),
}

/// Picks a free ephemeral port (`[1024, 65535]`) not already used by
/// `in_use`. Linear scan starting from a rotating offset — good enough for
/// the socket counts this stack's config caps allow.
pub fn alloc_ephemeral_port(in_use: impl Fn(u16) -> bool, start_hint: u16) -> NetResult<u16> {
    let start = start_hint.max(1024);
    for offset in 0..(65535 - 1024 + 1) {
        let port = 1024 + ((start as u32 - 1024 + offset) % (65535 - 1024 + 1)) as u16;
        if !in_use(port) {
            return Ok(port);
        }
    }
    Err(NetError::Mem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_object_wakes_waiter() {
        let w = WaitObject::new();
        w.wake(Ok(()));
        assert_eq!(w.enter(Timeout::NonBlocking), Ok(()));
    }

    #[test]
    fn wait_object_times_out_when_never_woken() {
        let w = WaitObject::new();
        assert_eq!(w.enter(Timeout::Millis(10)), Err(NetError::Tmo));
    }

    #[test]
    fn ephemeral_port_skips_in_use() {
        let port = alloc_ephemeral_port(|p| p == 1024, 1024);
        assert_eq!(port, Ok(1025));
    }
}
