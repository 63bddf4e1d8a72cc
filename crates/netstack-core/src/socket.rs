//! BSD-style socket descriptor bookkeeping.
//!
//! This module only owns the *table*: a generic slab mapping small integer
//! descriptors to socket objects, plus the handful of `setsockopt` settings
//! that apply uniformly across raw/UDP/TCP sockets. The actual socket-API
//! verbs (`connect`, `listen`, `send`, ...) need the route table, ARP cache
//! and netif queues alongside the table, so they're methods on
//! [`crate::stack::Stack`].

use std::collections::HashMap;

use crate::error::{NetError, NetResult};
use crate::mblock::Timeout;
use crate::sock::{SockBase, SockOpt};

pub type Fd = i32;

/// A capacity-bounded slab: `insert` fails with [`NetError::Mem`] once full,
/// matching the original's fixed-size socket tables.
pub struct Slab<T> {
    entries: Vec<Option<T>>,
}

impl<T> Slab<T> {
    pub fn new(capacity: usize) -> Slab<T> {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Slab { entries }
    }

    pub fn insert(&mut self, value: T) -> NetResult<usize> {
        let idx = self.entries.iter().position(|e| e.is_none()).ok_or(NetError::Mem)?;
        self.entries[idx] = Some(value);
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.entries.get(idx).and_then(|e| e.as_ref())
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.entries.get_mut(idx).and_then(|e| e.as_mut())
    }

    pub fn remove(&mut self, idx: usize) -> Option<T> {
        self.entries.get_mut(idx).and_then(|e| e.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| e.as_ref().map(|v| (i, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.entries.iter_mut().enumerate().filter_map(|(i, e)| e.as_mut().map(|v| (i, v)))
    }
}

/// Which protocol-specific table a descriptor's other half lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
    Raw(usize),
    Udp(usize),
    Tcp(usize),
}

/// The `fd -> (kind, inner index)` table. One instance lives on
/// [`crate::stack::Stack`]; it's capacity-bounded independent of the
/// per-protocol tables so a burst of `socket()` calls against one protocol
/// can't exhaust descriptors needed by another.
pub struct FdTable {
    entries: HashMap<Fd, SockKind>,
    capacity: usize,
    next_fd: Fd,
}

impl FdTable {
    pub fn new(capacity: usize) -> FdTable {
        FdTable { entries: HashMap::new(), capacity, next_fd: 3 } // leave 0/1/2 alone, BSD-style
    }

    pub fn insert(&mut self, kind: SockKind) -> NetResult<Fd> {
        if self.entries.len() >= self.capacity {
            return Err(NetError::Mem);
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        self.entries.insert(fd, kind);
        Ok(fd)
    }

    pub fn get(&self, fd: Fd) -> Option<SockKind> {
        self.entries.get(&fd).copied()
    }

    pub fn remove(&mut self, fd: Fd) -> Option<SockKind> {
        self.entries.remove(&fd)
    }
}

/// Common options (receive/send timeouts) that apply identically to every
/// sock variant; protocol-specific options (`SO_KEEPALIVE` and friends) are
/// handled by the TCP layer directly since only a `Tcb` has the state they
/// configure.
pub fn apply_common_opt(base: &mut SockBase, opt: SockOpt) -> NetResult<bool> {
    match opt {
        SockOpt::RcvTimeoMs(ms) => {
            base.rcv_tmo = Timeout::from_ms(ms as i64);
            Ok(true)
        }
        SockOpt::SndTimeoMs(ms) => {
            base.snd_tmo = Timeout::from_ms(ms as i64);
            Ok(true)
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_reuses_freed_slot() {
        let mut slab: Slab<u32> = Slab::new(2);
        let a = slab.insert(1).unwrap();
        let _b = slab.insert(2).unwrap();
        assert!(slab.insert(3).is_err());
        slab.remove(a);
        let c = slab.insert(3).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn fd_table_assigns_increasing_fds_and_forgets_on_remove() {
        let mut table = FdTable::new(4);
        let a = table.insert(SockKind::Udp(0)).unwrap();
        let b = table.insert(SockKind::Tcp(1)).unwrap();
        assert!(b > a);
        assert_eq!(table.get(a), Some(SockKind::Udp(0)));
        table.remove(a);
        assert_eq!(table.get(a), None);
    }

    #[test]
    fn common_opt_sets_timeout() {
        let mut base = SockBase::new(crate::sock::Family::Inet, crate::sock::Protocol::Udp);
        assert!(apply_common_opt(&mut base, SockOpt::RcvTimeoMs(50)).unwrap());
        assert_eq!(base.rcv_tmo, Timeout::Millis(50));
    }
}
