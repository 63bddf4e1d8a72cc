//! Bounded multi-producer/multi-consumer queue, used for per-netif in/out
//! queues and the exmsg worker's inbox.
//!
//! The original `fixq` is a hand-rolled circular array guarded by a lock
//! plus a pair of counting semaphores (`send_sem` counts free slots,
//! `recv_sem` counts filled ones). `crossbeam_channel::bounded` gives the
//! exact same capacity/blocking semantics directly and is the queue
//! primitive this codebase already depends on elsewhere, so `FixQ` is a
//! thin named wrapper over it rather than a hand-rolled reimplementation.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};

use crate::error::{NetError, NetResult};
use crate::mblock::Timeout;

pub struct FixQ<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> FixQ<T> {
    pub fn new(capacity: usize) -> FixQ<T> {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        FixQ { tx, rx }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    pub fn send(&self, msg: T, tmo: Timeout) -> NetResult<()> {
        match tmo {
            Timeout::NonBlocking => self.tx.try_send(msg).map_err(|e| match e {
                crossbeam_channel::TrySendError::Full(_) => NetError::Full,
                crossbeam_channel::TrySendError::Disconnected(_) => NetError::Sys,
            }),
            Timeout::Forever => self.tx.send(msg).map_err(|_| NetError::Sys),
            Timeout::Millis(ms) => self
                .tx
                .send_timeout(msg, Duration::from_millis(ms))
                .map_err(|e| match e {
                    SendTimeoutError::Timeout(_) => NetError::Tmo,
                    SendTimeoutError::Disconnected(_) => NetError::Sys,
                }),
        }
    }

    pub fn recv(&self, tmo: Timeout) -> NetResult<T> {
        match tmo {
            Timeout::NonBlocking => self.rx.try_recv().map_err(|e| match e {
                crossbeam_channel::TryRecvError::Empty => NetError::Tmo,
                crossbeam_channel::TryRecvError::Disconnected => NetError::Sys,
            }),
            Timeout::Forever => self.rx.recv().map_err(|_| NetError::Sys),
            Timeout::Millis(ms) => self
                .rx
                .recv_timeout(Duration::from_millis(ms))
                .map_err(|e| match e {
                    RecvTimeoutError::Timeout => NetError::Tmo,
                    RecvTimeoutError::Disconnected => NetError::Sys,
                }),
        }
    }

    /// A cloneable producer handle, for driver threads that only ever push.
    pub fn sender(&self) -> Sender<T> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonblocking_send_fails_when_full() {
        let q = FixQ::new(1);
        q.send(1u32, Timeout::NonBlocking).unwrap();
        assert_eq!(q.send(2u32, Timeout::NonBlocking), Err(NetError::Full));
    }

    #[test]
    fn nonblocking_recv_fails_when_empty() {
        let q: FixQ<u32> = FixQ::new(1);
        assert_eq!(q.recv(Timeout::NonBlocking), Err(NetError::Tmo));
    }

    #[test]
    fn fifo_order_preserved() {
        let q = FixQ::new(4);
        for i in 0..4u32 {
            q.send(i, Timeout::NonBlocking).unwrap();
        }
        for i in 0..4u32 {
            assert_eq!(q.recv(Timeout::NonBlocking).unwrap(), i);
        }
    }
}
