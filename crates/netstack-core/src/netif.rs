//! Per-interface record: hardware/IP addressing, the two per-netif queues,
//! and the driver binding.
//!
//! Driver threads never touch protocol state — they only push and pull raw
//! Ethernet frame bytes through `in_q`/`out_q`. Only the worker thread turns
//! those bytes into a [`crate::pktbuf::PktBuf`] (see `DESIGN.md`'s note on
//! why `PktBuf` stays off the wire between threads).

use crate::error::{NetError, NetResult};
use crate::fixq::FixQ;
use crate::ipaddr::IpAddr;
use crate::mblock::Timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetifState {
    Closed,
    Opened,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetifType {
    Ether,
    Loop,
    None,
}

pub type NetifId = usize;

/// Host-side binding for a NIC. `open`/`close` run on the worker thread at
/// interface bring-up/teardown; the driver is otherwise expected to run its
/// own receive thread pushing frames via the netif's in-queue sender and to
/// drain the out-queue receiver from its own transmit thread.
pub trait NetifDriver: Send {
    fn open(&mut self) -> NetResult<()>;
    fn close(&mut self);
    /// Link-layer MTU in bytes (excluding the Ethernet header).
    fn mtu(&self) -> usize;
}

pub struct Netif {
    pub name: String,
    pub hwaddr: [u8; 6],
    pub ipaddr: IpAddr,
    pub netmask: IpAddr,
    pub gateway: IpAddr,
    pub mtu: usize,
    pub state: NetifState,
    pub kind: NetifType,
    pub driver: Box<dyn NetifDriver>,
    pub in_q: FixQ<Vec<u8>>,
    pub out_q: FixQ<Vec<u8>>,
    pub is_default: bool,
}

impl Netif {
    pub fn new(
        name: impl Into<String>,
        kind: NetifType,
        driver: Box<dyn NetifDriver>,
        queue_depth: usize,
    ) -> Netif {
        let mtu = driver.mtu();
        Netif {
            name: name.into(),
            hwaddr: [0; 6],
            ipaddr: IpAddr::ANY,
            netmask: IpAddr::ANY,
            gateway: IpAddr::ANY,
            mtu,
            state: NetifState::Closed,
            kind,
            driver,
            in_q: FixQ::new(queue_depth),
            out_q: FixQ::new(queue_depth),
            is_default: false,
        }
    }

    pub fn open(&mut self) -> NetResult<()> {
        self.driver.open()?;
        self.state = NetifState::Opened;
        Ok(())
    }

    pub fn close(&mut self) {
        // Drain both queues; nothing downstream is going to service them
        // again.
        while self.in_q.recv(Timeout::NonBlocking).is_ok() {}
        while self.out_q.recv(Timeout::NonBlocking).is_ok() {}
        self.driver.close();
        self.state = NetifState::Closed;
    }

    pub fn set_addr(&mut self, ip: IpAddr, mask: IpAddr, gateway: IpAddr) {
        self.ipaddr = ip;
        self.netmask = mask;
        self.gateway = gateway;
    }

    pub fn set_hwaddr(&mut self, hw: [u8; 6]) {
        self.hwaddr = hw;
    }

    /// Enqueues a raw received frame and reports whether the worker should
    /// be notified (always `Ok` on success — the caller, `put_in`, is
    /// responsible for posting the `NETIF_IN` event).
    pub fn put_in(&self, frame: Vec<u8>) -> NetResult<()> {
        self.in_q.send(frame, Timeout::NonBlocking)
    }

    pub fn get_in(&self) -> NetResult<Vec<u8>> {
        self.in_q.recv(Timeout::NonBlocking).map_err(|_| NetError::None)
    }

    pub fn put_out(&self, frame: Vec<u8>) -> NetResult<()> {
        self.out_q.send(frame, Timeout::NonBlocking)
    }

    pub fn get_out(&self) -> NetResult<Vec<u8>> {
        self.out_q.recv(Timeout::NonBlocking).map_err(|_| NetError::None)
    }
}
