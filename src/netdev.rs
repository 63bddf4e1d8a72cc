//! A netif driver whose packet movement happens on externally-owned pump
//! threads (`run`'s loopback pump, `bench`'s pcap replay pump) rather than
//! through a polled `xmit` callback.
//!
//! The original's driver tables (`loop_driver`, `ether_driver`) bundle
//! `open`/`close`/`xmit` together; this crate's [`netstack_core::netif::NetifDriver`]
//! only covers `open`/`close`/`mtu` and moves frames through `FixQ`
//! sender/receiver handles grabbed before the netif is handed to the stack
//! (see `crate::run`/`crate::bench`), so `PassiveDriver` itself has nothing
//! to do beyond reporting its MTU.

use netstack_core::netif::NetifDriver;
use netstack_core::NetResult;

pub struct PassiveDriver {
    mtu: usize,
}

impl PassiveDriver {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }
}

impl NetifDriver for PassiveDriver {
    fn open(&mut self) -> NetResult<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn mtu(&self) -> usize {
        self.mtu
    }
}
