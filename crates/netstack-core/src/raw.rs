//! Raw IP sockets: matched by `(family, protocol)` and, if bound,
//! `local_ip`. Every matching raw sock gets a duplicate reference of an
//! inbound IP datagram (§4.9) so sniffers never compete with transport
//! delivery for the same buffer.

use std::collections::VecDeque;

use crate::ipaddr::IpAddr;
use crate::pktbuf::PktBuf;
use crate::sock::{Protocol, SockBase};

pub struct RawDatagram {
    pub source_ip: IpAddr,
    pub ip_datagram: PktBuf,
}

pub struct RawSock {
    pub base: SockBase,
    recv_queue: VecDeque<RawDatagram>,
    max_recv: usize,
}

impl RawSock {
    pub fn new(protocol: Protocol, max_recv: usize) -> RawSock {
        RawSock {
            base: SockBase::new(crate::sock::Family::Inet, protocol),
            recv_queue: VecDeque::new(),
            max_recv,
        }
    }

    pub fn matches(&self, protocol: Protocol, dst_ip: IpAddr) -> bool {
        self.base.protocol == protocol && (self.base.local_ip.is_any() || self.base.local_ip == dst_ip)
    }

    pub fn enqueue(&mut self, dgram: RawDatagram) {
        if self.recv_queue.len() >= self.max_recv {
            self.recv_queue.pop_front();
        }
        self.recv_queue.push_back(dgram);
        self.base.rcv_wait.wake(Ok(()));
    }

    pub fn recv_from(&mut self) -> Option<RawDatagram> {
        self.recv_queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::pktbuf::PktBufPool;

    #[test]
    fn protocol_and_local_ip_must_match() {
        let mut sock = RawSock::new(Protocol::Icmp, 4);
        sock.base.local_ip = IpAddr::from_octets([10, 0, 0, 2]);
        assert!(sock.matches(Protocol::Icmp, IpAddr::from_octets([10, 0, 0, 2])));
        assert!(!sock.matches(Protocol::Icmp, IpAddr::from_octets([10, 0, 0, 3])));
        assert!(!sock.matches(Protocol::Udp, IpAddr::from_octets([10, 0, 0, 2])));
    }

    #[test]
    fn overflow_drops_oldest() {
        let pool = PktBufPool::new(&NetConfig::default());
        let mut sock = RawSock::new(Protocol::Icmp, 1);
        let a = PktBuf::alloc(&pool, 0).unwrap();
        let b = PktBuf::alloc(&pool, 0).unwrap();
        sock.enqueue(RawDatagram { source_ip: IpAddr::ANY, ip_datagram: a });
        sock.enqueue(RawDatagram { source_ip: IpAddr::ANY, ip_datagram: b });
        assert_eq!(sock.recv_queue.len(), 1);
    }
}
