//! UDP (RFC 768): header codec with the IPv4 pseudo-header checksum, and
//! the per-sock receive queue. Dispatch-by-four-tuple, auto-bind, and the
//! port-unreachable path live in `stack.rs` where the socket table and
//! `ipv4_out` are both in scope.

use std::collections::VecDeque;

use crate::error::{NetError, NetResult};
use crate::ipaddr::IpAddr;
use crate::sock::{Protocol, SockBase, SockOpt};
use crate::tools;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub total_len: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn decode(data: &[u8]) -> NetResult<UdpHeader> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Broken);
        }
        let total_len = u16::from_be_bytes([data[4], data[5]]);
        if (total_len as usize) < HEADER_LEN || total_len as usize > data.len() {
            return Err(NetError::Broken);
        }
        Ok(UdpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            total_len,
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// `0` on the wire means "no checksum"; anything else must verify
    /// against the pseudo-header.
    pub fn verify_checksum(data: &[u8], src: IpAddr, dst: IpAddr) -> NetResult<()> {
        let checksum_field = u16::from_be_bytes([data[6], data[7]]);
        if checksum_field == 0 {
            return Ok(());
        }
        let seed = tools::pseudo_header_sum(src.0, dst.0, crate::ipv4::PROTO_UDP, data.len() as u16);
        if tools::checksum16(data, seed, false) != 0 {
            return Err(NetError::Chksum);
        }
        Ok(())
    }

    /// Builds a full UDP segment (header + payload) with the pseudo-header
    /// checksum filled in.
    pub fn build(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let total_len = (HEADER_LEN + payload.len()) as u16;
        let mut seg = Vec::with_capacity(total_len as usize);
        seg.extend_from_slice(&src_port.to_be_bytes());
        seg.extend_from_slice(&dst_port.to_be_bytes());
        seg.extend_from_slice(&total_len.to_be_bytes());
        seg.extend_from_slice(&[0, 0]);
        seg.extend_from_slice(payload);
        let seed = tools::pseudo_header_sum(src_ip.0, dst_ip.0, crate::ipv4::PROTO_UDP, total_len);
        let checksum = tools::checksum16(&seg, seed, true);
        let checksum = if checksum == 0 { 0xffff } else { checksum };
        seg[6..8].copy_from_slice(&checksum.to_be_bytes());
        seg
    }
}

pub struct Datagram {
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub data: Vec<u8>,
}

pub struct UdpSock {
    pub base: SockBase,
    recv_queue: VecDeque<Datagram>,
    max_recv: usize,
}

impl UdpSock {
    pub fn new(max_recv: usize) -> UdpSock {
        UdpSock {
            base: SockBase::new(crate::sock::Family::Inet, Protocol::Udp),
            recv_queue: VecDeque::new(),
            max_recv,
        }
    }

    /// Matches `(local_ip, local_port)`; an unbound local address (`ANY`)
    /// matches any destination.
    pub fn matches(&self, dst_ip: IpAddr, dst_port: u16) -> bool {
        self.base.local_port == dst_port && (self.base.local_ip.is_any() || self.base.local_ip == dst_ip)
    }

    /// Enqueues a datagram, dropping the oldest on overflow, and reports
    /// whether a receiver should be woken.
    pub fn enqueue(&mut self, dgram: Datagram) {
        if self.recv_queue.len() >= self.max_recv {
            self.recv_queue.pop_front();
        }
        self.recv_queue.push_back(dgram);
        self.base.rcv_wait.wake(Ok(()));
    }

    pub fn recv_from(&mut self) -> Option<Datagram> {
        self.recv_queue.pop_front()
    }

    pub fn has_data(&self) -> bool {
        !self.recv_queue.is_empty()
    }

    pub fn setopt(&mut self, opt: SockOpt) -> NetResult<()> {
        match opt {
            SockOpt::RcvTimeoMs(ms) => {
                self.base.rcv_tmo = crate::mblock::Timeout::from_ms(ms as i64);
                Ok(())
            }
            SockOpt::SndTimeoMs(ms) => {
                self.base.snd_tmo = crate::mblock::Timeout::from_ms(ms as i64);
                Ok(())
            }
            _ => Err(NetError::NotSupport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_checksum_round_trips() {
        let src = IpAddr::from_octets([10, 0, 0, 2]);
        let dst = IpAddr::from_octets([10, 0, 0, 3]);
        let seg = UdpHeader::build(src, dst, 40000, 7, b"hi");
        UdpHeader::verify_checksum(&seg, src, dst).unwrap();
        let header = UdpHeader::decode(&seg).unwrap();
        assert_eq!(header.dst_port, 7);
        assert_eq!(header.total_len as usize, seg.len());
    }

    #[test]
    fn unbound_local_ip_matches_any_destination() {
        let mut sock = UdpSock::new(4);
        sock.base.local_port = 9;
        assert!(sock.matches(IpAddr::from_octets([10, 0, 0, 9]), 9));
        assert!(!sock.matches(IpAddr::from_octets([10, 0, 0, 9]), 10));
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut sock = UdpSock::new(2);
        for i in 0..3u8 {
            sock.enqueue(Datagram { source_ip: IpAddr::ANY, source_port: i as u16, data: vec![] });
        }
        assert_eq!(sock.recv_from().unwrap().source_port, 1);
        assert_eq!(sock.recv_from().unwrap().source_port, 2);
        assert!(sock.recv_from().is_none());
    }
}
