//! ARP wire format (RFC 826) and the three-state resolution cache.
//!
//! This module owns cache *state transitions* only; it never sends a frame
//! itself. Callers (the `ether` link layer) turn the [`Resolution`] and
//! [`InputOutcome`] values this module returns into actual Ethernet frames,
//! which keeps the cache logic testable without a netif or driver in scope.

use std::collections::VecDeque;

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::ipaddr::IpAddr;
use crate::netif::NetifId;
use crate::pktbuf::PktBuf;

pub const HW_TYPE_ETHERNET: u16 = 1;
pub const PROTO_TYPE_IPV4: u16 = 0x0800;
pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;

pub const WIRE_LEN: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Request,
    Reply,
}

/// A decoded ARP packet.
#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub opcode: Opcode,
    pub sender_mac: [u8; 6],
    pub sender_ip: IpAddr,
    pub target_mac: [u8; 6],
    pub target_ip: IpAddr,
}

impl ArpPacket {
    pub fn request(sender_mac: [u8; 6], sender_ip: IpAddr, target_ip: IpAddr) -> ArpPacket {
        ArpPacket {
            opcode: Opcode::Request,
            sender_mac,
            sender_ip,
            target_mac: [0; 6],
            target_ip,
        }
    }

    pub fn reply(sender_mac: [u8; 6], sender_ip: IpAddr, target_mac: [u8; 6], target_ip: IpAddr) -> ArpPacket {
        ArpPacket { opcode: Opcode::Reply, sender_mac, sender_ip, target_mac, target_ip }
    }

    /// Gratuitous ARP: a request whose sender and target protocol addresses
    /// are both the announcer's own IP.
    pub fn gratuitous(mac: [u8; 6], ip: IpAddr) -> ArpPacket {
        ArpPacket::request(mac, ip, ip)
    }

    pub fn encode(&self) -> [u8; WIRE_LEN] {
        let mut w = [0u8; WIRE_LEN];
        w[0..2].copy_from_slice(&HW_TYPE_ETHERNET.to_be_bytes());
        w[2..4].copy_from_slice(&PROTO_TYPE_IPV4.to_be_bytes());
        w[4] = 6;
        w[5] = 4;
        let op = match self.opcode {
            Opcode::Request => OP_REQUEST,
            Opcode::Reply => OP_REPLY,
        };
        w[6..8].copy_from_slice(&op.to_be_bytes());
        w[8..14].copy_from_slice(&self.sender_mac);
        w[14..18].copy_from_slice(&self.sender_ip.to_octets());
        w[18..24].copy_from_slice(&self.target_mac);
        w[24..28].copy_from_slice(&self.target_ip.to_octets());
        w
    }

    /// Validates and decodes. Only `htype=ether, hwlen=6, ptype=ipv4,
    /// plen=4, opcode ∈ {request, reply}` are accepted; anything else is
    /// rejected as malformed.
    pub fn decode(data: &[u8]) -> NetResult<ArpPacket> {
        if data.len() < WIRE_LEN {
            return Err(NetError::Broken);
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let ptype = u16::from_be_bytes([data[2], data[3]]);
        let hlen = data[4];
        let plen = data[5];
        let op = u16::from_be_bytes([data[6], data[7]]);
        if htype != HW_TYPE_ETHERNET || ptype != PROTO_TYPE_IPV4 || hlen != 6 || plen != 4 {
            return Err(NetError::Broken);
        }
        let opcode = match op {
            OP_REQUEST => Opcode::Request,
            OP_REPLY => Opcode::Reply,
            _ => return Err(NetError::Broken),
        };
        let mut sender_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        let sender_ip = IpAddr::from_octets([data[14], data[15], data[16], data[17]]);
        let mut target_mac = [0u8; 6];
        target_mac.copy_from_slice(&data[18..24]);
        let target_ip = IpAddr::from_octets([data[24], data[25], data[26], data[27]]);
        Ok(ArpPacket { opcode, sender_mac, sender_ip, target_mac, target_ip })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Resolved,
    Waiting,
}

struct CacheEntry {
    paddr: IpAddr,
    haddr: [u8; 6],
    state: EntryState,
    tmo: u32,
    retry: u32,
    netif: NetifId,
    pending: VecDeque<PktBuf>,
}

pub enum Resolution {
    /// A cached, resolved entry — send the frame now with this hardware address.
    Resolved([u8; 6]),
    /// No resolved entry yet; `buf` has been queued. `send_request` is true
    /// the first time this target is seen (a fresh ARP request is needed);
    /// false when piggy-backing on an already-pending request.
    Queued { send_request: bool },
}

pub enum InputOutcome {
    None,
    /// Reply to the sender with our own address.
    SendReply,
    /// The entry just resolved; flush these buffers in FIFO order.
    Flush(Vec<PktBuf>),
}

pub struct ArpCache {
    entries: VecDeque<CacheEntry>,
    capacity: usize,
    max_pkt_wait: usize,
    pending_tmo: u32,
    stable_tmo: u32,
    retry_cnt: u32,
}

impl ArpCache {
    pub fn new(cfg: &NetConfig) -> ArpCache {
        ArpCache {
            entries: VecDeque::new(),
            capacity: cfg.arp_cache_size,
            max_pkt_wait: cfg.arp_max_pkt_wait,
            pending_tmo: cfg.arp_entry_pending_tmo_s,
            stable_tmo: cfg.arp_entry_stable_tmo_s,
            retry_cnt: cfg.arp_entry_retry_cnt,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn find_idx(&self, ip: IpAddr) -> Option<usize> {
        self.entries.iter().position(|e| e.paddr == ip)
    }

    fn touch(&mut self, idx: usize) {
        if idx != 0 {
            let e = self.entries.remove(idx).unwrap();
            self.entries.push_front(e);
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<[u8; 6]> {
        self.find_idx(ip).and_then(|i| {
            let e = &self.entries[i];
            (e.state == EntryState::Resolved).then_some(e.haddr)
        })
    }

    /// Implements §4.4 `lookup/resolve` for a non-broadcast target: returns
    /// whether to send now, or that `buf` has been queued pending
    /// resolution.
    pub fn resolve(&mut self, netif: NetifId, target_ip: IpAddr, buf: PktBuf) -> Resolution {
        if let Some(idx) = self.find_idx(target_ip) {
            match self.entries[idx].state {
                EntryState::Resolved => {
                    let mac = self.entries[idx].haddr;
                    self.touch(idx);
                    Resolution::Resolved(mac)
                }
                EntryState::Waiting => {
                    let entry = &mut self.entries[idx];
                    if entry.pending.len() >= self.max_pkt_wait {
                        entry.pending.pop_front();
                    }
                    entry.pending.push_back(buf);
                    self.touch(idx);
                    Resolution::Queued { send_request: false }
                }
            }
        } else {
            if self.entries.len() >= self.capacity {
                self.entries.pop_back();
            }
            let mut entry = CacheEntry {
                paddr: target_ip,
                haddr: [0; 6],
                state: EntryState::Waiting,
                tmo: self.pending_tmo,
                retry: self.retry_cnt,
                netif,
                pending: VecDeque::new(),
            };
            entry.pending.push_back(buf);
            self.entries.push_front(entry);
            Resolution::Queued { send_request: true }
        }
    }

    /// Unconditionally learns/refreshes the sender's mapping (called for
    /// every valid inbound ARP packet whose sender is on-subnet or already
    /// cached), then applies request/reply semantics.
    pub fn on_input(
        &mut self,
        netif: NetifId,
        pkt: &ArpPacket,
        local_ip: IpAddr,
        sender_on_subnet: bool,
    ) -> InputOutcome {
        let mut flushed = None;
        if let Some(idx) = self.find_idx(pkt.sender_ip) {
            let was_waiting = self.entries[idx].state == EntryState::Waiting;
            self.entries[idx].haddr = pkt.sender_mac;
            if was_waiting && pkt.opcode == Opcode::Reply {
                self.entries[idx].state = EntryState::Resolved;
                self.entries[idx].tmo = self.stable_tmo;
                let pending = std::mem::take(&mut self.entries[idx].pending);
                flushed = Some(pending.into_iter().collect::<Vec<_>>());
            } else if !was_waiting {
                self.entries[idx].tmo = self.stable_tmo;
            }
            self.touch(idx);
        } else if sender_on_subnet {
            if self.entries.len() >= self.capacity {
                self.entries.pop_back();
            }
            self.entries.push_front(CacheEntry {
                paddr: pkt.sender_ip,
                haddr: pkt.sender_mac,
                state: EntryState::Resolved,
                tmo: self.stable_tmo,
                retry: self.retry_cnt,
                netif,
                pending: VecDeque::new(),
            });
        }

        if let Some(bufs) = flushed {
            return InputOutcome::Flush(bufs);
        }
        if pkt.opcode == Opcode::Request && pkt.target_ip == local_ip {
            return InputOutcome::SendReply;
        }
        InputOutcome::None
    }

    /// One second's worth of aging. Returns the IPs that need a (re-)request
    /// sent this tick.
    pub fn on_timer(&mut self) -> Vec<(NetifId, IpAddr)> {
        let mut to_request = Vec::new();
        let mut i = 0;
        while i < self.entries.len() {
            let fire = {
                let e = &mut self.entries[i];
                e.tmo = e.tmo.saturating_sub(1);
                e.tmo == 0
            };
            if !fire {
                i += 1;
                continue;
            }
            match self.entries[i].state {
                EntryState::Resolved => {
                    let e = &mut self.entries[i];
                    e.state = EntryState::Waiting;
                    e.retry = self.retry_cnt;
                    e.tmo = self.pending_tmo;
                    to_request.push((e.netif, e.paddr));
                    i += 1;
                }
                EntryState::Waiting => {
                    let e = &mut self.entries[i];
                    if e.retry > 0 {
                        e.retry -= 1;
                        e.tmo = self.pending_tmo;
                        to_request.push((e.netif, e.paddr));
                        i += 1;
                    } else {
                        self.entries.remove(i);
                    }
                }
            }
        }
        to_request
    }

    /// Drops every entry owned by `netif` (its pending packets go with it).
    pub fn clear_netif(&mut self, netif: NetifId) {
        self.entries.retain(|e| e.netif != netif);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> NetConfig {
        let mut c = NetConfig::default();
        c.arp_cache_size = 2;
        c.arp_max_pkt_wait = 2;
        c
    }

    fn pool() -> std::sync::Arc<crate::pktbuf::PktBufPool> {
        crate::pktbuf::PktBufPool::new(&NetConfig::default())
    }

    #[test]
    fn encode_decode_round_trip() {
        let pkt = ArpPacket::request([1, 2, 3, 4, 5, 6], IpAddr::from_octets([10, 0, 0, 2]), IpAddr::from_octets([10, 0, 0, 3]));
        let wire = pkt.encode();
        let decoded = ArpPacket::decode(&wire).unwrap();
        assert_eq!(decoded.sender_ip, pkt.sender_ip);
        assert_eq!(decoded.target_ip, pkt.target_ip);
        assert_eq!(decoded.opcode, Opcode::Request);
    }

    #[test]
    fn first_resolve_requests_then_queues() {
        let mut cache = ArpCache::new(&cfg());
        let pool = pool();
        let buf = PktBuf::alloc(&pool, 4).unwrap();
        let ip = IpAddr::from_octets([10, 0, 0, 3]);
        match cache.resolve(0, ip, buf) {
            Resolution::Queued { send_request } => assert!(send_request),
            _ => panic!("expected queued"),
        }
    }

    #[test]
    fn reply_resolves_and_flushes_pending() {
        let mut cache = ArpCache::new(&cfg());
        let pool = pool();
        let ip = IpAddr::from_octets([10, 0, 0, 3]);
        let local = IpAddr::from_octets([10, 0, 0, 2]);
        let buf = PktBuf::alloc(&pool, 4).unwrap();
        cache.resolve(0, ip, buf);
        let reply = ArpPacket::reply([0xaa; 6], ip, [0xbb; 6], local);
        match cache.on_input(0, &reply, local, true) {
            InputOutcome::Flush(bufs) => assert_eq!(bufs.len(), 1),
            _ => panic!("expected flush"),
        }
        assert_eq!(cache.lookup(ip), Some([0xaa; 6]));
    }

    #[test]
    fn cache_never_exceeds_capacity() {
        let mut cache = ArpCache::new(&cfg());
        let pool = pool();
        for i in 0..5u8 {
            let ip = IpAddr::from_octets([10, 0, 0, i]);
            let buf = PktBuf::alloc(&pool, 4).unwrap();
            cache.resolve(0, ip, buf);
            assert!(cache.len() <= 2);
        }
    }

    #[test]
    fn waiting_entry_retries_then_frees() {
        let mut cache = ArpCache::new(&cfg());
        let pool = pool();
        let ip = IpAddr::from_octets([10, 0, 0, 3]);
        let buf = PktBuf::alloc(&pool, 4).unwrap();
        cache.resolve(0, ip, buf);
        // pending_tmo defaults to 1s; retry_cnt defaults to 3.
        for _ in 0..10 {
            cache.on_timer();
        }
        assert_eq!(cache.lookup(ip), None);
        assert_eq!(cache.len(), 0);
    }
}
