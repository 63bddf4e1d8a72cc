//! IPv4: header codec, checksum, the route table, and fragment reassembly.
//!
//! Input validation, dispatch-by-protocol, and ARP-resolved output all need
//! the netif table and ARP cache alongside this module's state, so (as with
//! `ether`) the actual `ipv4_in`/`ipv4_out` entry points live in
//! [`crate::stack`]; this module supplies the header codec, [`RouteTable`]
//! and [`ReassemblyTable`] they're built from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::config::NetConfig;
use crate::error::{NetError, NetResult};
use crate::ipaddr::{mask_prefix_len, IpAddr};
use crate::netif::NetifId;
use crate::tools;

pub const MIN_HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_TCP: u8 = 6;

const FLAG_MF: u16 = 0x2000;
const FRAG_OFFSET_MASK: u16 = 0x1fff;

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub ihl_words: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub more_fragments: bool,
    pub frag_offset: u16, // in 8-byte units
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        self.ihl_words as usize * 4
    }

    /// Encodes the 20-byte fixed header (options, if `ihl_words > 5`, are
    /// not reproduced — this stack never emits them) and fills in the
    /// checksum field by computing it over the result.
    pub fn encode(&self) -> [u8; MIN_HEADER_LEN] {
        let mut w = [0u8; MIN_HEADER_LEN];
        w[0] = 0x40 | (self.ihl_words & 0x0f);
        w[1] = self.tos;
        w[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        w[4..6].copy_from_slice(&self.id.to_be_bytes());
        let flags_frag = (if self.more_fragments { FLAG_MF } else { 0 }) | (self.frag_offset & FRAG_OFFSET_MASK);
        w[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        w[8] = self.ttl;
        w[9] = self.protocol;
        w[10..12].copy_from_slice(&[0, 0]);
        w[12..16].copy_from_slice(&self.src.to_octets());
        w[16..20].copy_from_slice(&self.dst.to_octets());
        let checksum = tools::checksum16(&w, 0, true);
        w[10..12].copy_from_slice(&checksum.to_be_bytes());
        w
    }

    /// Validates and decodes the fixed header. Does not validate that
    /// `total_len` fits the supplied buffer — the caller compares that
    /// against the pktbuf's actual size.
    pub fn decode(data: &[u8]) -> NetResult<Ipv4Header> {
        if data.len() < MIN_HEADER_LEN {
            return Err(NetError::Broken);
        }
        let version = data[0] >> 4;
        let ihl_words = data[0] & 0x0f;
        if version != 4 || ihl_words < 5 {
            return Err(NetError::Broken);
        }
        let header_len = ihl_words as usize * 4;
        if data.len() < header_len {
            return Err(NetError::Broken);
        }
        let checksum_field = u16::from_be_bytes([data[10], data[11]]);
        if checksum_field != 0 {
            let sum = tools::checksum16(&data[..header_len], 0, false);
            if sum != 0 {
                return Err(NetError::Chksum);
            }
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < header_len {
            return Err(NetError::Broken);
        }
        let flags_frag = u16::from_be_bytes([data[6], data[7]]);
        Ok(Ipv4Header {
            ihl_words,
            tos: data[1],
            total_len,
            id: u16::from_be_bytes([data[4], data[5]]),
            more_fragments: flags_frag & FLAG_MF != 0,
            frag_offset: flags_frag & FRAG_OFFSET_MASK,
            ttl: data[8],
            protocol: data[9],
            checksum: checksum_field,
            src: IpAddr::from_octets([data[12], data[13], data[14], data[15]]),
            dst: IpAddr::from_octets([data[16], data[17], data[18], data[19]]),
        })
    }
}

/// Monotonically-increasing IP identification counter for datagrams we
/// originate.
pub struct IdGenerator(AtomicU16);

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator(AtomicU16::new(1))
    }

    pub fn next(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `payload` into one or more complete IP datagrams (header +
/// fragment payload) no larger than `mtu` bytes on the wire, sharing `id`.
/// Offsets are emitted in 8-byte units per RFC 791.
pub fn fragment(payload: &[u8], mtu: usize, id: u16, mut template: Ipv4Header) -> Vec<Vec<u8>> {
    let max_payload_per_frag = ((mtu.saturating_sub(MIN_HEADER_LEN)) / 8) * 8;
    if payload.len() + MIN_HEADER_LEN <= mtu || max_payload_per_frag == 0 {
        template.id = id;
        template.more_fragments = false;
        template.frag_offset = 0;
        template.total_len = (MIN_HEADER_LEN + payload.len()) as u16;
        let mut datagram = template.encode().to_vec();
        datagram.extend_from_slice(payload);
        return vec![datagram];
    }

    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < payload.len() {
        let remaining = payload.len() - offset;
        let take = remaining.min(max_payload_per_frag);
        let more = offset + take < payload.len();
        let mut hdr = template;
        hdr.id = id;
        hdr.more_fragments = more;
        hdr.frag_offset = (offset / 8) as u16;
        hdr.total_len = (MIN_HEADER_LEN + take) as u16;
        let mut datagram = hdr.encode().to_vec();
        datagram.extend_from_slice(&payload[offset..offset + take]);
        out.push(datagram);
        offset += take;
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub net: IpAddr,
    pub mask: IpAddr,
    pub next_hop: IpAddr,
    pub netif: NetifId,
}

#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> RouteTable {
        RouteTable::default()
    }

    pub fn add(&mut self, net: IpAddr, mask: IpAddr, next_hop: IpAddr, netif: NetifId) {
        self.routes.retain(|r| !(r.net == net && r.mask == mask));
        self.routes.push(Route { net, mask, next_hop, netif });
    }

    pub fn remove(&mut self, net: IpAddr, mask: IpAddr) {
        self.routes.retain(|r| !(r.net == net && r.mask == mask));
    }

    /// Longest-prefix match; a route with mask `0.0.0.0` acts as the
    /// catch-all default and is only chosen when nothing more specific
    /// matches.
    pub fn find(&self, dest: IpAddr) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| dest.same_subnet(r.net, r.mask))
            .max_by_key(|r| mask_prefix_len(r.mask))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReassemblyKey {
    source_ip: IpAddr,
    id: u16,
}

struct Fragment {
    offset: usize,
    data: Vec<u8>,
    more_fragments: bool,
}

struct ReassemblyRecord {
    key: ReassemblyKey,
    tmo: u32,
    fragments: Vec<Fragment>,
}

impl ReassemblyRecord {
    /// A record is complete when some fragment has MF=0 and the fragments'
    /// byte ranges tile `[0, end)` with no gaps.
    fn completed(&self) -> Option<Vec<u8>> {
        let end = self.fragments.iter().find(|f| !f.more_fragments).map(|f| f.offset + f.data.len())?;
        let mut covered = 0usize;
        for f in &self.fragments {
            if f.offset > covered {
                return None;
            }
            covered = covered.max(f.offset + f.data.len());
        }
        if covered < end {
            return None;
        }
        let mut out = vec![0u8; end];
        for f in &self.fragments {
            out[f.offset..f.offset + f.data.len()].copy_from_slice(&f.data);
        }
        Some(out)
    }
}

pub struct ReassemblyTable {
    records: VecDeque<ReassemblyRecord>,
    max_records: usize,
    max_bufs_per_record: usize,
    tmo_s: u32,
}

impl ReassemblyTable {
    pub fn new(cfg: &NetConfig) -> ReassemblyTable {
        ReassemblyTable {
            records: VecDeque::new(),
            max_records: cfg.ip_frags_max_nr,
            max_bufs_per_record: cfg.ip_frag_max_buf_nr,
            tmo_s: cfg.ip_frag_tmo_s,
        }
    }

    /// Inserts one fragment; returns the reassembled datagram payload once
    /// the record is complete (the record is then deleted).
    pub fn insert(&mut self, source_ip: IpAddr, id: u16, offset: usize, data: Vec<u8>, more_fragments: bool) -> Option<Vec<u8>> {
        let key = ReassemblyKey { source_ip, id };
        let idx = match self.records.iter().position(|r| r.key == key) {
            Some(i) => i,
            None => {
                if self.records.len() >= self.max_records {
                    self.records.pop_front(); // evict oldest
                }
                self.records.push_back(ReassemblyRecord { key, tmo: self.tmo_s, fragments: Vec::new() });
                self.records.len() - 1
            }
        };

        let record = &mut self.records[idx];
        // Drop duplicates/overlaps at the same offset, keeping the newer one.
        record.fragments.retain(|f| f.offset != offset);
        if record.fragments.len() >= self.max_bufs_per_record {
            record.fragments.remove(0);
        }
        record.fragments.push(Fragment { offset, data, more_fragments });
        record.fragments.sort_by_key(|f| f.offset);

        if let Some(full) = record.completed() {
            self.records.remove(idx);
            return Some(full);
        }
        None
    }

    /// Ages every record by one scan period; drops those whose timeout has
    /// elapsed.
    pub fn on_timer(&mut self) {
        self.records.retain_mut(|r| {
            r.tmo = r.tmo.saturating_sub(1);
            r.tmo > 0
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(src: IpAddr, dst: IpAddr, proto: u8) -> Ipv4Header {
        Ipv4Header {
            ihl_words: 5,
            tos: 0,
            total_len: 0,
            id: 0,
            more_fragments: false,
            frag_offset: 0,
            ttl: DEFAULT_TTL,
            protocol: proto,
            checksum: 0,
            src,
            dst,
        }
    }

    #[test]
    fn header_round_trips_and_checksum_is_valid() {
        let h = hdr(IpAddr::from_octets([10, 0, 0, 2]), IpAddr::from_octets([10, 0, 0, 3]), PROTO_UDP);
        let encoded = h.encode();
        let decoded = Ipv4Header::decode(&encoded).unwrap();
        assert_eq!(decoded.src, h.src);
        assert_eq!(decoded.dst, h.dst);
        assert_eq!(decoded.protocol, PROTO_UDP);
    }

    #[test]
    fn longest_prefix_match_wins() {
        let mut rt = RouteTable::new();
        let net_24 = IpAddr::from_octets([10, 0, 0, 0]);
        let mask_24 = IpAddr::from_octets([255, 255, 255, 0]);
        let default = IpAddr::ANY;
        rt.add(default, default, IpAddr::from_octets([10, 0, 0, 1]), 0);
        rt.add(net_24, mask_24, IpAddr::ANY, 1);
        let route = rt.find(IpAddr::from_octets([10, 0, 0, 5])).unwrap();
        assert_eq!(route.netif, 1);
    }

    #[test]
    fn reassembly_is_order_independent() {
        let mut table = ReassemblyTable::new(&NetConfig::default());
        let src = IpAddr::from_octets([10, 0, 0, 3]);
        let id = 0x77;
        let p0 = vec![0xAAu8; 1480];
        let p1 = vec![0xBBu8; 1480];
        let p2 = vec![0xCCu8; 40];

        assert!(table.insert(src, id, 2960, p2.clone(), false).is_none());
        assert!(table.insert(src, id, 0, p0.clone(), true).is_none());
        let full = table.insert(src, id, 1480, p1.clone(), true).unwrap();

        let mut expected = p0;
        expected.extend(p1);
        expected.extend(p2);
        assert_eq!(full, expected);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn fragment_sizes_sum_to_original() {
        let payload = vec![0x42u8; 3000];
        let h = hdr(IpAddr::from_octets([10, 0, 0, 2]), IpAddr::from_octets([10, 0, 0, 3]), PROTO_UDP);
        let frags = fragment(&payload, 1500, 7, h);
        let total: usize = frags.iter().map(|f| f.len() - MIN_HEADER_LEN).sum();
        assert_eq!(total, payload.len());
        assert!(frags.iter().all(|f| f.len() <= 1500));
        assert!(!Ipv4Header::decode(&frags.last().unwrap()[..MIN_HEADER_LEN]).unwrap().more_fragments);
    }
}
