//! TCP (RFC 793): wire header codec, sequence-space arithmetic, and the
//! reset rule. The control block, per-state handlers, and the output
//! builder live in the sibling modules; the worker wiring that actually
//! moves segments to and from the wire lives in [`crate::stack`].

pub mod buf;
pub mod input;
pub mod output;
pub mod state;
pub mod tcb;

use crate::error::{NetError, NetResult};
use crate::ipaddr::IpAddr;
use crate::tools;

pub const HEADER_LEN: usize = 20;
pub const DEFAULT_MSS: u16 = 1460;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: Flags,
    pub window: u16,
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Encodes the header (and MSS option, on SYN segments) followed by
    /// `payload`, with the pseudo-header checksum filled in.
    pub fn build(&self, src_ip: IpAddr, dst_ip: IpAddr, payload: &[u8]) -> Vec<u8> {
        let has_mss = self.flags.has(FLAG_SYN) && self.mss.is_some();
        let options_len = if has_mss { 4 } else { 0 };
        let data_offset_words = ((HEADER_LEN + options_len) / 4) as u8;
        let mut seg = Vec::with_capacity(HEADER_LEN + options_len + payload.len());
        seg.extend_from_slice(&self.src_port.to_be_bytes());
        seg.extend_from_slice(&self.dst_port.to_be_bytes());
        seg.extend_from_slice(&self.seq.to_be_bytes());
        seg.extend_from_slice(&self.ack.to_be_bytes());
        seg.push(data_offset_words << 4);
        seg.push(self.flags.0);
        seg.extend_from_slice(&self.window.to_be_bytes());
        seg.extend_from_slice(&[0, 0]); // checksum placeholder
        seg.extend_from_slice(&[0, 0]); // urgent pointer, unused
        if let Some(mss) = self.mss {
            if has_mss {
                seg.extend_from_slice(&[2, 4]);
                seg.extend_from_slice(&mss.to_be_bytes());
            }
        }
        seg.extend_from_slice(payload);

        let total_len = seg.len() as u16;
        let seed = tools::pseudo_header_sum(src_ip.0, dst_ip.0, crate::ipv4::PROTO_TCP, total_len);
        let checksum = tools::checksum16(&seg, seed, true);
        seg[16..18].copy_from_slice(&checksum.to_be_bytes());
        seg
    }

    /// Validates the pseudo-header checksum, decodes the fixed header plus
    /// the MSS option if present, and returns the header alongside the
    /// payload slice.
    pub fn decode<'a>(data: &'a [u8], src_ip: IpAddr, dst_ip: IpAddr) -> NetResult<(TcpHeader, &'a [u8])> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Broken);
        }
        let seed = tools::pseudo_header_sum(src_ip.0, dst_ip.0, crate::ipv4::PROTO_TCP, data.len() as u16);
        if tools::checksum16(data, seed, false) != 0 {
            return Err(NetError::Chksum);
        }
        let data_offset_words = data[12] >> 4;
        let header_len = data_offset_words as usize * 4;
        if header_len < HEADER_LEN || header_len > data.len() {
            return Err(NetError::Broken);
        }
        let flags = Flags(data[13]);
        if flags.0 & (FLAG_FIN | FLAG_SYN | FLAG_RST | FLAG_ACK) == 0 {
            return Err(NetError::Broken);
        }
        let mut mss = None;
        let mut opt = &data[HEADER_LEN..header_len];
        while opt.len() >= 2 {
            match opt[0] {
                0 => break,
                1 => opt = &opt[1..],
                2 if opt.len() >= 4 => {
                    mss = Some(u16::from_be_bytes([opt[2], opt[3]]));
                    opt = &opt[4..];
                }
                _ => {
                    let len = (*opt.get(1).unwrap_or(&2)).max(2) as usize;
                    if len > opt.len() {
                        break;
                    }
                    opt = &opt[len..];
                }
            }
        }
        let header = TcpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags,
            window: u16::from_be_bytes([data[14], data[15]]),
            mss,
        };
        Ok((header, &data[header_len..]))
    }
}

/// An inbound segment decorated with the metadata the state machine needs:
/// `seq_len = data_len + syn + fin`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub header: TcpHeader,
    pub data: Vec<u8>,
    pub seq_len: u32,
}

impl Segment {
    pub fn new(local_ip: IpAddr, remote_ip: IpAddr, header: TcpHeader, data: Vec<u8>) -> Segment {
        let mut seq_len = data.len() as u32;
        if header.flags.has(FLAG_SYN) {
            seq_len += 1;
        }
        if header.flags.has(FLAG_FIN) {
            seq_len += 1;
        }
        Segment { local_ip, remote_ip, header, data, seq_len }
    }
}

/// `a <seq b`: true when advancing from `a` to `b` moves forward in
/// sequence space without wrapping past half of `u32` — the standard
/// RFC 793 modular comparison.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// A segment's sequence space `[seq, seq+seq_len)` is acceptable when it
/// overlaps the receive window `[rcv_nxt, rcv_nxt+rcv_wnd)`, correctly
/// under 32-bit wraparound.
pub fn is_acceptable(seq: u32, seq_len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    let in_window = |x: u32| seq_le(rcv_nxt, x) && seq_lt(x, rcv_nxt.wrapping_add(rcv_wnd));
    if seq_len == 0 {
        return if rcv_wnd == 0 { seq == rcv_nxt } else { in_window(seq) };
    }
    if rcv_wnd == 0 {
        return false;
    }
    in_window(seq) || in_window(seq.wrapping_add(seq_len - 1))
}

/// Builds the RST reply per spec.md §4.8's reset rule. Never call this for
/// an incoming RST (checked by the caller).
pub fn reset_reply(incoming: &Segment) -> TcpHeader {
    debug_assert!(!incoming.header.flags.has(FLAG_RST));
    if incoming.header.flags.has(FLAG_ACK) {
        TcpHeader {
            src_port: incoming.header.dst_port,
            dst_port: incoming.header.src_port,
            seq: incoming.header.ack,
            ack: 0,
            flags: Flags(FLAG_RST),
            window: 0,
            mss: None,
        }
    } else {
        TcpHeader {
            src_port: incoming.header.dst_port,
            dst_port: incoming.header.src_port,
            seq: 0,
            ack: incoming.header.seq.wrapping_add(incoming.seq_len),
            flags: Flags(FLAG_RST | FLAG_ACK),
            window: 0,
            mss: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_with_mss_option() {
        let src = IpAddr::from_octets([10, 0, 0, 2]);
        let dst = IpAddr::from_octets([10, 0, 0, 3]);
        let h = TcpHeader {
            src_port: 7000,
            dst_port: 12345,
            seq: 100,
            ack: 0,
            flags: Flags(FLAG_SYN),
            window: 4096,
            mss: Some(1460),
        };
        let wire = h.build(src, dst, &[]);
        let (decoded, payload) = TcpHeader::decode(&wire, src, dst).unwrap();
        assert_eq!(decoded.seq, 100);
        assert_eq!(decoded.mss, Some(1460));
        assert!(payload.is_empty());
    }

    #[test]
    fn sequence_acceptability_handles_wraparound() {
        let rcv_nxt = u32::MAX - 5;
        assert!(is_acceptable(rcv_nxt, 4, rcv_nxt, 100));
        assert!(is_acceptable(rcv_nxt.wrapping_add(2), 1, rcv_nxt, 100));
        assert!(!is_acceptable(rcv_nxt.wrapping_sub(50), 1, rcv_nxt, 100));
    }

    #[test]
    fn reset_rule_uses_ack_when_present() {
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 10,
            ack: 20,
            flags: Flags(FLAG_ACK),
            window: 0,
            mss: None,
        };
        let seg = Segment::new(IpAddr::ANY, IpAddr::ANY, header, vec![]);
        let rst = reset_reply(&seg);
        assert_eq!(rst.seq, 20);
        assert_eq!(rst.ack, 0);
        assert!(!rst.flags.has(FLAG_ACK));
    }
}
