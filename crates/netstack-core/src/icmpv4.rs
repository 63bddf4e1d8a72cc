//! ICMPv4 (RFC 792): echo reply and destination-unreachable only, per
//! spec.md's non-goals for the rest of the type space.

use crate::error::{NetError, NetResult};
use crate::ipv4::MIN_HEADER_LEN;
use crate::tools;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_DEST_UNREACHABLE: u8 = 3;
pub const TYPE_ECHO_REQUEST: u8 = 8;

pub const UNREACHABLE_QUOTE_LEN: usize = 576;

#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// id/seq for echo; unused (zero) for unreachable (which instead has 4
    /// reserved bytes in the same slot).
    pub rest: u32,
}

pub const HEADER_LEN: usize = 8;

impl IcmpHeader {
    pub fn decode(data: &[u8]) -> NetResult<(IcmpHeader, &[u8])> {
        if data.len() < HEADER_LEN {
            return Err(NetError::Broken);
        }
        if tools::checksum16(data, 0, false) != 0 {
            return Err(NetError::Chksum);
        }
        let header = IcmpHeader {
            icmp_type: data[0],
            code: data[1],
            checksum: u16::from_be_bytes([data[2], data[3]]),
            rest: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        };
        Ok((header, &data[HEADER_LEN..]))
    }

    fn encode_with_checksum(icmp_type: u8, code: u8, rest: u32, payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::with_capacity(HEADER_LEN + payload.len());
        msg.extend_from_slice(&[icmp_type, code, 0, 0]);
        msg.extend_from_slice(&rest.to_be_bytes());
        msg.extend_from_slice(payload);
        let checksum = tools::checksum16(&msg, 0, true);
        msg[2..4].copy_from_slice(&checksum.to_be_bytes());
        msg
    }
}

/// Builds an echo reply (type 0) for the given echo request payload (the
/// `id`/`seq` word plus the application payload, taken verbatim from the
/// request per RFC 792).
pub fn build_echo_reply(id_seq: u32, payload: &[u8]) -> Vec<u8> {
    IcmpHeader::encode_with_checksum(TYPE_ECHO_REPLY, 0, id_seq, payload)
}

/// Builds a destination-unreachable message: the offending IP header plus
/// up to 576 bytes of its payload, per spec.md §4.6.
pub fn build_unreachable(code: u8, offending_ip_datagram: &[u8]) -> Vec<u8> {
    let quote_len = offending_ip_datagram.len().min(MIN_HEADER_LEN + UNREACHABLE_QUOTE_LEN);
    IcmpHeader::encode_with_checksum(TYPE_DEST_UNREACHABLE, code, 0, &offending_ip_datagram[..quote_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_reply_preserves_payload_and_id_seq() {
        let payload = vec![0xABu8; 32];
        let id_seq = (0x1234u32 << 16) | 1;
        let msg = build_echo_reply(id_seq, &payload);
        let (hdr, body) = IcmpHeader::decode(&msg).unwrap();
        assert_eq!(hdr.icmp_type, TYPE_ECHO_REPLY);
        assert_eq!(hdr.rest, id_seq);
        assert_eq!(body, &payload[..]);
    }

    #[test]
    fn unreachable_quotes_offending_datagram() {
        let datagram = vec![0x11u8; MIN_HEADER_LEN + 16];
        let msg = build_unreachable(3, &datagram);
        let (hdr, body) = IcmpHeader::decode(&msg).unwrap();
        assert_eq!(hdr.icmp_type, TYPE_DEST_UNREACHABLE);
        assert_eq!(hdr.code, 3);
        assert_eq!(body.len(), MIN_HEADER_LEN + 16);
    }
}
