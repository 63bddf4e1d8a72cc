//! Builds outbound segments from a TCB's current send state. This is the
//! single place that decides how much queued data rides along with a given
//! set of flags, and advances `snd.nxt` to match what was actually sent.

use crate::ipaddr::IpAddr;

use super::tcb::Tcb;
use super::{Flags, TcpHeader, FLAG_ACK, FLAG_FIN, FLAG_SYN};

/// Builds one segment carrying `flags`, piggybacking up to
/// `min(mss, peer window, queued bytes)` bytes of unsent data from
/// `snd.nxt - snd.una` onward, and advances `snd.nxt` (and `fin_out`/
/// `syn_out` as appropriate) to reflect what was just put on the wire.
///
/// Does not itself re-send unacked bytes — retransmission calls this with
/// `snd.nxt` rewound to `snd.una` by the caller first.
pub fn build_segment(tcb: &mut Tcb, local_ip: IpAddr, remote_ip: IpAddr, flags: u8, peer_window: u32) -> Vec<u8> {
    let unsent_offset = tcb.snd.nxt.wrapping_sub(tcb.snd.una) as usize;
    let budget = (tcb.mss as usize).min(peer_window as usize);
    let data = if flags & FLAG_SYN != 0 {
        Vec::new()
    } else {
        tcb.send_buf.peek(unsent_offset, budget)
    };

    let mut out_flags = flags;
    if flags & FLAG_SYN != 0 {
        tcb.flags.syn_out = true;
    }
    let sending_fin = flags & FLAG_FIN != 0
        && unsent_offset + data.len() >= tcb.send_buf.count()
        && !tcb.flags.fin_out;
    if sending_fin {
        tcb.flags.fin_out = true;
    } else {
        out_flags &= !FLAG_FIN;
    }

    let header = TcpHeader {
        src_port: tcb.base.local_port,
        dst_port: tcb.base.remote_port,
        seq: tcb.snd.nxt,
        ack: if out_flags & FLAG_ACK != 0 { tcb.rcv.nxt } else { 0 },
        flags: Flags(out_flags),
        window: tcb.recv_window().min(u16::MAX as u32) as u16,
        mss: if flags & FLAG_SYN != 0 { Some(tcb.mss) } else { None },
    };

    let advance = data.len() as u32
        + u32::from(flags & FLAG_SYN != 0)
        + u32::from(sending_fin);
    tcb.snd.nxt = tcb.snd.nxt.wrapping_add(advance);

    header.build(local_ip, remote_ip, &data)
}

/// Builds a bare keepalive probe at `snd.nxt - 1`, one byte below the next
/// send sequence, so the peer is obliged to answer with a fresh ACK — a
/// probe at `snd.nxt` is an ordinary duplicate ACK the peer is free to
/// ignore, which would defeat the point of probing. Carries no data and
/// does not touch `snd.nxt`; this isn't new data, just a liveness nudge.
pub fn build_keepalive_probe(tcb: &Tcb, local_ip: IpAddr, remote_ip: IpAddr) -> Vec<u8> {
    let header = TcpHeader {
        src_port: tcb.base.local_port,
        dst_port: tcb.base.remote_port,
        seq: tcb.snd.nxt.wrapping_sub(1),
        ack: tcb.rcv.nxt,
        flags: Flags(FLAG_ACK),
        window: tcb.recv_window().min(u16::MAX as u32) as u16,
        mss: None,
    };
    header.build(local_ip, remote_ip, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::tcb::TcpState;

    #[test]
    fn syn_segment_carries_no_data_and_advances_one() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::SynSent);
        tcb.snd.iss = 1000;
        tcb.snd.una = 1000;
        tcb.snd.nxt = 1000;
        let local = IpAddr::from_octets([10, 0, 0, 2]);
        let remote = IpAddr::from_octets([10, 0, 0, 3]);
        let wire = build_segment(&mut tcb, local, remote, FLAG_SYN, 4096);
        let (header, payload) = TcpHeader::decode(&wire, local, remote).unwrap();
        assert_eq!(header.seq, 1000);
        assert!(payload.is_empty());
        assert_eq!(tcb.snd.nxt, 1001);
        assert!(tcb.flags.syn_out);
    }

    #[test]
    fn data_segment_piggybacks_up_to_peer_window() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Established);
        tcb.snd.una = 1;
        tcb.snd.nxt = 1;
        tcb.send_buf.write(b"hello world");
        let local = IpAddr::from_octets([10, 0, 0, 2]);
        let remote = IpAddr::from_octets([10, 0, 0, 3]);
        let wire = build_segment(&mut tcb, local, remote, FLAG_ACK, 5);
        let (_, payload) = TcpHeader::decode(&wire, local, remote).unwrap();
        assert_eq!(payload.len(), 5);
        assert_eq!(tcb.snd.nxt, 6);
    }

    #[test]
    fn keepalive_probe_carries_seq_one_below_nxt_and_no_data() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Established);
        tcb.snd.una = 100;
        tcb.snd.nxt = 150;
        tcb.rcv.nxt = 9;
        let local = IpAddr::from_octets([10, 0, 0, 2]);
        let remote = IpAddr::from_octets([10, 0, 0, 3]);
        let wire = build_keepalive_probe(&tcb, local, remote);
        let (header, payload) = TcpHeader::decode(&wire, local, remote).unwrap();
        assert_eq!(header.seq, 149);
        assert_eq!(header.ack, 9);
        assert!(header.flags.has(FLAG_ACK));
        assert!(payload.is_empty());
        assert_eq!(tcb.snd.nxt, 150, "probe must not advance snd.nxt");
    }

    #[test]
    fn fin_only_sent_once_all_data_acked() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::FinWait1);
        tcb.snd.una = 1;
        tcb.snd.nxt = 1;
        tcb.send_buf.write(b"ab");
        let local = IpAddr::from_octets([10, 0, 0, 2]);
        let remote = IpAddr::from_octets([10, 0, 0, 3]);
        // Unsent data still outstanding: FIN flag is withheld.
        let wire = build_segment(&mut tcb, local, remote, FLAG_ACK | FLAG_FIN, 1);
        let (header, _) = TcpHeader::decode(&wire, local, remote).unwrap();
        assert!(!header.flags.has(FLAG_FIN));
        assert!(!tcb.flags.fin_out);

        // Once the remaining byte goes out, FIN piggybacks and is counted.
        let wire2 = build_segment(&mut tcb, local, remote, FLAG_ACK | FLAG_FIN, 64);
        let (header2, _) = TcpHeader::decode(&wire2, local, remote).unwrap();
        assert!(header2.flags.has(FLAG_FIN));
        assert!(tcb.flags.fin_out);
    }
}
