//! Dispatches an inbound, already-decoded segment to the handler for the
//! owning TCB's current state. Looking the TCB up by four-tuple, sending
//! whatever [`Action`] comes back, and reclaiming/spawning TCBs all happen
//! in [`crate::stack`], which is the only module that can see the whole
//! TCB table plus the netif output queues at once.

use super::state::{self, Action};
use super::tcb::{Tcb, TcpState};
use super::{is_acceptable, Segment, FLAG_SYN};

/// Runs the acceptability test (skipped for `Listen`/`SynSent`, which have
/// no established receive window yet) and hands the segment to the
/// matching per-state function.
pub fn dispatch(tcb: &mut Tcb, seg: &Segment) -> Action {
    match tcb.state {
        TcpState::Closed => state::closed_in(tcb, seg),
        TcpState::Listen => state::listen_in(tcb, seg),
        TcpState::SynSent => {
            tcb.snd.wnd = seg.header.window as u32;
            state::syn_sent_in(tcb, seg)
        }
        _ => {
            if !seg.header.flags.has(FLAG_SYN)
                && !is_acceptable(seg.header.seq, seg.seq_len, tcb.rcv.nxt, tcb.recv_window())
            {
                return Action::SendAck;
            }
            tcb.snd.wnd = seg.header.window as u32;
            match tcb.state {
                TcpState::SynRecvd => state::syn_recvd_in(tcb, seg),
                TcpState::Established => state::established_in(tcb, seg),
                TcpState::CloseWait => state::close_wait_in(tcb, seg),
                TcpState::LastAck => state::last_ack_in(tcb, seg),
                TcpState::FinWait1 => state::fin_wait_1_in(tcb, seg),
                TcpState::FinWait2 => state::fin_wait_2_in(tcb, seg),
                TcpState::Closing => state::closing_in(tcb, seg),
                TcpState::TimeWait => state::time_wait_in(tcb, seg),
                TcpState::Closed | TcpState::Listen | TcpState::SynSent => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipaddr::IpAddr;
    use crate::tcp::{Flags, TcpHeader, FLAG_ACK};

    #[test]
    fn out_of_window_segment_gets_bare_ack() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Established);
        tcb.rcv.nxt = 1000;
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 50,
            ack: 1,
            flags: Flags(FLAG_ACK),
            window: 0,
            mss: None,
        };
        let seg = Segment::new(IpAddr::ANY, IpAddr::ANY, header, b"x".to_vec());
        assert_eq!(dispatch(&mut tcb, &seg), Action::SendAck);
    }

    #[test]
    fn listen_dispatch_spawns_child() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Listen);
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq: 500,
            ack: 0,
            flags: Flags(FLAG_SYN),
            window: 4096,
            mss: None,
        };
        let seg = Segment::new(IpAddr::ANY, IpAddr::ANY, header, vec![]);
        assert_eq!(dispatch(&mut tcb, &seg), Action::SpawnChild);
    }
}
