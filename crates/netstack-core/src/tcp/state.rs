//! Per-state segment handlers, one per RFC 793 state, dispatched by
//! [`super::input::dispatch`].

use crate::error::NetError;

use super::tcb::{Tcb, TcpState};
use super::{Segment, FLAG_ACK, FLAG_FIN, FLAG_RST, FLAG_SYN};

/// What the caller (which owns the TCB table, timers and netif output)
/// must do in response to a state handler's verdict. State handlers never
/// touch anything outside their own `Tcb` — spawning a child, moving a TCB
/// between queues, and sending bytes on the wire are all done by the
/// caller based on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    SendAck,
    SendRst,
    SendSynAck,
    /// A SYN arrived on a listening socket; the caller creates a child TCB.
    SpawnChild,
    /// This (child) TCB just reached ESTABLISHED; move it to the parent's
    /// accept queue and wake any `accept` waiter.
    PromoteToAcceptQueue,
    WakeConnEstablished,
    WakeRecv,
    WakeSend,
    Abort(NetError),
    EnterTimeWait,
    /// The TCB can be reclaimed now (TIME_WAIT expiry or LAST_ACK's final ACK).
    Reclaim,
}

pub fn closed_in(_tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_ACK) {
        Action::None // reset_reply already handled by the caller for no-TCB segments
    } else {
        Action::SendRst
    }
}

pub fn listen_in(_tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::None;
    }
    if seg.header.flags.has(FLAG_ACK) {
        return Action::SendRst;
    }
    if seg.header.flags.has(FLAG_SYN) {
        return Action::SpawnChild;
    }
    Action::None
}

pub fn syn_sent_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::Abort(NetError::Reset);
    }
    if !seg.header.flags.has(FLAG_SYN) {
        return Action::None;
    }
    tcb.rcv.irs = seg.header.seq;
    tcb.rcv.nxt = seg.header.seq.wrapping_add(1);
    tcb.flags.irs_valid = true;
    if let Some(mss) = seg.header.mss {
        tcb.mss = tcb.mss.min(mss);
    }
    if seg.header.flags.has(FLAG_ACK) {
        tcb.apply_ack(seg.header.ack);
        tcb.set_state(TcpState::Established);
        Action::WakeConnEstablished
    } else {
        tcb.set_state(TcpState::SynRecvd);
        Action::SendSynAck
    }
}

pub fn syn_recvd_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::Abort(NetError::Reset);
    }
    if seg.header.flags.has(FLAG_ACK) {
        tcb.apply_ack(seg.header.ack);
        tcb.set_state(TcpState::Established);
        return Action::PromoteToAcceptQueue;
    }
    Action::None
}

fn handle_established_like(tcb: &mut Tcb, seg: &Segment) -> Option<Action> {
    if seg.header.flags.has(FLAG_RST) {
        return Some(Action::Abort(NetError::Reset));
    }
    tcb.timers.keepalive_probes = 0;
    if !seg.data.is_empty() {
        tcb.recv_buf.write(&seg.data);
        tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(seg.data.len() as u32);
    }
    if seg.header.flags.has(FLAG_ACK) {
        tcb.apply_ack(seg.header.ack);
    }
    None
}

pub fn established_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if let Some(action) = handle_established_like(tcb, seg) {
        return action;
    }
    let woke_recv = !seg.data.is_empty();
    if seg.header.flags.has(FLAG_FIN) {
        tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
        tcb.set_state(TcpState::CloseWait);
        return Action::WakeRecv;
    }
    if woke_recv {
        Action::WakeRecv
    } else {
        Action::WakeSend
    }
}

pub fn close_wait_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::Abort(NetError::Reset);
    }
    if seg.header.flags.has(FLAG_ACK) {
        tcb.apply_ack(seg.header.ack);
    }
    Action::WakeSend
}

pub fn last_ack_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::Abort(NetError::Reset);
    }
    if seg.header.flags.has(FLAG_ACK) {
        let covers_fin = tcb.apply_ack(seg.header.ack);
        if covers_fin || tcb.send_caught_up() {
            return Action::Reclaim;
        }
    }
    Action::None
}

pub fn fin_wait_1_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if let Some(action) = handle_established_like(tcb, seg) {
        return action;
    }
    let fin_acked = !tcb.flags.fin_out;
    if seg.header.flags.has(FLAG_FIN) {
        tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
        if fin_acked {
            tcb.set_state(TcpState::TimeWait);
            Action::EnterTimeWait
        } else {
            tcb.set_state(TcpState::Closing);
            Action::SendAck
        }
    } else if fin_acked {
        tcb.set_state(TcpState::FinWait2);
        Action::None
    } else {
        Action::None
    }
}

pub fn fin_wait_2_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if let Some(action) = handle_established_like(tcb, seg) {
        return action;
    }
    if seg.header.flags.has(FLAG_FIN) {
        tcb.rcv.nxt = tcb.rcv.nxt.wrapping_add(1);
        tcb.set_state(TcpState::TimeWait);
        return Action::EnterTimeWait;
    }
    Action::WakeRecv
}

pub fn closing_in(tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_RST) {
        return Action::Abort(NetError::Reset);
    }
    if seg.header.flags.has(FLAG_ACK) {
        tcb.apply_ack(seg.header.ack);
        if tcb.send_caught_up() {
            tcb.set_state(TcpState::TimeWait);
            return Action::EnterTimeWait;
        }
    }
    Action::None
}

pub fn time_wait_in(_tcb: &mut Tcb, seg: &Segment) -> Action {
    if seg.header.flags.has(FLAG_ACK) && !seg.header.flags.has(FLAG_RST) {
        Action::SendAck
    } else {
        Action::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipaddr::IpAddr;
    use crate::tcp::{Flags, Segment, TcpHeader};

    fn seg(flags: u8, seq: u32, ack: u32, data: Vec<u8>) -> Segment {
        let header = TcpHeader {
            src_port: 1,
            dst_port: 2,
            seq,
            ack,
            flags: Flags(flags),
            window: 4096,
            mss: None,
        };
        Segment::new(IpAddr::ANY, IpAddr::ANY, header, data)
    }

    #[test]
    fn listen_spawns_child_on_syn() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Listen);
        let action = listen_in(&mut tcb, &seg(FLAG_SYN, 500, 0, vec![]));
        assert_eq!(action, Action::SpawnChild);
    }

    #[test]
    fn syn_recvd_promotes_on_ack() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::SynRecvd);
        tcb.snd.una = 1;
        tcb.snd.nxt = 1;
        let action = syn_recvd_in(&mut tcb, &seg(FLAG_ACK, 501, 1, vec![]));
        assert_eq!(action, Action::PromoteToAcceptQueue);
        assert_eq!(tcb.state, TcpState::Established);
    }

    #[test]
    fn established_accepts_data_and_wakes_recv() {
        let mut tcb = Tcb::new(64);
        tcb.set_state(TcpState::Established);
        tcb.rcv.nxt = 500;
        let action = established_in(&mut tcb, &seg(FLAG_ACK, 500, 1, b"abcd".to_vec()));
        assert_eq!(action, Action::WakeRecv);
        assert_eq!(tcb.rcv.nxt, 504);
    }
}
