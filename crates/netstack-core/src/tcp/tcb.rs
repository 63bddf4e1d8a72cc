//! The TCP control block: the eleven-state machine's data, the send/receive
//! rings, and the accept/connection queues for a listening parent.

use std::collections::VecDeque;

use crate::ipaddr::IpAddr;
use crate::sock::{Protocol, SockBase};
use crate::timer::TimerId;

use super::buf::RingBuf;
use super::DEFAULT_MSS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRecvd,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
    LastAck,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcbFlags {
    pub syn_out: bool,
    pub fin_out: bool,
    pub irs_valid: bool,
    pub keep_enable: bool,
    pub inactive: bool,
    pub reset_in: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendSeq {
    pub iss: u32,
    pub una: u32,
    pub nxt: u32,
    pub wnd: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecvSeq {
    pub irs: u32,
    pub nxt: u32,
    pub wnd: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct KeepAliveCfg {
    pub idle_s: u32,
    pub intvl_s: u32,
    pub cnt: u32,
    pub probe_cnt: u32,
}

impl Default for KeepAliveCfg {
    fn default() -> Self {
        KeepAliveCfg { idle_s: 7200, intvl_s: 75, cnt: 9, probe_cnt: 9 }
    }
}

#[derive(Default)]
pub struct Timers {
    pub retransmit: Option<TimerId>,
    pub keepalive: Option<TimerId>,
    pub time_wait: Option<TimerId>,
    pub retransmit_interval_ms: u64,
    pub retransmit_retries: u32,
    pub keepalive_probes: u32,
}

pub type TcbId = usize;

pub struct Tcb {
    pub base: SockBase,
    pub state: TcpState,
    pub flags: TcbFlags,
    pub mss: u16,
    pub snd: SendSeq,
    pub rcv: RecvSeq,
    pub send_buf: RingBuf,
    pub recv_buf: RingBuf,
    pub parent: Option<TcbId>,
    pub accept_queue: VecDeque<TcbId>,
    pub conn_backlog: Vec<TcbId>,
    pub timers: Timers,
    pub keep: KeepAliveCfg,
}

impl Tcb {
    pub fn new(ring_size: usize) -> Tcb {
        Tcb {
            base: SockBase::new(crate::sock::Family::Inet, Protocol::Tcp),
            state: TcpState::Closed,
            flags: TcbFlags::default(),
            mss: DEFAULT_MSS,
            snd: SendSeq::default(),
            rcv: RecvSeq::default(),
            send_buf: RingBuf::new(ring_size),
            recv_buf: RingBuf::new(ring_size),
            parent: None,
            accept_queue: VecDeque::new(),
            conn_backlog: Vec::new(),
            timers: Timers::default(),
            keep: KeepAliveCfg::default(),
        }
    }

    /// A child TCB for an incoming SYN on a listening socket, inheriting
    /// the parent's local address/port and ring sizes.
    pub fn new_child(parent: TcbId, parent_tcb: &Tcb, ring_size: usize) -> Tcb {
        let mut child = Tcb::new(ring_size);
        child.base.local_ip = parent_tcb.base.local_ip;
        child.base.local_port = parent_tcb.base.local_port;
        child.parent = Some(parent);
        child.keep = parent_tcb.keep;
        child
    }

    pub fn peer(&self) -> (IpAddr, u16) {
        (self.base.remote_ip, self.base.remote_port)
    }

    /// Receive window is always the current free space in the receive
    /// ring — the original's fixed `win = 1024` is the Open Question this
    /// crate resolves in favor of the live free-space figure.
    pub fn recv_window(&self) -> u32 {
        self.recv_buf.free_cnt() as u32
    }

    pub fn set_state(&mut self, state: TcpState) {
        self.state = state;
    }

    /// Applies an acceptable ACK: advances `snd.una`, drains that many
    /// bytes from the send ring, and clears SYN/FIN-outstanding flags when
    /// the ack covers them. Returns `true` if the ack covered an
    /// outstanding FIN (the caller advances state on that).
    pub fn apply_ack(&mut self, ack: u32) -> bool {
        let mut covers_fin = false;
        if super::seq_le(self.snd.una, ack) {
            let advanced = ack.wrapping_sub(self.snd.una);
            let mut consume = advanced as usize;

            if self.flags.syn_out && advanced > 0 {
                self.flags.syn_out = false;
                consume = consume.saturating_sub(1);
            }
            if self.flags.fin_out {
                let fin_seq = self.snd.nxt.wrapping_sub(1);
                if super::seq_le(ack, fin_seq.wrapping_add(1)) && ack == self.snd.nxt {
                    covers_fin = true;
                    self.flags.fin_out = false;
                    consume = consume.saturating_sub(1);
                }
            }
            self.send_buf.remove(consume.min(self.send_buf.count()));
            self.snd.una = ack;
        }
        covers_fin
    }

    pub fn send_caught_up(&self) -> bool {
        self.snd.una == self.snd.nxt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_advances_una_and_drains_ring() {
        let mut tcb = Tcb::new(64);
        tcb.snd.iss = 100;
        tcb.snd.una = 101;
        tcb.snd.nxt = 105;
        tcb.send_buf.write(b"data");
        tcb.apply_ack(103);
        assert_eq!(tcb.snd.una, 103);
        assert_eq!(tcb.send_buf.count(), 2);
    }

    #[test]
    fn recv_window_tracks_ring_free_space() {
        let mut tcb = Tcb::new(16);
        assert_eq!(tcb.recv_window(), 16);
        tcb.recv_buf.write(b"abcd");
        assert_eq!(tcb.recv_window(), 12);
    }
}
