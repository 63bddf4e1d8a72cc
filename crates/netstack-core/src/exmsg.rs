//! The worker's single inbox and run loop.
//!
//! Every driver thread, timer-tick thread, and application call feeds the
//! same `crossbeam_channel`; the worker thread drains it and is the only
//! thread that ever touches [`crate::stack::Stack`]'s protocol state. This
//! mirrors the original `exmsg` dispatcher, which likewise serialized
//! `NETIF_IN` events and application-originated function calls onto one
//! queue so the protocol stack itself never needs locking.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use crate::netif::NetifId;
use crate::stack::Stack;

/// A unit of work for the worker thread.
pub enum ExMsg {
    /// A netif's receive queue has at least one frame waiting.
    NetifIn(NetifId),
    /// An application call that couldn't run on the caller's thread (every
    /// socket verb dispatches through here so the worker is the only writer
    /// of protocol state).
    Fun(Box<dyn FnOnce(&mut Stack) + Send>),
}

#[derive(Clone)]
pub struct Inbox {
    tx: Sender<ExMsg>,
}

impl Inbox {
    pub fn post(&self, msg: ExMsg) {
        if self.tx.send(msg).is_err() {
            warn!("worker inbox closed, dropping message");
        }
    }

    pub fn notify_netif_in(&self, netif: NetifId) {
        self.post(ExMsg::NetifIn(netif));
    }

    pub fn call(&self, f: impl FnOnce(&mut Stack) + Send + 'static) {
        self.post(ExMsg::Fun(Box::new(f)));
    }
}

pub fn channel(depth: usize) -> (Inbox, Receiver<ExMsg>) {
    let (tx, rx) = crossbeam_channel::bounded(depth);
    (Inbox { tx }, rx)
}

/// Runs the worker loop until `rx`'s senders are all dropped. Ticks the
/// timer list every `tick_period` of wall-clock time actually elapsed
/// between iterations, so a busy period that delays the loop doesn't lose
/// timer ticks — it just fires the ones that would have, per
/// [`crate::timer::TimerList::advance`].
pub fn run(stack: &mut Stack, rx: &Receiver<ExMsg>, tick_period: Duration) {
    let mut last_tick = Instant::now();
    loop {
        match rx.recv_timeout(tick_period) {
            Ok(msg) => dispatch(stack, msg),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        let now = Instant::now();
        let elapsed_ms = now.duration_since(last_tick).as_millis() as u64;
        if elapsed_ms > 0 {
            stack.on_timer_tick(elapsed_ms);
            last_tick = now;
        }
    }
}

fn dispatch(stack: &mut Stack, msg: ExMsg) {
    match msg {
        ExMsg::NetifIn(id) => {
            trace!(netif = id, "draining netif inbound queue");
            stack.drain_netif_in(id);
        }
        ExMsg::Fun(f) => f(stack),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    #[test]
    fn fun_message_runs_against_the_stack() {
        let (inbox, rx) = channel(8);
        let mut stack = Stack::new(NetConfig::default());
        inbox.call(|s| {
            s.route_table_mut().add(
                crate::ipaddr::IpAddr::ANY,
                crate::ipaddr::IpAddr::ANY,
                crate::ipaddr::IpAddr::from_octets([10, 0, 0, 1]),
                0,
            );
        });
        let msg = rx.try_recv().unwrap();
        dispatch(&mut stack, msg);
        assert!(stack.route_table_mut().find(crate::ipaddr::IpAddr::from_octets([8, 8, 8, 8])).is_some());
    }
}
