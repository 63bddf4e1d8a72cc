//! `netstack-probe run` — bring the configured interfaces up and serve a
//! demo TCP echo listener.
//!
//! The worker thread owns the `Stack` (see `netstack_core::exmsg`); this
//! command is just another application thread talking to it through an
//! `Inbox`. Calls that can return `NeedWait` (accept, recv) are retried
//! with a short sleep instead of parking on the socket's `WaitObject` — a
//! real synchronous socket-API wrapper would do the latter (see
//! DESIGN.md). The accept loop exits cleanly on SIGINT.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use netstack_core::ipaddr::IpAddr;
use netstack_core::netif::{Netif, NetifType};
use netstack_core::socket::Fd;
use netstack_core::{exmsg, NetError, NetResult, Stack};
use tracing::{info, warn};

use crate::config::ProbeConfig;
use crate::netdev::PassiveDriver;

const TICK: Duration = Duration::from_millis(50);
const POLL_BACKOFF: Duration = Duration::from_millis(20);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn run(config: &ProbeConfig, port: u16) -> Result<()> {
    if config.netifs.is_empty() {
        bail!("no interfaces configured — run `netstack-probe init` to create netstack.toml");
    }

    let mut stack = Stack::new(config.net.clone());
    let (inbox, rx) = exmsg::channel(256);

    for entry in &config.netifs {
        let ip = IpAddr::from_str_strict(&entry.ip)
            .with_context(|| format!("bad ip for interface {}", entry.name))?;
        let mask = IpAddr::from_str_strict(&entry.mask)
            .with_context(|| format!("bad mask for interface {}", entry.name))?;
        let gateway = match &entry.gateway {
            Some(g) => IpAddr::from_str_strict(g)
                .with_context(|| format!("bad gateway for interface {}", entry.name))?,
            None => IpAddr::ANY,
        };

        let driver = Box::new(PassiveDriver::new(1500));
        let mut netif = Netif::new(entry.name.clone(), NetifType::Loop, driver, config.net.netif_queue_depth);
        netif.set_addr(ip, mask, gateway);
        let in_tx = netif.in_q.sender();
        let out_rx = netif.out_q.receiver();
        netif.open()?;

        let id = stack.add_netif(netif);
        stack
            .netif_set_active(id)
            .with_context(|| format!("failed to bring up interface {}", entry.name))?;

        // Loopback pump: whatever this interface transmits, it receives —
        // mirrors the original's `loop_xmit` (pktbuf pulled from the out
        // queue goes straight back into the in queue).
        let pump_inbox = inbox.clone();
        thread::spawn(move || {
            for frame in out_rx.iter() {
                if in_tx.send(frame).is_ok() {
                    pump_inbox.notify_netif_in(id);
                }
            }
        });

        info!(name = %entry.name, ip = %entry.ip, "interface up");
    }

    thread::spawn(move || exmsg::run(&mut stack, &rx, TICK));

    let listen_fd = call(&inbox, move |s| -> NetResult<Fd> {
        let fd = s.tcp_socket()?;
        s.tcp_bind(fd, IpAddr::ANY, port)?;
        s.tcp_listen(fd)?;
        Ok(fd)
    })
    .context("failed to bring up echo listener")?;

    info!(port, "echo listener up, waiting for connections");

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    while RUNNING.load(Ordering::SeqCst) {
        let client_fd = loop {
            if !RUNNING.load(Ordering::SeqCst) {
                info!("shutting down on SIGINT");
                return Ok(());
            }
            match call(&inbox, move |s| s.tcp_accept(listen_fd)) {
                Ok(fd) => break fd,
                Err(NetError::NeedWait) => thread::sleep(POLL_BACKOFF),
                Err(e) => return Err(e.into()),
            }
        };
        info!(fd = client_fd, "connection accepted");
        let echo_inbox = inbox.clone();
        thread::spawn(move || echo_connection(echo_inbox, client_fd));
    }

    Ok(())
}

/// Echoes whatever a connected peer sends back to it until it closes.
fn echo_connection(inbox: exmsg::Inbox, fd: Fd) {
    loop {
        let chunk = loop {
            match call(&inbox, move |s| s.tcp_recv(fd, 4096)) {
                Ok(data) => break data,
                Err(NetError::NeedWait) => thread::sleep(POLL_BACKOFF),
                Err(e) => {
                    warn!(fd, error = %e, "echo connection recv failed");
                    return;
                }
            }
        };
        if chunk.is_empty() {
            break;
        }
        let n = chunk.len();
        let _ = call(&inbox, move |s| s.tcp_send(fd, &chunk));
        info!(fd, bytes = n, "echoed");
    }
    let _ = call(&inbox, move |s| s.tcp_close(fd));
    info!(fd, "connection closed");
}

/// Posts `f` to the worker and blocks the calling thread for its result.
fn call<T, F>(inbox: &exmsg::Inbox, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&mut Stack) -> T + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(1);
    inbox.call(move |stack| {
        let _ = tx.send(f(stack));
    });
    rx.recv().expect("worker thread gone")
}
