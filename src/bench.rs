//! `netstack-probe bench` — replay a pcap capture through the stack and
//! report throughput/drops.
//!
//! Frames from the input pcap are pushed into the first configured
//! interface's in-queue at the pace they were recorded; every frame the
//! stack transmits back out is both counted and, if `--output` was given,
//! written to a pcap file — the same `PcapWriter` plumbing `capture.rs`
//! already uses for the always-on capture ring.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use crossbeam_channel::Receiver as CbReceiver;
use netstack_core::ipaddr::IpAddr;
use netstack_core::netif::{Netif, NetifType};
use netstack_core::{exmsg, Stack};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapReader, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use serde::Serialize;
use tracing::info;

use crate::config::ProbeConfig;
use crate::netdev::PassiveDriver;

const TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize)]
struct BenchReport {
    started_at: String,
    frames_in: u64,
    bytes_in: u64,
    frames_out: u64,
    bytes_out: u64,
    dropped_in: u64,
    elapsed_secs: f64,
}

pub fn run(config: &ProbeConfig, input: &Path, output: Option<PathBuf>) -> Result<()> {
    let Some(entry) = config.netifs.first() else {
        bail!("no interfaces configured — run `netstack-probe init` to create netstack.toml");
    };

    let mut stack = Stack::new(config.net.clone());
    let ip = IpAddr::from_str_strict(&entry.ip).context("bad interface ip")?;
    let mask = IpAddr::from_str_strict(&entry.mask).context("bad interface mask")?;

    let driver = Box::new(PassiveDriver::new(1500));
    let mut netif = Netif::new(entry.name.clone(), NetifType::Ether, driver, config.net.netif_queue_depth);
    netif.set_addr(ip, mask, IpAddr::ANY);
    let in_tx = netif.in_q.sender();
    let out_rx = netif.out_q.receiver();
    netif.open()?;
    let id = stack.add_netif(netif);
    stack
        .netif_set_active(id)
        .context("failed to bring up bench interface")?;

    let (inbox, rx) = exmsg::channel(256);
    thread::spawn(move || exmsg::run(&mut stack, &rx, TICK));

    let writer = match &output {
        Some(path) => Some(open_pcap_writer(path)?),
        None => None,
    };

    let (frames_out, bytes_out) = spawn_out_drain(out_rx, writer);

    let started_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let reader = File::open(input).with_context(|| format!("failed to open {}", input.display()))?;
    let mut pcap = PcapReader::new(BufReader::new(reader))
        .with_context(|| format!("failed to parse pcap header in {}", input.display()))?;

    let start = Instant::now();
    let mut frames_in = 0u64;
    let mut bytes_in = 0u64;
    let mut dropped_in = 0u64;

    while let Some(pkt) = pcap.next_packet() {
        let pkt = pkt.context("malformed pcap record")?;
        let data = pkt.data.into_owned();
        bytes_in += data.len() as u64;
        match in_tx.try_send(data) {
            Ok(()) => {
                frames_in += 1;
                inbox.notify_netif_in(id);
            }
            Err(_) => dropped_in += 1,
        }
    }

    // Give the worker a moment to drain the in-queue and produce any
    // replies before we tally the out side.
    thread::sleep(Duration::from_millis(200));

    let report = BenchReport {
        started_at,
        frames_in,
        bytes_in,
        frames_out: frames_out.load(Ordering::Relaxed),
        bytes_out: bytes_out.load(Ordering::Relaxed),
        dropped_in,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(
        frames_in = report.frames_in,
        frames_out = report.frames_out,
        dropped_in = report.dropped_in,
        "bench replay done"
    );

    Ok(())
}

/// Drains the netif's out-queue on a background thread for the lifetime of
/// the process, optionally mirroring each frame to a pcap writer, and
/// returns live frame/byte counters.
fn spawn_out_drain(
    out_rx: CbReceiver<Vec<u8>>,
    mut writer: Option<PcapWriter<BufWriter<File>>>,
) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
    let frames = Arc::new(AtomicU64::new(0));
    let bytes = Arc::new(AtomicU64::new(0));
    let frames2 = frames.clone();
    let bytes2 = bytes.clone();

    thread::spawn(move || {
        for frame in out_rx.iter() {
            frames2.fetch_add(1, Ordering::Relaxed);
            bytes2.fetch_add(frame.len() as u64, Ordering::Relaxed);
            if let Some(w) = writer.as_mut() {
                let pkt = PcapPacket::new(Duration::from_secs(0), frame.len() as u32, &frame);
                let _ = w.write_packet(&pkt);
            }
        }
    });

    (frames, bytes)
}

fn open_pcap_writer(path: &Path) -> Result<PcapWriter<BufWriter<File>>> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let header = PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    };
    PcapWriter::with_header(BufWriter::new(file), header)
        .map_err(|e| anyhow::anyhow!("failed to write pcap header: {e}"))
}
