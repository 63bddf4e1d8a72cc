//! CLI definitions for netstack-probe.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "netstack-probe",
    version,
    about = "Userspace TCP/IPv4 stack over a packet-capture device — bring-up, echo demo, and pcap-replay benchmark",
    long_about = None
)]
pub struct Cli {
    /// Path to netstack.toml config file
    #[clap(long, short, default_value = "netstack.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print an example netstack.toml to stdout
    Init,

    /// List configured interfaces and host link state
    Discover,

    /// Bring the configured interfaces up and serve a demo TCP echo listener
    Run {
        /// TCP port the echo listener binds to
        #[clap(long, default_value = "7000")]
        port: u16,
    },

    /// Replay a pcap capture through the stack and report throughput/drops
    Bench {
        /// Input pcap file replayed as inbound frames on the first configured interface
        #[clap(long)]
        input: PathBuf,

        /// Write the stack's outbound frames to this pcap file
        #[clap(long)]
        output: Option<PathBuf>,
    },
}
