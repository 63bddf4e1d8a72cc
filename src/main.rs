//! netstack-probe — userspace TCP/IPv4 stack bring-up, echo demo, and
//! pcap-replay benchmark.
//!
//! Run `netstack-probe --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bench;
mod cli;
mod config;
mod discover;
mod netdev;
mod run;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    netstack_core::tools::assert_host_endian_consistent();

    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Init => None,
        _ => {
            if !cli.config.exists() {
                let example = config::ProbeConfig::default_example();
                std::fs::write(&cli.config, toml::to_string_pretty(&example)?)?;
                eprintln!(
                    "Created '{}' with a default interface — edit it to match your setup.",
                    cli.config.display()
                );
            }
            Some(config::ProbeConfig::load(&cli.config)?)
        }
    };

    match cli.command {
        Commands::Init => {
            let example = config::ProbeConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Discover => {
            discover::run(config.as_ref().unwrap())?;
        }
        Commands::Run { port } => {
            run::run(config.as_ref().unwrap(), port)?;
        }
        Commands::Bench { input, output } => {
            bench::run(config.as_ref().unwrap(), &input, output)?;
        }
    }

    Ok(())
}
