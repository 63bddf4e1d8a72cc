//! `netstack-probe discover` — show configured interfaces and host link state.

use anyhow::Result;
use std::process::Command;

use crate::config::ProbeConfig;

pub fn run(config: &ProbeConfig) -> Result<()> {
    println!("=== Host network interfaces ===");
    show_host_interfaces();

    println!();
    println!("=== Configured interfaces (netstack.toml) ===");
    if config.netifs.is_empty() {
        println!("  (no interfaces configured — run `netstack-probe init` to create netstack.toml)");
    } else {
        println!("  {:<12} {:<16} {:<16} {:<16}", "NAME", "IP", "MASK", "GATEWAY");
        println!("  {}", "-".repeat(62));
        for n in &config.netifs {
            println!(
                "  {:<12} {:<16} {:<16} {:<16}",
                n.name,
                n.ip,
                n.mask,
                n.gateway.as_deref().unwrap_or("-"),
            );
        }
    }

    println!();
    println!("Tip: `netstack-probe run` brings these interfaces up against a loopback");
    println!("pump and serves a demo TCP echo listener; `netstack-probe bench` replays a");
    println!("pcap capture through the stack instead of live traffic.");

    Ok(())
}

/// Prints the host's real interfaces for comparison — this crate never
/// binds to them, but seeing what's actually up helps pick sane
/// `netstack.toml` addressing.
fn show_host_interfaces() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(output) = Command::new("ip").args(["-br", "addr", "show"]).output() {
            let text = String::from_utf8_lossy(&output.stdout);
            if text.trim().is_empty() {
                println!("  (no interfaces reported by `ip -br addr show`)");
            } else {
                for line in text.lines() {
                    println!("  {}", line);
                }
            }
        } else {
            println!("  (ip command not available)");
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        println!("  (host interface listing requires Linux — ip -br addr show)");
    }
}
