//! `netstack.toml` configuration.

use anyhow::{Context, Result};
use netstack_core::NetConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level probe configuration: the interfaces to bring up plus the
/// stack's tunable caps.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub netifs: Vec<NetifEntry>,
    #[serde(default)]
    pub net: NetConfig,
}

/// One configured interface: a dotted-quad address/mask and an optional
/// default gateway. `name` is cosmetic for `run`/`bench` (both of which
/// drive the interface with an in-process driver, not a real NIC).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetifEntry {
    pub name: String,
    pub ip: String,
    pub mask: String,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl ProbeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Returns a default config for a single `10.0.0.2/24` interface.
    pub fn default_example() -> Self {
        Self {
            net: NetConfig::default(),
            netifs: vec![NetifEntry {
                name: "eth0".into(),
                ip: "10.0.0.2".into(),
                mask: "255.255.255.0".into(),
                gateway: None,
            }],
        }
    }
}
