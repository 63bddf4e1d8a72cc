//! Compile-time-cap configuration, made runtime-tunable via `serde`/`toml`.
//!
//! Every field here corresponds to a cap the original course stack fixed at
//! compile time (block size/count, cache sizes, ring sizes, ...). Mirrors
//! the `#[serde(default = ...)]` shape of the probe's own `ProbeConfig`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetConfig {
    #[serde(default = "NetConfig::default_block_size")]
    pub pktbuf_block_size: usize,
    #[serde(default = "NetConfig::default_block_count")]
    pub pktbuf_block_count: usize,
    #[serde(default = "NetConfig::default_header_count")]
    pub pktbuf_header_count: usize,

    #[serde(default = "NetConfig::default_netif_count")]
    pub netif_count: usize,
    #[serde(default = "NetConfig::default_netif_queue_depth")]
    pub netif_queue_depth: usize,

    #[serde(default = "NetConfig::default_arp_cache_size")]
    pub arp_cache_size: usize,
    #[serde(default = "NetConfig::default_arp_max_pkt_wait")]
    pub arp_max_pkt_wait: usize,
    #[serde(default = "NetConfig::default_arp_pending_tmo")]
    pub arp_entry_pending_tmo_s: u32,
    #[serde(default = "NetConfig::default_arp_stable_tmo")]
    pub arp_entry_stable_tmo_s: u32,
    #[serde(default = "NetConfig::default_arp_retry_cnt")]
    pub arp_entry_retry_cnt: u32,

    #[serde(default = "NetConfig::default_ip_frags_max_nr")]
    pub ip_frags_max_nr: usize,
    #[serde(default = "NetConfig::default_ip_frag_max_buf_nr")]
    pub ip_frag_max_buf_nr: usize,
    #[serde(default = "NetConfig::default_ip_frag_tmo")]
    pub ip_frag_tmo_s: u32,
    #[serde(default = "NetConfig::default_ip_frag_scan_period")]
    pub ip_frag_scan_period_s: u32,

    #[serde(default = "NetConfig::default_raw_sock_cnt")]
    pub raw_sock_count: usize,
    #[serde(default = "NetConfig::default_raw_max_recv")]
    pub raw_max_recv: usize,
    #[serde(default = "NetConfig::default_udp_sock_cnt")]
    pub udp_sock_count: usize,
    #[serde(default = "NetConfig::default_udp_max_recv")]
    pub udp_max_recv: usize,
    #[serde(default = "NetConfig::default_tcp_sock_cnt")]
    pub tcp_sock_count: usize,
    #[serde(default = "NetConfig::default_tcp_ring_size")]
    pub tcp_ring_size: usize,

    #[serde(default = "NetConfig::default_log_level")]
    pub log_level: String,
}

impl NetConfig {
    fn default_block_size() -> usize { 128 }
    fn default_block_count() -> usize { 512 }
    fn default_header_count() -> usize { 128 }
    fn default_netif_count() -> usize { 4 }
    fn default_netif_queue_depth() -> usize { 64 }
    fn default_arp_cache_size() -> usize { 32 }
    fn default_arp_max_pkt_wait() -> usize { 4 }
    fn default_arp_pending_tmo() -> u32 { 1 }
    fn default_arp_stable_tmo() -> u32 { 60 }
    fn default_arp_retry_cnt() -> u32 { 3 }
    fn default_ip_frags_max_nr() -> usize { 16 }
    fn default_ip_frag_max_buf_nr() -> usize { 8 }
    fn default_ip_frag_tmo() -> u32 { 10 }
    fn default_ip_frag_scan_period() -> u32 { 1 }
    fn default_raw_sock_cnt() -> usize { 8 }
    fn default_raw_max_recv() -> usize { 16 }
    fn default_udp_sock_cnt() -> usize { 32 }
    fn default_udp_max_recv() -> usize { 16 }
    fn default_tcp_sock_cnt() -> usize { 32 }
    fn default_tcp_ring_size() -> usize { 4096 }
    fn default_log_level() -> String { "info".into() }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            pktbuf_block_size: Self::default_block_size(),
            pktbuf_block_count: Self::default_block_count(),
            pktbuf_header_count: Self::default_header_count(),
            netif_count: Self::default_netif_count(),
            netif_queue_depth: Self::default_netif_queue_depth(),
            arp_cache_size: Self::default_arp_cache_size(),
            arp_max_pkt_wait: Self::default_arp_max_pkt_wait(),
            arp_entry_pending_tmo_s: Self::default_arp_pending_tmo(),
            arp_entry_stable_tmo_s: Self::default_arp_stable_tmo(),
            arp_entry_retry_cnt: Self::default_arp_retry_cnt(),
            ip_frags_max_nr: Self::default_ip_frags_max_nr(),
            ip_frag_max_buf_nr: Self::default_ip_frag_max_buf_nr(),
            ip_frag_tmo_s: Self::default_ip_frag_tmo(),
            ip_frag_scan_period_s: Self::default_ip_frag_scan_period(),
            raw_sock_count: Self::default_raw_sock_cnt(),
            raw_max_recv: Self::default_raw_max_recv(),
            udp_sock_count: Self::default_udp_sock_cnt(),
            udp_max_recv: Self::default_udp_max_recv(),
            tcp_sock_count: Self::default_tcp_sock_cnt(),
            tcp_ring_size: Self::default_tcp_ring_size(),
            log_level: Self::default_log_level(),
        }
    }
}
