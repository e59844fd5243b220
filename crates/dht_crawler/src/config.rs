use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// All tunables from spec.md §6, with the same defaults. No CLI parser is
/// built on top of this — front-ends are out of scope; `main.rs` just
/// calls `Config::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_ip: Ipv4Addr,
    pub bind_port: u16,
    pub public_ip: Option<Ipv4Addr>,
    pub self_node_id: Option<String>,

    pub bootstrap_nodes: Vec<String>,

    pub discovery_interval_seconds: u64,
    pub report_interval_seconds: u64,
    pub refresh_nodes_check_interval_seconds: u64,
    pub get_peers_refresh_interval_seconds: u64,
    pub get_peers_request_expiration_seconds: i64,
    pub transaction_expiration_seconds: i64,

    pub throttler_enabled: bool,
    pub throttler_max_rps: f64,
    pub throttler_leak_probability: f64,
    pub throttler_max_queue_size: usize,

    pub max_routing_table_bucket_size: usize,
    pub max_routing_table_known_nodes: usize,
    pub delete_good_nodes: bool,

    pub fake_id: bool,
    pub fake_id_prefix_length: u32,
    pub fat_routing_table: bool,

    pub use_utp: bool,
    pub resolve_torrent_expiration_seconds: i64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_ip: Ipv4Addr::new(0, 0, 0, 0),
            bind_port: 16667,
            public_ip: None,
            self_node_id: None,

            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
            ],

            discovery_interval_seconds: 5,
            report_interval_seconds: 5,
            refresh_nodes_check_interval_seconds: 5,
            get_peers_refresh_interval_seconds: 2,
            get_peers_request_expiration_seconds: 30,
            transaction_expiration_seconds: 60,

            throttler_enabled: false,
            throttler_max_rps: 1000.0,
            throttler_leak_probability: 0.1,
            throttler_max_queue_size: 1000,

            max_routing_table_bucket_size: 8,
            max_routing_table_known_nodes: 16384,
            delete_good_nodes: true,

            fake_id: false,
            fake_id_prefix_length: 128,
            fat_routing_table: false,

            use_utp: false,
            resolve_torrent_expiration_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.bind_port, 16667);
        assert_eq!(config.max_routing_table_bucket_size, 8);
        assert_eq!(config.max_routing_table_known_nodes, 16384);
        assert!(config.delete_good_nodes);
        assert!(!config.fake_id);
        assert!(!config.throttler_enabled);
        assert_eq!(config.bootstrap_nodes.len(), 3);
    }
}
