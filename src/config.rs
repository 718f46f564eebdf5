//! Crawler configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tunables for a [`DhtClient`](crate::DhtClient). Every field has a
/// working default; embedders can deserialize this from whatever
/// configuration source they use.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// UDP port to bind; 0 picks an ephemeral port.
    pub port: u16,

    /// Capacity of the discovery queue feeding the find_node loop.
    pub node_queue_size: usize,
    /// Capacity of the ingest queue between receive and processing.
    pub receive_queue_size: usize,
    /// Capacity of the outbound query queue.
    pub send_queue_size: usize,
    /// Capacity of the priority queue for responses and error replies.
    pub response_queue_size: usize,

    /// Outbound budget in KiB per second.
    pub send_rate_kib: u64,
    /// Inbound budget in KiB per second.
    pub receive_rate_kib: u64,

    /// Worker tasks draining the ingest queue.
    pub process_workers: usize,
    /// Routing table capacity.
    pub route_table_size: usize,

    /// Seed endpoints queried every discovery round, as `host:port`
    /// strings; hostnames are resolved per round, raw addresses parse
    /// directly.
    pub bootstrap_nodes: Vec<String>,

    /// When set, transaction registrations are persisted here and survive
    /// restarts; otherwise the in-memory map is used.
    pub durable_map_dir: Option<PathBuf>,

    /// After this many processed datagrams a worker pauses for
    /// `process_wait_millis`; 0 disables the throttle.
    pub process_wait_size: usize,
    pub process_wait_millis: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            port: 6881,
            node_queue_size: 1024 * 20,
            receive_queue_size: 1024 * 20,
            send_queue_size: 1024 * 20,
            response_queue_size: 1024 * 20,
            send_rate_kib: 100,
            receive_rate_kib: 100,
            process_workers: 1,
            route_table_size: 2048,
            bootstrap_nodes: vec![
                "router.bittorrent.com:6881".into(),
                "dht.transmissionbt.com:6881".into(),
                "router.utorrent.com:6881".into(),
                "82.221.103.244:6881".into(),
                "23.21.224.150:6881".into(),
            ],
            durable_map_dir: None,
            process_wait_size: 0,
            process_wait_millis: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DhtConfig::default();
        assert!(config.receive_queue_size > 0);
        assert!(config.send_rate_kib > 0);
        assert!(config.process_workers >= 1);
        assert!(!config.bootstrap_nodes.is_empty());
        assert!(config.durable_map_dir.is_none());
    }

    #[test]
    fn default_bootstrap_endpoints_parse_as_host_port() {
        for entry in DhtConfig::default().bootstrap_nodes {
            let (host, port) = entry.rsplit_once(':').expect("host:port form");
            assert!(!host.is_empty());
            assert!(port.parse::<u16>().is_ok());
        }
    }
}
