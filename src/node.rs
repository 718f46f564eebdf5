//! Node identity, endpoints and the info-hash domain type.
//!
//! A node id is a 160-bit value; closeness between ids is the bitwise XOR
//! of the two, compared as an unsigned big-endian integer. Nodes travel on
//! the wire in the 26-byte compact form (20-byte id, 4-byte IPv4, 2-byte
//! big-endian port); swarm peers in the 6-byte compact form.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::storage::TorrentFile;

pub const NODE_ID_LENGTH: usize = 20;
pub const INFO_HASH_LENGTH: usize = 20;
pub const COMPACT_NODE_LENGTH: usize = 26;
pub const COMPACT_PEER_LENGTH: usize = 6;

/// A 160-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub [u8; NODE_ID_LENGTH]);

impl NodeId {
    /// A fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NODE_ID_LENGTH] = slice.try_into().ok()?;
        Some(NodeId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// XOR distance to `other`. Byte arrays order lexicographically, which
    /// is exactly the unsigned big-endian comparison the metric needs.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_LENGTH] {
        let mut out = [0u8; NODE_ID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Derives the id a crawler presents to `target`: the first ten bytes of
/// the target id spliced onto the last ten of `local`. Mainline nodes rank
/// contacts by shared prefix, so the spliced id keeps the crawler looking
/// like a close neighbor of whoever it talks to.
pub fn neighbor_id(local: &NodeId, target: Option<&NodeId>) -> NodeId {
    let base = target.unwrap_or(local);
    let mut out = [0u8; NODE_ID_LENGTH];
    out[..10].copy_from_slice(&base.0[..10]);
    out[10..].copy_from_slice(&local.0[10..]);
    NodeId(out)
}

/// A remote DHT node. The id is unknown until the node first speaks to us
/// (bootstrap entries start without one).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtNode {
    pub id: Option<NodeId>,
    pub addr: SocketAddr,
}

impl DhtNode {
    pub fn new(addr: SocketAddr) -> Self {
        Self { id: None, addr }
    }

    pub fn with_id(id: NodeId, addr: SocketAddr) -> Self {
        Self { id: Some(id), addr }
    }

    /// 6-byte compact endpoint; `None` for non-IPv4 addresses.
    pub fn compact_endpoint(&self) -> Option<[u8; COMPACT_PEER_LENGTH]> {
        let IpAddr::V4(ip) = self.addr.ip() else {
            return None;
        };
        let mut out = [0u8; COMPACT_PEER_LENGTH];
        out[..4].copy_from_slice(&ip.octets());
        out[4..].copy_from_slice(&self.addr.port().to_be_bytes());
        Some(out)
    }

    /// The compact endpoint widened to an integer; the transaction map keys
    /// its slots off this.
    pub fn endpoint_key(&self) -> Option<u64> {
        let compact = self.compact_endpoint()?;
        let mut widened = [0u8; 8];
        widened[2..].copy_from_slice(&compact);
        Some(u64::from_be_bytes(widened))
    }

    /// 26-byte compact node form; requires a known id and an IPv4 endpoint.
    pub fn compact_node(&self) -> Option<[u8; COMPACT_NODE_LENGTH]> {
        let id = self.id?;
        let endpoint = self.compact_endpoint()?;
        let mut out = [0u8; COMPACT_NODE_LENGTH];
        out[..NODE_ID_LENGTH].copy_from_slice(id.as_bytes());
        out[NODE_ID_LENGTH..].copy_from_slice(&endpoint);
        Some(out)
    }
}

impl PartialEq for DhtNode {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.id == other.id
    }
}

impl Eq for DhtNode {}

impl Hash for DhtNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.id.hash(state);
    }
}

/// Concatenates nodes into their wire form, skipping any that cannot be
/// compact-encoded.
pub fn encode_compact_nodes(nodes: &[DhtNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LENGTH);
    for node in nodes {
        if let Some(compact) = node.compact_node() {
            out.extend_from_slice(&compact);
        }
    }
    out
}

/// Splits a `nodes` blob into 26-byte entries; a trailing partial entry is
/// discarded.
pub fn parse_compact_nodes(raw: &[u8]) -> Vec<DhtNode> {
    raw.chunks_exact(COMPACT_NODE_LENGTH)
        .filter_map(|chunk| {
            let id = NodeId::from_slice(&chunk[..NODE_ID_LENGTH])?;
            let addr = parse_compact_peer(&chunk[NODE_ID_LENGTH..])?;
            Some(DhtNode::with_id(id, addr))
        })
        .collect()
}

/// Decodes a 6-byte compact peer endpoint.
pub fn parse_compact_peer(raw: &[u8]) -> Option<SocketAddr> {
    if raw.len() != COMPACT_PEER_LENGTH {
        return None;
    }
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// A torrent observed on the wire: the 20-byte identifier plus whatever the
/// crawl has learned about it so far.
#[derive(Clone, Debug)]
pub struct InfoHash {
    bytes: [u8; INFO_HASH_LENGTH],
    /// Swarm peers attached by announce traffic or `get_peers` responses.
    pub peers: Option<HashSet<SocketAddr>>,
    pub name: Option<String>,
    pub files: Option<Vec<TorrentFile>>,
    pub total_size: Option<u64>,
    /// Set once a collaborator has fetched this torrent's metadata; the
    /// engine stops fanning out for resolved hashes.
    pub resolved: bool,
}

impl InfoHash {
    pub fn new(bytes: [u8; INFO_HASH_LENGTH]) -> Self {
        Self {
            bytes,
            peers: None,
            name: None,
            files: None,
            total_size: None,
            resolved: false,
        }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; INFO_HASH_LENGTH] = slice.try_into().ok()?;
        Some(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; INFO_HASH_LENGTH] {
        &self.bytes
    }

    /// Lowercase hex rendering, the identity used by the persistence layer.
    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// The opaque token handed out in `get_peers` responses: the first two
    /// characters of the hex form.
    pub fn token(&self) -> String {
        let mut text = self.hex();
        text.truncate(2);
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first(byte: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LENGTH];
        bytes[0] = byte;
        NodeId(bytes)
    }

    #[test]
    fn distance_orders_as_big_endian() {
        let origin = id_with_first(0x00);
        let near = id_with_first(0x01);
        let far = id_with_first(0x80);
        assert!(origin.distance(&near) < origin.distance(&far));
        assert_eq!(origin.distance(&origin), [0u8; NODE_ID_LENGTH]);
    }

    #[test]
    fn neighbor_id_splices_prefix_and_suffix() {
        let local = NodeId([0xAA; NODE_ID_LENGTH]);
        let target = NodeId([0x55; NODE_ID_LENGTH]);
        let spliced = neighbor_id(&local, Some(&target));
        assert_eq!(&spliced.0[..10], &[0x55; 10]);
        assert_eq!(&spliced.0[10..], &[0xAA; 10]);
        assert_eq!(neighbor_id(&local, None), local);
    }

    #[test]
    fn compact_node_round_trips() {
        let id = NodeId::random();
        let addr: SocketAddr = "10.1.2.3:6881".parse().unwrap();
        let node = DhtNode::with_id(id, addr);
        let compact = node.compact_node().unwrap();
        let parsed = parse_compact_nodes(&compact);
        assert_eq!(parsed, vec![node]);
    }

    #[test]
    fn parse_compact_nodes_discards_partial_tail() {
        let id = NodeId::random();
        let addr: SocketAddr = "192.168.0.1:1234".parse().unwrap();
        let mut raw = DhtNode::with_id(id, addr).compact_node().unwrap().to_vec();
        raw.extend_from_slice(&[1, 2, 3]);
        assert_eq!(parse_compact_nodes(&raw).len(), 1);
    }

    #[test]
    fn compact_peer_decodes_address_and_port() {
        let raw = [1, 2, 3, 4, 0x1A, 0xE1];
        let addr = parse_compact_peer(&raw).unwrap();
        assert_eq!(addr, "1.2.3.4:6881".parse().unwrap());
        assert!(parse_compact_peer(&raw[..4]).is_none());
    }

    #[test]
    fn endpoint_key_packs_ip_and_port() {
        let node = DhtNode::new("1.0.0.2:258".parse().unwrap());
        assert_eq!(node.endpoint_key(), Some(0x0100_0002_0102));
        let v6 = DhtNode::new("[::1]:6881".parse().unwrap());
        assert_eq!(v6.endpoint_key(), None);
    }

    #[test]
    fn info_hash_token_is_hex_prefix() {
        let mut bytes = [0u8; INFO_HASH_LENGTH];
        bytes[0] = 0xAB;
        let hash = InfoHash::new(bytes);
        assert_eq!(hash.token(), "ab");
        assert_eq!(hash.hex().len(), 40);
    }
}
