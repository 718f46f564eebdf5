//! Bounded routing table with XOR-metric nearest-neighbor lookup.
//!
//! The crawler does not maintain full Kademlia buckets; it keeps one flat,
//! capacity-bounded set of recently seen nodes keyed by endpoint. Lookups
//! sort by XOR distance to the target, so responses still hand out the
//! closest contacts the table knows.
//!
//! A single coarse mutex guards the table. Critical sections are short and
//! contention is negligible next to network round-trips. `snapshot` clones
//! the current membership, so iterating callers never hold the lock and
//! concurrent mutation cannot corrupt what they see.
//!
//! When the table is full, an upsert for a brand-new node evicts the entry
//! that has been silent longest; plain inserts stay silent no-ops. Either
//! way `len() <= capacity` holds after every operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

use crate::node::{DhtNode, NodeId};

/// How many nodes a nearest-neighbor lookup returns.
pub const NEAREST_NODE_COUNT: usize = 8;

struct TableEntry {
    node: DhtNode,
    last_seen: Instant,
    /// Monotonic insertion counter; breaks distance ties stably.
    order: u64,
}

struct TableInner {
    entries: HashMap<SocketAddr, TableEntry>,
    next_order: u64,
}

pub struct RouteTable {
    capacity: usize,
    inner: Mutex<TableInner>,
}

impl RouteTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_order: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upserts a node that just talked to us: refreshes the last-seen clock
    /// (and the id, which may have been unknown) when the endpoint is
    /// already tracked, otherwise inserts, evicting the least recently seen
    /// entry if the table is full.
    pub fn add_or_update_node(&self, node: DhtNode) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&node.addr) {
            entry.last_seen = Instant::now();
            if node.id.is_some() {
                entry.node.id = node.id;
            }
            return;
        }
        if inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .values()
                .min_by_key(|entry| entry.last_seen)
                .map(|entry| entry.node.addr);
            if let Some(addr) = oldest {
                inner.entries.remove(&addr);
            }
        }
        insert_entry(&mut inner, node);
    }

    /// Inserts a passively discovered node; silently ignored when the
    /// endpoint is already tracked or the table is full.
    pub fn add_node(&self, node: DhtNode) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= self.capacity || inner.entries.contains_key(&node.addr) {
            return false;
        }
        insert_entry(&mut inner, node);
        true
    }

    /// Up to [`NEAREST_NODE_COUNT`] nodes sorted ascending by XOR distance
    /// to `target`, ties broken by insertion order. Nodes whose id is still
    /// unknown cannot be ranked and are skipped.
    pub fn find_nodes(&self, target: &NodeId) -> Vec<DhtNode> {
        let inner = self.inner.lock().unwrap();
        let mut ranked: Vec<_> = inner
            .entries
            .values()
            .filter_map(|entry| {
                let id = entry.node.id?;
                Some((id.distance(target), entry.order, entry.node.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(NEAREST_NODE_COUNT)
            .map(|(_, _, node)| node)
            .collect()
    }

    /// Point-in-time copy of the table membership.
    pub fn snapshot(&self) -> Vec<DhtNode> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .map(|entry| entry.node.clone())
            .collect()
    }
}

fn insert_entry(inner: &mut TableInner, node: DhtNode) {
    let order = inner.next_order;
    inner.next_order += 1;
    inner.entries.insert(
        node.addr,
        TableEntry {
            node,
            last_seen: Instant::now(),
            order,
        },
    );
}
