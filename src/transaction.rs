//! Transaction correlation between outbound queries and inbound responses.
//!
//! Every query gets a 2-byte transaction id that must be unique for its
//! destination at the moment of sending. The slot key packs the compact
//! endpoint and the id into one 64-bit value; registration tries up to
//! three candidate slots before giving up, and a failed registration
//! suppresses the send entirely.
//!
//! Consumption is strictly once: `require_registered_info` removes the
//! stored context, so a second response with the same id, like any
//! unsolicited, stale or spoofed response, finds nothing and is dropped
//! by the caller.
//!
//! Two backends share the contract: a process-lifetime in-memory map, and
//! a file-per-slot durable map whose records survive a restart until the
//! matching response consumes them.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use tracing::warn;

use crate::krpc::{CommandType, DhtMessage};
use crate::node::{DhtNode, INFO_HASH_LENGTH};

pub const TRANSACTION_ID_LENGTH: usize = 2;

/// Candidate slots tried per registration before the query is dropped.
const ALLOC_ATTEMPTS: usize = 3;

/// Stripe-lock pool size for the durable backend.
const LOCK_STRIPES: usize = 10;

/// What was asked of the destination, kept so the response can be
/// interpreted without trusting anything it claims about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionContext {
    pub command: CommandType,
    /// The queried info-hash, present for `get_peers`.
    pub info_hash: Option<[u8; INFO_HASH_LENGTH]>,
}

/// Correlation map contract shared by the in-memory and durable backends.
pub trait MessageMap: Send + Sync {
    /// Allocates a transaction id for `message` (a query) bound for `node`,
    /// writes it into the message and stores the context. Returns `false`
    /// when no slot could be claimed; the caller must drop the send.
    fn register_message(&self, message: &mut DhtMessage, node: &DhtNode) -> bool;

    /// Looks up and removes the context registered for `transaction_id`
    /// and `node`. `None` is the required outcome for anything that was
    /// never registered here.
    fn require_registered_info(
        &self,
        transaction_id: &[u8],
        node: &DhtNode,
    ) -> Option<TransactionContext>;
}

fn context_of(message: &DhtMessage) -> Option<TransactionContext> {
    let command = message.command?;
    let info_hash = message
        .arg_bytes("info_hash")
        .and_then(|raw| raw.try_into().ok());
    Some(TransactionContext { command, info_hash })
}

fn slot_key(endpoint: u64, tid: [u8; TRANSACTION_ID_LENGTH]) -> u64 {
    endpoint << 16 | u64::from(tid[0]) << 8 | u64::from(tid[1])
}

/// Rotating source of candidate transaction ids. Id zero is reserved for
/// error replies and is skipped.
struct TidCursor(AtomicU16);

impl TidCursor {
    fn new() -> Self {
        TidCursor(AtomicU16::new(1))
    }

    fn next(&self) -> [u8; TRANSACTION_ID_LENGTH] {
        loop {
            let raw = self.0.fetch_add(1, Ordering::Relaxed);
            if raw != 0 {
                return raw.to_be_bytes();
            }
        }
    }
}

/// Process-lifetime correlation map; registrations are lost on restart.
pub struct MemoryMessageMap {
    slots: Mutex<HashMap<u64, TransactionContext>>,
    cursor: TidCursor,
}

impl MemoryMessageMap {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            cursor: TidCursor::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryMessageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageMap for MemoryMessageMap {
    fn register_message(&self, message: &mut DhtMessage, node: &DhtNode) -> bool {
        let Some(endpoint) = node.endpoint_key() else {
            return false;
        };
        let Some(context) = context_of(message) else {
            return false;
        };
        let mut slots = self.slots.lock().unwrap();
        for _ in 0..ALLOC_ATTEMPTS {
            let tid = self.cursor.next();
            let key = slot_key(endpoint, tid);
            if slots.contains_key(&key) {
                continue;
            }
            slots.insert(key, context.clone());
            message.transaction_id = tid.to_vec();
            return true;
        }
        false
    }

    fn require_registered_info(
        &self,
        transaction_id: &[u8],
        node: &DhtNode,
    ) -> Option<TransactionContext> {
        let tid: [u8; TRANSACTION_ID_LENGTH] = transaction_id.try_into().ok()?;
        let endpoint = node.endpoint_key()?;
        let key = slot_key(endpoint, tid);
        self.slots.lock().unwrap().remove(&key)
    }
}

/// Durable correlation map: one small file per slot, named by the slot
/// key, deleted when the matching response consumes it. Files left behind
/// by a crash stay consumable by the next process.
///
/// A fixed pool of stripe locks indexed by `slot % pool` serializes
/// same-slot filesystem races while keeping contention independent of how
/// many transactions are outstanding.
pub struct FileMessageMap {
    dir: PathBuf,
    stripes: Vec<Mutex<()>>,
    cursor: TidCursor,
}

impl FileMessageMap {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let stripes = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Ok(Self {
            dir,
            stripes,
            cursor: TidCursor::new(),
        })
    }

    fn slot_path(&self, key: u64) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    fn stripe(&self, key: u64) -> &Mutex<()> {
        &self.stripes[(key % LOCK_STRIPES as u64) as usize]
    }
}

fn encode_record(context: &TransactionContext) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + INFO_HASH_LENGTH);
    out.push(context.command.to_tag());
    if let Some(hash) = context.info_hash {
        out.extend_from_slice(&hash);
    }
    out
}

fn decode_record(raw: &[u8]) -> Option<TransactionContext> {
    let (&tag, rest) = raw.split_first()?;
    let command = CommandType::from_tag(tag)?;
    let info_hash = match rest.len() {
        0 => None,
        INFO_HASH_LENGTH => Some(rest.try_into().ok()?),
        _ => return None,
    };
    Some(TransactionContext { command, info_hash })
}

impl MessageMap for FileMessageMap {
    fn register_message(&self, message: &mut DhtMessage, node: &DhtNode) -> bool {
        let Some(endpoint) = node.endpoint_key() else {
            return false;
        };
        let Some(context) = context_of(message) else {
            return false;
        };
        let record = encode_record(&context);
        for _ in 0..ALLOC_ATTEMPTS {
            let tid = self.cursor.next();
            let key = slot_key(endpoint, tid);
            let path = self.slot_path(key);
            let _guard = self.stripe(key).lock().unwrap();
            if path.exists() {
                continue;
            }
            match fs::write(&path, &record) {
                Ok(()) => {
                    message.transaction_id = tid.to_vec();
                    return true;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "transaction record write failed");
                    return false;
                }
            }
        }
        false
    }

    fn require_registered_info(
        &self,
        transaction_id: &[u8],
        node: &DhtNode,
    ) -> Option<TransactionContext> {
        let tid: [u8; TRANSACTION_ID_LENGTH] = transaction_id.try_into().ok()?;
        let endpoint = node.endpoint_key()?;
        let key = slot_key(endpoint, tid);
        let path = self.slot_path(key);
        let _guard = self.stripe(key).lock().unwrap();
        let raw = fs::read(&path).ok()?;
        if let Err(err) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %err, "transaction record delete failed");
        }
        decode_record(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use crate::krpc::Args;
    use crate::node::NodeId;

    fn get_peers_query(hash: [u8; INFO_HASH_LENGTH]) -> DhtMessage {
        let mut args = Args::new();
        args.insert("id".into(), Value::bytes(vec![0; 20]));
        args.insert("info_hash".into(), Value::bytes(hash.to_vec()));
        DhtMessage::query(CommandType::GetPeers, args)
    }

    fn remote(port: u16) -> DhtNode {
        DhtNode::with_id(
            NodeId([3; 20]),
            format!("127.0.0.1:{port}").parse().unwrap(),
        )
    }

    fn temp_map_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "dht-crawler-map-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ))
    }

    #[test]
    fn memory_map_consumes_exactly_once() {
        let map = MemoryMessageMap::new();
        let node = remote(6881);
        let hash = [0xCD; INFO_HASH_LENGTH];
        let mut message = get_peers_query(hash);

        assert!(map.register_message(&mut message, &node));
        assert_eq!(message.transaction_id.len(), TRANSACTION_ID_LENGTH);

        let context = map
            .require_registered_info(&message.transaction_id, &node)
            .expect("first lookup must succeed");
        assert_eq!(context.command, CommandType::GetPeers);
        assert_eq!(context.info_hash, Some(hash));

        assert!(map
            .require_registered_info(&message.transaction_id, &node)
            .is_none());
    }

    #[test]
    fn memory_map_rejects_foreign_or_misshapen_ids() {
        let map = MemoryMessageMap::new();
        let node = remote(6881);
        let mut message = get_peers_query([1; INFO_HASH_LENGTH]);
        assert!(map.register_message(&mut message, &node));

        // Same id, different source endpoint: not ours.
        assert!(map
            .require_registered_info(&message.transaction_id, &remote(6882))
            .is_none());
        // Ids that are not exactly two bytes can never correlate.
        assert!(map.require_registered_info(&[1, 2, 3], &node).is_none());
        assert!(map.require_registered_info(&[], &node).is_none());
        // The real owner is still intact afterwards.
        assert!(map
            .require_registered_info(&message.transaction_id, &node)
            .is_some());
    }

    #[test]
    fn memory_map_allocates_distinct_ids_per_destination() {
        let map = MemoryMessageMap::new();
        let node = remote(6881);
        let mut first = get_peers_query([1; INFO_HASH_LENGTH]);
        let mut second = get_peers_query([2; INFO_HASH_LENGTH]);
        assert!(map.register_message(&mut first, &node));
        assert!(map.register_message(&mut second, &node));
        assert_ne!(first.transaction_id, second.transaction_id);
    }

    #[test]
    fn memory_map_fails_when_destination_slots_exhaust() {
        let map = MemoryMessageMap::new();
        let node = remote(6881);
        // Claim every non-reserved id for this destination.
        for _ in 0..u16::MAX {
            let mut message = get_peers_query([7; INFO_HASH_LENGTH]);
            if !map.register_message(&mut message, &node) {
                break;
            }
        }
        let mut message = get_peers_query([7; INFO_HASH_LENGTH]);
        assert!(!map.register_message(&mut message, &node));
        assert!(message.transaction_id.is_empty());
    }

    #[test]
    fn memory_map_refuses_non_ipv4_destinations() {
        let map = MemoryMessageMap::new();
        let node = DhtNode::new("[::1]:6881".parse().unwrap());
        let mut message = get_peers_query([7; INFO_HASH_LENGTH]);
        assert!(!map.register_message(&mut message, &node));
    }

    #[test]
    fn file_map_consumes_exactly_once_and_deletes() {
        let dir = temp_map_dir("consume");
        let map = FileMessageMap::new(&dir).unwrap();
        let node = remote(6881);
        let hash = [0xEE; INFO_HASH_LENGTH];
        let mut message = get_peers_query(hash);

        assert!(map.register_message(&mut message, &node));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);

        let context = map
            .require_registered_info(&message.transaction_id, &node)
            .expect("stored context must come back");
        assert_eq!(context.info_hash, Some(hash));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        assert!(map
            .require_registered_info(&message.transaction_id, &node)
            .is_none());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_map_survives_a_restart() {
        let dir = temp_map_dir("restart");
        let node = remote(6881);
        let hash = [0xAB; INFO_HASH_LENGTH];
        let mut message = get_peers_query(hash);
        {
            let map = FileMessageMap::new(&dir).unwrap();
            assert!(map.register_message(&mut message, &node));
        }

        let revived = FileMessageMap::new(&dir).unwrap();
        let context = revived
            .require_registered_info(&message.transaction_id, &node)
            .expect("record must survive the first map being dropped");
        assert_eq!(context.command, CommandType::GetPeers);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn file_map_steps_past_occupied_slots() {
        let dir = temp_map_dir("collide");
        let map = FileMessageMap::new(&dir).unwrap();
        let node = remote(6881);

        // Two registrations from the same cursor must land in different
        // slots even though the first file still exists.
        let mut first = get_peers_query([1; INFO_HASH_LENGTH]);
        let mut second = get_peers_query([2; INFO_HASH_LENGTH]);
        assert!(map.register_message(&mut first, &node));
        assert!(map.register_message(&mut second, &node));
        assert_ne!(first.transaction_id, second.transaction_id);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn record_codec_round_trips() {
        for context in [
            TransactionContext {
                command: CommandType::FindNode,
                info_hash: None,
            },
            TransactionContext {
                command: CommandType::GetPeers,
                info_hash: Some([9; INFO_HASH_LENGTH]),
            },
        ] {
            assert_eq!(decode_record(&encode_record(&context)), Some(context));
        }
        assert_eq!(decode_record(&[]), None);
        assert_eq!(decode_record(&[99]), None);
        assert_eq!(decode_record(&[1, 2, 3]), None);
    }
}
