//! A crawler for the BitTorrent Mainline DHT.
//!
//! The crate binds one UDP socket, joins the DHT as an ordinary-looking
//! node and harvests the info-hashes and swarm peers that flow past it.
//! [`DhtClient`] runs the protocol engine; implement [`DhtEventHandler`]
//! to receive observations, and [`InfoHashStore`] to persist them.

mod bencode;
mod client;
mod config;
mod krpc;
mod node;
mod ratelimit;
mod routing;
mod storage;
mod transaction;

pub use bencode::{decode, encode, BencodeError, Value};
pub use client::{DhtClient, DhtEventHandler};
pub use config::DhtConfig;
pub use krpc::{
    Args, CommandType, DhtMessage, MessageKind, ProtocolError, QueryPayload, ResponseBody,
    ERROR_PROTOCOL, ERROR_SERVER,
};
pub use node::{
    encode_compact_nodes, neighbor_id, parse_compact_nodes, parse_compact_peer, DhtNode, InfoHash,
    NodeId, COMPACT_NODE_LENGTH, COMPACT_PEER_LENGTH, INFO_HASH_LENGTH, NODE_ID_LENGTH,
};
pub use ratelimit::TokenBucketLimiter;
pub use routing::{RouteTable, NEAREST_NODE_COUNT};
pub use storage::{InfoHashRecord, InfoHashStore, MemoryInfoHashStore, TorrentFile};
pub use transaction::{
    FileMessageMap, MemoryMessageMap, MessageMap, TransactionContext, TRANSACTION_ID_LENGTH,
};
