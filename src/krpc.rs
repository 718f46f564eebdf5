//! KRPC message envelope.
//!
//! A datagram is a bencoded dictionary carrying a transaction id (`t`), a
//! kind marker (`y` = `q`/`r`/`e`) and one of a query name plus arguments
//! (`q`/`a`), a response argument dictionary (`r`), or an error payload
//! (`e` = `[code, text]`). Responses carry no command on the wire; the
//! engine recovers it from the transaction map.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use anyhow::anyhow;
use thiserror::Error;

use crate::bencode::{self, BencodeError, Dict, Value};
use crate::node::{parse_compact_nodes, parse_compact_peer, DhtNode, NodeId, INFO_HASH_LENGTH};

/// Generic server failure; the message text is appended to the reply.
pub const ERROR_SERVER: i64 = 202;
/// Unparseable or malformed request.
pub const ERROR_PROTOCOL: i64 = 203;

/// Anything that makes an inbound datagram unusable as a KRPC message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Query,
    Response,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl CommandType {
    pub fn wire_name(&self) -> &'static str {
        match self {
            CommandType::Ping => "ping",
            CommandType::FindNode => "find_node",
            CommandType::GetPeers => "get_peers",
            CommandType::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_wire(name: &[u8]) -> Option<Self> {
        match name {
            b"ping" => Some(CommandType::Ping),
            b"find_node" => Some(CommandType::FindNode),
            b"get_peers" => Some(CommandType::GetPeers),
            b"announce_peer" => Some(CommandType::AnnouncePeer),
            _ => None,
        }
    }

    /// Single-byte tag used by the durable transaction records.
    pub fn to_tag(self) -> u8 {
        match self {
            CommandType::Ping => 1,
            CommandType::FindNode => 2,
            CommandType::GetPeers => 3,
            CommandType::AnnouncePeer => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(CommandType::Ping),
            2 => Some(CommandType::FindNode),
            3 => Some(CommandType::GetPeers),
            4 => Some(CommandType::AnnouncePeer),
            _ => None,
        }
    }
}

/// Argument map of a query or response body. Keys are the BEP-5 names
/// (`id`, `target`, `info_hash`, `nodes`, `values`, `token`,
/// `implied_port`, `port`); `BTreeMap` keeps them in wire order.
pub type Args = BTreeMap<String, Value>;

/// One KRPC message, decoded or about to be encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct DhtMessage {
    pub transaction_id: Vec<u8>,
    pub kind: MessageKind,
    /// Present on queries; responses get theirs from the transaction map.
    pub command: Option<CommandType>,
    pub args: Args,
    pub error: Option<(i64, String)>,
}

impl DhtMessage {
    /// A query with an unallocated transaction id; the send pipeline fills
    /// it in at registration time.
    pub fn query(command: CommandType, args: Args) -> Self {
        Self {
            transaction_id: Vec::new(),
            kind: MessageKind::Query,
            command: Some(command),
            args,
            error: None,
        }
    }

    pub fn response(transaction_id: Vec<u8>, args: Args) -> Self {
        Self {
            transaction_id,
            kind: MessageKind::Response,
            command: None,
            args,
            error: None,
        }
    }

    /// An error reply. The zeroed transaction id marks replies to datagrams
    /// whose own id never decoded.
    pub fn error(code: i64, text: impl Into<String>) -> Self {
        Self {
            transaction_id: vec![0, 0],
            kind: MessageKind::Error,
            command: None,
            args: Args::new(),
            error: Some((code, text.into())),
        }
    }

    pub fn arg_bytes(&self, name: &str) -> Option<&[u8]> {
        self.args.get(name)?.as_bytes()
    }

    pub fn arg_int(&self, name: &str) -> Option<i64> {
        self.args.get(name)?.as_int()
    }

    pub fn arg_list(&self, name: &str) -> Option<&[Value]> {
        self.args.get(name)?.as_list()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut root = Dict::new();
        root.insert(b"t".to_vec(), Value::bytes(self.transaction_id.clone()));
        match self.kind {
            MessageKind::Query => {
                root.insert(b"y".to_vec(), Value::from("q"));
                if let Some(command) = self.command {
                    root.insert(b"q".to_vec(), Value::from(command.wire_name()));
                }
                root.insert(b"a".to_vec(), args_to_dict(&self.args));
            }
            MessageKind::Response => {
                root.insert(b"y".to_vec(), Value::from("r"));
                root.insert(b"r".to_vec(), args_to_dict(&self.args));
            }
            MessageKind::Error => {
                root.insert(b"y".to_vec(), Value::from("e"));
                let (code, text) = self.error.clone().unwrap_or((ERROR_SERVER, String::new()));
                root.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(code), Value::bytes(text.into_bytes())]),
                );
            }
        }
        bencode::encode(&Value::Dict(root))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let root = bencode::decode(raw)?
            .into_dict()
            .ok_or(ProtocolError::Malformed("top level is not a dictionary"))?;
        let transaction_id = root
            .get(b"t".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(ProtocolError::Malformed("missing transaction id"))?
            .to_vec();
        let kind = root
            .get(b"y".as_slice())
            .and_then(Value::as_bytes)
            .ok_or(ProtocolError::Malformed("missing message kind"))?;
        match kind {
            b"q" => {
                let command = root
                    .get(b"q".as_slice())
                    .and_then(Value::as_bytes)
                    .and_then(CommandType::from_wire)
                    .ok_or(ProtocolError::Malformed("unknown query command"))?;
                let args = root
                    .get(b"a".as_slice())
                    .and_then(Value::as_dict)
                    .ok_or(ProtocolError::Malformed("query without arguments"))?;
                Ok(Self {
                    transaction_id,
                    kind: MessageKind::Query,
                    command: Some(command),
                    args: dict_to_args(args)?,
                    error: None,
                })
            }
            b"r" => {
                let args = root
                    .get(b"r".as_slice())
                    .and_then(Value::as_dict)
                    .ok_or(ProtocolError::Malformed("response without body"))?;
                Ok(Self {
                    transaction_id,
                    kind: MessageKind::Response,
                    command: None,
                    args: dict_to_args(args)?,
                    error: None,
                })
            }
            b"e" => {
                let payload = root
                    .get(b"e".as_slice())
                    .and_then(Value::as_list)
                    .ok_or(ProtocolError::Malformed("error without payload"))?;
                let code = payload
                    .first()
                    .and_then(Value::as_int)
                    .ok_or(ProtocolError::Malformed("error without code"))?;
                let text = payload
                    .get(1)
                    .and_then(Value::as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(Self {
                    transaction_id,
                    kind: MessageKind::Error,
                    command: None,
                    args: Args::new(),
                    error: Some((code, text)),
                })
            }
            _ => Err(ProtocolError::Malformed("unknown message kind")),
        }
    }
}

/// Typed view of a query's argument bag, one variant per command with its
/// required and optional fields spelled out. The generic map stays the
/// wire carrier; this is what the engine dispatches on.
///
/// Parse failures here are processing errors, not protocol errors: the
/// envelope already decoded, so the sender gets a server-error reply
/// rather than a protocol-error one.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryPayload {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: [u8; INFO_HASH_LENGTH],
    },
    AnnouncePeer {
        info_hash: [u8; INFO_HASH_LENGTH],
        /// The declared `port` argument, unvalidated.
        port: Option<i64>,
        implied_port: Option<i64>,
    },
}

impl QueryPayload {
    pub fn from_message(message: &DhtMessage) -> anyhow::Result<Self> {
        let command = message
            .command
            .ok_or_else(|| anyhow!("query without command"))?;
        match command {
            CommandType::Ping => Ok(QueryPayload::Ping),
            CommandType::FindNode => {
                let target = message
                    .arg_bytes("target")
                    .and_then(NodeId::from_slice)
                    .ok_or_else(|| anyhow!("find_node missing target"))?;
                Ok(QueryPayload::FindNode { target })
            }
            CommandType::GetPeers => {
                let info_hash = required_info_hash(message, "get_peers")?;
                Ok(QueryPayload::GetPeers { info_hash })
            }
            CommandType::AnnouncePeer => {
                let info_hash = required_info_hash(message, "announce_peer")?;
                Ok(QueryPayload::AnnouncePeer {
                    info_hash,
                    port: message.arg_int("port"),
                    implied_port: message.arg_int("implied_port"),
                })
            }
        }
    }

    pub fn command(&self) -> CommandType {
        match self {
            QueryPayload::Ping => CommandType::Ping,
            QueryPayload::FindNode { .. } => CommandType::FindNode,
            QueryPayload::GetPeers { .. } => CommandType::GetPeers,
            QueryPayload::AnnouncePeer { .. } => CommandType::AnnouncePeer,
        }
    }

    /// The argument map this payload contributes on the wire (the `id`
    /// argument is added by the sender).
    pub fn to_args(&self) -> Args {
        let mut args = Args::new();
        match self {
            QueryPayload::Ping => {}
            QueryPayload::FindNode { target } => {
                args.insert("target".into(), Value::bytes(target.as_bytes().to_vec()));
            }
            QueryPayload::GetPeers { info_hash } => {
                args.insert("info_hash".into(), Value::bytes(info_hash.to_vec()));
            }
            QueryPayload::AnnouncePeer {
                info_hash,
                port,
                implied_port,
            } => {
                args.insert("info_hash".into(), Value::bytes(info_hash.to_vec()));
                if let Some(port) = port {
                    args.insert("port".into(), Value::Int(*port));
                }
                if let Some(implied) = implied_port {
                    args.insert("implied_port".into(), Value::Int(*implied));
                }
            }
        }
        args
    }
}

fn required_info_hash(
    message: &DhtMessage,
    what: &str,
) -> anyhow::Result<[u8; INFO_HASH_LENGTH]> {
    message
        .arg_bytes("info_hash")
        .and_then(|raw| raw.try_into().ok())
        .ok_or_else(|| anyhow!("{what} missing info hash"))
}

/// What a response body carries, by precedence: a non-empty `values` list
/// of compact peers wins outright, otherwise a `nodes` blob, otherwise
/// nothing usable.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Peers(HashSet<SocketAddr>),
    Nodes(Vec<DhtNode>),
    Empty,
}

impl ResponseBody {
    pub fn from_message(message: &DhtMessage) -> Self {
        if let Some(values) = message.arg_list("values") {
            let peers: HashSet<SocketAddr> = values
                .iter()
                .filter_map(Value::as_bytes)
                .filter_map(parse_compact_peer)
                .collect();
            if !peers.is_empty() {
                return ResponseBody::Peers(peers);
            }
        }
        if let Some(raw) = message.arg_bytes("nodes") {
            return ResponseBody::Nodes(parse_compact_nodes(raw));
        }
        ResponseBody::Empty
    }
}

fn args_to_dict(args: &Args) -> Value {
    let mut dict = Dict::new();
    for (name, value) in args {
        dict.insert(name.clone().into_bytes(), value.clone());
    }
    Value::Dict(dict)
}

fn dict_to_args(dict: &Dict) -> Result<Args, ProtocolError> {
    let mut args = Args::new();
    for (key, value) in dict {
        let name = String::from_utf8(key.clone())
            .map_err(|_| ProtocolError::Malformed("argument name is not utf-8"))?;
        args.insert(name, value.clone());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_query_is_byte_stable() {
        let mut args = Args::new();
        args.insert("id".into(), Value::bytes(vec![0x61; 20]));
        let mut message = DhtMessage::query(CommandType::Ping, args);
        message.transaction_id = b"aa".to_vec();

        let raw = message.encode();
        let mut expected = b"d1:ad2:id20:".to_vec();
        expected.extend_from_slice(&[0x61; 20]);
        expected.extend_from_slice(b"e1:q4:ping1:t2:aa1:y1:qe");
        assert_eq!(raw, expected);

        let decoded = DhtMessage::decode(&raw).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.encode(), raw);
    }

    #[test]
    fn response_round_trips_without_command() {
        let mut args = Args::new();
        args.insert("id".into(), Value::bytes(vec![7; 20]));
        args.insert("nodes".into(), Value::bytes(vec![1; 26]));
        let message = DhtMessage::response(vec![0xDE, 0xAD], args);

        let decoded = DhtMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Response);
        assert_eq!(decoded.command, None);
        assert_eq!(decoded.transaction_id, vec![0xDE, 0xAD]);
        assert_eq!(decoded.arg_bytes("nodes"), Some(vec![1u8; 26].as_slice()));
    }

    #[test]
    fn error_reply_carries_code_and_text() {
        let message = DhtMessage::error(ERROR_PROTOCOL, "Error Protocol");
        let raw = message.encode();
        assert_eq!(
            raw,
            b"d1:eli203e14:Error Protocole1:t2:\x00\x001:y1:ee".to_vec()
        );

        let decoded = DhtMessage::decode(&raw).unwrap();
        assert_eq!(decoded.kind, MessageKind::Error);
        assert_eq!(decoded.error, Some((203, "Error Protocol".into())));
        assert_eq!(decoded.transaction_id, vec![0, 0]);
    }

    #[test]
    fn unknown_command_is_malformed() {
        let raw = b"d1:ade1:q5:store1:t2:aa1:y1:qe";
        assert!(matches!(
            DhtMessage::decode(raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn query_payloads_round_trip_through_the_arg_map() {
        let payloads = [
            QueryPayload::Ping,
            QueryPayload::FindNode {
                target: NodeId([5; 20]),
            },
            QueryPayload::GetPeers {
                info_hash: [6; INFO_HASH_LENGTH],
            },
            QueryPayload::AnnouncePeer {
                info_hash: [7; INFO_HASH_LENGTH],
                port: Some(6881),
                implied_port: Some(1),
            },
            QueryPayload::AnnouncePeer {
                info_hash: [8; INFO_HASH_LENGTH],
                port: None,
                implied_port: None,
            },
        ];
        for payload in payloads {
            let message = DhtMessage::query(payload.command(), payload.to_args());
            let reparsed = QueryPayload::from_message(&message).unwrap();
            assert_eq!(reparsed, payload);
        }
    }

    #[test]
    fn query_payload_requires_its_mandatory_fields() {
        let message = DhtMessage::query(CommandType::FindNode, Args::new());
        assert!(QueryPayload::from_message(&message).is_err());

        let mut args = Args::new();
        args.insert("info_hash".into(), Value::bytes(vec![1; 19]));
        let message = DhtMessage::query(CommandType::GetPeers, args);
        assert!(QueryPayload::from_message(&message).is_err());
    }

    #[test]
    fn response_body_prefers_non_empty_values_over_nodes() {
        let node = DhtNode::with_id(NodeId([9; 20]), "1.2.3.4:6881".parse().unwrap());
        let nodes_blob = node.compact_node().unwrap().to_vec();

        let mut args = Args::new();
        args.insert(
            "values".into(),
            Value::List(vec![Value::bytes(vec![10, 0, 0, 1, 0x1A, 0xE1])]),
        );
        args.insert("nodes".into(), Value::bytes(nodes_blob.clone()));
        let message = DhtMessage::response(vec![0, 1], args);
        match ResponseBody::from_message(&message) {
            ResponseBody::Peers(peers) => {
                assert_eq!(peers.len(), 1);
                assert!(peers.contains(&"10.0.0.1:6881".parse().unwrap()));
            }
            other => panic!("expected peers, got {other:?}"),
        }

        // An empty values list falls through to the nodes blob.
        let mut args = Args::new();
        args.insert("values".into(), Value::List(Vec::new()));
        args.insert("nodes".into(), Value::bytes(nodes_blob));
        let message = DhtMessage::response(vec![0, 2], args);
        match ResponseBody::from_message(&message) {
            ResponseBody::Nodes(nodes) => assert_eq!(nodes.len(), 1),
            other => panic!("expected nodes, got {other:?}"),
        }

        let message = DhtMessage::response(vec![0, 3], Args::new());
        assert_eq!(ResponseBody::from_message(&message), ResponseBody::Empty);
    }

    #[test]
    fn garbage_is_a_bencode_error() {
        assert!(matches!(
            DhtMessage::decode(b"abc"),
            Err(ProtocolError::Bencode(_))
        ));
    }

    #[test]
    fn non_dict_top_level_is_malformed() {
        assert!(matches!(
            DhtMessage::decode(b"i42e"),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
