//! KRPC (BEP-5) messages on top of `serde_bencode`.
//!
//! Only the shapes this crawler reacts to are modeled: `find_node`,
//! `get_peers` and `announce_peer` queries, and responses carrying `nodes`.
//! Every other query name decodes to [`QueryKind::Other`] so callers can drop it.

use crate::node_id::NodeId;
use serde_bencode::value::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum KrpcError {
    #[error("bencode: {0}")]
    Bencode(#[from] serde_bencode::Error),
    #[error("message is not a dictionary")]
    NotADict,
    #[error("missing or malformed field `{0}`")]
    Field(&'static str),
    #[error("unsupported message type")]
    UnsupportedType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Krpc {
    Query(Query),
    Response(Response),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub tid: Vec<u8>,
    pub sender: Option<Vec<u8>>,
    pub kind: QueryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    FindNode {
        target: Vec<u8>,
    },
    GetPeers {
        info_hash: Vec<u8>,
    },
    AnnouncePeer {
        info_hash: Vec<u8>,
        token: Vec<u8>,
        port: Option<i64>,
        implied_port: Option<i64>,
    },
    Other(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub nodes: Option<Vec<u8>>,
}

impl Krpc {
    pub fn decode(raw: &[u8]) -> Result<Self, KrpcError> {
        let value: Value = serde_bencode::from_bytes(raw)?;
        let Value::Dict(msg) = value else {
            return Err(KrpcError::NotADict);
        };

        let tid = get_bytes(&msg, b"t").ok_or(KrpcError::Field("t"))?.to_vec();
        let y = get_bytes(&msg, b"y").ok_or(KrpcError::Field("y"))?;

        match y {
            b"q" => {
                let q = get_bytes(&msg, b"q").ok_or(KrpcError::Field("q"))?;
                let a = get_dict(&msg, b"a").ok_or(KrpcError::Field("a"))?;
                let sender = get_bytes(a, b"id").map(<[u8]>::to_vec);
                let kind = match q {
                    b"find_node" => QueryKind::FindNode {
                        target: get_bytes(a, b"target")
                            .ok_or(KrpcError::Field("target"))?
                            .to_vec(),
                    },
                    b"get_peers" => QueryKind::GetPeers {
                        info_hash: get_bytes(a, b"info_hash")
                            .ok_or(KrpcError::Field("info_hash"))?
                            .to_vec(),
                    },
                    b"announce_peer" => QueryKind::AnnouncePeer {
                        info_hash: get_bytes(a, b"info_hash")
                            .ok_or(KrpcError::Field("info_hash"))?
                            .to_vec(),
                        token: get_bytes(a, b"token")
                            .ok_or(KrpcError::Field("token"))?
                            .to_vec(),
                        port: get_int(a, b"port"),
                        implied_port: get_int(a, b"implied_port"),
                    },
                    other => QueryKind::Other(other.to_vec()),
                };
                Ok(Krpc::Query(Query { tid, sender, kind }))
            }
            b"r" => {
                let r = get_dict(&msg, b"r").ok_or(KrpcError::Field("r"))?;
                Ok(Krpc::Response(Response {
                    nodes: get_bytes(r, b"nodes").map(<[u8]>::to_vec),
                }))
            }
            _ => Err(KrpcError::UnsupportedType),
        }
    }
}

/// Transaction ids for outgoing queries. Nothing is matched against them, they
/// only need to be present.
pub fn next_tid() -> [u8; 4] {
    static TX: AtomicU32 = AtomicU32::new(0);
    TX.fetch_add(1, Ordering::Relaxed).to_be_bytes()
}

pub fn find_node_query(tid: &[u8], id: &NodeId, target: &NodeId) -> Result<Vec<u8>, KrpcError> {
    let args = dict(vec![
        ("id", bytes(id.as_bytes())),
        ("target", bytes(target.as_bytes())),
    ]);
    encode(dict(vec![
        ("t", bytes(tid)),
        ("y", bytes(b"q")),
        ("q", bytes(b"find_node")),
        ("a", args),
    ]))
}

/// `get_peers` reply: never carries peers, only an empty `nodes` and a token.
pub fn get_peers_reply(tid: &[u8], id: &NodeId, token: &[u8]) -> Result<Vec<u8>, KrpcError> {
    let r = dict(vec![
        ("id", bytes(id.as_bytes())),
        ("nodes", bytes(b"")),
        ("token", bytes(token)),
    ]);
    reply(tid, r)
}

pub fn announce_peer_ack(tid: &[u8], id: &NodeId) -> Result<Vec<u8>, KrpcError> {
    reply(tid, dict(vec![("id", bytes(id.as_bytes()))]))
}

fn reply(tid: &[u8], r: Value) -> Result<Vec<u8>, KrpcError> {
    encode(dict(vec![("t", bytes(tid)), ("y", bytes(b"r")), ("r", r)]))
}

fn encode(value: Value) -> Result<Vec<u8>, KrpcError> {
    Ok(serde_bencode::to_bytes(&value)?)
}

fn dict(entries: Vec<(&str, Value)>) -> Value {
    Value::Dict(
        entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect::<HashMap<_, _>>(),
    )
}

fn bytes(b: &[u8]) -> Value {
    Value::Bytes(b.to_vec())
}

fn get_bytes<'a>(dict: &'a HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<&'a [u8]> {
    match dict.get(key)? {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

fn get_dict<'a>(
    dict: &'a HashMap<Vec<u8>, Value>,
    key: &[u8],
) -> Option<&'a HashMap<Vec<u8>, Value>> {
    match dict.get(key)? {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

fn get_int(dict: &HashMap<Vec<u8>, Value>, key: &[u8]) -> Option<i64> {
    match dict.get(key)? {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}
