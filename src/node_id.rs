use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const ID_LEN: usize = 20;

// Compact node info: 20-byte node id + 4-byte IPv4 + 2-byte port.
pub const COMPACT_NODE_LEN: usize = 26;

// Leading bytes borrowed from the target when deriving a neighbor id.
const NEIGHBOR_PREFIX_LEN: usize = 10;

/// A 20-byte identifier in the DHT keyspace. Node ids and info-hashes share it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Id that looks topologically close to `target`: the target's leading
    /// bytes followed by the tail of our own id.
    ///
    /// A short target contributes what it has; the rest stays ours.
    pub fn neighbor(&self, target: &[u8]) -> NodeId {
        let mut out = self.0;
        let n = target.len().min(NEIGHBOR_PREFIX_LEN);
        out[..n].copy_from_slice(&target[..n]);
        NodeId(out)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A node learned from a `nodes` field. Used once to continue the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// Decodes a compact node list. A trailing partial entry is ignored.
pub fn decode_compact_nodes(nodes: &[u8]) -> Vec<CompactNode> {
    nodes
        .chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let mut id = [0u8; ID_LEN];
            id.copy_from_slice(&chunk[..ID_LEN]);
            let ip = Ipv4Addr::new(chunk[20], chunk[21], chunk[22], chunk[23]);
            let port = u16::from_be_bytes([chunk[24], chunk[25]]);
            CompactNode {
                id: NodeId(id),
                addr: SocketAddrV4::new(ip, port),
            }
        })
        .collect()
}

pub fn encode_compact_nodes(nodes: &[CompactNode]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        out.extend_from_slice(node.id.as_bytes());
        out.extend_from_slice(&node.addr.ip().octets());
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}
