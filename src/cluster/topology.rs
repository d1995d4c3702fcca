// Immutable topology snapshots.
//
// A snapshot carries a strictly increasing version and the set of joined
// members keyed by node id. The 128-bit content hash over the sorted node-id
// set detects stale views without full compares.

use crate::cluster::node::{Node, NodeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Content digest of a topology's sorted node-id set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopologyHash(pub [u8; 16]);

impl fmt::Display for TopologyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One immutable membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    version: u64,
    nodes: BTreeMap<NodeId, Node>,
}

impl Topology {
    pub fn empty() -> Self {
        Self {
            version: 0,
            nodes: BTreeMap::new(),
        }
    }

    pub fn new(version: u64, nodes: BTreeMap<NodeId, Node>) -> Self {
        Self { version, nodes }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Members sorted by node id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// The member with the lowest join order.
    pub fn oldest(&self) -> Option<&Node> {
        self.nodes
            .values()
            .min_by_key(|n| (n.join_order, n.id))
    }

    /// The member with the highest join order.
    pub fn youngest(&self) -> Option<&Node> {
        self.nodes
            .values()
            .max_by_key(|n| (n.join_order, n.id))
    }

    /// 128-bit digest over the sorted node-id set.
    pub fn hash(&self) -> TopologyHash {
        hash_of(self.nodes.keys())
    }

    /// Narrowed copy retaining only matching members; keeps this version.
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool) -> Topology {
        let nodes = self
            .nodes
            .iter()
            .filter(|(_, n)| predicate(n))
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        Topology {
            version: self.version,
            nodes,
        }
    }

    pub(crate) fn with_version(&self, version: u64) -> Topology {
        Topology {
            version,
            nodes: self.nodes.clone(),
        }
    }
}

/// Digest over an arbitrary sorted id iterator.
pub fn hash_of<'a>(ids: impl Iterator<Item = &'a NodeId>) -> TopologyHash {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id.uuid().as_bytes());
        hasher.update(id.order().to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    TopologyHash(out)
}

pub type TopologySnapshot = Arc<Topology>;
