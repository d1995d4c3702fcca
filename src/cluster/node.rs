// Node identity and lifecycle model.
//
// A node identity is a 128-bit random id plus a process-wide creation order
// counter; rejoining always mints a fresh identity. The join order is a
// cluster-assigned dense integer (1 for the founder) and never reused within
// the same cluster.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

static NODE_ORDER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

/// Globally unique node identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    id: Uuid,
    order: u64,
}

impl NodeId {
    /// Mints a fresh identity; never reuses a previous one.
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            order: NODE_ORDER.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub(crate) fn from_parts(id: Uuid, order: u64) -> Self {
        Self { id, order }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form: first uuid group plus the order counter.
        let text = self.id.simple().to_string();
        write!(f, "{}#{}", &text[..8], self.order)
    }
}

/// Network address of a node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> crate::error::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| {
                crate::error::ClusterError::Configuration(format!(
                    "cannot resolve {}: {}",
                    self, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                crate::error::ClusterError::Configuration(format!("cannot resolve {}", self))
            })
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for NodeAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Roster status of a node as seen by the gossip protocol.
///
/// Precedence breaks version ties during merges: Failed > Down > Leaving >
/// Up > Joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    Joining,
    Up,
    Leaving,
    Down,
    Failed,
}

impl NodeStatus {
    pub fn precedence(&self) -> u8 {
        match self {
            NodeStatus::Joining => 0,
            NodeStatus::Up => 1,
            NodeStatus::Leaving => 2,
            NodeStatus::Down => 3,
            NodeStatus::Failed => 4,
        }
    }

    pub(crate) fn from_wire(v: u8) -> crate::error::Result<Self> {
        Ok(match v {
            0 => NodeStatus::Joining,
            1 => NodeStatus::Up,
            2 => NodeStatus::Leaving,
            3 => NodeStatus::Down,
            4 => NodeStatus::Failed,
            other => {
                return Err(crate::error::ClusterError::Codec(format!(
                    "unknown node status: {}",
                    other
                )))
            }
        })
    }

    pub(crate) fn to_wire(self) -> u8 {
        self.precedence()
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Joining => "Joining",
            NodeStatus::Up => "Up",
            NodeStatus::Leaving => "Leaving",
            NodeStatus::Down => "Down",
            NodeStatus::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Externally visible lifecycle of the local instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Down,
    Initializing,
    Initialized,
    Joining,
    Synchronizing,
    Up,
    Leaving,
    Terminating,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Down => "Down",
            NodeState::Initializing => "Initializing",
            NodeState::Initialized => "Initialized",
            NodeState::Joining => "Joining",
            NodeState::Synchronizing => "Synchronizing",
            NodeState::Up => "Up",
            NodeState::Leaving => "Leaving",
            NodeState::Terminating => "Terminating",
        };
        write!(f, "{}", s)
    }
}

/// A cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub address: NodeAddress,
    pub roles: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
    /// Dense cluster-assigned join order; 0 until the cluster assigned one.
    pub join_order: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            id: NodeId::generate(),
            name: name.into(),
            address,
            roles: BTreeSet::new(),
            properties: BTreeMap::new(),
            join_order: 0,
        }
    }

    pub fn with_roles(mut self, roles: BTreeSet<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn has_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}@{}", self.id, self.address)
        } else {
            write!(f, "{}({})@{}", self.name, self.id, self.address)
        }
    }
}
