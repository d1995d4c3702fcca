// Membership wire protocol.
//
// Messages travel as data payloads on the gossip connector. Each payload
// starts with a type byte; bodies follow the crate-wide layout rules
// (big-endian integers, i32-length-prefixed strings and blocks).
//
//   JOIN_REQUEST : Node, utf8 clusterName
//   JOIN_ACCEPT  : u64 joinOrder, i32 count, Rumor[count]
//   JOIN_REJECT  : utf8 reason, NodeId rejectedBy
//   UPDATE       : NodeId sender, i32 count, Digest[count], i32 rumorCount, Rumor[rumorCount]
//   UPDATE_REPLY : NodeId sender, i32 rumorCount, Rumor[rumorCount]
//   LEAVE_ACK    : NodeId sender

use crate::cluster::node::{Node, NodeAddress, NodeId, NodeStatus};
use crate::error::{ClusterError, Result};
use crate::network::frame::{FrameReader, FrameWriter};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub const GOSSIP_PROTOCOL: &str = "hekate.cluster";

mod msg_type {
    pub const JOIN_REQUEST: u8 = 10;
    pub const JOIN_ACCEPT: u8 = 11;
    pub const JOIN_REJECT: u8 = 12;
    pub const UPDATE: u8 = 13;
    pub const UPDATE_REPLY: u8 = 14;
    pub const LEAVE_ACK: u8 = 15;
}

/// Compact per-node summary used to decide what to exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub id: NodeId,
    pub status: NodeStatus,
    pub version: u64,
}

/// Full roster entry shipped between peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rumor {
    pub node: Node,
    pub status: NodeStatus,
    pub version: u64,
    pub suspicions: BTreeSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    JoinRequest {
        node: Node,
        cluster: String,
    },
    JoinAccept {
        join_order: u64,
        roster: Vec<Rumor>,
    },
    JoinReject {
        reason: String,
        rejected_by: NodeId,
    },
    Update {
        sender: NodeId,
        digest: Vec<DigestEntry>,
        rumors: Vec<Rumor>,
    },
    UpdateReply {
        sender: NodeId,
        rumors: Vec<Rumor>,
    },
    LeaveAck {
        sender: NodeId,
    },
}

pub(crate) fn write_node_id(w: &mut FrameWriter, id: &NodeId) {
    w.write_u128(id.uuid().as_u128());
    w.write_u64(id.order());
}

pub(crate) fn read_node_id(r: &mut FrameReader) -> Result<NodeId> {
    let uuid = Uuid::from_u128(r.read_u128()?);
    let order = r.read_u64()?;
    Ok(NodeId::from_parts(uuid, order))
}

pub(crate) fn write_node(w: &mut FrameWriter, node: &Node) {
    write_node_id(w, &node.id);
    w.write_str(&node.name);
    w.write_str(&node.address.host);
    w.write_u16(node.address.port);
    w.write_i32(node.roles.len() as i32);
    for role in &node.roles {
        w.write_str(role);
    }
    w.write_i32(node.properties.len() as i32);
    for (key, value) in &node.properties {
        w.write_str(key);
        w.write_str(value);
    }
    w.write_u64(node.join_order);
}

pub(crate) fn read_node(r: &mut FrameReader) -> Result<Node> {
    let id = read_node_id(r)?;
    let name = r.read_str()?;
    let host = r.read_str()?;
    let port = r.read_u16()?;

    let role_count = read_count(r, "roles")?;
    let mut roles = BTreeSet::new();
    for _ in 0..role_count {
        roles.insert(r.read_str()?);
    }

    let prop_count = read_count(r, "properties")?;
    let mut properties = BTreeMap::new();
    for _ in 0..prop_count {
        let key = r.read_str()?;
        let value = r.read_str()?;
        properties.insert(key, value);
    }

    let join_order = r.read_u64()?;
    Ok(Node {
        id,
        name,
        address: NodeAddress::new(host, port),
        roles,
        properties,
        join_order,
    })
}

fn write_rumor(w: &mut FrameWriter, rumor: &Rumor) {
    write_node(w, &rumor.node);
    w.write_u8(rumor.status.to_wire());
    w.write_u64(rumor.version);
    w.write_i32(rumor.suspicions.len() as i32);
    for id in &rumor.suspicions {
        write_node_id(w, id);
    }
}

fn read_rumor(r: &mut FrameReader) -> Result<Rumor> {
    let node = read_node(r)?;
    let status = NodeStatus::from_wire(r.read_u8()?)?;
    let version = r.read_u64()?;
    let count = read_count(r, "suspicions")?;
    let mut suspicions = BTreeSet::new();
    for _ in 0..count {
        suspicions.insert(read_node_id(r)?);
    }
    Ok(Rumor {
        node,
        status,
        version,
        suspicions,
    })
}

fn write_rumors(w: &mut FrameWriter, rumors: &[Rumor]) {
    w.write_i32(rumors.len() as i32);
    for rumor in rumors {
        write_rumor(w, rumor);
    }
}

fn read_rumors(r: &mut FrameReader) -> Result<Vec<Rumor>> {
    let count = read_count(r, "rumors")?;
    let mut rumors = Vec::with_capacity(count);
    for _ in 0..count {
        rumors.push(read_rumor(r)?);
    }
    Ok(rumors)
}

fn read_count(r: &mut FrameReader, what: &str) -> Result<usize> {
    let count = r.read_i32()?;
    if count < 0 {
        return Err(ClusterError::Codec(format!(
            "negative {} count: {}",
            what, count
        )));
    }
    Ok(count as usize)
}

impl GossipMessage {
    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::new();
        match self {
            GossipMessage::JoinRequest { node, cluster } => {
                w.write_u8(msg_type::JOIN_REQUEST);
                write_node(&mut w, node);
                w.write_str(cluster);
            }
            GossipMessage::JoinAccept { join_order, roster } => {
                w.write_u8(msg_type::JOIN_ACCEPT);
                w.write_u64(*join_order);
                write_rumors(&mut w, roster);
            }
            GossipMessage::JoinReject {
                reason,
                rejected_by,
            } => {
                w.write_u8(msg_type::JOIN_REJECT);
                w.write_str(reason);
                write_node_id(&mut w, rejected_by);
            }
            GossipMessage::Update {
                sender,
                digest,
                rumors,
            } => {
                w.write_u8(msg_type::UPDATE);
                write_node_id(&mut w, sender);
                w.write_i32(digest.len() as i32);
                for entry in digest {
                    write_node_id(&mut w, &entry.id);
                    w.write_u8(entry.status.to_wire());
                    w.write_u64(entry.version);
                }
                write_rumors(&mut w, rumors);
            }
            GossipMessage::UpdateReply { sender, rumors } => {
                w.write_u8(msg_type::UPDATE_REPLY);
                write_node_id(&mut w, sender);
                write_rumors(&mut w, rumors);
            }
            GossipMessage::LeaveAck { sender } => {
                w.write_u8(msg_type::LEAVE_ACK);
                write_node_id(&mut w, sender);
            }
        }
        w.into_bytes()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut r = FrameReader::new(payload);
        let msg_type = r.read_u8()?;
        match msg_type {
            msg_type::JOIN_REQUEST => {
                let node = read_node(&mut r)?;
                let cluster = r.read_str()?;
                Ok(GossipMessage::JoinRequest { node, cluster })
            }
            msg_type::JOIN_ACCEPT => {
                let join_order = r.read_u64()?;
                let roster = read_rumors(&mut r)?;
                Ok(GossipMessage::JoinAccept { join_order, roster })
            }
            msg_type::JOIN_REJECT => {
                let reason = r.read_str()?;
                let rejected_by = read_node_id(&mut r)?;
                Ok(GossipMessage::JoinReject {
                    reason,
                    rejected_by,
                })
            }
            msg_type::UPDATE => {
                let sender = read_node_id(&mut r)?;
                let count = read_count(&mut r, "digest")?;
                let mut digest = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = read_node_id(&mut r)?;
                    let status = NodeStatus::from_wire(r.read_u8()?)?;
                    let version = r.read_u64()?;
                    digest.push(DigestEntry {
                        id,
                        status,
                        version,
                    });
                }
                let rumors = read_rumors(&mut r)?;
                Ok(GossipMessage::Update {
                    sender,
                    digest,
                    rumors,
                })
            }
            msg_type::UPDATE_REPLY => {
                let sender = read_node_id(&mut r)?;
                let rumors = read_rumors(&mut r)?;
                Ok(GossipMessage::UpdateReply { sender, rumors })
            }
            msg_type::LEAVE_ACK => {
                let sender = read_node_id(&mut r)?;
                Ok(GossipMessage::LeaveAck { sender })
            }
            other => Err(ClusterError::Codec(format!(
                "unknown gossip message type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        let mut node = Node::new("n1", NodeAddress::new("10.0.0.1", 7001));
        node.roles.insert("worker".to_string());
        node.roles.insert("storage".to_string());
        node.properties
            .insert("zone".to_string(), "eu-1".to_string());
        node.join_order = 3;
        node
    }

    fn sample_rumor() -> Rumor {
        let mut suspicions = BTreeSet::new();
        suspicions.insert(NodeId::generate());
        Rumor {
            node: sample_node(),
            status: NodeStatus::Up,
            version: 17,
            suspicions,
        }
    }

    fn round_trip(msg: GossipMessage) {
        let decoded = GossipMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_join_request_round_trip() {
        round_trip(GossipMessage::JoinRequest {
            node: sample_node(),
            cluster: "prod".into(),
        });
    }

    #[test]
    fn test_join_accept_round_trip() {
        round_trip(GossipMessage::JoinAccept {
            join_order: 4,
            roster: vec![sample_rumor(), sample_rumor()],
        });
    }

    #[test]
    fn test_join_reject_round_trip() {
        round_trip(GossipMessage::JoinReject {
            reason: "cluster name mismatch".into(),
            rejected_by: NodeId::generate(),
        });
    }

    #[test]
    fn test_update_round_trip() {
        let rumor = sample_rumor();
        round_trip(GossipMessage::Update {
            sender: NodeId::generate(),
            digest: vec![DigestEntry {
                id: rumor.node.id,
                status: rumor.status,
                version: rumor.version,
            }],
            rumors: vec![rumor],
        });
    }

    #[test]
    fn test_update_reply_and_leave_ack_round_trip() {
        round_trip(GossipMessage::UpdateReply {
            sender: NodeId::generate(),
            rumors: vec![sample_rumor()],
        });
        round_trip(GossipMessage::LeaveAck {
            sender: NodeId::generate(),
        });
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(GossipMessage::decode(Bytes::from_static(&[200, 1, 2])).is_err());
        assert!(GossipMessage::decode(Bytes::new()).is_err());
    }
}
