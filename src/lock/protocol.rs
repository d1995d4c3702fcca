// Lock service wire protocol.
//
// Payload layouts on the lock connector:
//   LOCK_REQUEST      : u64 lockId, utf8 region, utf8 name, i64 timeoutMs,
//                       u8 wantFeedback, u64 threadId, TopologyHash, NodeId
//   LOCK_RESPONSE     : u64 lockId, u8 status, u64 ownerThreadId, u8 hasOwner, [NodeId]
//   UNLOCK_REQUEST    : u64 lockId, utf8 region, utf8 name, TopologyHash, NodeId
//   UNLOCK_RESPONSE   : u64 lockId, u8 status
//   OWNER_REQUEST     : u64 queryId, utf8 region, utf8 name, TopologyHash
//   OWNER_RESPONSE    : u64 queryId, u8 status, u64 threadId, u8 hasOwner, [NodeId]
//   MIGRATION_PREPARE : utf8 region, MigrationKey, u8 firstPass,
//                       i32 topoCount, {NodeId, u8 hasHash, [TopologyHash]}[],
//                       i32 lockCount, LockEntry[]
//   MIGRATION_PREPARE_REPLY : utf8 region, MigrationKey, TopologyHash,
//                       i32 lockCount, LockEntry[]
//   MIGRATION_APPLY   : utf8 region, MigrationKey, i32 lockCount, LockEntry[]
//   MIGRATION_APPLY_ACK : utf8 region, MigrationKey
//
// A LockEntry is `utf8 name, u64 lockId, u64 threadId, NodeId owner`; a
// MigrationKey is `NodeId initiator, TopologyHash, u64 id`.

use crate::cluster::node::NodeId;
use crate::cluster::protocol::{read_node_id, write_node_id};
use crate::cluster::topology::TopologyHash;
use crate::error::{ClusterError, Result};
use crate::network::frame::{FrameReader, FrameWriter};
use bytes::Bytes;

pub const LOCK_PROTOCOL: &str = "hekate.locks";

mod msg_type {
    pub const LOCK_REQUEST: u8 = 30;
    pub const LOCK_RESPONSE: u8 = 31;
    pub const UNLOCK_REQUEST: u8 = 32;
    pub const UNLOCK_RESPONSE: u8 = 33;
    pub const OWNER_REQUEST: u8 = 34;
    pub const OWNER_RESPONSE: u8 = 35;
    pub const MIGRATION_PREPARE: u8 = 36;
    pub const MIGRATION_PREPARE_REPLY: u8 = 37;
    pub const MIGRATION_APPLY: u8 = 38;
    pub const MIGRATION_APPLY_ACK: u8 = 39;
}

/// Outcome of a lock-protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWireStatus {
    Ok,
    Busy,
    Timeout,
    /// The manager's topology view is stale relative to the requester's (or
    /// vice versa); refresh and retry.
    Retry,
    NotOwner,
}

impl LockWireStatus {
    fn to_wire(self) -> u8 {
        match self {
            LockWireStatus::Ok => 0,
            LockWireStatus::Busy => 1,
            LockWireStatus::Timeout => 2,
            LockWireStatus::Retry => 3,
            LockWireStatus::NotOwner => 4,
        }
    }

    fn from_wire(v: u8) -> Result<Self> {
        Ok(match v {
            0 => LockWireStatus::Ok,
            1 => LockWireStatus::Busy,
            2 => LockWireStatus::Timeout,
            3 => LockWireStatus::Retry,
            4 => LockWireStatus::NotOwner,
            other => {
                return Err(ClusterError::Codec(format!(
                    "unknown lock status: {}",
                    other
                )))
            }
        })
    }
}

/// Identifies one lock-rebalancing round; stale keys are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockMigrationKey {
    pub initiator: NodeId,
    pub topology: TopologyHash,
    pub id: u64,
}

/// One live lock ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockEntry {
    pub name: String,
    pub lock_id: u64,
    pub thread_id: u64,
    pub owner: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockMessage {
    LockRequest {
        lock_id: u64,
        region: String,
        name: String,
        timeout_ms: i64,
        want_feedback: bool,
        thread_id: u64,
        topology: TopologyHash,
        requester: NodeId,
    },
    LockResponse {
        lock_id: u64,
        status: LockWireStatus,
        owner_thread: u64,
        owner: Option<NodeId>,
    },
    UnlockRequest {
        lock_id: u64,
        region: String,
        name: String,
        topology: TopologyHash,
        requester: NodeId,
    },
    UnlockResponse {
        lock_id: u64,
        status: LockWireStatus,
    },
    OwnerRequest {
        query_id: u64,
        region: String,
        name: String,
        topology: TopologyHash,
    },
    OwnerResponse {
        query_id: u64,
        status: LockWireStatus,
        thread_id: u64,
        owner: Option<NodeId>,
    },
    MigrationPrepare {
        region: String,
        key: LockMigrationKey,
        first_pass: bool,
        topologies: Vec<(NodeId, Option<TopologyHash>)>,
        locks: Vec<LockEntry>,
    },
    MigrationPrepareReply {
        region: String,
        key: LockMigrationKey,
        topology: TopologyHash,
        locks: Vec<LockEntry>,
    },
    MigrationApply {
        region: String,
        key: LockMigrationKey,
        locks: Vec<LockEntry>,
    },
    MigrationApplyAck {
        region: String,
        key: LockMigrationKey,
    },
}

impl LockMessage {
    /// Correlation for request/response matching on a connection.
    pub fn request_id(&self) -> u64 {
        match self {
            LockMessage::LockRequest { lock_id, .. } => *lock_id,
            LockMessage::LockResponse { lock_id, .. } => *lock_id,
            LockMessage::UnlockRequest { lock_id, .. } => *lock_id,
            LockMessage::UnlockResponse { lock_id, .. } => *lock_id,
            LockMessage::OwnerRequest { query_id, .. } => *query_id,
            LockMessage::OwnerResponse { query_id, .. } => *query_id,
            LockMessage::MigrationPrepare { key, .. } => key.id,
            LockMessage::MigrationPrepareReply { key, .. } => key.id,
            LockMessage::MigrationApply { key, .. } => key.id,
            LockMessage::MigrationApplyAck { key, .. } => key.id,
        }
    }

    /// True for unsolicited messages (the request side of an exchange).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            LockMessage::LockRequest { .. }
                | LockMessage::UnlockRequest { .. }
                | LockMessage::OwnerRequest { .. }
                | LockMessage::MigrationPrepare { .. }
                | LockMessage::MigrationApply { .. }
        )
    }
}

fn write_hash(w: &mut FrameWriter, hash: &TopologyHash) {
    w.write_raw(&hash.0);
}

fn read_hash(r: &mut FrameReader) -> Result<TopologyHash> {
    let hi = r.read_u128()?;
    Ok(TopologyHash(hi.to_be_bytes()))
}

fn write_key(w: &mut FrameWriter, key: &LockMigrationKey) {
    write_node_id(w, &key.initiator);
    write_hash(w, &key.topology);
    w.write_u64(key.id);
}

fn read_key(r: &mut FrameReader) -> Result<LockMigrationKey> {
    Ok(LockMigrationKey {
        initiator: read_node_id(r)?,
        topology: read_hash(r)?,
        id: r.read_u64()?,
    })
}

fn write_owner(w: &mut FrameWriter, owner: &Option<NodeId>) {
    match owner {
        Some(id) => {
            w.write_u8(1);
            write_node_id(w, id);
        }
        None => w.write_u8(0),
    }
}

fn read_owner(r: &mut FrameReader) -> Result<Option<NodeId>> {
    if r.read_u8()? != 0 {
        Ok(Some(read_node_id(r)?))
    } else {
        Ok(None)
    }
}

fn write_entries(w: &mut FrameWriter, entries: &[LockEntry]) {
    w.write_i32(entries.len() as i32);
    for entry in entries {
        w.write_str(&entry.name);
        w.write_u64(entry.lock_id);
        w.write_u64(entry.thread_id);
        write_node_id(w, &entry.owner);
    }
}

fn read_entries(r: &mut FrameReader) -> Result<Vec<LockEntry>> {
    let count = r.read_i32()?;
    if count < 0 {
        return Err(ClusterError::Codec(format!(
            "negative lock count: {}",
            count
        )));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(LockEntry {
            name: r.read_str()?,
            lock_id: r.read_u64()?,
            thread_id: r.read_u64()?,
            owner: read_node_id(r)?,
        });
    }
    Ok(entries)
}

impl LockMessage {
    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::new();
        match self {
            LockMessage::LockRequest {
                lock_id,
                region,
                name,
                timeout_ms,
                want_feedback,
                thread_id,
                topology,
                requester,
            } => {
                w.write_u8(msg_type::LOCK_REQUEST);
                w.write_u64(*lock_id);
                w.write_str(region);
                w.write_str(name);
                w.write_i64(*timeout_ms);
                w.write_bool(*want_feedback);
                w.write_u64(*thread_id);
                write_hash(&mut w, topology);
                write_node_id(&mut w, requester);
            }
            LockMessage::LockResponse {
                lock_id,
                status,
                owner_thread,
                owner,
            } => {
                w.write_u8(msg_type::LOCK_RESPONSE);
                w.write_u64(*lock_id);
                w.write_u8(status.to_wire());
                w.write_u64(*owner_thread);
                write_owner(&mut w, owner);
            }
            LockMessage::UnlockRequest {
                lock_id,
                region,
                name,
                topology,
                requester,
            } => {
                w.write_u8(msg_type::UNLOCK_REQUEST);
                w.write_u64(*lock_id);
                w.write_str(region);
                w.write_str(name);
                write_hash(&mut w, topology);
                write_node_id(&mut w, requester);
            }
            LockMessage::UnlockResponse { lock_id, status } => {
                w.write_u8(msg_type::UNLOCK_RESPONSE);
                w.write_u64(*lock_id);
                w.write_u8(status.to_wire());
            }
            LockMessage::OwnerRequest {
                query_id,
                region,
                name,
                topology,
            } => {
                w.write_u8(msg_type::OWNER_REQUEST);
                w.write_u64(*query_id);
                w.write_str(region);
                w.write_str(name);
                write_hash(&mut w, topology);
            }
            LockMessage::OwnerResponse {
                query_id,
                status,
                thread_id,
                owner,
            } => {
                w.write_u8(msg_type::OWNER_RESPONSE);
                w.write_u64(*query_id);
                w.write_u8(status.to_wire());
                w.write_u64(*thread_id);
                write_owner(&mut w, owner);
            }
            LockMessage::MigrationPrepare {
                region,
                key,
                first_pass,
                topologies,
                locks,
            } => {
                w.write_u8(msg_type::MIGRATION_PREPARE);
                w.write_str(region);
                write_key(&mut w, key);
                w.write_bool(*first_pass);
                w.write_i32(topologies.len() as i32);
                for (id, hash) in topologies {
                    write_node_id(&mut w, id);
                    match hash {
                        Some(hash) => {
                            w.write_u8(1);
                            write_hash(&mut w, hash);
                        }
                        None => w.write_u8(0),
                    }
                }
                write_entries(&mut w, locks);
            }
            LockMessage::MigrationPrepareReply {
                region,
                key,
                topology,
                locks,
            } => {
                w.write_u8(msg_type::MIGRATION_PREPARE_REPLY);
                w.write_str(region);
                write_key(&mut w, key);
                write_hash(&mut w, topology);
                write_entries(&mut w, locks);
            }
            LockMessage::MigrationApply { region, key, locks } => {
                w.write_u8(msg_type::MIGRATION_APPLY);
                w.write_str(region);
                write_key(&mut w, key);
                write_entries(&mut w, locks);
            }
            LockMessage::MigrationApplyAck { region, key } => {
                w.write_u8(msg_type::MIGRATION_APPLY_ACK);
                w.write_str(region);
                write_key(&mut w, key);
            }
        }
        w.into_bytes()
    }

    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut r = FrameReader::new(payload);
        match r.read_u8()? {
            msg_type::LOCK_REQUEST => Ok(LockMessage::LockRequest {
                lock_id: r.read_u64()?,
                region: r.read_str()?,
                name: r.read_str()?,
                timeout_ms: r.read_i64()?,
                want_feedback: r.read_bool()?,
                thread_id: r.read_u64()?,
                topology: read_hash(&mut r)?,
                requester: read_node_id(&mut r)?,
            }),
            msg_type::LOCK_RESPONSE => Ok(LockMessage::LockResponse {
                lock_id: r.read_u64()?,
                status: LockWireStatus::from_wire(r.read_u8()?)?,
                owner_thread: r.read_u64()?,
                owner: read_owner(&mut r)?,
            }),
            msg_type::UNLOCK_REQUEST => Ok(LockMessage::UnlockRequest {
                lock_id: r.read_u64()?,
                region: r.read_str()?,
                name: r.read_str()?,
                topology: read_hash(&mut r)?,
                requester: read_node_id(&mut r)?,
            }),
            msg_type::UNLOCK_RESPONSE => Ok(LockMessage::UnlockResponse {
                lock_id: r.read_u64()?,
                status: LockWireStatus::from_wire(r.read_u8()?)?,
            }),
            msg_type::OWNER_REQUEST => Ok(LockMessage::OwnerRequest {
                query_id: r.read_u64()?,
                region: r.read_str()?,
                name: r.read_str()?,
                topology: read_hash(&mut r)?,
            }),
            msg_type::OWNER_RESPONSE => Ok(LockMessage::OwnerResponse {
                query_id: r.read_u64()?,
                status: LockWireStatus::from_wire(r.read_u8()?)?,
                thread_id: r.read_u64()?,
                owner: read_owner(&mut r)?,
            }),
            msg_type::MIGRATION_PREPARE => {
                let region = r.read_str()?;
                let key = read_key(&mut r)?;
                let first_pass = r.read_bool()?;
                let count = r.read_i32()?;
                if count < 0 {
                    return Err(ClusterError::Codec("negative topology count".to_string()));
                }
                let mut topologies = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let id = read_node_id(&mut r)?;
                    let hash = if r.read_u8()? != 0 {
                        Some(read_hash(&mut r)?)
                    } else {
                        None
                    };
                    topologies.push((id, hash));
                }
                let locks = read_entries(&mut r)?;
                Ok(LockMessage::MigrationPrepare {
                    region,
                    key,
                    first_pass,
                    topologies,
                    locks,
                })
            }
            msg_type::MIGRATION_PREPARE_REPLY => Ok(LockMessage::MigrationPrepareReply {
                region: r.read_str()?,
                key: read_key(&mut r)?,
                topology: read_hash(&mut r)?,
                locks: read_entries(&mut r)?,
            }),
            msg_type::MIGRATION_APPLY => Ok(LockMessage::MigrationApply {
                region: r.read_str()?,
                key: read_key(&mut r)?,
                locks: read_entries(&mut r)?,
            }),
            msg_type::MIGRATION_APPLY_ACK => Ok(LockMessage::MigrationApplyAck {
                region: r.read_str()?,
                key: read_key(&mut r)?,
            }),
            other => Err(ClusterError::Codec(format!(
                "unknown lock message type: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash() -> TopologyHash {
        TopologyHash([7u8; 16])
    }

    fn key() -> LockMigrationKey {
        LockMigrationKey {
            initiator: NodeId::generate(),
            topology: hash(),
            id: 12,
        }
    }

    fn entry(name: &str) -> LockEntry {
        LockEntry {
            name: name.to_string(),
            lock_id: 99,
            thread_id: 3,
            owner: NodeId::generate(),
        }
    }

    fn round_trip(msg: LockMessage) {
        let decoded = LockMessage::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_lock_request_response_round_trip() {
        round_trip(LockMessage::LockRequest {
            lock_id: 5,
            region: "R".into(),
            name: "x".into(),
            timeout_ms: 1500,
            want_feedback: true,
            thread_id: 2,
            topology: hash(),
            requester: NodeId::generate(),
        });
        round_trip(LockMessage::LockResponse {
            lock_id: 5,
            status: LockWireStatus::Busy,
            owner_thread: 2,
            owner: Some(NodeId::generate()),
        });
        round_trip(LockMessage::LockResponse {
            lock_id: 5,
            status: LockWireStatus::Ok,
            owner_thread: 0,
            owner: None,
        });
    }

    #[test]
    fn test_unlock_round_trip() {
        round_trip(LockMessage::UnlockRequest {
            lock_id: 8,
            region: "R".into(),
            name: "x".into(),
            topology: hash(),
            requester: NodeId::generate(),
        });
        round_trip(LockMessage::UnlockResponse {
            lock_id: 8,
            status: LockWireStatus::NotOwner,
        });
    }

    #[test]
    fn test_owner_round_trip() {
        round_trip(LockMessage::OwnerRequest {
            query_id: 4,
            region: "R".into(),
            name: "x".into(),
            topology: hash(),
        });
        round_trip(LockMessage::OwnerResponse {
            query_id: 4,
            status: LockWireStatus::Ok,
            thread_id: 9,
            owner: Some(NodeId::generate()),
        });
    }

    #[test]
    fn test_migration_round_trip() {
        round_trip(LockMessage::MigrationPrepare {
            region: "R".into(),
            key: key(),
            first_pass: true,
            topologies: vec![
                (NodeId::generate(), Some(hash())),
                (NodeId::generate(), None),
            ],
            locks: vec![entry("a"), entry("b")],
        });
        round_trip(LockMessage::MigrationPrepareReply {
            region: "R".into(),
            key: key(),
            topology: hash(),
            locks: vec![entry("a")],
        });
        round_trip(LockMessage::MigrationApply {
            region: "R".into(),
            key: key(),
            locks: vec![entry("c")],
        });
        round_trip(LockMessage::MigrationApplyAck {
            region: "R".into(),
            key: key(),
        });
    }

    #[test]
    fn test_status_wire_values() {
        for status in [
            LockWireStatus::Ok,
            LockWireStatus::Busy,
            LockWireStatus::Timeout,
            LockWireStatus::Retry,
            LockWireStatus::NotOwner,
        ] {
            assert_eq!(LockWireStatus::from_wire(status.to_wire()).unwrap(), status);
        }
        assert!(LockWireStatus::from_wire(7).is_err());
    }
}
