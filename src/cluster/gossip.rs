// Gossip roster and merge rules.
//
// The roster maps node ids to versioned entries. Merging keeps, per id, the
// entry with the highest version; ties break on status precedence
// (Failed > Down > Leaving > Up > Joining). Suspicions are union-merged and
// a node whose live suspicion count exceeds the failure quorum transitions
// to Failed. All mutation happens on the gossip worker, so this type is
// plain data.

use crate::cluster::node::{Node, NodeId, NodeStatus};
use crate::cluster::protocol::{DigestEntry, Rumor};
use std::collections::{BTreeMap, BTreeSet};

/// Rounds a terminal (Down/Failed) entry stays in the roster before being
/// purged.
const TERMINAL_PURGE_ROUNDS: u32 = 50;

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub node: Node,
    pub status: NodeStatus,
    pub version: u64,
    pub suspicions: BTreeSet<NodeId>,
    terminal_rounds: u32,
}

impl RosterEntry {
    fn new(node: Node, status: NodeStatus, version: u64) -> Self {
        Self {
            node,
            status,
            version,
            suspicions: BTreeSet::new(),
            terminal_rounds: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.status, NodeStatus::Joining | NodeStatus::Up)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, NodeStatus::Down | NodeStatus::Failed)
    }

    pub fn to_rumor(&self) -> Rumor {
        Rumor {
            node: self.node.clone(),
            status: self.status,
            version: self.version,
            suspicions: self.suspicions.clone(),
        }
    }

    fn from_rumor(rumor: Rumor) -> Self {
        Self {
            node: rumor.node,
            status: rumor.status,
            version: rumor.version,
            suspicions: rumor.suspicions,
            terminal_rounds: 0,
        }
    }
}

/// Outcome of merging a batch of rumors.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Any entry changed (status, version, membership or suspicions).
    pub changed: bool,
    /// Ids whose status or membership changed (not mere suspicion growth).
    pub updated: Vec<NodeId>,
}

#[derive(Debug)]
pub struct GossipState {
    local_id: NodeId,
    entries: BTreeMap<NodeId, RosterEntry>,
}

impl GossipState {
    pub fn new(local: Node, status: NodeStatus) -> Self {
        let local_id = local.id;
        let mut entries = BTreeMap::new();
        entries.insert(local_id, RosterEntry::new(local, status, 1));
        Self { local_id, entries }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn local(&self) -> &RosterEntry {
        &self.entries[&self.local_id]
    }

    pub fn get(&self, id: &NodeId) -> Option<&RosterEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.values()
    }

    /// Bumps the local Lamport counter and applies the new status.
    pub fn set_local_status(&mut self, status: NodeStatus) {
        let entry = self.entries.get_mut(&self.local_id).expect("local entry");
        entry.status = status;
        entry.version += 1;
    }

    /// Replaces the local node descriptor (join-order assignment).
    pub fn set_local_node(&mut self, node: Node) {
        let entry = self.entries.get_mut(&self.local_id).expect("local entry");
        entry.node = node;
        entry.version += 1;
    }

    pub fn digest(&self) -> Vec<DigestEntry> {
        self.entries
            .values()
            .map(|e| DigestEntry {
                id: e.node.id,
                status: e.status,
                version: e.version,
            })
            .collect()
    }

    pub fn rumors(&self) -> Vec<Rumor> {
        self.entries.values().map(RosterEntry::to_rumor).collect()
    }

    /// Entries the peer is missing or behind on, per its digest. Entries
    /// carrying suspicions are always included so suspicion unions converge
    /// without version bumps.
    pub fn deltas_for(&self, digest: &[DigestEntry]) -> Vec<Rumor> {
        let known: BTreeMap<NodeId, (NodeStatus, u64)> = digest
            .iter()
            .map(|d| (d.id, (d.status, d.version)))
            .collect();

        self.entries
            .values()
            .filter(|entry| match known.get(&entry.node.id) {
                None => true,
                Some((status, version)) => {
                    entry.version > *version
                        || (entry.version == *version
                            && entry.status.precedence() > status.precedence())
                        || !entry.suspicions.is_empty()
                }
            })
            .map(RosterEntry::to_rumor)
            .collect()
    }

    /// True when the peer's digest advertises anything newer than us.
    pub fn is_behind(&self, digest: &[DigestEntry]) -> bool {
        digest.iter().any(|d| match self.entries.get(&d.id) {
            None => true,
            Some(entry) => {
                d.version > entry.version
                    || (d.version == entry.version
                        && d.status.precedence() > entry.status.precedence())
            }
        })
    }

    /// Merges incoming rumors, returning what changed.
    pub fn merge(&mut self, rumors: Vec<Rumor>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for rumor in rumors {
            let id = rumor.node.id;

            if id == self.local_id {
                self.merge_about_self(rumor, &mut outcome);
                continue;
            }

            match self.entries.get_mut(&id) {
                None => {
                    self.entries.insert(id, RosterEntry::from_rumor(rumor));
                    outcome.changed = true;
                    outcome.updated.push(id);
                }
                Some(existing) => {
                    let supersedes = rumor.version > existing.version
                        || (rumor.version == existing.version
                            && rumor.status.precedence() > existing.status.precedence());

                    if supersedes {
                        let old_suspicions = std::mem::take(&mut existing.suspicions);
                        let status_changed = existing.status != rumor.status;
                        existing.node = rumor.node;
                        existing.status = rumor.status;
                        existing.version = rumor.version;
                        existing.suspicions = rumor.suspicions;
                        existing.suspicions.extend(old_suspicions);
                        existing.terminal_rounds = 0;
                        outcome.changed = true;
                        if status_changed {
                            outcome.updated.push(id);
                        }
                    } else {
                        // Union-merge suspicions even for stale rumors.
                        let before = existing.suspicions.len();
                        existing.suspicions.extend(rumor.suspicions);
                        if existing.suspicions.len() != before {
                            outcome.changed = true;
                        }
                    }
                }
            }
        }

        outcome
    }

    /// A peer's view of us with a competing version: reassert our own status
    /// above it so the refutation wins the merge everywhere.
    fn merge_about_self(&mut self, rumor: Rumor, outcome: &mut MergeOutcome) {
        let entry = self.entries.get_mut(&self.local_id).expect("local entry");
        if rumor.version >= entry.version && rumor.status != entry.status {
            entry.version = rumor.version + 1;
            outcome.changed = true;
        }
    }

    /// Records a local suspicion about a silent peer.
    pub fn suspect(&mut self, id: &NodeId) -> bool {
        let local_id = self.local_id;
        if let Some(entry) = self.entries.get_mut(id) {
            if entry.is_alive() {
                return entry.suspicions.insert(local_id);
            }
        }
        false
    }

    /// Clears our suspicion once the peer is heard from again.
    pub fn unsuspect(&mut self, id: &NodeId) -> bool {
        let local_id = self.local_id;
        self.entries
            .get_mut(id)
            .map(|e| e.suspicions.remove(&local_id))
            .unwrap_or(false)
    }

    /// Marks entries Failed whose live suspicion count exceeds the quorum
    /// fraction of UP members (excluding the suspect itself).
    pub fn apply_failure_quorum(&mut self, quorum: f64) -> Vec<NodeId> {
        let up: BTreeSet<NodeId> = self
            .entries
            .values()
            .filter(|e| e.status == NodeStatus::Up)
            .map(|e| e.node.id)
            .collect();

        let mut failed = Vec::new();
        for entry in self.entries.values_mut() {
            if !entry.is_alive() || entry.node.id == self.local_id {
                continue;
            }
            let eligible = up.iter().filter(|id| **id != entry.node.id).count();
            if eligible == 0 {
                continue;
            }
            let live_suspicions = entry
                .suspicions
                .iter()
                .filter(|id| up.contains(id) && **id != entry.node.id)
                .count();
            if (live_suspicions as f64) > (eligible as f64) * quorum {
                entry.status = NodeStatus::Failed;
                entry.version += 1;
                failed.push(entry.node.id);
            }
        }
        failed
    }

    /// Ages terminal entries and purges the long-dead ones.
    pub fn purge_terminal(&mut self) {
        let local_id = self.local_id;
        for entry in self.entries.values_mut() {
            if entry.is_terminal() {
                entry.terminal_rounds = entry.terminal_rounds.saturating_add(1);
            }
        }
        self.entries.retain(|id, entry| {
            *id == local_id || !entry.is_terminal() || entry.terminal_rounds < TERMINAL_PURGE_ROUNDS
        });
    }

    /// Live peers (Joining or Up), excluding the local node.
    pub fn alive_peers(&self) -> Vec<&Node> {
        self.entries
            .values()
            .filter(|e| e.is_alive() && e.node.id != self.local_id)
            .map(|e| &e.node)
            .collect()
    }

    /// Members that belong in the published topology.
    pub fn topology_nodes(&self) -> BTreeMap<NodeId, Node> {
        self.entries
            .values()
            .filter(|e| e.status == NodeStatus::Up)
            .map(|e| (e.node.id, e.node.clone()))
            .collect()
    }

    /// The next dense join order.
    pub fn next_join_order(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.node.join_order)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// UP member with the lowest join order.
    pub fn oldest_up(&self) -> Option<&Node> {
        self.entries
            .values()
            .filter(|e| e.status == NodeStatus::Up)
            .map(|e| &e.node)
            .min_by_key(|n| (n.join_order, n.id))
    }

    pub fn up_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.status == NodeStatus::Up)
            .count()
    }
}
