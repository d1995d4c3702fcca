// Observable topology views.
//
// Listeners receive events strictly in topology-version order, serially per
// listener, each on its own dispatch task. A listener registered after the
// node joined receives a synthetic JOIN carrying the current topology first.
// Filtered views narrow the membership and emit independently versioned
// events; `await_for` resolves once a matching topology is observed and
// cancels on leave.

use crate::cluster::node::{Node, NodeId};
use crate::cluster::topology::{Topology, TopologySnapshot};
use crate::error::{ClusterError, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEventKind {
    /// First event a node (or a late listener) observes.
    Join,
    /// Membership changed.
    Change,
    /// The local node left the cluster.
    Leave,
}

/// One membership event.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    pub topology: TopologySnapshot,
    pub added: Vec<Node>,
    pub removed: Vec<Node>,
}

struct ViewShared {
    current: RwLock<TopologySnapshot>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ClusterEvent>>>,
    joined: AtomicBool,
    left: AtomicBool,
}

/// Handle onto an observable topology.
#[derive(Clone)]
pub struct ClusterView {
    shared: Arc<ViewShared>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ViewShared {
                current: RwLock::new(Arc::new(Topology::empty())),
                listeners: Mutex::new(Vec::new()),
                joined: AtomicBool::new(false),
                left: AtomicBool::new(false),
            }),
        }
    }

    /// The latest published snapshot.
    pub fn topology(&self) -> TopologySnapshot {
        self.shared.current.read().clone()
    }

    /// Subscribes to future events. If the node already joined, the first
    /// delivered event is a synthetic JOIN with the current topology.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Registration and the synthetic snapshot must agree, so both happen
        // under the listener lock.
        let mut listeners = self.shared.listeners.lock();
        if self.shared.joined.load(Ordering::Acquire) && !self.shared.left.load(Ordering::Acquire) {
            let current = self.shared.current.read().clone();
            let added: Vec<Node> = current.nodes().cloned().collect();
            let _ = tx.send(ClusterEvent {
                kind: ClusterEventKind::Join,
                topology: current,
                added,
                removed: Vec::new(),
            });
        }
        listeners.push(tx);
        rx
    }

    /// Runs `listener` serially for every event on a dedicated task.
    pub fn add_listener(&self, listener: impl Fn(ClusterEvent) + Send + Sync + 'static) {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                listener(event);
            }
        });
    }

    /// Publishes the next event; callers guarantee version monotonicity.
    pub(crate) fn publish(&self, event: ClusterEvent) {
        *self.shared.current.write() = event.topology.clone();
        match event.kind {
            ClusterEventKind::Join => {
                self.shared.joined.store(true, Ordering::Release);
            }
            ClusterEventKind::Leave => {
                self.shared.left.store(true, Ordering::Release);
            }
            ClusterEventKind::Change => {}
        }

        let mut listeners = self.shared.listeners.lock();
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Narrowed view. Filtered events carry their own version sequence and
    /// are emitted only when the filtered membership actually changes (or on
    /// join/leave).
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool + Send + Sync + 'static) -> ClusterView {
        let derived = ClusterView::new();
        let predicate = Arc::new(predicate);

        // Seed from the current topology if we already joined.
        let mut version: u64 = 0;
        if self.shared.joined.load(Ordering::Acquire) {
            let seed = self.topology().filter(|n| (predicate.as_ref())(n));
            version += 1;
            let seed = Arc::new(seed.with_version(version));
            let added: Vec<Node> = seed.nodes().cloned().collect();
            derived.publish(ClusterEvent {
                kind: ClusterEventKind::Join,
                topology: seed,
                added,
                removed: Vec::new(),
            });
        }

        let mut rx = self.subscribe();
        let forward = derived.clone();
        let seeded = version > 0;
        tokio::spawn(async move {
            let mut version = version;
            let mut first = true;
            while let Some(event) = rx.recv().await {
                let filtered = event.topology.filter(|n| (predicate.as_ref())(n));
                let previous = forward.topology();

                let membership_changed = {
                    let prev_ids: Vec<&NodeId> = previous.node_ids().collect();
                    let next_ids: Vec<&NodeId> = filtered.node_ids().collect();
                    prev_ids != next_ids
                };

                // The synthetic JOIN duplicates the seed; skip it.
                if first && seeded && event.kind == ClusterEventKind::Join && !membership_changed {
                    first = false;
                    continue;
                }
                first = false;

                let emit = match event.kind {
                    ClusterEventKind::Join | ClusterEventKind::Leave => true,
                    ClusterEventKind::Change => membership_changed,
                };
                if !emit {
                    continue;
                }

                version += 1;
                let next = Arc::new(filtered.with_version(version));
                let (added, removed) = diff(&previous, &next);
                forward.publish(ClusterEvent {
                    kind: event.kind,
                    topology: next,
                    added,
                    removed,
                });
            }
        });

        derived
    }

    /// Resolves once an observed topology satisfies the predicate; fails
    /// when the node leaves first.
    pub async fn await_for(
        &self,
        predicate: impl Fn(&Topology) -> bool + Send + 'static,
    ) -> Result<TopologySnapshot> {
        let mut rx = self.subscribe();

        if self.shared.joined.load(Ordering::Acquire) {
            let current = self.topology();
            if predicate(&current) {
                return Ok(current);
            }
        }

        while let Some(event) = rx.recv().await {
            if event.kind == ClusterEventKind::Leave {
                return Err(ClusterError::IllegalState(
                    "node left the cluster".to_string(),
                ));
            }
            if predicate(&event.topology) {
                return Ok(event.topology);
            }
        }

        Err(ClusterError::IllegalState(
            "cluster view closed".to_string(),
        ))
    }
}

impl Default for ClusterView {
    fn default() -> Self {
        Self::new()
    }
}

/// Added and removed members between two snapshots.
pub fn diff(previous: &Topology, next: &Topology) -> (Vec<Node>, Vec<Node>) {
    let added = next
        .nodes()
        .filter(|n| !previous.contains(&n.id))
        .cloned()
        .collect();
    let removed = previous
        .nodes()
        .filter(|n| !next.contains(&n.id))
        .cloned()
        .collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeAddress;
    use std::collections::BTreeMap;

    fn node(name: &str, join_order: u64) -> Node {
        let mut n = Node::new(name, NodeAddress::new("127.0.0.1", 7000));
        n.join_order = join_order;
        n
    }

    fn snapshot(version: u64, nodes: &[Node]) -> TopologySnapshot {
        let map: BTreeMap<NodeId, Node> = nodes.iter().map(|n| (n.id, n.clone())).collect();
        Arc::new(Topology::new(version, map))
    }

    fn join_event(version: u64, nodes: &[Node]) -> ClusterEvent {
        ClusterEvent {
            kind: ClusterEventKind::Join,
            topology: snapshot(version, nodes),
            added: nodes.to_vec(),
            removed: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_events_in_version_order() {
        let view = ClusterView::new();
        let mut rx = view.subscribe();

        let a = node("a", 1);
        let b = node("b", 2);

        view.publish(join_event(1, &[a.clone()]));
        view.publish(ClusterEvent {
            kind: ClusterEventKind::Change,
            topology: snapshot(2, &[a.clone(), b.clone()]),
            added: vec![b.clone()],
            removed: Vec::new(),
        });

        let e1 = rx.recv().await.unwrap();
        let e2 = rx.recv().await.unwrap();
        assert!(e1.topology.version() < e2.topology.version());
        assert_eq!(e1.kind, ClusterEventKind::Join);
        assert_eq!(e2.kind, ClusterEventKind::Change);
        assert_eq!(e2.added.len(), 1);
    }

    #[tokio::test]
    async fn test_late_listener_gets_synthetic_join() {
        let view = ClusterView::new();
        let a = node("a", 1);
        view.publish(join_event(1, &[a.clone()]));

        let mut rx = view.subscribe();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, ClusterEventKind::Join);
        assert_eq!(event.topology.version(), 1);
        assert_eq!(event.added.len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_view_narrows_membership() {
        let view = ClusterView::new();
        let mut worker = node("w", 1);
        worker.roles.insert("worker".to_string());
        let other = node("o", 2);

        view.publish(join_event(1, &[worker.clone(), other.clone()]));

        let filtered = view.filter(|n| n.has_role("worker"));
        let mut rx = filtered.subscribe();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topology.size(), 1);
        assert!(event.topology.contains(&worker.id));
    }

    #[tokio::test]
    async fn test_filtered_view_skips_unrelated_changes() {
        let view = ClusterView::new();
        let mut worker = node("w", 1);
        worker.roles.insert("worker".to_string());
        view.publish(join_event(1, &[worker.clone()]));

        let filtered = view.filter(|n| n.has_role("worker"));
        let mut rx = filtered.subscribe();
        assert_eq!(rx.recv().await.unwrap().kind, ClusterEventKind::Join);

        // An unrelated node joins; the filtered membership is unchanged.
        let other = node("o", 2);
        view.publish(ClusterEvent {
            kind: ClusterEventKind::Change,
            topology: snapshot(2, &[worker.clone(), other.clone()]),
            added: vec![other.clone()],
            removed: Vec::new(),
        });
        // A related node joins; this one must come through.
        let mut w2 = node("w2", 3);
        w2.roles.insert("worker".to_string());
        view.publish(ClusterEvent {
            kind: ClusterEventKind::Change,
            topology: snapshot(3, &[worker.clone(), other.clone(), w2.clone()]),
            added: vec![w2.clone()],
            removed: Vec::new(),
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ClusterEventKind::Change);
        assert_eq!(event.topology.size(), 2);
    }

    #[tokio::test]
    async fn test_await_for_resolves_on_match() {
        let view = ClusterView::new();
        let a = node("a", 1);
        view.publish(join_event(1, &[a.clone()]));

        let waiter = {
            let view = view.clone();
            tokio::spawn(async move { view.await_for(|t| t.size() >= 2).await })
        };

        let b = node("b", 2);
        view.publish(ClusterEvent {
            kind: ClusterEventKind::Change,
            topology: snapshot(2, &[a.clone(), b.clone()]),
            added: vec![b.clone()],
            removed: Vec::new(),
        });

        let topology = waiter.await.unwrap().unwrap();
        assert_eq!(topology.size(), 2);
    }

    #[tokio::test]
    async fn test_await_for_cancelled_on_leave() {
        let view = ClusterView::new();
        let a = node("a", 1);
        view.publish(join_event(1, &[a.clone()]));

        let waiter = {
            let view = view.clone();
            tokio::spawn(async move { view.await_for(|t| t.size() >= 5).await })
        };

        view.publish(ClusterEvent {
            kind: ClusterEventKind::Leave,
            topology: snapshot(2, &[]),
            added: Vec::new(),
            removed: vec![a],
        });

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClusterError::IllegalState(_))));
    }
}
