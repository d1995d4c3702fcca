// Cluster membership service.
//
// Owns the local node's lifecycle (Down -> Initializing -> Initialized ->
// Joining -> Synchronizing -> Up -> Leaving -> Down), the gossip worker, the
// join/leave exchanges and split-brain handling. Roster mutation is
// serialized behind one async mutex; outgoing messages are collected under
// the lock and sent after it is released.

use crate::cluster::gossip::GossipState;
use crate::cluster::join::{JoinContext, JoinValidatorChain};
use crate::cluster::node::{Node, NodeId, NodeState, NodeStatus};
use crate::cluster::protocol::{GossipMessage, GOSSIP_PROTOCOL};
use crate::cluster::seed::SeedNodeManager;
use crate::cluster::split_brain::{SplitBrainAction, SplitBrainDetector};
use crate::cluster::topology::Topology;
use crate::cluster::view::{diff, ClusterEvent, ClusterEventKind, ClusterView};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::network::client::NetworkClient;
use crate::network::connection::{ConnectionEvent, ConnectionSender};
use crate::network::transport::{Connector, ConnectorHandler, NetworkTransport};
use crate::runtime::guard::{GuardState, StateGuard};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{watch, Mutex, Notify};

struct GossipRuntime {
    state: GossipState,
    last_heard: HashMap<NodeId, Instant>,
}

enum ReplyTo {
    Conn(ConnectionSender),
    Client(NetworkClient),
}

impl ReplyTo {
    async fn send(&self, msg: &GossipMessage) -> Result<()> {
        match self {
            ReplyTo::Conn(sender) => sender.enqueue(msg.encode()).await,
            ReplyTo::Client(client) => client.enqueue(msg.encode()).await,
        }
    }
}

struct ClusterInner {
    config: ClusterConfig,
    transport: Arc<NetworkTransport>,
    seeds: SeedNodeManager,
    validators: JoinValidatorChain,
    detector: Option<Arc<dyn SplitBrainDetector>>,

    guard: StateGuard,
    state_tx: watch::Sender<NodeState>,
    view: ClusterView,
    local: RwLock<Node>,
    runtime: Mutex<Option<GossipRuntime>>,
    topology_version: AtomicU64,
    peers: DashMap<NodeId, NetworkClient>,
    leave_ack: Notify,
    stop_tx: watch::Sender<bool>,
}

/// Handle onto the membership service.
#[derive(Clone)]
pub struct ClusterService {
    inner: Arc<ClusterInner>,
}

struct GossipHandler {
    inner: Weak<ClusterInner>,
}

#[async_trait]
impl ConnectorHandler for GossipHandler {
    async fn on_message(&self, msg: Bytes, sender: &ConnectionSender) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        handle_message(&inner, msg, ReplyTo::Conn(sender.clone())).await;
    }
}

impl ClusterService {
    pub fn new(
        config: ClusterConfig,
        transport: Arc<NetworkTransport>,
        seeds: SeedNodeManager,
        validators: JoinValidatorChain,
        detector: Option<Arc<dyn SplitBrainDetector>>,
        local: Node,
    ) -> Self {
        let (state_tx, _) = watch::channel(NodeState::Down);
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClusterInner {
                config,
                transport,
                seeds,
                validators,
                detector,
                guard: StateGuard::new("cluster"),
                state_tx,
                view: ClusterView::new(),
                local: RwLock::new(local),
                runtime: Mutex::new(None),
                topology_version: AtomicU64::new(0),
                peers: DashMap::new(),
                leave_ack: Notify::new(),
                stop_tx,
            }),
        }
    }

    pub fn view(&self) -> ClusterView {
        self.inner.view.clone()
    }

    pub fn local_node(&self) -> Node {
        self.inner.local.read().clone()
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local.read().id
    }

    /// Fixes the advertised address once the transport is bound.
    pub fn update_local_address(&self, address: crate::cluster::node::NodeAddress) {
        self.inner.local.write().address = address;
    }

    pub fn state(&self) -> NodeState {
        *self.inner.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<NodeState> {
        self.inner.state_tx.subscribe()
    }

    /// Registers the gossip connector and starts seed discovery.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .guard
            .transition(&[GuardState::Down], GuardState::Initializing)?;
        set_state(&self.inner, NodeState::Initializing);

        self.inner.transport.register(Connector::new(
            GOSSIP_PROTOCOL,
            Arc::new(GossipHandler {
                inner: Arc::downgrade(&self.inner),
            }),
        ))?;

        let local_addr = self.local_socket_addr()?;
        self.inner.seeds.start(local_addr).await?;

        self.inner
            .guard
            .transition(&[GuardState::Initializing], GuardState::Initialized)?;
        set_state(&self.inner, NodeState::Initialized);
        Ok(())
    }

    fn local_socket_addr(&self) -> Result<SocketAddr> {
        self.inner.local.read().address.to_socket_addr()
    }

    /// Joins the cluster: split-brain gate, seed discovery, join exchange,
    /// then the gossip worker.
    pub async fn join(&self) -> Result<()> {
        self.inner.guard.ensure_initialized()?;

        // Split-brain gate: poll until the detector reports a valid view.
        // Each invalid poll under the Rejoin action mints a fresh identity.
        if let Some(detector) = self.inner.detector.clone() {
            loop {
                let local = self.local_node();
                match detector.is_valid(&local) {
                    Ok(true) => break,
                    Ok(false) => match self.inner.config.split_brain_action {
                        SplitBrainAction::Rejoin => {
                            regenerate_identity(&self.inner);
                            tokio::time::sleep(self.inner.config.split_brain_check_interval).await;
                        }
                        SplitBrainAction::Terminate => {
                            self.terminate().await?;
                            return Err(ClusterError::IllegalState(
                                "split-brain detector rejected the join".to_string(),
                            ));
                        }
                    },
                    Err(e) => {
                        tracing::error!(error = %e, "split-brain detector failed, terminating");
                        self.terminate().await?;
                        return Err(e);
                    }
                }
            }
        }

        set_state(&self.inner, NodeState::Joining);

        let local_addr = self.local_socket_addr()?;
        let mut seeds = self.inner.seeds.seed_nodes().await?;
        seeds.retain(|addr| *addr != local_addr);
        seeds.shuffle(&mut rand::thread_rng());

        let mut rejected: Option<ClusterError> = None;
        let mut joined = false;

        for seed in seeds {
            match self.try_join_via(seed).await {
                Ok(true) => {
                    joined = true;
                    break;
                }
                Ok(false) => continue,
                Err(e @ ClusterError::JoinRejected { .. }) => {
                    rejected = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::debug!(%seed, error = %e, "join attempt failed, trying next seed");
                }
            }
        }

        if let Some(e) = rejected {
            set_state(&self.inner, NodeState::Down);
            return Err(e);
        }

        if !joined {
            self.become_founder().await;
        }

        set_state(&self.inner, NodeState::Synchronizing);
        self.promote_to_up().await;
        set_state(&self.inner, NodeState::Up);

        self.spawn_gossip_worker();
        tracing::info!(node = %self.local_node(), "joined the cluster");
        Ok(())
    }

    /// One join exchange with one seed. `Ok(true)` means accepted.
    async fn try_join_via(&self, seed: SocketAddr) -> Result<bool> {
        let net = self.inner.transport.config().clone();
        let request = GossipMessage::JoinRequest {
            node: self.local_node(),
            cluster: self.inner.config.cluster_name.clone(),
        };

        let (client, mut events) =
            NetworkClient::connect(seed, GOSSIP_PROTOCOL, Bytes::new(), &net).await?;
        client.send(request.encode()).await?;

        let reply = tokio::time::timeout(net.connect_timeout, events.recv())
            .await
            .map_err(|_| ClusterError::Timeout(format!("join reply from {} timed out", seed)))?;

        let payload = match reply {
            Some(ConnectionEvent::Message(payload)) => payload,
            Some(ConnectionEvent::Disconnected(Some(e))) => return Err(e),
            _ => {
                return Err(ClusterError::ChannelClosed(format!(
                    "{} closed during join",
                    seed
                )))
            }
        };

        match GossipMessage::decode(payload)? {
            GossipMessage::JoinAccept { join_order, roster } => {
                {
                    let mut local = self.inner.local.write();
                    local.join_order = join_order;
                }
                let local = self.local_node();
                let mut state = GossipState::new(local, NodeStatus::Joining);
                state.merge(roster);

                // Versions observed by this instance start where the cluster
                // already is: the first published topology carries at least
                // the local join order.
                self.inner
                    .topology_version
                    .store(join_order.saturating_sub(1), Ordering::Relaxed);

                let mut runtime = self.inner.runtime.lock().await;
                *runtime = Some(GossipRuntime {
                    state,
                    last_heard: HashMap::new(),
                });
                drop(runtime);

                // The gossip worker opens its own pooled connections.
                client.disconnect();
                Ok(true)
            }
            GossipMessage::JoinReject {
                reason,
                rejected_by,
            } => Err(ClusterError::JoinRejected {
                reason,
                rejected_by: rejected_by.to_string(),
            }),
            other => Err(ClusterError::Codec(format!(
                "unexpected join reply: {:?}",
                message_kind(&other)
            ))),
        }
    }

    /// No reachable seed: this node founds the cluster with join order 1.
    async fn become_founder(&self) {
        {
            let mut local = self.inner.local.write();
            local.join_order = 1;
        }
        let local = self.local_node();
        tracing::info!(node = %local, "no reachable seeds, founding a new cluster");

        let mut runtime = self.inner.runtime.lock().await;
        *runtime = Some(GossipRuntime {
            state: GossipState::new(local, NodeStatus::Joining),
            last_heard: HashMap::new(),
        });
    }

    /// Marks the local node UP, publishes the local JOIN event and pushes an
    /// immediate gossip round.
    async fn promote_to_up(&self) {
        let outgoing = {
            let mut runtime = self.inner.runtime.lock().await;
            let runtime = runtime.as_mut().expect("runtime after join");
            runtime.state.set_local_status(NodeStatus::Up);
            publish_from_state(&self.inner, &runtime.state, Some(ClusterEventKind::Join));
            gossip_round_messages(&runtime.state, self.inner.config.gossip_fanout)
        };
        self.send_gossip(outgoing).await;
    }

    fn spawn_gossip_worker(&self) {
        let inner = self.inner.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.gossip_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous_up = 0usize;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let (outgoing, up_now) = {
                    let mut runtime = inner.runtime.lock().await;
                    let Some(runtime) = runtime.as_mut() else {
                        continue;
                    };

                    detect_failures(&inner, runtime);
                    runtime.state.purge_terminal();
                    publish_from_state(&inner, &runtime.state, None);

                    (
                        gossip_round_messages(&runtime.state, inner.config.gossip_fanout),
                        runtime.state.up_count(),
                    )
                };

                // Suddenly alone after being in company: consult the
                // split-brain detector.
                if up_now == 1 && previous_up > 1 {
                    check_split_brain(&inner).await;
                }
                previous_up = up_now;

                send_gossip_messages(&inner, outgoing).await;
            }
        });
    }

    async fn send_gossip(&self, outgoing: Vec<(Node, GossipMessage)>) {
        send_gossip_messages(&self.inner, outgoing).await;
    }

    /// Graceful leave: gossip Leaving, await one ack, then stop.
    pub async fn leave(&self) -> Result<()> {
        if self.state() != NodeState::Up {
            return self.terminate().await;
        }

        set_state(&self.inner, NodeState::Leaving);

        let (outgoing, has_peers) = {
            let mut runtime = self.inner.runtime.lock().await;
            match runtime.as_mut() {
                Some(runtime) => {
                    runtime.state.set_local_status(NodeStatus::Leaving);
                    let peers = !runtime.state.alive_peers().is_empty();
                    (
                        gossip_round_messages(&runtime.state, usize::MAX),
                        peers,
                    )
                }
                None => (Vec::new(), false),
            }
        };

        if has_peers {
            // `notify_one` on the ack side stores a permit, so an ack racing
            // ahead of this wait is not lost.
            let acked = self.inner.leave_ack.notified();
            self.send_gossip(outgoing).await;
            if tokio::time::timeout(self.inner.config.leave_timeout, acked)
                .await
                .is_err()
            {
                tracing::warn!("leave not acknowledged in time, escalating to terminate");
            }
        }

        self.shutdown_core(NodeState::Down).await;
        Ok(())
    }

    /// Immediate stop without the leave exchange; peers detect the failure.
    /// Idempotent: terminating an already-stopped node is a no-op.
    pub async fn terminate(&self) -> Result<()> {
        if self.inner.guard.state() == GuardState::Terminated && self.state() == NodeState::Down {
            return Ok(());
        }
        set_state(&self.inner, NodeState::Terminating);
        self.shutdown_core(NodeState::Down).await;
        Ok(())
    }

    async fn shutdown_core(&self, final_state: NodeState) {
        self.inner.stop_tx.send_replace(true);

        for entry in self.inner.peers.iter() {
            entry.value().disconnect();
        }
        self.inner.peers.clear();

        if let Ok(local_addr) = self.local_socket_addr() {
            if let Err(e) = self.inner.seeds.stop(local_addr).await {
                tracing::warn!(error = %e, "seed discovery stop failed");
            }
        }

        let was_joined = {
            let mut runtime = self.inner.runtime.lock().await;
            runtime.take().is_some()
        };

        if was_joined {
            let version = self.inner.topology_version.fetch_add(1, Ordering::Relaxed) + 1;
            let previous = self.inner.view.topology();
            let empty = Arc::new(Topology::new(version, Default::default()));
            let (_, removed) = diff(&previous, &empty);
            self.inner.view.publish(ClusterEvent {
                kind: ClusterEventKind::Leave,
                topology: empty,
                added: Vec::new(),
                removed,
            });
        }

        self.inner.guard.force(GuardState::Terminated);
        set_state(&self.inner, final_state);
        tracing::info!(node = %self.local_node(), "left the cluster");
    }

    /// Terminates and joins again with a fresh identity.
    pub async fn rejoin(&self) -> Result<()> {
        tracing::info!("rejoining with a fresh identity");
        self.terminate().await?;

        regenerate_identity(&self.inner);
        self.inner.stop_tx.send_replace(false);
        self.inner.guard.force(GuardState::Initialized);

        let local_addr = self.local_socket_addr()?;
        self.inner.seeds.start(local_addr).await?;
        self.join().await
    }
}

fn set_state(inner: &ClusterInner, state: NodeState) {
    let previous = *inner.state_tx.borrow();
    if previous != state {
        tracing::debug!(from = %previous, to = %state, "lifecycle transition");
        inner.state_tx.send_replace(state);
    }
}

fn regenerate_identity(inner: &ClusterInner) {
    let mut local = inner.local.write();
    let fresh = Node {
        id: NodeId::generate(),
        name: local.name.clone(),
        address: local.address.clone(),
        roles: local.roles.clone(),
        properties: local.properties.clone(),
        join_order: 0,
    };
    tracing::debug!(old = %local.id, new = %fresh.id, "minted fresh identity");
    *local = fresh;
}

fn message_kind(msg: &GossipMessage) -> &'static str {
    match msg {
        GossipMessage::JoinRequest { .. } => "JoinRequest",
        GossipMessage::JoinAccept { .. } => "JoinAccept",
        GossipMessage::JoinReject { .. } => "JoinReject",
        GossipMessage::Update { .. } => "Update",
        GossipMessage::UpdateReply { .. } => "UpdateReply",
        GossipMessage::LeaveAck { .. } => "LeaveAck",
    }
}

/// Publishes a new topology snapshot when the UP membership changed (or
/// unconditionally for the local JOIN event) and refreshes the seed
/// manager's alive set.
fn publish_from_state(inner: &ClusterInner, state: &GossipState, kind: Option<ClusterEventKind>) {
    let nodes = state.topology_nodes();
    let current = inner.view.topology();

    let current_ids: BTreeSet<NodeId> = current.node_ids().copied().collect();
    let next_ids: BTreeSet<NodeId> = nodes.keys().copied().collect();
    let forced = matches!(kind, Some(ClusterEventKind::Join));
    if current_ids == next_ids && !forced {
        return;
    }

    let version = inner.topology_version.fetch_add(1, Ordering::Relaxed) + 1;
    let next = Arc::new(Topology::new(version, nodes));
    let (added, removed) = diff(&current, &next);

    tracing::debug!(
        version,
        size = next.size(),
        added = added.len(),
        removed = removed.len(),
        "topology updated"
    );

    inner.view.publish(ClusterEvent {
        kind: kind.unwrap_or(ClusterEventKind::Change),
        topology: next,
        added,
        removed,
    });

    let alive: HashSet<SocketAddr> = state
        .entries()
        .filter(|e| e.is_alive())
        .filter_map(|e| {
            let ip: std::net::IpAddr = e.node.address.host.parse().ok()?;
            Some(SocketAddr::new(ip, e.node.address.port))
        })
        .collect();
    inner.seeds.update_alive(alive);
}

/// Suspects silent peers and applies the failure quorum.
fn detect_failures(inner: &ClusterInner, runtime: &mut GossipRuntime) {
    let now = Instant::now();
    let timeout = inner.config.suspect_timeout;

    let peers: Vec<NodeId> = runtime
        .state
        .alive_peers()
        .iter()
        .map(|n| n.id)
        .collect();

    for id in peers {
        let heard = runtime.last_heard.entry(id).or_insert(now);
        if now.duration_since(*heard) > timeout {
            if runtime.state.suspect(&id) {
                tracing::debug!(peer = %id, "suspecting silent peer");
            }
        }
    }

    for failed in runtime
        .state
        .apply_failure_quorum(inner.config.failure_quorum)
    {
        tracing::info!(peer = %failed, "peer failed (suspicion quorum reached)");
        runtime.last_heard.remove(&failed);
    }
}

/// Picks up to `fanout` random live peers and builds their updates.
fn gossip_round_messages(state: &GossipState, fanout: usize) -> Vec<(Node, GossipMessage)> {
    let peers = state.alive_peers();
    if peers.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<Node> = peers.into_iter().cloned().collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(fanout.max(1).min(candidates.len()));

    let sender = state.local_id();
    let digest = state.digest();
    let rumors = state.rumors();

    candidates
        .into_iter()
        .map(|node| {
            (
                node,
                GossipMessage::Update {
                    sender,
                    digest: digest.clone(),
                    rumors: rumors.clone(),
                },
            )
        })
        .collect()
}

async fn send_gossip_messages(inner: &Arc<ClusterInner>, outgoing: Vec<(Node, GossipMessage)>) {
    for (node, msg) in outgoing {
        let client = peer_client(inner, &node);
        if let Err(e) = client.enqueue(msg.encode()).await {
            tracing::debug!(peer = %node, error = %e, "gossip send failed");
            inner.peers.remove(&node.id);
        }
    }
}

/// Cached outbound gossip connection to a peer; reconnects on demand.
fn peer_client(inner: &Arc<ClusterInner>, node: &Node) -> NetworkClient {
    if let Some(existing) = inner.peers.get(&node.id) {
        if existing.state() != crate::network::client::ClientState::Disconnected {
            return existing.clone();
        }
    }

    let addr = match node.address.to_socket_addr() {
        Ok(addr) => addr,
        Err(_) => {
            // Unresolvable peer: return a client that will fail fast.
            let fallback: SocketAddr = ([127, 0, 0, 1], 1).into();
            let (client, _events) = NetworkClient::open(
                fallback,
                GOSSIP_PROTOCOL,
                Bytes::new(),
                inner.transport.config(),
            );
            return client;
        }
    };

    let (client, mut events) = NetworkClient::open(
        addr,
        GOSSIP_PROTOCOL,
        Bytes::new(),
        inner.transport.config(),
    );
    inner.peers.insert(node.id, client.clone());

    // Replies arriving on this outbound connection feed the same handler.
    let weak = Arc::downgrade(inner);
    let reply_client = client.clone();
    let peer_id = node.id;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(payload) => {
                    let Some(inner) = weak.upgrade() else { break };
                    handle_message(&inner, payload, ReplyTo::Client(reply_client.clone())).await;
                }
                ConnectionEvent::Disconnected(_) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.peers.remove(&peer_id);
                    }
                    break;
                }
            }
        }
    });

    client
}

/// Dispatches one inbound gossip payload.
async fn handle_message(inner: &Arc<ClusterInner>, payload: Bytes, reply: ReplyTo) {
    let msg = match GossipMessage::decode(payload) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed gossip message");
            return;
        }
    };

    match msg {
        GossipMessage::JoinRequest { node, cluster } => {
            handle_join_request(inner, node, cluster, reply).await;
        }
        GossipMessage::Update {
            sender,
            digest,
            rumors,
        } => {
            let (reply_msg, ack_leaving) = {
                let mut runtime = inner.runtime.lock().await;
                let Some(runtime) = runtime.as_mut() else {
                    return;
                };

                let leaving = rumors
                    .iter()
                    .any(|r| r.node.id == sender && r.status == NodeStatus::Leaving);

                let outcome = runtime.state.merge(rumors);
                runtime.last_heard.insert(sender, Instant::now());
                runtime.state.unsuspect(&sender);

                if outcome.changed {
                    publish_from_state(inner, &runtime.state, None);
                }

                let deltas = runtime.state.deltas_for(&digest);
                let reply_msg = if deltas.is_empty() {
                    None
                } else {
                    Some(GossipMessage::UpdateReply {
                        sender: runtime.state.local_id(),
                        rumors: deltas,
                    })
                };
                let ack = leaving.then(|| GossipMessage::LeaveAck {
                    sender: runtime.state.local_id(),
                });
                (reply_msg, ack)
            };

            if let Some(msg) = reply_msg {
                let _ = reply.send(&msg).await;
            }
            if let Some(ack) = ack_leaving {
                let _ = reply.send(&ack).await;
            }
        }
        GossipMessage::UpdateReply { sender, rumors } => {
            let mut runtime = inner.runtime.lock().await;
            let Some(runtime) = runtime.as_mut() else {
                return;
            };
            let outcome = runtime.state.merge(rumors);
            runtime.last_heard.insert(sender, Instant::now());
            runtime.state.unsuspect(&sender);
            if outcome.changed {
                publish_from_state(inner, &runtime.state, None);
            }
        }
        GossipMessage::LeaveAck { sender } => {
            tracing::debug!(peer = %sender, "leave acknowledged");
            inner.leave_ack.notify_one();
        }
        GossipMessage::JoinAccept { .. } | GossipMessage::JoinReject { .. } => {
            tracing::trace!("ignoring stray join reply");
        }
    }
}

/// The accepting side of a join: validator chain, join-order assignment and
/// the roster reply.
async fn handle_join_request(
    inner: &Arc<ClusterInner>,
    mut node: Node,
    cluster: String,
    reply: ReplyTo,
) {
    let local = inner.local.read().clone();

    let reject_reason = if cluster != inner.config.cluster_name {
        Some(format!(
            "cluster name mismatch: expected '{}', got '{}'",
            inner.config.cluster_name, cluster
        ))
    } else {
        let ctx = JoinContext {
            cluster_name: inner.config.cluster_name.clone(),
            local: local.clone(),
        };
        inner.validators.validate(&node, &ctx)
    };

    if let Some(reason) = reject_reason {
        tracing::info!(joining = %node, reason = %reason, "rejecting join");
        let _ = reply
            .send(&GossipMessage::JoinReject {
                reason,
                rejected_by: local.id,
            })
            .await;
        return;
    }

    let accept = {
        let mut runtime = inner.runtime.lock().await;
        let Some(runtime) = runtime.as_mut() else {
            // Not a member ourselves yet; the joiner will try another seed.
            return;
        };

        let join_order = runtime.state.next_join_order();
        node.join_order = join_order;

        runtime.state.merge(vec![crate::cluster::protocol::Rumor {
            node: node.clone(),
            status: NodeStatus::Joining,
            version: 1,
            suspicions: BTreeSet::new(),
        }]);
        runtime.last_heard.insert(node.id, Instant::now());

        tracing::info!(joining = %node, join_order, "accepted join");
        GossipMessage::JoinAccept {
            join_order,
            roster: runtime.state.rumors(),
        }
    };

    let _ = reply.send(&accept).await;
}

/// Consults the detector when gossip leaves this node alone in a partition.
async fn check_split_brain(inner: &Arc<ClusterInner>) {
    let Some(detector) = inner.detector.clone() else {
        return;
    };
    let local = inner.local.read().clone();

    let service = ClusterService {
        inner: inner.clone(),
    };

    match detector.is_valid(&local) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(action = ?inner.config.split_brain_action, "split-brain detected");
            match inner.config.split_brain_action {
                SplitBrainAction::Rejoin => {
                    tokio::spawn(async move {
                        if let Err(e) = service.rejoin().await {
                            tracing::error!(error = %e, "rejoin after split-brain failed");
                        }
                    });
                }
                SplitBrainAction::Terminate => {
                    tokio::spawn(async move {
                        let _ = service.terminate().await;
                    });
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "split-brain detector failed, terminating");
            tokio::spawn(async move {
                let _ = service.terminate().await;
            });
        }
    }
}
