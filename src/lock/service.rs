// Distributed lock service.
//
// Ownership of each (region, name) pair is arbitrated by its manager node:
// the hash of the name selects one slot in the sorted node-id list of the
// current topology. Clients route requests to the manager and transparently
// retry on Retry responses (stale topology, migration in progress). On
// topology change the oldest member runs the two-phase prepare/apply
// migration that rebalances the stored ownerships.

use crate::cluster::node::{Node, NodeId};
use crate::cluster::topology::Topology;
use crate::cluster::view::{ClusterEventKind, ClusterView};
use crate::config::NetworkConfig;
use crate::error::{ClusterError, Result};
use crate::lock::protocol::{
    LockEntry, LockMessage, LockMigrationKey, LockWireStatus, LOCK_PROTOCOL,
};
use crate::lock::region::RegionCore;
use crate::messaging::protocol::affinity_hash;
use crate::network::client::{ClientState, NetworkClient};
use crate::network::connection::{ConnectionEvent, ConnectionSender};
use crate::network::transport::{Connector, ConnectorHandler, NetworkTransport};
use crate::runtime::guard::{GuardState, StateGuard};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

/// Stable per-thread token standing in for the owner thread id.
pub fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

/// The manager node for a lock name under a topology.
pub fn manager_of(topology: &Topology, name: &str) -> Option<NodeId> {
    let ids: Vec<NodeId> = topology.node_ids().copied().collect();
    if ids.is_empty() {
        return None;
    }
    let index = (affinity_hash(name.as_bytes()) as u32 as usize) % ids.len();
    Some(ids[index])
}

/// Dedupes collected entries by name (highest lock id wins) and drops
/// ownerships whose owner is gone from the topology.
fn merge_entries(entries: Vec<LockEntry>, topology: &Topology) -> Vec<LockEntry> {
    let mut merged: HashMap<String, LockEntry> = HashMap::new();
    for entry in entries {
        if !topology.contains(&entry.owner) {
            continue;
        }
        match merged.get(&entry.name) {
            Some(existing) if existing.lock_id >= entry.lock_id => {}
            _ => {
                merged.insert(entry.name.clone(), entry);
            }
        }
    }
    merged.into_values().collect()
}

#[derive(Clone)]
struct LockConnection {
    client: NetworkClient,
    pending: Arc<DashMap<u64, oneshot::Sender<LockMessage>>>,
}

struct LockInner {
    transport: Arc<NetworkTransport>,
    cluster: ClusterView,
    net: NetworkConfig,
    guard: StateGuard,
    local_id: Arc<dyn Fn() -> NodeId + Send + Sync>,
    regions: RwLock<HashMap<String, Arc<RegionCore<ConnectionSender>>>>,
    connections: DashMap<NodeId, LockConnection>,
    /// Locks held by this node as a client, keyed by (region, name). These
    /// are reported during migration so ownership survives a manager's
    /// death.
    held: DashMap<(String, String), LockEntry>,
    op_seq: AtomicU64,
    migration_seq: AtomicU64,
}

impl LockInner {
    fn local(&self) -> NodeId {
        (self.local_id.as_ref())()
    }
}

/// Every ownership this node can attest to for a region: what it manages
/// plus what it holds itself.
fn attested_entries(inner: &LockInner, region: &RegionCore<ConnectionSender>) -> Vec<LockEntry> {
    let mut entries = region.local_entries();
    for held in inner.held.iter() {
        if held.key().0 == region.name() {
            entries.push(held.value().clone());
        }
    }
    entries
}

/// Handle onto the lock subsystem.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockInner>,
}

struct LockHandler {
    inner: Weak<LockInner>,
}

#[async_trait]
impl ConnectorHandler for LockHandler {
    async fn on_message(&self, msg: Bytes, sender: &ConnectionSender) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match LockMessage::decode(msg) {
            Ok(msg) => handle_server_message(&inner, msg, sender).await,
            Err(e) => {
                tracing::warn!(error = %e, "malformed lock message, closing connection");
                sender.disconnect();
            }
        }
    }
}

impl LockService {
    pub fn new(
        transport: Arc<NetworkTransport>,
        cluster: ClusterView,
        local_id: Arc<dyn Fn() -> NodeId + Send + Sync>,
    ) -> Self {
        let net = transport.config().clone();
        Self {
            inner: Arc::new(LockInner {
                transport,
                cluster,
                net,
                guard: StateGuard::new("locks"),
                local_id,
                regions: RwLock::new(HashMap::new()),
                connections: DashMap::new(),
                held: DashMap::new(),
                op_seq: AtomicU64::new(1),
                migration_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Declares a region; must happen before `initialize`.
    pub fn register_region(&self, name: impl Into<String>) -> Result<()> {
        if self.inner.guard.state() != GuardState::Down {
            return Err(ClusterError::IllegalState(
                "regions must be registered before the lock service initializes".to_string(),
            ));
        }
        let name = name.into();
        let mut regions = self.inner.regions.write();
        if regions.contains_key(&name) {
            return Err(ClusterError::Configuration(format!(
                "duplicate lock region: {}",
                name
            )));
        }
        regions.insert(name.clone(), Arc::new(RegionCore::new(name)));
        Ok(())
    }

    /// Registers the lock connector and the migration trigger.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .guard
            .transition(&[GuardState::Down], GuardState::Initializing)?;

        self.inner.transport.register(Connector::new(
            LOCK_PROTOCOL,
            Arc::new(LockHandler {
                inner: Arc::downgrade(&self.inner),
            }),
        ))?;

        // Rebalance on every membership change.
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.cluster.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if event.kind == ClusterEventKind::Leave {
                    break;
                }
                handle_topology_change(&inner, event.topology.clone());
            }
        });

        self.inner
            .guard
            .transition(&[GuardState::Initializing], GuardState::Initialized)?;
        Ok(())
    }

    pub fn region(&self, name: &str) -> Result<LockRegion> {
        self.inner.guard.ensure_initialized()?;
        let exists = self.inner.regions.read().contains_key(name);
        if !exists {
            return Err(ClusterError::Lock(format!("unknown lock region: {}", name)));
        }
        Ok(LockRegion {
            name: name.to_string(),
            inner: self.inner.clone(),
        })
    }

    pub async fn terminate(&self) -> Result<()> {
        for entry in self.inner.connections.iter() {
            entry.value().client.disconnect();
        }
        self.inner.connections.clear();
        self.inner.guard.force(GuardState::Terminated);
        Ok(())
    }
}

/// Client handle for one region.
#[derive(Clone)]
pub struct LockRegion {
    name: String,
    inner: Arc<LockInner>,
}

/// Owner information returned by `owner_of`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub node: NodeId,
    pub thread_id: u64,
}

/// A held lock; unlocking consumes it.
pub struct LockHandle {
    region: String,
    name: String,
    lock_id: u64,
    inner: Arc<LockInner>,
}

impl LockRegion {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires, waiting as long as it takes.
    pub async fn lock(&self, name: &str) -> Result<LockHandle> {
        match self.acquire(name, -1).await? {
            Some(handle) => Ok(handle),
            None => Err(ClusterError::Lock(format!(
                "unbounded lock wait for {}:{} ended without a grant",
                self.name, name
            ))),
        }
    }

    /// Attempts to acquire within `timeout`; `None` when busy past the
    /// deadline.
    pub async fn try_lock(&self, name: &str, timeout: Duration) -> Result<Option<LockHandle>> {
        self.acquire(name, timeout.as_millis() as i64).await
    }

    async fn acquire(&self, name: &str, timeout_ms: i64) -> Result<Option<LockHandle>> {
        self.inner.guard.ensure_initialized()?;
        let thread_id = current_thread_token();

        let overall_deadline = (timeout_ms >= 0).then(|| {
            tokio::time::Instant::now()
                + Duration::from_millis(timeout_ms as u64)
                + self.inner.net.connect_timeout
        });

        loop {
            let topology = self.inner.cluster.topology();
            if topology.is_empty() {
                return Err(ClusterError::Lock(
                    "no topology: the node has not joined".to_string(),
                ));
            }
            let manager = manager_of(&topology, name).expect("non-empty topology");
            let lock_id = self.inner.op_seq.fetch_add(1, Ordering::Relaxed);

            let request = LockMessage::LockRequest {
                lock_id,
                region: self.name.clone(),
                name: name.to_string(),
                timeout_ms,
                want_feedback: false,
                thread_id,
                topology: topology.hash(),
                requester: self.inner.local(),
            };

            let rpc_timeout = overall_deadline
                .map(|d| d.saturating_duration_since(tokio::time::Instant::now()));

            match request_response(&self.inner, manager, request, rpc_timeout).await {
                Ok(LockMessage::LockResponse { status, .. }) => match status {
                    LockWireStatus::Ok => {
                        self.inner.held.insert(
                            (self.name.clone(), name.to_string()),
                            LockEntry {
                                name: name.to_string(),
                                lock_id,
                                thread_id,
                                owner: self.inner.local(),
                            },
                        );
                        return Ok(Some(LockHandle {
                            region: self.name.clone(),
                            name: name.to_string(),
                            lock_id,
                            inner: self.inner.clone(),
                        }))
                    }
                    LockWireStatus::Busy | LockWireStatus::Timeout => return Ok(None),
                    LockWireStatus::Retry => {
                        if let Some(deadline) = overall_deadline {
                            if tokio::time::Instant::now() >= deadline {
                                return Ok(None);
                            }
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    LockWireStatus::NotOwner => {
                        return Err(ClusterError::Lock(
                            "unexpected NotOwner response to a lock request".to_string(),
                        ))
                    }
                },
                Ok(other) => {
                    return Err(ClusterError::Lock(format!(
                        "unexpected lock reply: {:?}",
                        other
                    )))
                }
                Err(e) if e.is_transient() => {
                    // Manager unreachable; the topology will catch up.
                    if let Some(deadline) = overall_deadline {
                        if tokio::time::Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                    tracing::debug!(region = %self.name, name, error = %e, "lock attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Current owner of a lock name, if held.
    pub async fn owner_of(&self, name: &str) -> Result<Option<LockOwner>> {
        self.inner.guard.ensure_initialized()?;

        for _ in 0..64 {
            let topology = self.inner.cluster.topology();
            if topology.is_empty() {
                return Err(ClusterError::Lock(
                    "no topology: the node has not joined".to_string(),
                ));
            }
            let manager = manager_of(&topology, name).expect("non-empty topology");
            let query_id = self.inner.op_seq.fetch_add(1, Ordering::Relaxed);

            let request = LockMessage::OwnerRequest {
                query_id,
                region: self.name.clone(),
                name: name.to_string(),
                topology: topology.hash(),
            };

            match request_response(
                &self.inner,
                manager,
                request,
                Some(self.inner.net.connect_timeout),
            )
            .await
            {
                Ok(LockMessage::OwnerResponse {
                    status,
                    thread_id,
                    owner,
                    ..
                }) => match status {
                    LockWireStatus::Ok => {
                        return Ok(owner.map(|node| LockOwner { node, thread_id }))
                    }
                    LockWireStatus::Retry => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    other => {
                        return Err(ClusterError::Lock(format!(
                            "unexpected owner query status: {:?}",
                            other
                        )))
                    }
                },
                Ok(other) => {
                    return Err(ClusterError::Lock(format!(
                        "unexpected owner reply: {:?}",
                        other
                    )))
                }
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Lock(format!(
            "owner query for {}:{} did not settle",
            self.name, name
        )))
    }
}

impl LockHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    /// Releases the lock; stale releases are tolerated.
    pub async fn unlock(self) -> Result<()> {
        for _ in 0..64 {
            let topology = self.inner.cluster.topology();
            if topology.is_empty() {
                return Ok(());
            }
            let manager = manager_of(&topology, &self.name).expect("non-empty topology");

            let request = LockMessage::UnlockRequest {
                lock_id: self.lock_id,
                region: self.region.clone(),
                name: self.name.clone(),
                topology: topology.hash(),
                requester: self.inner.local(),
            };

            match request_response(
                &self.inner,
                manager,
                request,
                Some(self.inner.net.connect_timeout),
            )
            .await
            {
                Ok(LockMessage::UnlockResponse { status, .. }) => match status {
                    LockWireStatus::Ok | LockWireStatus::NotOwner => {
                        self.inner
                            .held
                            .remove(&(self.region.clone(), self.name.clone()));
                        return Ok(());
                    }
                    LockWireStatus::Retry => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    other => {
                        return Err(ClusterError::Lock(format!(
                            "unexpected unlock status: {:?}",
                            other
                        )))
                    }
                },
                Ok(other) => {
                    return Err(ClusterError::Lock(format!(
                        "unexpected unlock reply: {:?}",
                        other
                    )))
                }
                Err(e) if e.is_transient() => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ClusterError::Lock(format!(
            "unlock of {}:{} did not settle",
            self.region, self.name
        )))
    }
}

/// One request/response exchange with a peer over the lock connector.
async fn request_response(
    inner: &Arc<LockInner>,
    target: NodeId,
    msg: LockMessage,
    timeout: Option<Duration>,
) -> Result<LockMessage> {
    let topology = inner.cluster.topology();
    let Some(node) = topology.get(&target).cloned() else {
        return Err(ClusterError::Network(format!(
            "lock peer {} not in topology",
            target
        )));
    };

    let conn = peer_connection(inner, &node).await?;
    let id = msg.request_id();
    let (tx, rx) = oneshot::channel();
    conn.pending.insert(id, tx);

    if let Err(e) = conn.client.send(msg.encode()).await {
        conn.pending.remove(&id);
        return Err(e);
    }

    let reply = match timeout {
        Some(t) => match tokio::time::timeout(t, rx).await {
            Err(_) => {
                conn.pending.remove(&id);
                return Err(ClusterError::Timeout(format!(
                    "lock request to {} timed out",
                    target
                )));
            }
            Ok(r) => r,
        },
        None => rx.await,
    };

    reply.map_err(|_| {
        ClusterError::ChannelClosed(format!("lock connection to {} closed mid-request", target))
    })
}

async fn peer_connection(inner: &Arc<LockInner>, node: &Node) -> Result<LockConnection> {
    if let Some(existing) = inner.connections.get(&node.id) {
        if existing.client.state() != ClientState::Disconnected {
            return Ok(existing.clone());
        }
    }

    let addr = node.address.to_socket_addr()?;
    let (client, mut events) = NetworkClient::open(addr, LOCK_PROTOCOL, Bytes::new(), &inner.net);
    let conn = LockConnection {
        client: client.clone(),
        pending: Arc::new(DashMap::new()),
    };
    inner.connections.insert(node.id, conn.clone());

    let pending = conn.pending.clone();
    let weak = Arc::downgrade(inner);
    let peer_id = node.id;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Message(payload) => match LockMessage::decode(payload) {
                    Ok(msg) if !msg.is_request() => {
                        if let Some((_, tx)) = pending.remove(&msg.request_id()) {
                            let _ = tx.send(msg);
                        }
                    }
                    Ok(_) => {
                        tracing::trace!("dropping unsolicited request on lock client connection");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed lock reply dropped");
                    }
                },
                ConnectionEvent::Disconnected(_) => {
                    pending.clear();
                    if let Some(inner) = weak.upgrade() {
                        inner.connections.remove(&peer_id);
                    }
                    break;
                }
            }
        }
    });

    client.ready().await?;
    Ok(conn)
}

/// Server-side dispatch on the lock connector.
async fn handle_server_message(inner: &Arc<LockInner>, msg: LockMessage, sender: &ConnectionSender) {
    match msg {
        LockMessage::LockRequest {
            lock_id,
            region,
            name,
            timeout_ms,
            want_feedback: _,
            thread_id,
            topology: request_hash,
            requester,
        } => {
            let Some(core) = inner.regions.read().get(&region).cloned() else {
                let _ = sender
                    .enqueue(
                        LockMessage::LockResponse {
                            lock_id,
                            status: LockWireStatus::Retry,
                            owner_thread: 0,
                            owner: None,
                        }
                        .encode(),
                    )
                    .await;
                return;
            };

            let topology = inner.cluster.topology();
            let is_manager = manager_of(&topology, &name) == Some(inner.local());
            let (reply, timer) = core.handle_lock(
                lock_id,
                &name,
                timeout_ms,
                thread_id,
                requester,
                request_hash,
                topology.hash(),
                is_manager,
                sender.clone(),
            );

            if let Some(reply) = reply {
                let _ = sender.enqueue(reply.encode()).await;
            }
            if let Some(timer) = timer {
                let core = core.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timer.after).await;
                    if let Some((reply_to, msg)) = core.expire_waiter(&timer.name, timer.lock_id) {
                        let _ = reply_to.enqueue(msg.encode()).await;
                    }
                });
            }
        }
        LockMessage::UnlockRequest {
            lock_id,
            region,
            name,
            topology: request_hash,
            requester: _,
        } => {
            let Some(core) = inner.regions.read().get(&region).cloned() else {
                let _ = sender
                    .enqueue(
                        LockMessage::UnlockResponse {
                            lock_id,
                            status: LockWireStatus::Retry,
                        }
                        .encode(),
                    )
                    .await;
                return;
            };

            let topology = inner.cluster.topology();
            let is_manager = manager_of(&topology, &name) == Some(inner.local());
            let (reply, grants) = core.handle_unlock(
                lock_id,
                &name,
                request_hash,
                topology.hash(),
                is_manager,
                sender.clone(),
            );

            if let Some(reply) = reply {
                let _ = sender.enqueue(reply.encode()).await;
            }
            for (reply_to, msg) in grants {
                let _ = reply_to.enqueue(msg.encode()).await;
            }
        }
        LockMessage::OwnerRequest {
            query_id,
            region,
            name,
            topology: request_hash,
        } => {
            let Some(core) = inner.regions.read().get(&region).cloned() else {
                let _ = sender
                    .enqueue(
                        LockMessage::OwnerResponse {
                            query_id,
                            status: LockWireStatus::Retry,
                            thread_id: 0,
                            owner: None,
                        }
                        .encode(),
                    )
                    .await;
                return;
            };

            let topology = inner.cluster.topology();
            let is_manager = manager_of(&topology, &name) == Some(inner.local());
            let reply = core.handle_owner(query_id, &name, request_hash, topology.hash(), is_manager);
            let _ = sender.enqueue(reply.encode()).await;
        }
        LockMessage::MigrationPrepare {
            region, key, ..
        } => {
            let Some(core) = inner.regions.read().get(&region).cloned() else {
                return;
            };
            core.begin_migration(key);
            tracing::debug!(region = %region, key_id = key.id, "migration prepare received");

            let reply = LockMessage::MigrationPrepareReply {
                region,
                key,
                topology: inner.cluster.topology().hash(),
                locks: attested_entries(inner, &core),
            };
            let _ = sender.enqueue(reply.encode()).await;
        }
        LockMessage::MigrationApply { region, key, locks } => {
            let Some(core) = inner.regions.read().get(&region).cloned() else {
                return;
            };

            let topology = inner.cluster.topology();
            let local = inner.local();
            let replies = core.apply_migration(key, locks, |name| {
                manager_of(&topology, name) == Some(local)
            });
            tracing::debug!(region = %region, key_id = key.id, "migration applied");

            for (reply_to, msg) in replies {
                let _ = reply_to.enqueue(msg.encode()).await;
            }
            let _ = sender
                .enqueue(LockMessage::MigrationApplyAck { region, key }.encode())
                .await;
        }
        other => {
            tracing::trace!(
                "dropping unsolicited lock reply on server connection: {}",
                other.request_id()
            );
        }
    }
}

/// Topology change: the oldest member drives a fresh migration round per
/// region.
fn handle_topology_change(inner: &Arc<LockInner>, topology: crate::cluster::topology::TopologySnapshot) {
    if topology.is_empty() {
        return;
    }
    let local = inner.local();
    let Some(oldest) = topology.oldest() else {
        return;
    };
    if oldest.id != local {
        return;
    }

    let regions: Vec<Arc<RegionCore<ConnectionSender>>> =
        inner.regions.read().values().cloned().collect();
    for region in regions {
        let inner = inner.clone();
        let topology = topology.clone();
        tokio::spawn(async move {
            run_migration(inner, region, topology).await;
        });
    }
}

async fn run_migration(
    inner: Arc<LockInner>,
    region: Arc<RegionCore<ConnectionSender>>,
    topology: crate::cluster::topology::TopologySnapshot,
) {
    let local = inner.local();
    let seq = inner.migration_seq.fetch_add(1, Ordering::Relaxed) + 1;
    let key = LockMigrationKey {
        initiator: local,
        topology: topology.hash(),
        id: seq,
    };

    if !region.begin_migration(key) {
        return;
    }
    tracing::info!(region = region.name(), key_id = key.id, "lock migration started");

    let peers: Vec<Node> = topology
        .nodes()
        .filter(|n| n.id != local)
        .cloned()
        .collect();

    let rpc_timeout = inner.net.connect_timeout * 2;
    let mut collected = attested_entries(&inner, &region);

    for first_pass in [true, false] {
        let mut mismatch = false;
        let mut requests: FuturesUnordered<_> = peers
            .iter()
            .map(|peer| {
                let prepare = LockMessage::MigrationPrepare {
                    region: region.name().to_string(),
                    key,
                    first_pass,
                    topologies: vec![(local, Some(topology.hash()))],
                    locks: attested_entries(&inner, &region),
                };
                request_response(&inner, peer.id, prepare, Some(rpc_timeout))
            })
            .collect();

        while let Some(result) = requests.next().await {
            match result {
                Ok(LockMessage::MigrationPrepareReply {
                    topology: peer_hash,
                    locks,
                    ..
                }) => {
                    if peer_hash != key.topology {
                        mismatch = true;
                    }
                    collected.extend(locks);
                }
                Ok(_) => {}
                Err(e) => {
                    // A dead peer's locks surface through the survivors.
                    tracing::debug!(error = %e, "migration prepare skipped unreachable peer");
                }
            }
        }

        if first_pass && !mismatch {
            break;
        }
        if !first_pass {
            break;
        }
        tracing::debug!(region = region.name(), "topology mismatch, running second prepare pass");
    }

    // A newer round supersedes this one.
    if inner.migration_seq.load(Ordering::Relaxed) != seq {
        region.cancel_migration(&key);
        return;
    }

    let merged = merge_entries(collected, &topology);

    // Local apply first, then broadcast.
    let replies = region.apply_migration(key, merged.clone(), |name| {
        manager_of(&topology, name) == Some(local)
    });
    for (reply_to, msg) in replies {
        let _ = reply_to.enqueue(msg.encode()).await;
    }

    let mut applies: FuturesUnordered<_> = peers
        .iter()
        .map(|peer| {
            let apply = LockMessage::MigrationApply {
                region: region.name().to_string(),
                key,
                locks: merged.clone(),
            };
            request_response(&inner, peer.id, apply, Some(rpc_timeout))
        })
        .collect();
    while let Some(result) = applies.next().await {
        if let Err(e) = result {
            tracing::debug!(error = %e, "migration apply skipped unreachable peer");
        }
    }

    tracing::info!(
        region = region.name(),
        key_id = key.id,
        locks = merged.len(),
        "lock migration completed"
    );
}
