// Messaging channels.
//
// A channel owns per-peer connection pools (`sockets` connections per peer,
// affinity keys hash onto a stable one), the correlation map for in-flight
// requests, the failover loop and the worker pool running receiver
// callbacks. Replies stream back over the requesting connection: zero or
// more chunks, then a final payload or an error carrying the remote failure
// rendering.

use crate::cluster::node::{Node, NodeId};
use crate::cluster::view::ClusterView;
use crate::config::{ChannelConfig, NetworkConfig};
use crate::error::{ClusterError, Result};
use crate::messaging::balancer::{LoadBalancer, LoadBalancerContext};
use crate::messaging::failover::{
    FailoverCondition, FailoverDecision, FailoverPolicy, FailoverRouting, FailureInfo,
};
use crate::messaging::pressure::{ReceivePressureGuard, SendPressureGuard};
use crate::messaging::protocol::{affinity_hash, MessageFrame};
use crate::messaging::worker::WorkerPool;
use crate::network::client::{ClientState, NetworkClient};
use crate::network::connection::{ConnectionEvent, ConnectionSender};
use crate::network::transport::ConnectorHandler;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Application affinity key; its hash pins the connection and the remote
    /// worker.
    pub affinity: Option<Bytes>,
    /// Overrides the channel's default request timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_affinity(mut self, key: impl Into<Bytes>) -> Self {
        self.affinity = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn affinity_hash(&self) -> Option<i32> {
        self.affinity.as_ref().map(|key| affinity_hash(key))
    }
}

/// One inbound message as seen by a receiver.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub payload: Bytes,
    pub affinity: Option<i32>,
    pub from: SocketAddr,
}

/// Reply handle handed to receivers; requests expect `complete` (optionally
/// after `partial` chunks), notifications ignore it.
#[derive(Clone)]
pub struct Responder {
    sender: ConnectionSender,
    correlation: Option<u32>,
    finished: Arc<AtomicBool>,
}

impl Responder {
    pub fn is_reply_expected(&self) -> bool {
        self.correlation.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Streams one partial reply chunk.
    pub async fn partial(&self, payload: Bytes) -> Result<()> {
        let Some(correlation) = self.correlation else {
            return Ok(());
        };
        if self.is_finished() {
            return Err(ClusterError::IllegalState(
                "reply already completed".to_string(),
            ));
        }
        self.sender
            .enqueue(
                MessageFrame::Chunk {
                    correlation,
                    payload,
                }
                .encode(),
            )
            .await
    }

    /// Sends the final reply.
    pub async fn complete(&self, payload: Bytes) -> Result<()> {
        let Some(correlation) = self.correlation else {
            return Ok(());
        };
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(ClusterError::IllegalState(
                "reply already completed".to_string(),
            ));
        }
        self.sender
            .enqueue(
                MessageFrame::Final {
                    correlation,
                    payload,
                }
                .encode(),
            )
            .await
    }

    /// Fails the request on the remote side.
    pub async fn fail(&self, message: impl Into<String>) -> Result<()> {
        let Some(correlation) = self.correlation else {
            return Ok(());
        };
        self.finished.store(true, Ordering::Release);
        self.sender
            .enqueue(
                MessageFrame::Error {
                    correlation,
                    stack_trace: message.into(),
                }
                .encode(),
            )
            .await
    }
}

/// Application callback for inbound channel traffic.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive(&self, msg: InboundMessage, responder: Responder) -> Result<()>;
}

enum ReplyEvent {
    Chunk(Bytes),
    Final(Bytes),
    Error(String),
}

/// One streamed reply part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePart {
    Chunk(Bytes),
    Final(Bytes),
}

struct PendingRequest {
    tx: mpsc::UnboundedSender<ReplyEvent>,
    node: NodeId,
}

struct PeerPool {
    slots: Vec<Mutex<Option<NetworkClient>>>,
    rr: AtomicUsize,
}

impl PeerPool {
    fn new(sockets: usize) -> Self {
        Self {
            slots: (0..sockets.max(1)).map(|_| Mutex::new(None)).collect(),
            rr: AtomicUsize::new(0),
        }
    }

    fn slot_for(&self, affinity: Option<i32>) -> usize {
        match affinity {
            Some(hash) => (hash as u32 as usize) % self.slots.len(),
            None => self.rr.fetch_add(1, Ordering::Relaxed) % self.slots.len(),
        }
    }
}

pub(crate) struct ChannelCore {
    name: String,
    protocol: String,
    config: ChannelConfig,
    net: NetworkConfig,
    cluster: ClusterView,
    balancer: Arc<dyn LoadBalancer>,
    failover: Arc<dyn FailoverPolicy>,
    condition: Arc<dyn FailoverCondition>,
    out_pressure: SendPressureGuard,
    in_pressure: ReceivePressureGuard,
    workers: WorkerPool,
    receiver: Option<Arc<dyn MessageReceiver>>,
    correlations: DashMap<u32, PendingRequest>,
    next_correlation: AtomicU32,
    pools: DashMap<NodeId, Arc<PeerPool>>,
}

impl ChannelCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ChannelConfig,
        net: NetworkConfig,
        cluster: ClusterView,
        balancer: Arc<dyn LoadBalancer>,
        failover: Arc<dyn FailoverPolicy>,
        condition: Arc<dyn FailoverCondition>,
        receiver: Option<Arc<dyn MessageReceiver>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            protocol: channel_protocol(&config.name),
            out_pressure: SendPressureGuard::new(&config.backpressure),
            in_pressure: ReceivePressureGuard::new(&config.backpressure),
            workers: WorkerPool::new(config.worker_threads),
            config,
            net,
            cluster,
            balancer,
            failover,
            condition,
            receiver,
            correlations: DashMap::new(),
            next_correlation: AtomicU32::new(1),
            pools: DashMap::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn protocol(&self) -> &str {
        &self.protocol
    }

    /// 31-bit, never zero, locally unique.
    fn alloc_correlation(&self) -> u32 {
        loop {
            let v = self.next_correlation.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff;
            if v != 0 {
                return v;
            }
        }
    }

    /// Pooled connection to a peer; the affinity hash selects a stable slot.
    async fn connection(
        self: &Arc<Self>,
        node: &Node,
        affinity: Option<i32>,
    ) -> Result<NetworkClient> {
        let pool = self
            .pools
            .entry(node.id)
            .or_insert_with(|| Arc::new(PeerPool::new(self.config.sockets)))
            .clone();

        let index = pool.slot_for(affinity);
        let mut slot = pool.slots[index].lock().await;

        if let Some(client) = slot.as_ref() {
            if client.state() != ClientState::Disconnected {
                return Ok(client.clone());
            }
        }

        let addr = node.address.to_socket_addr()?;
        let (client, events) = NetworkClient::open(addr, &self.protocol, Bytes::new(), &self.net);
        spawn_reply_dispatch(Arc::downgrade(self), node.id, events);
        client.ready().await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Opens one request: routes, correlates, serializes and writes, with
    /// the failover loop around the physical send. The returned stream owns
    /// the correlation entry and one outbound pressure slot.
    async fn open_request(
        self: &Arc<Self>,
        explicit: Option<NodeId>,
        payload: Bytes,
        affinity: Option<i32>,
    ) -> Result<ReplyStream> {
        self.out_pressure.acquire().await?;

        let mut attempt: u32 = 0;
        let mut failure: Option<FailureInfo> = None;

        let result = loop {
            let topology = self.cluster.topology();
            let target = match explicit {
                Some(id) => id,
                None => {
                    let ctx = LoadBalancerContext {
                        topology: &topology,
                        affinity,
                        failure: failure.as_ref(),
                    };
                    match self.balancer.route(&ctx) {
                        Some(id) => id,
                        None => {
                            break Err(ClusterError::Messaging(format!(
                                "channel {}: no nodes available",
                                self.name
                            )))
                        }
                    }
                }
            };

            let Some(node) = topology.get(&target).cloned() else {
                break Err(ClusterError::Messaging(format!(
                    "channel {}: target {} not in topology",
                    self.name, target
                )));
            };

            // Fresh correlation per physical send; never reused on retries.
            let correlation = self.alloc_correlation();
            let (tx, rx) = mpsc::unbounded_channel();
            self.correlations
                .insert(correlation, PendingRequest { tx, node: target });

            let frame = MessageFrame::Request {
                correlation,
                affinity,
                payload: payload.clone(),
            };

            let sent = match self.connection(&node, affinity).await {
                Ok(conn) => conn.send(frame.encode()).await,
                Err(e) => Err(e),
            };

            match sent {
                Ok(()) => {
                    break Ok(ReplyStream {
                        rx,
                        correlation,
                        core: self.clone(),
                        done: false,
                    })
                }
                Err(e) => {
                    self.correlations.remove(&correlation);
                    if !self.condition.should_failover(&e) {
                        break Err(e);
                    }
                    let info = FailureInfo {
                        error: e.clone(),
                        attempt,
                        last_node: target,
                        routing: FailoverRouting::PreferSame,
                    };
                    match self.failover.apply(&info) {
                        FailoverDecision::Fail => break Err(e),
                        FailoverDecision::RetrySameNode => failure = Some(info),
                        FailoverDecision::RetryDifferentNode => {
                            failure = Some(FailureInfo {
                                routing: FailoverRouting::ReRoute,
                                ..info
                            })
                        }
                    }
                    attempt += 1;
                    tracing::debug!(
                        channel = %self.name,
                        attempt,
                        error = %e,
                        "retrying send after failure"
                    );
                }
            }
        };

        if result.is_err() {
            self.out_pressure.release();
        }
        result
    }

    async fn request_inner(
        self: &Arc<Self>,
        explicit: Option<NodeId>,
        payload: Bytes,
        opts: &SendOptions,
    ) -> Result<Bytes> {
        let timeout = opts.timeout.unwrap_or(self.config.default_timeout);
        let affinity = opts.affinity_hash();
        let mut stream = self.open_request(explicit, payload, affinity).await?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    return Err(ClusterError::Timeout(format!(
                        "channel {}: no reply within {:?}",
                        self.name, timeout
                    )))
                }
                Ok(None) => {
                    return Err(ClusterError::ChannelClosed(format!(
                        "channel {}: reply stream ended",
                        self.name
                    )))
                }
                Ok(Some(Ok(ResponsePart::Chunk(_)))) => continue,
                Ok(Some(Ok(ResponsePart::Final(payload)))) => return Ok(payload),
                Ok(Some(Err(e))) => return Err(e),
            }
        }
    }

    async fn notify_inner(
        self: &Arc<Self>,
        explicit: Option<NodeId>,
        payload: Bytes,
        opts: &SendOptions,
    ) -> Result<()> {
        let affinity = opts.affinity_hash();
        self.out_pressure.acquire().await?;

        let result = async {
            let topology = self.cluster.topology();
            let target = match explicit {
                Some(id) => id,
                None => {
                    let ctx = LoadBalancerContext {
                        topology: &topology,
                        affinity,
                        failure: None,
                    };
                    self.balancer.route(&ctx).ok_or_else(|| {
                        ClusterError::Messaging(format!(
                            "channel {}: no nodes available",
                            self.name
                        ))
                    })?
                }
            };
            let node = topology.get(&target).cloned().ok_or_else(|| {
                ClusterError::Messaging(format!(
                    "channel {}: target {} not in topology",
                    self.name, target
                ))
            })?;

            let frame = MessageFrame::Notification { affinity, payload };
            let conn = self.connection(&node, affinity).await?;
            conn.send(frame.encode()).await
        }
        .await;

        self.out_pressure.release();
        result
    }

    /// Inbound dispatch from the connector handler.
    async fn handle_inbound(self: &Arc<Self>, frame: MessageFrame, sender: &ConnectionSender) {
        match frame {
            MessageFrame::Request {
                correlation,
                affinity,
                payload,
            } => self.dispatch_to_receiver(Some(correlation), affinity, payload, sender),
            MessageFrame::Notification { affinity, payload } => {
                self.dispatch_to_receiver(None, affinity, payload, sender)
            }
            // Replies arrive on client connections; one landing here is
            // stray (e.g. sent after its requester disconnected).
            MessageFrame::Chunk { correlation, .. }
            | MessageFrame::Final { correlation, .. }
            | MessageFrame::Error { correlation, .. } => {
                tracing::trace!(channel = %self.name, correlation, "dropping stray reply");
            }
        }
    }

    fn dispatch_to_receiver(
        self: &Arc<Self>,
        correlation: Option<u32>,
        affinity: Option<i32>,
        payload: Bytes,
        sender: &ConnectionSender,
    ) {
        let Some(receiver) = self.receiver.clone() else {
            tracing::warn!(channel = %self.name, "no receiver configured, dropping message");
            if let Some(correlation) = correlation {
                let sender = sender.clone();
                let name = self.name.clone();
                tokio::spawn(async move {
                    let _ = sender
                        .enqueue(
                            MessageFrame::Error {
                                correlation,
                                stack_trace: format!("channel {} has no receiver", name),
                            }
                            .encode(),
                        )
                        .await;
                });
            }
            return;
        };

        // Inbound queue accounting; crossing the high watermark pauses this
        // connection's reader until the queue drains.
        if self.in_pressure.on_enqueue() {
            tracing::debug!(channel = %self.name, "inbound queue full, pausing reader");
            sender.pause_receiving();
        }

        let responder = Responder {
            sender: sender.clone(),
            correlation,
            finished: Arc::new(AtomicBool::new(false)),
        };
        let core = self.clone();
        let sender = sender.clone();

        self.workers.execute(affinity, async move {
            let msg = InboundMessage {
                payload,
                affinity,
                from: sender.remote(),
            };

            if let Err(e) = receiver.receive(msg, responder.clone()).await {
                tracing::warn!(channel = %core.name, error = %e, "receiver failed");
                if responder.is_reply_expected() && !responder.is_finished() {
                    let _ = responder.fail(render_failure(&e)).await;
                }
            }

            if core.in_pressure.on_dequeue() {
                tracing::debug!(channel = %core.name, "inbound queue drained, resuming reader");
                sender.resume_receiving();
            }
        });
    }

    /// Routes one reply event into its pending request; unknown or late
    /// correlations are dropped.
    fn dispatch_reply(&self, frame: MessageFrame) {
        match frame {
            MessageFrame::Chunk {
                correlation,
                payload,
            } => {
                if let Some(pending) = self.correlations.get(&correlation) {
                    let _ = pending.tx.send(ReplyEvent::Chunk(payload));
                } else {
                    tracing::trace!(channel = %self.name, correlation, "dropping late chunk");
                }
            }
            MessageFrame::Final {
                correlation,
                payload,
            } => {
                if let Some((_, pending)) = self.correlations.remove(&correlation) {
                    let _ = pending.tx.send(ReplyEvent::Final(payload));
                } else {
                    tracing::trace!(channel = %self.name, correlation, "dropping late final");
                }
            }
            MessageFrame::Error {
                correlation,
                stack_trace,
            } => {
                if let Some((_, pending)) = self.correlations.remove(&correlation) {
                    let _ = pending.tx.send(ReplyEvent::Error(stack_trace));
                }
            }
            other => {
                tracing::trace!(channel = %self.name, "unexpected frame on client connection: {:?}", kind_of(&other));
            }
        }
    }

    /// Fails every pending request routed to a peer whose connection died;
    /// their streams end and callers see a closed-channel error.
    fn fail_pending_for(&self, node: NodeId) {
        self.correlations.retain(|_, pending| pending.node != node);
    }

    pub(crate) fn disconnect_all(&self) {
        for pool in self.pools.iter() {
            for slot in &pool.slots {
                if let Ok(slot) = slot.try_lock() {
                    if let Some(client) = slot.as_ref() {
                        client.disconnect();
                    }
                }
            }
        }
        self.pools.clear();
        self.correlations.clear();
    }
}

fn kind_of(frame: &MessageFrame) -> &'static str {
    match frame {
        MessageFrame::Request { .. } => "Request",
        MessageFrame::Notification { .. } => "Notification",
        MessageFrame::Chunk { .. } => "Chunk",
        MessageFrame::Final { .. } => "Final",
        MessageFrame::Error { .. } => "Error",
    }
}

pub(crate) fn channel_protocol(name: &str) -> String {
    format!("hekate.messaging:{}", name)
}

fn render_failure(e: &ClusterError) -> String {
    use std::error::Error;
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(s) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&s.to_string());
        source = s.source();
    }
    out
}

fn spawn_reply_dispatch(
    core: Weak<ChannelCore>,
    node: NodeId,
    mut events: mpsc::Receiver<ConnectionEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(core) = core.upgrade() else { break };
            match event {
                ConnectionEvent::Message(payload) => match MessageFrame::decode(payload) {
                    Ok(frame) => core.dispatch_reply(frame),
                    Err(e) => {
                        tracing::warn!(channel = %core.name, error = %e, "malformed reply dropped");
                    }
                },
                ConnectionEvent::Disconnected(reason) => {
                    if let Some(e) = reason {
                        tracing::debug!(channel = %core.name, peer = %node, error = %e, "peer connection lost");
                    }
                    core.fail_pending_for(node);
                    break;
                }
            }
        }
    });
}

/// Streamed reply to one request. Dropping the stream releases the
/// correlation and the pressure slot; later chunks are discarded.
pub struct ReplyStream {
    rx: mpsc::UnboundedReceiver<ReplyEvent>,
    correlation: u32,
    core: Arc<ChannelCore>,
    done: bool,
}

impl ReplyStream {
    /// Next reply part; `None` after the final part was consumed.
    pub async fn next(&mut self) -> Option<Result<ResponsePart>> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            None => {
                self.done = true;
                Some(Err(ClusterError::ChannelClosed(
                    "connection lost before the final reply".to_string(),
                )))
            }
            Some(ReplyEvent::Chunk(payload)) => Some(Ok(ResponsePart::Chunk(payload))),
            Some(ReplyEvent::Final(payload)) => {
                self.done = true;
                Some(Ok(ResponsePart::Final(payload)))
            }
            Some(ReplyEvent::Error(stack_trace)) => {
                self.done = true;
                Some(Err(ClusterError::Remote(stack_trace)))
            }
        }
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        self.core.correlations.remove(&self.correlation);
        self.core.out_pressure.release();
    }
}

/// Public channel handle.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The channel's (possibly filtered) topology.
    pub fn topology(&self) -> crate::cluster::topology::TopologySnapshot {
        self.core.cluster.topology()
    }

    /// Routed request awaiting the single final reply.
    pub async fn request(&self, payload: Bytes, opts: SendOptions) -> Result<Bytes> {
        self.core.request_inner(None, payload, &opts).await
    }

    /// Request addressed to a specific member.
    pub async fn request_to(
        &self,
        target: NodeId,
        payload: Bytes,
        opts: SendOptions,
    ) -> Result<Bytes> {
        self.core.request_inner(Some(target), payload, &opts).await
    }

    /// Routed request exposing the chunk stream.
    pub async fn stream(&self, payload: Bytes, opts: SendOptions) -> Result<ReplyStream> {
        self.core
            .open_request(None, payload, opts.affinity_hash())
            .await
    }

    /// Streamed request addressed to a specific member.
    pub async fn stream_to(
        &self,
        target: NodeId,
        payload: Bytes,
        opts: SendOptions,
    ) -> Result<ReplyStream> {
        self.core
            .open_request(Some(target), payload, opts.affinity_hash())
            .await
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, payload: Bytes, opts: SendOptions) -> Result<()> {
        self.core.notify_inner(None, payload, &opts).await
    }

    /// Notification addressed to a specific member.
    pub async fn notify_to(&self, target: NodeId, payload: Bytes, opts: SendOptions) -> Result<()> {
        self.core.notify_inner(Some(target), payload, &opts).await
    }
}

/// Connector handler bridging the transport to one channel.
pub(crate) struct ChannelHandler {
    core: Weak<ChannelCore>,
}

impl ChannelHandler {
    pub(crate) fn new(core: &Arc<ChannelCore>) -> Self {
        Self {
            core: Arc::downgrade(core),
        }
    }
}

#[async_trait]
impl ConnectorHandler for ChannelHandler {
    async fn on_message(&self, msg: Bytes, sender: &ConnectionSender) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match MessageFrame::decode(msg) {
            Ok(frame) => core.handle_inbound(frame, sender).await,
            Err(e) => {
                // A codec failure poisons the stream; close the connection.
                tracing::warn!(channel = %core.name, error = %e, "decode failed, closing connection");
                sender.disconnect();
            }
        }
    }
}
