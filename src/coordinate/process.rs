// Coordination processes.
//
// A process binds a handler to the sub-topology of nodes advertising the
// process name as a service property. On each relevant topology change the
// oldest participant becomes the coordinator, `prepare` runs everywhere,
// and the coordinator drives broadcast/collect rounds through the messaging
// gateway until the context completes or is cancelled. Rounds are never
// resumed across coordinator changes; handlers must be idempotent.

use crate::cluster::node::{Node, NodeId};
use crate::cluster::view::{ClusterEventKind, ClusterView};
use crate::error::{ClusterError, Result};
use crate::messaging::channel::{Channel, InboundMessage, MessageReceiver, Responder, SendOptions};
use crate::messaging::gateway::{ChannelOptions, MessagingGateway};
use crate::network::frame::{FrameReader, FrameWriter};
use crate::runtime::guard::{GuardState, StateGuard};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

/// Messaging channel carrying all coordination traffic.
pub const COORDINATION_CHANNEL: &str = "hekate.coordinate";

/// Service property marking a node as a participant of a named process.
pub fn process_property(name: &str) -> String {
    format!("hekate.process.{}", name)
}

fn encode_envelope(process: &str, epoch: u64, payload: &[u8]) -> Bytes {
    let mut w = FrameWriter::new();
    w.write_str(process);
    w.write_u64(epoch);
    w.write_bytes(payload);
    w.into_bytes()
}

fn decode_envelope(payload: Bytes) -> Result<(String, u64, Bytes)> {
    let mut r = FrameReader::new(payload);
    let process = r.read_str()?;
    let epoch = r.read_u64()?;
    let body = r.read_bytes()?;
    Ok((process, epoch, body))
}

/// Application contract for a coordination process.
#[async_trait]
pub trait CoordinationHandler: Send + Sync {
    /// Runs on every member when a round begins.
    async fn prepare(&self, _ctx: &CoordinationContext) -> Result<()> {
        Ok(())
    }

    /// Runs on every member for each broadcast request; the returned bytes
    /// are that member's reply.
    async fn process(&self, request: Bytes, ctx: &CoordinationContext) -> Result<Bytes>;

    /// Runs on the coordinator only; drives `ctx.broadcast` rounds until the
    /// context completes or cancels.
    async fn coordinate(&self, ctx: &CoordinationContext) -> Result<()>;
}

struct ContextInner {
    process: String,
    epoch: u64,
    members: Vec<Node>,
    coordinator: NodeId,
    local: NodeId,
    channel: Channel,
    attachment: Mutex<Option<Bytes>>,
    done: AtomicBool,
    cancelled: AtomicBool,
    done_tx: watch::Sender<bool>,
}

/// One round's immutable view plus the mutable attachment and terminal
/// flags.
#[derive(Clone)]
pub struct CoordinationContext {
    inner: Arc<ContextInner>,
}

impl CoordinationContext {
    pub fn process_name(&self) -> &str {
        &self.inner.process
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch
    }

    pub fn members(&self) -> &[Node] {
        &self.inner.members
    }

    pub fn coordinator(&self) -> NodeId {
        self.inner.coordinator
    }

    pub fn local(&self) -> NodeId {
        self.inner.local
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.coordinator == self.inner.local
    }

    pub fn attachment(&self) -> Option<Bytes> {
        self.inner.attachment.lock().clone()
    }

    pub fn set_attachment(&self, attachment: Option<Bytes>) {
        *self.inner.attachment.lock() = attachment;
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Marks the process complete on this node.
    pub fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.done_tx.send_replace(true);
    }

    /// Aborts the round.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Sends `request` to every member (self included) and collects exactly
    /// one reply per member.
    pub async fn broadcast(&self, request: Bytes) -> Result<Vec<(NodeId, Bytes)>> {
        if self.is_cancelled() {
            return Err(ClusterError::Coordination(format!(
                "process {} round cancelled",
                self.inner.process
            )));
        }

        let envelope = encode_envelope(&self.inner.process, self.inner.epoch, &request);
        let mut requests: FuturesUnordered<_> = self
            .inner
            .members
            .iter()
            .map(|member| {
                let channel = self.inner.channel.clone();
                let envelope = envelope.clone();
                let id = member.id;
                async move {
                    channel
                        .request_to(id, envelope, SendOptions::new())
                        .await
                        .map(|reply| (id, reply))
                }
            })
            .collect();

        let mut replies = Vec::with_capacity(self.inner.members.len());
        while let Some(result) = requests.next().await {
            match result {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    return Err(ClusterError::Coordination(format!(
                        "process {} broadcast failed: {}",
                        self.inner.process, e
                    )))
                }
            }
        }
        Ok(replies)
    }
}

type Job = BoxFuture<'static, ()>;

struct ProcessState {
    name: String,
    handler: Arc<dyn CoordinationHandler>,
    executor: mpsc::UnboundedSender<Job>,
    current: Mutex<Option<CoordinationContext>>,
    epoch: AtomicU64,
    done_tx: watch::Sender<bool>,
}

impl ProcessState {
    fn schedule(&self, job: impl std::future::Future<Output = ()> + Send + 'static) {
        if self.executor.send(Box::pin(job)).is_err() {
            tracing::warn!(process = %self.name, "executor gone, dropping coordination job");
        }
    }
}

struct CoordInner {
    cluster: ClusterView,
    local_id: Arc<dyn Fn() -> NodeId + Send + Sync>,
    guard: StateGuard,
    processes: RwLock<HashMap<String, Arc<ProcessState>>>,
    channel: RwLock<Option<Channel>>,
}

impl CoordInner {
    fn local(&self) -> NodeId {
        (self.local_id.as_ref())()
    }
}

/// Handle onto the coordination subsystem.
#[derive(Clone)]
pub struct CoordinationService {
    inner: Arc<CoordInner>,
}

struct CoordReceiver {
    inner: Weak<CoordInner>,
}

#[async_trait]
impl MessageReceiver for CoordReceiver {
    async fn receive(&self, msg: InboundMessage, responder: Responder) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Err(ClusterError::IllegalState(
                "coordination service is gone".to_string(),
            ));
        };

        let (process, epoch, payload) = decode_envelope(msg.payload)?;

        let state = inner
            .processes
            .read()
            .get(&process)
            .cloned()
            .ok_or_else(|| {
                ClusterError::Coordination(format!("unknown coordination process: {}", process))
            })?;

        let ctx = state.current.lock().clone().ok_or_else(|| {
            ClusterError::Coordination(format!("process {} has no active round", process))
        })?;

        if epoch < ctx.epoch() {
            return Err(ClusterError::Coordination(format!(
                "process {} request from superseded round {} (current {})",
                process,
                epoch,
                ctx.epoch()
            )));
        }

        let reply = state.handler.process(payload, &ctx).await?;
        responder.complete(reply).await
    }
}

impl CoordinationService {
    pub fn new(cluster: ClusterView, local_id: Arc<dyn Fn() -> NodeId + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(CoordInner {
                cluster,
                local_id,
                guard: StateGuard::new("coordination"),
                processes: RwLock::new(HashMap::new()),
                channel: RwLock::new(None),
            }),
        }
    }

    /// Declares a process; must happen before initialization.
    pub fn register_process(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CoordinationHandler>,
    ) -> Result<()> {
        if self.inner.guard.state() != GuardState::Down {
            return Err(ClusterError::IllegalState(
                "processes must be registered before the coordination service initializes"
                    .to_string(),
            ));
        }
        let name = name.into();
        let mut processes = self.inner.processes.write();
        if processes.contains_key(&name) {
            return Err(ClusterError::Configuration(format!(
                "duplicate coordination process: {}",
                name
            )));
        }

        // One single-threaded executor per process keeps its work ordered.
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });

        let (done_tx, _) = watch::channel(false);
        processes.insert(
            name.clone(),
            Arc::new(ProcessState {
                name,
                handler,
                executor: tx,
                current: Mutex::new(None),
                epoch: AtomicU64::new(0),
                done_tx,
            }),
        );
        Ok(())
    }

    /// Registers the coordination channel on the gateway; runs before the
    /// gateway initializes.
    pub fn register_channel(&self, gateway: &MessagingGateway) -> Result<()> {
        gateway.register_channel(
            crate::config::ChannelConfig::new(COORDINATION_CHANNEL),
            ChannelOptions::default().with_receiver(Arc::new(CoordReceiver {
                inner: Arc::downgrade(&self.inner),
            })),
        )
    }

    /// Wires the channel handle and the per-process topology listeners.
    pub async fn initialize(&self, gateway: &MessagingGateway) -> Result<()> {
        self.inner
            .guard
            .transition(&[GuardState::Down], GuardState::Initializing)?;

        let processes: Vec<Arc<ProcessState>> =
            self.inner.processes.read().values().cloned().collect();

        if processes.is_empty() {
            // Nothing to coordinate; the channel was never registered.
            self.inner
                .guard
                .transition(&[GuardState::Initializing], GuardState::Initialized)?;
            return Ok(());
        }

        let channel = gateway.channel(COORDINATION_CHANNEL)?;
        *self.inner.channel.write() = Some(channel);
        for state in processes {
            let property = process_property(&state.name);
            let filtered = self
                .inner
                .cluster
                .filter(move |node| node.has_property(&property));

            let weak = Arc::downgrade(&self.inner);
            let process = state.clone();
            let mut events = filtered.subscribe();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    if event.kind == ClusterEventKind::Leave {
                        break;
                    }
                    reconfigure(&inner, &process, event.topology.nodes().cloned().collect());
                }
            });
        }

        self.inner
            .guard
            .transition(&[GuardState::Initializing], GuardState::Initialized)?;
        Ok(())
    }

    /// Resolves once the named process reports completion on this node.
    pub async fn await_done(&self, name: &str) -> Result<()> {
        self.inner.guard.ensure_initialized()?;
        let state = self
            .inner
            .processes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                ClusterError::Coordination(format!("unknown coordination process: {}", name))
            })?;

        let mut rx = state.done_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(ClusterError::Coordination(format!(
                    "process {} ended without completing",
                    name
                )));
            }
        }
    }

    /// The active context of a process, if a round is running.
    pub fn context_of(&self, name: &str) -> Option<CoordinationContext> {
        self.inner
            .processes
            .read()
            .get(name)
            .and_then(|state| state.current.lock().clone())
    }

    pub async fn terminate(&self) -> Result<()> {
        for state in self.inner.processes.read().values() {
            if let Some(ctx) = state.current.lock().clone() {
                ctx.cancel();
            }
        }
        self.inner.guard.force(GuardState::Terminated);
        Ok(())
    }
}

/// Installs a fresh round for the new sub-topology and schedules prepare
/// (and coordinate, on the coordinator) on the process executor.
fn reconfigure(inner: &Arc<CoordInner>, state: &Arc<ProcessState>, members: Vec<Node>) {
    let Some(channel) = inner.channel.read().clone() else {
        return;
    };

    // Cancel whatever round was in flight; it will not be resumed.
    if let Some(previous) = state.current.lock().take() {
        previous.cancel();
    }

    if members.is_empty() {
        return;
    }

    let Some(coordinator) = members
        .iter()
        .min_by_key(|n| (n.join_order, n.id))
        .map(|n| n.id)
    else {
        return;
    };

    let epoch = state.epoch.fetch_add(1, Ordering::Relaxed) + 1;
    let ctx = CoordinationContext {
        inner: Arc::new(ContextInner {
            process: state.name.clone(),
            epoch,
            members,
            coordinator,
            local: inner.local(),
            channel,
            attachment: Mutex::new(None),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            done_tx: state.done_tx.clone(),
        }),
    };

    *state.current.lock() = Some(ctx.clone());

    tracing::debug!(
        process = %state.name,
        epoch,
        members = ctx.members().len(),
        coordinator = %coordinator,
        "coordination round configured"
    );

    let handler = state.handler.clone();
    let is_coordinator = ctx.is_coordinator();
    state.schedule(async move {
        if let Err(e) = handler.prepare(&ctx).await {
            tracing::warn!(process = ctx.process_name(), error = %e, "prepare failed");
            return;
        }
        if is_coordinator && !ctx.is_cancelled() {
            match handler.coordinate(&ctx).await {
                Ok(()) => {
                    tracing::debug!(process = ctx.process_name(), "coordination round finished");
                }
                Err(e) if ctx.is_cancelled() => {
                    tracing::debug!(process = ctx.process_name(), error = %e,
                        "round abandoned after cancellation");
                }
                Err(e) => {
                    tracing::warn!(process = ctx.process_name(), error = %e, "coordinate failed");
                }
            }
        }
    });
}
