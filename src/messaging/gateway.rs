// Messaging gateway: the channel registry.
//
// Channels are declared before initialization; `initialize` registers one
// transport connector per channel and wires the (optionally filtered)
// cluster view into each. Operations on an uninitialized or terminated
// gateway fail with an illegal-state error.

use crate::cluster::node::Node;
use crate::cluster::view::ClusterView;
use crate::config::{ChannelConfig, NetworkConfig};
use crate::error::{ClusterError, Result};
use crate::messaging::balancer::{LoadBalancer, RoundRobinBalancer};
use crate::messaging::channel::{Channel, ChannelCore, ChannelHandler, MessageReceiver};
use crate::messaging::failover::{FailFast, FailoverCondition, FailoverPolicy, TransientOnly};
use crate::network::transport::{Connector, NetworkTransport};
use crate::runtime::guard::{GuardState, StateGuard};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-channel wiring beyond the declarative config.
pub struct ChannelOptions {
    pub receiver: Option<Arc<dyn MessageReceiver>>,
    pub balancer: Arc<dyn LoadBalancer>,
    pub failover: Arc<dyn FailoverPolicy>,
    pub condition: Arc<dyn FailoverCondition>,
    /// Narrows the channel to matching cluster members.
    pub filter: Option<Arc<dyn Fn(&Node) -> bool + Send + Sync>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            receiver: None,
            balancer: Arc::new(RoundRobinBalancer::new()),
            failover: Arc::new(FailFast),
            condition: Arc::new(TransientOnly),
            filter: None,
        }
    }
}

impl ChannelOptions {
    pub fn with_receiver(mut self, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_balancer(mut self, balancer: Arc<dyn LoadBalancer>) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_failover(mut self, failover: Arc<dyn FailoverPolicy>) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_condition(mut self, condition: Arc<dyn FailoverCondition>) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_filter(mut self, filter: impl Fn(&Node) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }
}

struct Declared {
    config: ChannelConfig,
    options: ChannelOptions,
}

struct GatewayInner {
    transport: Arc<NetworkTransport>,
    cluster: ClusterView,
    net: NetworkConfig,
    guard: StateGuard,
    declared: RwLock<Vec<Declared>>,
    channels: RwLock<HashMap<String, Arc<ChannelCore>>>,
}

/// Handle onto the messaging subsystem.
#[derive(Clone)]
pub struct MessagingGateway {
    inner: Arc<GatewayInner>,
}

impl MessagingGateway {
    pub fn new(transport: Arc<NetworkTransport>, cluster: ClusterView) -> Self {
        let net = transport.config().clone();
        Self {
            inner: Arc::new(GatewayInner {
                transport,
                cluster,
                net,
                guard: StateGuard::new("messaging"),
                declared: RwLock::new(Vec::new()),
                channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Declares a channel; must happen before `initialize`.
    pub fn register_channel(&self, config: ChannelConfig, options: ChannelOptions) -> Result<()> {
        if self.inner.guard.state() != GuardState::Down {
            return Err(ClusterError::IllegalState(
                "channels must be registered before the gateway initializes".to_string(),
            ));
        }
        let mut declared = self.inner.declared.write();
        if declared.iter().any(|d| d.config.name == config.name) {
            return Err(ClusterError::Configuration(format!(
                "duplicate messaging channel: {}",
                config.name
            )));
        }
        declared.push(Declared { config, options });
        Ok(())
    }

    /// Builds every declared channel and registers its connector.
    pub async fn initialize(&self) -> Result<()> {
        self.inner
            .guard
            .transition(&[GuardState::Down], GuardState::Initializing)?;

        let declared = std::mem::take(&mut *self.inner.declared.write());
        let mut channels = HashMap::new();

        for Declared { config, options } in declared {
            let view = match &options.filter {
                Some(filter) => {
                    let filter = filter.clone();
                    self.inner.cluster.filter(move |n| (filter.as_ref())(n))
                }
                None => self.inner.cluster.clone(),
            };

            let core = ChannelCore::new(
                config,
                self.inner.net.clone(),
                view,
                options.balancer,
                options.failover,
                options.condition,
                options.receiver,
            );

            self.inner.transport.register(Connector::new(
                core.protocol(),
                Arc::new(ChannelHandler::new(&core)),
            ))?;

            tracing::debug!(channel = core.name(), "channel initialized");
            channels.insert(core.name().to_string(), core);
        }

        *self.inner.channels.write() = channels;
        self.inner
            .guard
            .transition(&[GuardState::Initializing], GuardState::Initialized)?;
        Ok(())
    }

    /// Looks up an initialized channel by name.
    pub fn channel(&self, name: &str) -> Result<Channel> {
        self.inner.guard.ensure_initialized()?;
        self.inner
            .channels
            .read()
            .get(name)
            .cloned()
            .map(Channel::new)
            .ok_or_else(|| ClusterError::Messaging(format!("unknown channel: {}", name)))
    }

    /// Closes every pooled connection and refuses further operations.
    pub async fn terminate(&self) -> Result<()> {
        for core in self.inner.channels.read().values() {
            core.disconnect_all();
        }
        self.inner.guard.force(GuardState::Terminated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{NodeAddress, NodeId};
    use crate::cluster::topology::Topology;
    use crate::cluster::view::{ClusterEvent, ClusterEventKind};
    use crate::messaging::channel::{InboundMessage, Responder, SendOptions};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct EchoReceiver;

    #[async_trait]
    impl MessageReceiver for EchoReceiver {
        async fn receive(&self, msg: InboundMessage, responder: Responder) -> Result<()> {
            responder.complete(msg.payload).await
        }
    }

    struct StreamingReceiver;

    #[async_trait]
    impl MessageReceiver for StreamingReceiver {
        async fn receive(&self, msg: InboundMessage, responder: Responder) -> Result<()> {
            responder.partial(Bytes::from_static(b"part-1")).await?;
            responder.partial(Bytes::from_static(b"part-2")).await?;
            responder.complete(msg.payload).await
        }
    }

    struct FailingReceiver;

    #[async_trait]
    impl MessageReceiver for FailingReceiver {
        async fn receive(&self, _msg: InboundMessage, _responder: Responder) -> Result<()> {
            Err(ClusterError::Internal("handler exploded".into()))
        }
    }

    struct SilentReceiver;

    #[async_trait]
    impl MessageReceiver for SilentReceiver {
        async fn receive(&self, _msg: InboundMessage, _responder: Responder) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingReceiver {
        seen: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl MessageReceiver for RecordingReceiver {
        async fn receive(&self, msg: InboundMessage, responder: Responder) -> Result<()> {
            self.seen.lock().push(msg.payload);
            responder.complete(Bytes::new()).await
        }
    }

    fn net_config() -> NetworkConfig {
        NetworkConfig {
            connect_timeout: Duration::from_millis(500),
            ..NetworkConfig::default()
        }
    }

    /// Two in-process endpoints sharing one logical cluster view.
    async fn gateway_pair(
        receiver: Arc<dyn MessageReceiver>,
    ) -> (MessagingGateway, MessagingGateway, NodeId) {
        let t1 = NetworkTransport::new(net_config());
        let t2 = NetworkTransport::new(net_config());
        let a1 = t1.bind().await.unwrap();
        let a2 = t2.bind().await.unwrap();

        let mut n1 = crate::cluster::node::Node::new("n1", NodeAddress::from(a1));
        n1.join_order = 1;
        let mut n2 = crate::cluster::node::Node::new("n2", NodeAddress::from(a2));
        n2.join_order = 2;
        let receiver_id = n2.id;

        let mut nodes = BTreeMap::new();
        nodes.insert(n1.id, n1.clone());
        nodes.insert(n2.id, n2.clone());
        let topology = Arc::new(Topology::new(1, nodes));

        let view = ClusterView::new();
        view.publish(ClusterEvent {
            kind: ClusterEventKind::Join,
            topology,
            added: vec![n1, n2],
            removed: Vec::new(),
        });

        let g1 = MessagingGateway::new(t1, view.clone());
        let g2 = MessagingGateway::new(t2, view.clone());

        g1.register_channel(ChannelConfig::new("test"), ChannelOptions::default())
            .unwrap();
        g2.register_channel(
            ChannelConfig::new("test"),
            ChannelOptions::default().with_receiver(receiver),
        )
        .unwrap();

        g1.initialize().await.unwrap();
        g2.initialize().await.unwrap();

        (g1, g2, receiver_id)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (g1, _g2, receiver_id) = gateway_pair(Arc::new(EchoReceiver)).await;
        let channel = g1.channel("test").unwrap();

        let reply = channel
            .request_to(receiver_id, Bytes::from_static(b"hello"), SendOptions::new())
            .await
            .unwrap();
        assert_eq!(reply.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_streaming_replies() {
        let (g1, _g2, receiver_id) = gateway_pair(Arc::new(StreamingReceiver)).await;
        let channel = g1.channel("test").unwrap();

        let mut stream = channel
            .stream_to(receiver_id, Bytes::from_static(b"final"), SendOptions::new())
            .await
            .unwrap();

        let mut parts = Vec::new();
        while let Some(part) = stream.next().await {
            parts.push(part.unwrap());
        }
        assert_eq!(
            parts,
            vec![
                crate::messaging::channel::ResponsePart::Chunk(Bytes::from_static(b"part-1")),
                crate::messaging::channel::ResponsePart::Chunk(Bytes::from_static(b"part-2")),
                crate::messaging::channel::ResponsePart::Final(Bytes::from_static(b"final")),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_reply_carries_remote_rendering() {
        let (g1, _g2, receiver_id) = gateway_pair(Arc::new(FailingReceiver)).await;
        let channel = g1.channel("test").unwrap();

        let err = channel
            .request_to(receiver_id, Bytes::from_static(b"x"), SendOptions::new())
            .await
            .unwrap_err();
        match err {
            ClusterError::Remote(trace) => assert!(trace.contains("handler exploded")),
            other => panic!("expected remote failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (g1, _g2, receiver_id) = gateway_pair(Arc::new(SilentReceiver)).await;
        let channel = g1.channel("test").unwrap();

        let err = channel
            .request_to(
                receiver_id,
                Bytes::from_static(b"x"),
                SendOptions::new().with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_notification_is_fire_and_forget() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (g1, _g2, receiver_id) =
            gateway_pair(Arc::new(RecordingReceiver { seen: seen.clone() })).await;
        let channel = g1.channel("test").unwrap();

        channel
            .notify_to(receiver_id, Bytes::from_static(b"event"), SendOptions::new())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !seen.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.lock()[0].as_ref(), b"event");
    }

    #[tokio::test]
    async fn test_affinity_preserves_send_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (g1, _g2, receiver_id) =
            gateway_pair(Arc::new(RecordingReceiver { seen: seen.clone() })).await;
        let channel = g1.channel("test").unwrap();

        let opts = SendOptions::new().with_affinity(Bytes::from_static(b"k42"));
        for i in 0..200u32 {
            channel
                .notify_to(
                    receiver_id,
                    Bytes::from(i.to_be_bytes().to_vec()),
                    opts.clone(),
                )
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if seen.lock().len() == 200 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock();
        for (i, payload) in seen.iter().enumerate() {
            assert_eq!(payload.as_ref(), (i as u32).to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_channel_lookup_guarded() {
        let transport = NetworkTransport::new(net_config());
        let gateway = MessagingGateway::new(transport, ClusterView::new());
        gateway
            .register_channel(ChannelConfig::new("jobs"), ChannelOptions::default())
            .unwrap();

        // Not initialized yet.
        assert!(matches!(
            gateway.channel("jobs").unwrap_err(),
            ClusterError::IllegalState(_)
        ));

        gateway.initialize().await.unwrap();
        assert!(gateway.channel("jobs").is_ok());
        assert!(matches!(
            gateway.channel("missing").unwrap_err(),
            ClusterError::Messaging(_)
        ));

        gateway.terminate().await.unwrap();
        assert!(matches!(
            gateway.channel("jobs").unwrap_err(),
            ClusterError::IllegalState(_)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_channel_rejected() {
        let transport = NetworkTransport::new(net_config());
        let gateway = MessagingGateway::new(transport, ClusterView::new());
        gateway
            .register_channel(ChannelConfig::new("jobs"), ChannelOptions::default())
            .unwrap();
        let err = gateway
            .register_channel(ChannelConfig::new("jobs"), ChannelOptions::default())
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }
}
