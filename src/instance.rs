// The Hekate node: builder and lifecycle facade.
//
// The builder assembles the transport, membership, messaging, lock and
// coordination services; the kernel brings them up in dependency order and
// tears them down in reverse. Components hold only the narrow handles they
// need; the instance keeps the strong references.

use crate::cluster::join::{JoinValidator, JoinValidatorChain};
use crate::cluster::node::{Node, NodeAddress, NodeState};
use crate::cluster::seed::{SeedNodeManager, SeedNodeProvider, StaticSeedNodeProvider};
use crate::cluster::service::ClusterService;
use crate::cluster::split_brain::SplitBrainDetector;
use crate::cluster::view::ClusterView;
use crate::config::{ChannelConfig, HekateConfig};
use crate::coordinate::process::{process_property, CoordinationHandler, CoordinationService};
use crate::error::{ClusterError, Result};
use crate::lock::service::{LockRegion, LockService};
use crate::messaging::channel::Channel;
use crate::messaging::gateway::{ChannelOptions, MessagingGateway};
use crate::network::ping::PingHandler;
use crate::network::transport::{Connector, NetworkTransport};
use crate::network::PING_PROTOCOL;
use crate::runtime::kernel::{Service, ServiceKernel};
use async_trait::async_trait;
use std::sync::Arc;

/// Assembles a [`Hekate`] node.
pub struct HekateBuilder {
    config: HekateConfig,
    seed_provider: Option<Arc<dyn SeedNodeProvider>>,
    detector: Option<Arc<dyn SplitBrainDetector>>,
    validators: Vec<Arc<dyn JoinValidator>>,
    channels: Vec<(ChannelConfig, ChannelOptions)>,
    regions: Vec<String>,
    processes: Vec<(String, Arc<dyn CoordinationHandler>)>,
}

impl HekateBuilder {
    pub fn new(config: HekateConfig) -> Self {
        Self {
            config,
            seed_provider: None,
            detector: None,
            validators: Vec::new(),
            channels: Vec::new(),
            regions: Vec::new(),
            processes: Vec::new(),
        }
    }

    pub fn with_seed_provider(mut self, provider: Arc<dyn SeedNodeProvider>) -> Self {
        self.seed_provider = Some(provider);
        self
    }

    pub fn with_split_brain_detector(mut self, detector: Arc<dyn SplitBrainDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn with_join_validator(mut self, validator: Arc<dyn JoinValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_channel(mut self, config: ChannelConfig, options: ChannelOptions) -> Self {
        self.channels.push((config, options));
        self
    }

    pub fn with_lock_region(mut self, name: impl Into<String>) -> Self {
        self.regions.push(name.into());
        self
    }

    pub fn with_process(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn CoordinationHandler>,
    ) -> Self {
        self.processes.push((name.into(), handler));
        self
    }

    pub fn build(self) -> Result<Hekate> {
        self.config.validate()?;

        for process in &self.config.processes {
            if !self.processes.iter().any(|(name, _)| name == &process.name) {
                return Err(ClusterError::Configuration(format!(
                    "coordination process {} has no handler",
                    process.name
                )));
            }
        }

        let transport = NetworkTransport::new(self.config.network.clone());

        // The local descriptor advertises every configured process as a
        // service property; the port is fixed once the transport binds.
        let mut local = Node::new(
            self.config.cluster.node_name.clone(),
            NodeAddress::new(self.config.network.host.clone(), self.config.network.port),
        )
        .with_roles(self.config.cluster.roles.clone())
        .with_properties(self.config.cluster.properties.clone());
        for (name, _) in &self.processes {
            local
                .properties
                .insert(process_property(name), "true".to_string());
        }

        let provider: Arc<dyn SeedNodeProvider> = match self.seed_provider {
            Some(provider) => provider,
            None => Arc::new(StaticSeedNodeProvider::parse(
                &self.config.cluster.seed_nodes,
            )?),
        };
        let seeds = SeedNodeManager::new(
            self.config.cluster.cluster_name.clone(),
            provider,
            self.config.network.clone(),
        );

        let mut validators = JoinValidatorChain::new();
        for validator in self.validators {
            validators.push(validator);
        }

        let cluster = ClusterService::new(
            self.config.cluster.clone(),
            transport.clone(),
            seeds,
            validators,
            self.detector,
            local,
        );
        let view = cluster.view();

        let messaging = MessagingGateway::new(transport.clone(), view.clone());
        for channel in &self.config.channels {
            messaging.register_channel(channel.clone(), ChannelOptions::default())?;
        }
        for (config, options) in self.channels {
            messaging.register_channel(config, options)?;
        }

        let local_id: Arc<dyn Fn() -> crate::cluster::node::NodeId + Send + Sync> = {
            let cluster = cluster.clone();
            Arc::new(move || cluster.local_id())
        };

        let locks = LockService::new(transport.clone(), view.clone(), local_id.clone());
        for region in &self.config.lock_regions {
            locks.register_region(region.name.clone())?;
        }
        for region in self.regions {
            locks.register_region(region)?;
        }

        let coordinate = CoordinationService::new(view.clone(), local_id);
        let has_processes = !self.processes.is_empty();
        for (name, handler) in self.processes {
            coordinate.register_process(name, handler)?;
        }
        if has_processes {
            coordinate.register_channel(&messaging)?;
        }

        let mut kernel = ServiceKernel::new();
        kernel.register(Arc::new(NetworkService {
            transport: transport.clone(),
        }));
        kernel.register(Arc::new(ClusterKernelService {
            cluster: cluster.clone(),
            transport: transport.clone(),
            host: self.config.network.host.clone(),
        }));
        kernel.register(Arc::new(MessagingKernelService {
            messaging: messaging.clone(),
        }));
        kernel.register(Arc::new(LockKernelService {
            locks: locks.clone(),
        }));
        kernel.register(Arc::new(CoordinationKernelService {
            coordinate: coordinate.clone(),
            messaging: messaging.clone(),
        }));

        Ok(Hekate {
            inner: Arc::new(HekateInner {
                transport,
                cluster,
                messaging,
                locks,
                coordinate,
                kernel,
            }),
        })
    }
}

struct HekateInner {
    transport: Arc<NetworkTransport>,
    cluster: ClusterService,
    messaging: MessagingGateway,
    locks: LockService,
    coordinate: CoordinationService,
    kernel: ServiceKernel,
}

/// A single cluster node.
#[derive(Clone)]
pub struct Hekate {
    inner: Arc<HekateInner>,
}

impl Hekate {
    pub fn builder(config: HekateConfig) -> HekateBuilder {
        HekateBuilder::new(config)
    }

    /// Brings every service up in dependency order.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.kernel.start_all().await
    }

    /// Joins the cluster; the node ends in the Up state.
    pub async fn join(&self) -> Result<()> {
        self.inner.cluster.join().await
    }

    /// Convenience: initialize then join.
    pub async fn start(&self) -> Result<()> {
        self.initialize().await?;
        self.join().await
    }

    /// Gracefully leaves the cluster and shuts every service down.
    pub async fn leave(&self) -> Result<()> {
        self.inner.cluster.leave().await?;
        self.inner.kernel.stop_all().await
    }

    /// Stops immediately; peers detect the failure.
    pub async fn terminate(&self) -> Result<()> {
        self.inner.cluster.terminate().await?;
        self.inner.kernel.stop_all().await
    }

    pub fn state(&self) -> NodeState {
        self.inner.cluster.state()
    }

    pub fn local_node(&self) -> Node {
        self.inner.cluster.local_node()
    }

    pub fn cluster(&self) -> &ClusterService {
        &self.inner.cluster
    }

    pub fn view(&self) -> ClusterView {
        self.inner.cluster.view()
    }

    pub fn messaging(&self) -> &MessagingGateway {
        &self.inner.messaging
    }

    pub fn channel(&self, name: &str) -> Result<Channel> {
        self.inner.messaging.channel(name)
    }

    pub fn locks(&self) -> &LockService {
        &self.inner.locks
    }

    pub fn lock_region(&self, name: &str) -> Result<LockRegion> {
        self.inner.locks.region(name)
    }

    pub fn coordinate(&self) -> &CoordinationService {
        &self.inner.coordinate
    }

    /// The transport's bound address once initialized.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.transport.local_addr()
    }
}

// ---------------------------------------------------------------------------
// Kernel adapters
// ---------------------------------------------------------------------------

struct NetworkService {
    transport: Arc<NetworkTransport>,
}

#[async_trait]
impl Service for NetworkService {
    fn name(&self) -> &str {
        "network"
    }

    async fn initialize(&self) -> Result<()> {
        self.transport
            .register(Connector::new(PING_PROTOCOL, Arc::new(PingHandler)))?;
        self.transport.bind().await?;
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        self.transport.shutdown();
        Ok(())
    }
}

struct ClusterKernelService {
    cluster: ClusterService,
    transport: Arc<NetworkTransport>,
    host: String,
}

#[async_trait]
impl Service for ClusterKernelService {
    fn name(&self) -> &str {
        "cluster"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["network".to_string()]
    }

    async fn initialize(&self) -> Result<()> {
        let bound = self.transport.local_addr().ok_or_else(|| {
            ClusterError::IllegalState("transport is not bound".to_string())
        })?;
        self.cluster
            .update_local_address(NodeAddress::new(self.host.clone(), bound.port()));
        self.cluster.initialize().await
    }

    async fn terminate(&self) -> Result<()> {
        self.cluster.terminate().await
    }
}

struct MessagingKernelService {
    messaging: MessagingGateway,
}

#[async_trait]
impl Service for MessagingKernelService {
    fn name(&self) -> &str {
        "messaging"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["cluster".to_string()]
    }

    async fn initialize(&self) -> Result<()> {
        self.messaging.initialize().await
    }

    async fn terminate(&self) -> Result<()> {
        self.messaging.terminate().await
    }
}

struct LockKernelService {
    locks: LockService,
}

#[async_trait]
impl Service for LockKernelService {
    fn name(&self) -> &str {
        "locks"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["cluster".to_string()]
    }

    async fn initialize(&self) -> Result<()> {
        self.locks.initialize().await
    }

    async fn terminate(&self) -> Result<()> {
        self.locks.terminate().await
    }
}

struct CoordinationKernelService {
    coordinate: CoordinationService,
    messaging: MessagingGateway,
}

#[async_trait]
impl Service for CoordinationKernelService {
    fn name(&self) -> &str {
        "coordination"
    }

    fn dependencies(&self) -> Vec<String> {
        vec!["messaging".to_string()]
    }

    async fn initialize(&self) -> Result<()> {
        self.coordinate.initialize(&self.messaging).await
    }

    async fn terminate(&self) -> Result<()> {
        self.coordinate.terminate().await
    }
}
