// Hekate - clustering and messaging toolkit.
//
// Peer nodes discover each other through pluggable seed providers, converge
// on a shared membership view via gossip, and exchange messages over
// multiplexed channels with load balancing, backpressure and failover. On
// top of membership and messaging sit partitioned distributed locks and a
// coordinator-driven coordination framework (leader election, barriers).
//
// Subsystems:
// - `network`: connection-oriented transport, framing, codecs, ping
// - `cluster`: gossip membership, topology views, seeds, split-brain
// - `messaging`: channels, balancing, failover, backpressure, workers
// - `lock`: partitioned lock regions with two-phase migration
// - `coordinate`: coordination processes and leader election
// - `runtime`: service lifecycle kernel and the state guard

pub mod cluster;
pub mod config;
pub mod coordinate;
pub mod error;
pub mod instance;
pub mod lock;
pub mod messaging;
pub mod metrics;
pub mod network;
pub mod runtime;

pub use cluster::{
    ClusterEvent, ClusterEventKind, ClusterService, ClusterView, Node, NodeAddress, NodeId,
    NodeState, NodeStatus, Topology, TopologyHash,
};
pub use config::{
    BackpressureConfig, ChannelConfig, ClusterConfig, CoordinationProcessConfig, HekateConfig,
    LockRegionConfig, NetworkConfig, OverflowPolicy, SplitBrainAction,
};
pub use coordinate::{CoordinationContext, CoordinationHandler, CoordinationService};
pub use error::{ClusterError, Result};
pub use instance::{Hekate, HekateBuilder};
pub use lock::{LockHandle, LockOwner, LockRegion, LockService};
pub use messaging::{
    Channel, ChannelOptions, InboundMessage, MessageReceiver, MessagingGateway, Responder,
    SendOptions,
};
