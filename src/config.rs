// Configuration surface for a Hekate node.
//
// Every tunable is an explicit struct field with a documented default. The
// structs are serde-derived so a node can be configured from JSON, and
// `validate()` rejects bad options before any socket is bound.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;

/// What a node does when the split-brain detector reports an invalid view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitBrainAction {
    /// Terminate and rejoin with a fresh identity and join-order.
    Rejoin,
    /// Transition to Down and stay there.
    Terminate,
}

/// Behavior of the outbound pressure guard when the high watermark is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Block the sender until the queue drains below the low watermark.
    Block,
    /// Fail the send immediately.
    Fail,
}

/// Cluster-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical cluster name; joins across differently named clusters are rejected.
    pub cluster_name: String,

    /// Human-readable node name (informational).
    pub node_name: String,

    /// Roles advertised by this node, fixed at startup.
    pub roles: BTreeSet<String>,

    /// Property map advertised by this node, fixed at startup.
    pub properties: BTreeMap<String, String>,

    /// Interval between gossip rounds.
    pub gossip_interval: Duration,

    /// Number of random peers contacted per gossip round.
    pub gossip_fanout: usize,

    /// A peer is suspected once nothing was heard from it for this long.
    pub suspect_timeout: Duration,

    /// Fraction of UP members whose suspicions mark a node FAILED.
    /// The default of 0.5 requires a strict majority.
    pub failure_quorum: f64,

    /// Seed addresses for the default static provider ("host:port").
    pub seed_nodes: Vec<String>,

    /// Action applied when the split-brain detector reports invalid.
    pub split_brain_action: SplitBrainAction,

    /// Re-check interval while the detector keeps reporting invalid at join.
    pub split_brain_check_interval: Duration,

    /// Upper bound on a graceful leave before it escalates to terminate.
    pub leave_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: "hekate".to_string(),
            node_name: String::new(),
            roles: BTreeSet::new(),
            properties: BTreeMap::new(),
            gossip_interval: Duration::from_millis(250),
            gossip_fanout: 3,
            suspect_timeout: Duration::from_secs(5),
            failure_quorum: 0.5,
            seed_nodes: Vec::new(),
            split_brain_action: SplitBrainAction::Terminate,
            split_brain_check_interval: Duration::from_millis(500),
            leave_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host to bind and advertise.
    pub host: String,

    /// First port to try when binding. 0 asks the OS for an ephemeral port.
    pub port: u16,

    /// Number of consecutive ports tried on bind failure.
    pub port_range: u16,

    /// Bound on establishing an outbound connection (including handshake).
    pub connect_timeout: Duration,

    /// Delay before the acceptor retries after a failure.
    pub accept_retry_interval: Duration,

    /// Write-idle interval after which a heartbeat frame is pushed.
    pub heartbeat_interval: Duration,

    /// Read-idle timeout = heartbeat_interval * heartbeat_loss_threshold.
    pub heartbeat_loss_threshold: u32,

    /// Suppress heartbeat emission (read timeouts still apply).
    pub heartbeats_disabled: bool,

    /// Advisory sizing for I/O worker threads (the runtime owns the pool).
    pub nio_threads: usize,

    pub tcp_no_delay: bool,
    pub so_receive_buffer: Option<usize>,
    pub so_send_buffer: Option<usize>,
    pub so_reuse_address: bool,
    pub so_backlog: u32,

    /// Largest accepted frame, guarding against corrupt length prefixes.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            port_range: 1,
            connect_timeout: Duration::from_secs(3),
            accept_retry_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_loss_threshold: 3,
            heartbeats_disabled: false,
            nio_threads: 0,
            tcp_no_delay: true,
            so_receive_buffer: None,
            so_send_buffer: None,
            so_reuse_address: true,
            so_backlog: 128,
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl NetworkConfig {
    /// Read-idle bound derived from the heartbeat settings.
    pub fn read_idle_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_loss_threshold.max(1)
    }

    /// Effective number of I/O threads.
    pub fn effective_nio_threads(&self) -> usize {
        if self.nio_threads == 0 {
            num_cpus::get()
        } else {
            self.nio_threads
        }
    }
}

/// Outbound/inbound pressure bounds for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// In-flight outbound messages above which the overflow policy applies.
    pub out_high_watermark: usize,

    /// Blocked senders resume below this mark.
    pub out_low_watermark: usize,

    pub out_overflow: OverflowPolicy,

    /// Queued inbound messages above which the connection reader is paused.
    pub in_high_watermark: usize,

    /// The paused reader resumes below this mark.
    pub in_low_watermark: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            out_high_watermark: 10_000,
            out_low_watermark: 5_000,
            out_overflow: OverflowPolicy::Block,
            in_high_watermark: 10_000,
            in_low_watermark: 5_000,
        }
    }
}

/// One messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,

    /// Pooled connections per remote peer; affinity keys hash over these.
    pub sockets: usize,

    /// Async workers running receiver callbacks for this channel.
    pub worker_threads: usize,

    /// Idle pooled connections are closed after this long.
    pub idle_timeout: Duration,

    /// Default request timeout when the caller supplies none.
    pub default_timeout: Duration,

    pub backpressure: BackpressureConfig,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sockets: 1,
            worker_threads: 4,
            idle_timeout: Duration::from_secs(60),
            default_timeout: Duration::from_secs(10),
            backpressure: BackpressureConfig::default(),
        }
    }
}

/// One distributed lock region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRegionConfig {
    pub name: String,
}

/// One coordination process (the handler is attached through the builder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationProcessConfig {
    pub name: String,
}

/// Complete node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HekateConfig {
    pub cluster: ClusterConfig,
    pub network: NetworkConfig,
    pub channels: Vec<ChannelConfig>,
    pub lock_regions: Vec<LockRegionConfig>,
    pub processes: Vec<CoordinationProcessConfig>,
}

impl HekateConfig {
    /// Parse a configuration from its JSON rendering.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ClusterError::Configuration(format!("invalid configuration: {}", e)))
    }

    /// Reject bad options and duplicate names before startup.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.cluster_name.is_empty() {
            return Err(ClusterError::Configuration(
                "cluster.name must not be empty".to_string(),
            ));
        }
        if self.cluster.gossip_fanout == 0 {
            return Err(ClusterError::Configuration(
                "cluster.gossip_fanout must be at least 1".to_string(),
            ));
        }
        if !(self.cluster.failure_quorum > 0.0 && self.cluster.failure_quorum <= 1.0) {
            return Err(ClusterError::Configuration(format!(
                "cluster.failure_quorum must be in (0, 1], got {}",
                self.cluster.failure_quorum
            )));
        }
        if self.network.heartbeat_loss_threshold == 0 {
            return Err(ClusterError::Configuration(
                "network.heartbeat_loss_threshold must be at least 1".to_string(),
            ));
        }
        if self.network.heartbeat_interval.is_zero() {
            return Err(ClusterError::Configuration(
                "network.heartbeat_interval must be positive".to_string(),
            ));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(ClusterError::Configuration(
                    "messaging channel name must not be empty".to_string(),
                ));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate messaging channel: {}",
                    channel.name
                )));
            }
            if channel.sockets == 0 {
                return Err(ClusterError::Configuration(format!(
                    "channel {} must have at least one socket",
                    channel.name
                )));
            }
            if channel.worker_threads == 0 {
                return Err(ClusterError::Configuration(format!(
                    "channel {} must have at least one worker",
                    channel.name
                )));
            }
            let bp = &channel.backpressure;
            if bp.out_low_watermark > bp.out_high_watermark
                || bp.in_low_watermark > bp.in_high_watermark
            {
                return Err(ClusterError::Configuration(format!(
                    "channel {} backpressure low watermark exceeds high watermark",
                    channel.name
                )));
            }
        }

        let mut regions: HashSet<&str> = HashSet::new();
        for region in &self.lock_regions {
            if !regions.insert(region.name.as_str()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate lock region: {}",
                    region.name
                )));
            }
        }

        let mut processes: HashSet<&str> = HashSet::new();
        for process in &self.processes {
            if !processes.insert(process.name.as_str()) {
                return Err(ClusterError::Configuration(format!(
                    "duplicate coordination process: {}",
                    process.name
                )));
            }
        }

        Ok(())
    }
}
