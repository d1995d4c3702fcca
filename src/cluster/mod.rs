// Gossip-based cluster membership.
//
// Submodules:
// - `node`: identities, addresses, statuses, lifecycle states
// - `topology`: immutable versioned snapshots and the content hash
// - `view`: observable views, filtered views, topology futures
// - `gossip`: the roster and its merge rules
// - `protocol`: membership wire messages
// - `seed`: seed-node providers and the directory manager
// - `join`: join validator chain
// - `split_brain`: split-brain detection contract
// - `service`: the membership service itself

pub mod gossip;
pub mod join;
pub mod node;
pub mod protocol;
pub mod seed;
pub mod service;
pub mod split_brain;
pub mod topology;
pub mod view;

pub use join::{AddressFamilyValidator, JoinContext, JoinValidator, JoinValidatorChain};
pub use node::{Node, NodeAddress, NodeId, NodeState, NodeStatus};
pub use seed::{
    FilesystemSeedNodeProvider, SeedNodeManager, SeedNodeProvider, StaticSeedNodeProvider,
};
pub use service::ClusterService;
pub use split_brain::{AlwaysValid, SplitBrainAction, SplitBrainDetector};
pub use topology::{Topology, TopologyHash, TopologySnapshot};
pub use view::{ClusterEvent, ClusterEventKind, ClusterView};
