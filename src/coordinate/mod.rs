// Coordination framework.
//
// Submodules:
// - `process`: coordinator-driven broadcast/collect rounds
// - `election`: leader election built on the kernel

pub mod election;
pub mod process;

pub use election::{leader_election, ElectionHandler, LeaderWatch};
pub use process::{
    process_property, CoordinationContext, CoordinationHandler, CoordinationService,
    COORDINATION_CHANNEL,
};
