// Distributed locks.
//
// Submodules:
// - `protocol`: lock and migration wire messages
// - `region`: manager-side region state machine
// - `service`: the lock service, client API and migration driver

pub mod protocol;
pub(crate) mod region;
pub mod service;

pub use protocol::{LockEntry, LockMigrationKey, LockWireStatus};
pub use service::{current_thread_token, LockHandle, LockOwner, LockRegion, LockService};
