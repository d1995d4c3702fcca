// Service lifecycle runtime: the state guard gating public operations and
// the kernel driving dependency-ordered bring-up and tear-down.

pub mod guard;
pub mod kernel;

pub use guard::{GuardState, OperationGuard, StateGuard};
pub use kernel::{Service, ServiceKernel};
