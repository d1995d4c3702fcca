// Reader-writer lifecycle guard.
//
// Every public service operation passes a cheap state check: the operation
// path takes the read lock and asserts the service is initialized, lifecycle
// transitions take the write lock. Calls made after termination get a uniform
// illegal-state error instead of a crash.

use crate::error::{ClusterError, Result};
use parking_lot::{RwLock, RwLockReadGuard};
use std::fmt;

/// Coarse lifecycle state of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Down,
    Initializing,
    Initialized,
    Terminating,
    Terminated,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GuardState::Down => "Down",
            GuardState::Initializing => "Initializing",
            GuardState::Initialized => "Initialized",
            GuardState::Terminating => "Terminating",
            GuardState::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// Holds the read lock for the duration of a synchronous operation.
pub struct OperationGuard<'a> {
    _lock: RwLockReadGuard<'a, GuardState>,
}

/// Lifecycle guard for one service.
pub struct StateGuard {
    name: &'static str,
    state: RwLock<GuardState>,
}

impl StateGuard {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: RwLock::new(GuardState::Down),
        }
    }

    pub fn state(&self) -> GuardState {
        *self.state.read()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == GuardState::Initialized
    }

    /// Takes the read lock and asserts the service is initialized. The guard
    /// must not be held across awaits; async paths use [`ensure_initialized`]
    /// instead and re-fail on closed resources.
    ///
    /// [`ensure_initialized`]: StateGuard::ensure_initialized
    pub fn enter(&self) -> Result<OperationGuard<'_>> {
        let lock = self.state.read();
        if *lock != GuardState::Initialized {
            return Err(self.illegal_state(*lock));
        }
        Ok(OperationGuard { _lock: lock })
    }

    /// Cheap entry check for async operations.
    pub fn ensure_initialized(&self) -> Result<()> {
        let state = self.state();
        if state != GuardState::Initialized {
            return Err(self.illegal_state(state));
        }
        Ok(())
    }

    /// Moves to `to` if the current state is one of `from`.
    pub fn transition(&self, from: &[GuardState], to: GuardState) -> Result<()> {
        let mut lock = self.state.write();
        if !from.contains(&*lock) {
            return Err(ClusterError::IllegalState(format!(
                "{}: cannot transition from {} to {}",
                self.name, *lock, to
            )));
        }
        tracing::debug!(service = self.name, from = %*lock, to = %to, "state transition");
        *lock = to;
        Ok(())
    }

    /// Unconditional transition used by terminate paths.
    pub fn force(&self, to: GuardState) {
        let mut lock = self.state.write();
        tracing::debug!(service = self.name, from = %*lock, to = %to, "forced state transition");
        *lock = to;
    }

    fn illegal_state(&self, state: GuardState) -> ClusterError {
        ClusterError::IllegalState(format!("{} is not initialized (state: {})", self.name, state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_down() {
        let guard = StateGuard::new("svc");
        assert_eq!(guard.state(), GuardState::Down);
        assert!(guard.enter().is_err());
    }

    #[test]
    fn test_operations_allowed_when_initialized() {
        let guard = StateGuard::new("svc");
        guard
            .transition(&[GuardState::Down], GuardState::Initializing)
            .unwrap();
        guard
            .transition(&[GuardState::Initializing], GuardState::Initialized)
            .unwrap();
        assert!(guard.enter().is_ok());
        assert!(guard.ensure_initialized().is_ok());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let guard = StateGuard::new("svc");
        let err = guard
            .transition(&[GuardState::Initialized], GuardState::Terminating)
            .unwrap_err();
        assert!(matches!(err, ClusterError::IllegalState(_)));
    }

    #[test]
    fn test_terminated_calls_fail_uniformly() {
        let guard = StateGuard::new("svc");
        guard.force(GuardState::Terminated);
        let err = guard.ensure_initialized().unwrap_err();
        assert!(matches!(err, ClusterError::IllegalState(_)));
        assert!(err.to_string().contains("Terminated"));
    }

    #[test]
    fn test_many_readers() {
        let guard = StateGuard::new("svc");
        guard.force(GuardState::Initialized);
        let g1 = guard.enter().unwrap();
        let g2 = guard.enter().unwrap();
        drop(g1);
        drop(g2);
    }
}
