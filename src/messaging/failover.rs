// Failover contracts and built-in policies.
//
// A policy sees the failure of one physical send attempt and chooses the
// next move; a condition gates whether the policy is consulted at all.
// Every retry is a new attempt with a fresh correlation id.

use crate::cluster::node::NodeId;
use crate::error::ClusterError;

/// Routing preference recorded on the failure for the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverRouting {
    PreferSame,
    ReRoute,
}

/// What the policy learns about a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureInfo {
    pub error: ClusterError,
    /// Zero-based attempt counter.
    pub attempt: u32,
    pub last_node: NodeId,
    pub routing: FailoverRouting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    RetrySameNode,
    RetryDifferentNode,
    Fail,
}

pub trait FailoverPolicy: Send + Sync {
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision;
}

impl<F> FailoverPolicy for F
where
    F: Fn(&FailureInfo) -> FailoverDecision + Send + Sync,
{
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision {
        self(failure)
    }
}

/// Gates when the failover policy applies.
pub trait FailoverCondition: Send + Sync {
    fn should_failover(&self, error: &ClusterError) -> bool;
}

impl<F> FailoverCondition for F
where
    F: Fn(&ClusterError) -> bool + Send + Sync,
{
    fn should_failover(&self, error: &ClusterError) -> bool {
        self(error)
    }
}

/// Only transient transport-level failures are retried.
pub struct TransientOnly;

impl FailoverCondition for TransientOnly {
    fn should_failover(&self, error: &ClusterError) -> bool {
        error.is_transient()
    }
}

/// Never retry.
pub struct FailFast;

impl FailoverPolicy for FailFast {
    fn apply(&self, _failure: &FailureInfo) -> FailoverDecision {
        FailoverDecision::Fail
    }
}

/// Retry on the same node up to a bound.
pub struct RetrySame {
    pub max_attempts: u32,
}

impl FailoverPolicy for RetrySame {
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision {
        if failure.attempt + 1 < self.max_attempts {
            FailoverDecision::RetrySameNode
        } else {
            FailoverDecision::Fail
        }
    }
}

/// Move to another node on each failed attempt, up to a bound.
pub struct Rotate {
    pub max_attempts: u32,
}

impl FailoverPolicy for Rotate {
    fn apply(&self, failure: &FailureInfo) -> FailoverDecision {
        if failure.attempt + 1 < self.max_attempts {
            FailoverDecision::RetryDifferentNode
        } else {
            FailoverDecision::Fail
        }
    }
}
