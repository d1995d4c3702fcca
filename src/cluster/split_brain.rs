// Split-brain detection contract.
//
// A detector decides whether the local node still belongs to a valid
// partition. It is consulted at join time (repeating while invalid) and
// whenever gossip leaves this node as the only remaining UP member of a
// recent partition. A detector error terminates the node unconditionally.

use crate::cluster::node::Node;
use crate::error::Result;

pub use crate::config::SplitBrainAction;

pub trait SplitBrainDetector: Send + Sync {
    fn is_valid(&self, local: &Node) -> Result<bool>;
}

impl<F> SplitBrainDetector for F
where
    F: Fn(&Node) -> Result<bool> + Send + Sync,
{
    fn is_valid(&self, local: &Node) -> Result<bool> {
        self(local)
    }
}

/// Always reports a valid partition.
pub struct AlwaysValid;

impl SplitBrainDetector for AlwaysValid {
    fn is_valid(&self, _local: &Node) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::NodeAddress;
    use crate::error::ClusterError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_always_valid() {
        let node = Node::new("n", NodeAddress::new("127.0.0.1", 7000));
        assert!(AlwaysValid.is_valid(&node).unwrap());
    }

    #[test]
    fn test_closure_detector() {
        let calls = AtomicU32::new(0);
        let detector = |_: &Node| -> Result<bool> {
            Ok(calls.fetch_add(1, Ordering::Relaxed) >= 2)
        };

        let node = Node::new("n", NodeAddress::new("127.0.0.1", 7000));
        assert!(!detector.is_valid(&node).unwrap());
        assert!(!detector.is_valid(&node).unwrap());
        assert!(detector.is_valid(&node).unwrap());
    }

    #[test]
    fn test_failing_detector() {
        let detector =
            |_: &Node| -> Result<bool> { Err(ClusterError::Internal("probe failed".into())) };
        let node = Node::new("n", NodeAddress::new("127.0.0.1", 7000));
        assert!(detector.is_valid(&node).is_err());
    }
}
