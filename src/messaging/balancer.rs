// Load balancer contract and built-in strategies.
//
// A balancer is consulted per physical send, including retries; for
// affinity-bearing requests it must be deterministic given an identical
// context.

use crate::cluster::node::NodeId;
use crate::cluster::topology::Topology;
use crate::messaging::failover::{FailoverRouting, FailureInfo};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What a balancer sees for one send.
pub struct LoadBalancerContext<'a> {
    pub topology: &'a Topology,
    /// Hash of the application affinity key, when present.
    pub affinity: Option<i32>,
    /// Populated on retries.
    pub failure: Option<&'a FailureInfo>,
}

impl<'a> LoadBalancerContext<'a> {
    pub fn has_affinity(&self) -> bool {
        self.affinity.is_some()
    }
}

pub trait LoadBalancer: Send + Sync {
    /// Picks the target node, or `None` when no node qualifies.
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId>;
}

impl<F> LoadBalancer for F
where
    F: Fn(&LoadBalancerContext<'_>) -> Option<NodeId> + Send + Sync,
{
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        self(ctx)
    }
}

fn nodes_of(ctx: &LoadBalancerContext<'_>) -> Vec<NodeId> {
    ctx.topology.node_ids().copied().collect()
}

/// Skips the node a re-routed retry just failed on, when an alternative
/// exists.
fn adjust_for_failure(selected: usize, nodes: &[NodeId], ctx: &LoadBalancerContext<'_>) -> usize {
    if nodes.len() < 2 {
        return selected;
    }
    if let Some(failure) = ctx.failure {
        if failure.routing == FailoverRouting::ReRoute && nodes[selected] == failure.last_node {
            return (selected + 1) % nodes.len();
        }
    }
    selected
}

/// Deterministic for affinity requests, rotating otherwise.
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        let nodes = nodes_of(ctx);
        if nodes.is_empty() {
            return None;
        }
        let selected = match ctx.affinity {
            Some(hash) => (hash as u32 as usize) % nodes.len(),
            None => self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len(),
        };
        Some(nodes[adjust_for_failure(selected, &nodes, ctx)])
    }
}

/// Random pick for non-affinity requests; affinity stays deterministic.
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        let nodes = nodes_of(ctx);
        if nodes.is_empty() {
            return None;
        }
        let selected = match ctx.affinity {
            Some(hash) => (hash as u32 as usize) % nodes.len(),
            None => rand::thread_rng().gen_range(0..nodes.len()),
        };
        Some(nodes[adjust_for_failure(selected, &nodes, ctx)])
    }
}

/// Pins every request to the local node; used by self-addressed traffic.
pub struct LocalNodeBalancer {
    pub local: NodeId,
}

impl LoadBalancer for LocalNodeBalancer {
    fn route(&self, ctx: &LoadBalancerContext<'_>) -> Option<NodeId> {
        ctx.topology.contains(&self.local).then_some(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{Node, NodeAddress};
    use crate::error::ClusterError;
    use std::collections::BTreeMap;

    fn topology(count: usize) -> Topology {
        let mut nodes = BTreeMap::new();
        for i in 0..count {
            let mut node = Node::new(
                format!("n{}", i),
                NodeAddress::new("127.0.0.1", 7000 + i as u16),
            );
            node.join_order = i as u64 + 1;
            nodes.insert(node.id, node);
        }
        Topology::new(1, nodes)
    }

    #[test]
    fn test_round_robin_rotates() {
        let topo = topology(3);
        let balancer = RoundRobinBalancer::new();
        let ctx = |failure| LoadBalancerContext {
            topology: &topo,
            affinity: None,
            failure,
        };

        let a = balancer.route(&ctx(None)).unwrap();
        let b = balancer.route(&ctx(None)).unwrap();
        let c = balancer.route(&ctx(None)).unwrap();
        let d = balancer.route(&ctx(None)).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, d);
    }

    #[test]
    fn test_affinity_is_deterministic() {
        let topo = topology(3);
        let balancer = RoundRobinBalancer::new();
        let ctx = LoadBalancerContext {
            topology: &topo,
            affinity: Some(1234),
            failure: None,
        };
        let first = balancer.route(&ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(balancer.route(&ctx).unwrap(), first);
        }
    }

    #[test]
    fn test_empty_topology_routes_none() {
        let topo = Topology::empty();
        let balancer = RoundRobinBalancer::new();
        let ctx = LoadBalancerContext {
            topology: &topo,
            affinity: None,
            failure: None,
        };
        assert!(balancer.route(&ctx).is_none());
    }

    #[test]
    fn test_reroute_skips_failed_node() {
        let topo = topology(2);
        let balancer = RoundRobinBalancer::new();

        let affinity = Some(7);
        let first = balancer
            .route(&LoadBalancerContext {
                topology: &topo,
                affinity,
                failure: None,
            })
            .unwrap();

        let failure = FailureInfo {
            error: ClusterError::Timeout("t".into()),
            attempt: 0,
            last_node: first,
            routing: FailoverRouting::ReRoute,
        };
        let second = balancer
            .route(&LoadBalancerContext {
                topology: &topo,
                affinity,
                failure: Some(&failure),
            })
            .unwrap();
        assert_ne!(first, second);
    }
}
