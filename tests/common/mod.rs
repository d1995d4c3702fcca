// Shared helpers for multi-node integration tests: short timers, loopback
// transports, ephemeral ports.

#![allow(dead_code)]

use hekate::{Hekate, HekateConfig, NodeState};
use std::time::Duration;

pub fn test_config(seeds: Vec<String>) -> HekateConfig {
    let mut config = HekateConfig::default();
    config.cluster.cluster_name = "test-cluster".to_string();
    config.cluster.gossip_interval = Duration::from_millis(50);
    config.cluster.gossip_fanout = 4;
    config.cluster.suspect_timeout = Duration::from_millis(600);
    config.cluster.split_brain_check_interval = Duration::from_millis(50);
    config.cluster.leave_timeout = Duration::from_secs(2);
    config.cluster.seed_nodes = seeds;
    config.network.host = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.connect_timeout = Duration::from_millis(800);
    config.network.heartbeat_interval = Duration::from_millis(200);
    config
}

/// Seed list pointing at an already started node.
pub fn seeds_of(node: &Hekate) -> Vec<String> {
    vec![node.local_addr().expect("node not bound").to_string()]
}

/// Waits until the node's published topology satisfies the predicate.
pub async fn await_topology(
    node: &Hekate,
    what: &str,
    predicate: impl Fn(&hekate::Topology) -> bool + Send + Copy + 'static,
) -> std::sync::Arc<hekate::Topology> {
    tokio::time::timeout(Duration::from_secs(10), node.view().await_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for topology: {}", what))
        .unwrap_or_else(|e| panic!("view closed waiting for {}: {}", what, e))
}

pub async fn await_state(node: &Hekate, expected: NodeState) {
    let mut watch = node.cluster().state_watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *watch.borrow_and_update() == expected {
                return;
            }
            if watch.changed().await.is_err() {
                panic!("state watch closed before reaching {:?}", expected);
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for state {:?}", expected));
}
