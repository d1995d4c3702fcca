// Cluster lifecycle scenarios: single-node up/down, multi-node membership
// with failure detection, and split-brain driven rejoin.

mod common;

use common::{await_state, await_topology, seeds_of, test_config};
use hekate::cluster::split_brain::SplitBrainDetector;
use hekate::{ClusterEventKind, Hekate, Node, NodeState, SplitBrainAction};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_single_node_cluster_up_down() {
    let node = Hekate::builder(test_config(Vec::new())).build().unwrap();
    node.start().await.unwrap();

    assert_eq!(node.state(), NodeState::Up);
    let topology = node.view().topology();
    assert_eq!(topology.size(), 1);
    assert_eq!(node.local_node().join_order, 1);
    assert_eq!(topology.oldest().unwrap().id, node.local_node().id);

    node.leave().await.unwrap();
    assert_eq!(node.state(), NodeState::Down);
}

#[tokio::test]
async fn test_three_nodes_converge_and_detect_failure() {
    let n1 = Hekate::builder(test_config(Vec::new())).build().unwrap();
    n1.start().await.unwrap();

    let n2 = Hekate::builder(test_config(seeds_of(&n1))).build().unwrap();
    n2.start().await.unwrap();

    let n3 = Hekate::builder(test_config(seeds_of(&n1))).build().unwrap();
    n3.start().await.unwrap();

    // Everyone converges on the same three-member roster, N1 oldest.
    let n1_id = n1.local_node().id;
    for node in [&n1, &n2, &n3] {
        let topology = await_topology(node, "three members", |t| t.size() == 3).await;
        assert!(topology.version() >= 3);
        assert_eq!(topology.oldest().unwrap().id, n1_id);
    }
    assert_eq!(n1.local_node().join_order, 1);
    assert_eq!(n2.local_node().join_order, 2);
    assert_eq!(n3.local_node().join_order, 3);

    // Watch for the removal on one survivor before killing N1.
    let mut events = n2.view().subscribe();

    n1.terminate().await.unwrap();

    let n2_id = n2.local_node().id;
    for node in [&n2, &n3] {
        let topology = await_topology(node, "two members after kill", |t| t.size() == 2).await;
        assert_eq!(topology.oldest().unwrap().id, n2_id);
    }

    // Some observed CHANGE event must carry the removal of N1.
    let saw_removal = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if event.kind == ClusterEventKind::Change
                && event.removed.iter().any(|n| n.id == n1_id)
            {
                return true;
            }
        }
        false
    })
    .await
    .expect("no removal event observed");
    assert!(saw_removal);

    n2.leave().await.unwrap();
    n3.leave().await.unwrap();
}

#[tokio::test]
async fn test_graceful_leave_shrinks_topology() {
    let n1 = Hekate::builder(test_config(Vec::new())).build().unwrap();
    n1.start().await.unwrap();
    let n2 = Hekate::builder(test_config(seeds_of(&n1))).build().unwrap();
    n2.start().await.unwrap();

    await_topology(&n1, "two members", |t| t.size() == 2).await;

    let n2_id = n2.local_node().id;
    n2.leave().await.unwrap();
    await_state(&n2, NodeState::Down).await;

    let topology = await_topology(&n1, "one member after leave", |t| t.size() == 1).await;
    assert!(!topology.contains(&n2_id));

    n1.leave().await.unwrap();
}

struct FlappingDetector {
    polls: AtomicU32,
    invalid_polls: u32,
}

impl SplitBrainDetector for FlappingDetector {
    fn is_valid(&self, _local: &Node) -> hekate::Result<bool> {
        let poll = self.polls.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(poll > self.invalid_polls)
    }
}

#[tokio::test]
async fn test_split_brain_rejoin_mints_fresh_identity() {
    let detector = Arc::new(FlappingDetector {
        polls: AtomicU32::new(0),
        invalid_polls: 4,
    });

    let mut config = test_config(Vec::new());
    config.cluster.split_brain_action = SplitBrainAction::Rejoin;

    let node = Hekate::builder(config)
        .with_split_brain_detector(detector.clone())
        .build()
        .unwrap();

    node.initialize().await.unwrap();
    let identity_before = node.local_node().id;

    node.join().await.unwrap();

    assert_eq!(node.state(), NodeState::Up);
    assert!(detector.polls.load(Ordering::Relaxed) >= 5);
    assert_ne!(node.local_node().id, identity_before);

    node.leave().await.unwrap();
}

#[tokio::test]
async fn test_join_rejected_on_cluster_name_mismatch() {
    let n1 = Hekate::builder(test_config(Vec::new())).build().unwrap();
    n1.start().await.unwrap();

    let mut config = test_config(seeds_of(&n1));
    config.cluster.cluster_name = "other-cluster".to_string();
    let outsider = Hekate::builder(config).build().unwrap();
    outsider.initialize().await.unwrap();

    let err = outsider.join().await.unwrap_err();
    match err {
        hekate::ClusterError::JoinRejected { reason, .. } => {
            assert!(reason.contains("cluster name mismatch"));
        }
        other => panic!("expected join rejection, got {:?}", other),
    }
    assert_eq!(outsider.state(), NodeState::Down);

    n1.leave().await.unwrap();
}
