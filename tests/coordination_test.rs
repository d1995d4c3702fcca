// Coordination scenarios: broadcast/collect rounds with per-member replies
// and leader election following the oldest member.

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use common::{await_topology, seeds_of, test_config};
use hekate::coordinate::{leader_election, LeaderWatch};
use hekate::{CoordinationContext, CoordinationHandler, Hekate, NodeId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const PROCESS: &str = "barrier";

#[derive(Default)]
struct Observed {
    reply_counts: Vec<usize>,
    members: usize,
    coordinator: Option<NodeId>,
}

/// Completes after three broadcast rounds once all three members are
/// present; earlier partial rounds simply wait for the next topology.
struct ThreeRoundHandler {
    expected_members: usize,
    observed: Arc<Mutex<Observed>>,
}

#[async_trait]
impl CoordinationHandler for ThreeRoundHandler {
    async fn process(&self, request: Bytes, ctx: &CoordinationContext) -> hekate::Result<Bytes> {
        {
            let mut observed = self.observed.lock();
            observed.members = ctx.members().len();
            observed.coordinator = Some(ctx.coordinator());
        }
        if request.as_ref() == b"done" {
            // Only confirm once this member's own view caught up; the
            // coordinator repeats the round until everyone is ready.
            if ctx.members().len() == self.expected_members {
                ctx.complete();
                return Ok(Bytes::from_static(b"ready"));
            }
            return Ok(Bytes::from_static(b"not-ready"));
        }
        Ok(Bytes::from_static(b"ack"))
    }

    async fn coordinate(&self, ctx: &CoordinationContext) -> hekate::Result<()> {
        if ctx.members().len() < self.expected_members {
            // Not everyone arrived; a fresh round comes with the next change.
            return Ok(());
        }

        for _ in 0..2 {
            let replies = broadcast_retry(ctx, Bytes::from_static(b"round")).await?;
            self.observed.lock().reply_counts.push(replies.len());
        }

        loop {
            let replies = broadcast_retry(ctx, Bytes::from_static(b"done")).await?;
            self.observed.lock().reply_counts.push(replies.len());
            if replies.iter().all(|(_, reply)| reply.as_ref() == b"ready") {
                ctx.complete();
                return Ok(());
            }
            if ctx.is_cancelled() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Members lagging on the topology reject broadcasts from rounds they have
/// not configured yet; retry until the round goes through.
async fn broadcast_retry(
    ctx: &CoordinationContext,
    payload: Bytes,
) -> hekate::Result<Vec<(NodeId, Bytes)>> {
    loop {
        match ctx.broadcast(payload.clone()).await {
            Ok(replies) => return Ok(replies),
            Err(e) => {
                if ctx.is_cancelled() {
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn node_with_barrier(seeds: Vec<String>, observed: Arc<Mutex<Observed>>) -> Hekate {
    Hekate::builder(test_config(seeds))
        .with_process(
            PROCESS,
            Arc::new(ThreeRoundHandler {
                expected_members: 3,
                observed,
            }),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_three_node_coordination_completes() {
    let states: Vec<Arc<Mutex<Observed>>> = (0..3).map(|_| Arc::default()).collect();

    let n1 = node_with_barrier(Vec::new(), states[0].clone());
    n1.start().await.unwrap();
    let n2 = node_with_barrier(seeds_of(&n1), states[1].clone());
    n2.start().await.unwrap();
    let n3 = node_with_barrier(seeds_of(&n1), states[2].clone());
    n3.start().await.unwrap();

    for node in [&n1, &n2, &n3] {
        await_topology(node, "three members", |t| t.size() == 3).await;
    }

    // Every node's completion future resolves.
    for node in [&n1, &n2, &n3] {
        tokio::time::timeout(Duration::from_secs(15), node.coordinate().await_done(PROCESS))
            .await
            .expect("coordination did not complete in time")
            .unwrap();
    }

    let oldest = n1.local_node().id;
    for state in &states {
        let observed = state.lock();
        assert_eq!(observed.members, 3);
        assert_eq!(observed.coordinator, Some(oldest));
    }

    // The coordinator collected exactly one reply per member, per round.
    let coordinator_rounds = states[0].lock().reply_counts.clone();
    assert!(coordinator_rounds.len() >= 3);
    let last_three = &coordinator_rounds[coordinator_rounds.len() - 3..];
    for count in last_three {
        assert_eq!(*count, 3);
    }

    n3.leave().await.unwrap();
    n2.leave().await.unwrap();
    n1.leave().await.unwrap();
}

fn node_with_election(seeds: Vec<String>) -> (Hekate, LeaderWatch) {
    let (handler, watch) = leader_election();
    let node = Hekate::builder(test_config(seeds))
        .with_process("leader", handler)
        .build()
        .unwrap();
    (node, watch)
}

#[tokio::test]
async fn test_leader_election_follows_oldest() {
    let (n1, mut w1) = node_with_election(Vec::new());
    n1.start().await.unwrap();
    let (n2, mut w2) = node_with_election(seeds_of(&n1));
    n2.start().await.unwrap();

    await_topology(&n1, "two members", |t| t.size() == 2).await;
    await_topology(&n2, "two members", |t| t.size() == 2).await;

    let oldest = n1.local_node().id;
    let l1 = tokio::time::timeout(Duration::from_secs(10), w1.leader())
        .await
        .expect("no leader on n1")
        .unwrap();
    let l2 = tokio::time::timeout(Duration::from_secs(10), w2.leader())
        .await
        .expect("no leader on n2")
        .unwrap();
    assert_eq!(l1, oldest);
    assert_eq!(l2, oldest);

    n2.leave().await.unwrap();
    n1.leave().await.unwrap();
}
