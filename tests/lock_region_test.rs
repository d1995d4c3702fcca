// Distributed lock scenarios: mutual exclusion across nodes and ownership
// migration when members die.

mod common;

use common::{await_topology, seeds_of, test_config};
use hekate::{Hekate, NodeId};
use std::collections::HashMap;
use std::time::Duration;

const REGION: &str = "R";

fn node_with_region(seeds: Vec<String>) -> Hekate {
    Hekate::builder(test_config(seeds))
        .with_lock_region(REGION)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_lock_exclusion_between_nodes() {
    let n1 = node_with_region(Vec::new());
    n1.start().await.unwrap();
    let n2 = node_with_region(seeds_of(&n1));
    n2.start().await.unwrap();

    await_topology(&n1, "two members", |t| t.size() == 2).await;
    await_topology(&n2, "two members", |t| t.size() == 2).await;

    let r1 = n1.lock_region(REGION).unwrap();
    let r2 = n2.lock_region(REGION).unwrap();

    let held = r1
        .try_lock("x", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("first acquire must succeed");

    // The other node cannot get it within its timeout.
    let blocked = r2.try_lock("x", Duration::from_millis(100)).await.unwrap();
    assert!(blocked.is_none());

    held.unlock().await.unwrap();

    let reacquired = r2
        .try_lock("x", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("acquire after unlock must succeed");
    reacquired.unlock().await.unwrap();

    n2.leave().await.unwrap();
    n1.leave().await.unwrap();
}

#[tokio::test]
async fn test_lock_unlock_returns_to_free() {
    let node = node_with_region(Vec::new());
    node.start().await.unwrap();

    let region = node.lock_region(REGION).unwrap();
    let handle = region.lock("slot").await.unwrap();
    assert!(region.owner_of("slot").await.unwrap().is_some());

    handle.unlock().await.unwrap();
    assert!(region.owner_of("slot").await.unwrap().is_none());

    // Immediately reacquirable.
    let again = region.lock("slot").await.unwrap();
    again.unlock().await.unwrap();

    node.leave().await.unwrap();
}

#[tokio::test]
async fn test_blocking_lock_waits_for_release() {
    let n1 = node_with_region(Vec::new());
    n1.start().await.unwrap();
    let n2 = node_with_region(seeds_of(&n1));
    n2.start().await.unwrap();

    await_topology(&n1, "two members", |t| t.size() == 2).await;
    await_topology(&n2, "two members", |t| t.size() == 2).await;

    let r1 = n1.lock_region(REGION).unwrap();
    let r2 = n2.lock_region(REGION).unwrap();

    let held = r1.lock("queue").await.unwrap();

    let waiter = {
        let r2 = r2.clone();
        tokio::spawn(async move { r2.lock("queue").await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished());

    held.unlock().await.unwrap();

    let granted = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    granted.unlock().await.unwrap();

    n2.leave().await.unwrap();
    n1.leave().await.unwrap();
}

#[tokio::test]
async fn test_lock_migration_after_node_deaths() {
    // Five members, ten locks spread across them, then two members die.
    let names: Vec<String> = ('a'..='j').map(|c| c.to_string()).collect();

    let n1 = node_with_region(Vec::new());
    n1.start().await.unwrap();

    let mut nodes = vec![n1];
    for _ in 0..4 {
        let node = node_with_region(seeds_of(&nodes[0]));
        node.start().await.unwrap();
        nodes.push(node);
    }
    for node in &nodes {
        await_topology(node, "five members", |t| t.size() == 5).await;
    }

    // Lock name i from node i % 5 and remember the owner.
    let mut owners: HashMap<String, NodeId> = HashMap::new();
    let mut handles = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let node = &nodes[i % 5];
        let region = node.lock_region(REGION).unwrap();
        let handle = tokio::time::timeout(Duration::from_secs(10), region.lock(name))
            .await
            .expect("lock attempt hung")
            .unwrap();
        owners.insert(name.clone(), node.local_node().id);
        handles.push(handle);
    }

    // Kill the two youngest members.
    let dead_a = nodes[3].local_node().id;
    let dead_b = nodes[4].local_node().id;
    nodes[3].terminate().await.unwrap();
    nodes[4].terminate().await.unwrap();

    let survivors = &nodes[..3];
    for node in survivors {
        await_topology(node, "three members after deaths", |t| t.size() == 3).await;
    }

    // Give the migration a moment to settle, then verify the survivors
    // collectively know exactly the locks whose owners are still alive.
    let region = survivors[0].lock_region(REGION).unwrap();
    for name in &names {
        let owner = owners[name];
        let expect_alive = owner != dead_a && owner != dead_b;

        let observed = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match region.owner_of(name).await {
                    Ok(observed) => {
                        let alive = observed.as_ref().map(|o| o.node);
                        if alive == expect_alive.then_some(owner) {
                            return observed;
                        }
                    }
                    Err(_) => {}
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("ownership of {} did not settle", name));

        if expect_alive {
            assert_eq!(observed.unwrap().node, owner);
        } else {
            assert!(observed.is_none());
        }
    }

    // A lock freed by its owner's death is acquirable again.
    let freed = names
        .iter()
        .find(|name| {
            let owner = owners[name.as_str()];
            owner == dead_a || owner == dead_b
        })
        .expect("some lock belonged to a dead node");
    let reacquired = tokio::time::timeout(
        Duration::from_secs(10),
        region.try_lock(freed, Duration::from_secs(5)),
    )
    .await
    .expect("reacquire attempt hung")
    .unwrap()
    .expect("freed lock must be acquirable");
    reacquired.unlock().await.unwrap();

    for node in survivors {
        node.terminate().await.unwrap();
    }
}
