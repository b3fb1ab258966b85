//! Leader election over an in-memory message router.
//!
//! Three Raft nodes exchange real wire payloads through channels instead of
//! UDP, which keeps the timing assertions deterministic enough for CI.

use constellation::cluster::wire::Message;
use constellation::config::ConsensusConfig;
use constellation::consensus::{RaftNode, RaftRole};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, watch};

type Router = Arc<RwLock<HashMap<String, Arc<RaftNode>>>>;

struct Fleet {
    nodes: Vec<Arc<RaftNode>>,
    router: Router,
    shutdowns: Vec<watch::Sender<bool>>,
}

/// Build `n` nodes with addresses 127.0.0.1:9001.. and full peer meshes,
/// wiring every outbound queue into the shared router.
async fn build_fleet(n: usize) -> Fleet {
    let addrs: Vec<String> = (0..n).map(|i| format!("127.0.0.1:{}", 9001 + i)).collect();
    let ids: Vec<String> = (0..n).map(|i| format!("raft-{i}@127.0.0.1")).collect();

    let router: Router = Arc::new(RwLock::new(HashMap::new()));
    let mut nodes = Vec::new();
    let mut shutdowns = Vec::new();

    for i in 0..n {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<(String, Message)>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = Arc::new(RaftNode::new(
            &ids[i],
            ConsensusConfig::default(),
            out_tx,
            shutdown_rx,
        ));

        for j in 0..n {
            if i != j {
                node.add_peer(&ids[j], &addrs[j]).await;
            }
        }

        // Deliver this node's outbound traffic through the router
        let router_for_task = Arc::clone(&router);
        let own_addr: SocketAddr = addrs[i].parse().unwrap();
        let addr_to_id: HashMap<String, String> = addrs
            .iter()
            .cloned()
            .zip(ids.iter().cloned())
            .collect();
        tokio::spawn(async move {
            while let Some((target, msg)) = out_rx.recv().await {
                let target_id = match addr_to_id.get(&target) {
                    Some(id) => id.clone(),
                    None => continue,
                };
                let destination = {
                    let routes = router_for_task.read().await;
                    routes.get(&target_id).cloned()
                };
                if let Some(destination) = destination {
                    destination.process_message(msg, own_addr).await;
                }
            }
        });

        nodes.push(node);
        shutdowns.push(shutdown_tx);
    }

    {
        let mut routes = router.write().await;
        for (id, node) in ids.iter().zip(nodes.iter()) {
            routes.insert(id.clone(), Arc::clone(node));
        }
    }

    // Replies are addressed by the sender's socket address; route those too
    {
        let mut routes = router.write().await;
        let by_addr: Vec<(String, Arc<RaftNode>)> = addrs
            .iter()
            .cloned()
            .zip(nodes.iter().cloned())
            .collect();
        for (addr, node) in by_addr {
            routes.insert(addr, node);
        }
    }

    Fleet {
        nodes,
        router,
        shutdowns,
    }
}

async fn leaders(nodes: &[Arc<RaftNode>]) -> Vec<usize> {
    let mut found = Vec::new();
    for (i, node) in nodes.iter().enumerate() {
        if node.role().await == RaftRole::Leader {
            found.push(i);
        }
    }
    found
}

#[tokio::test]
async fn one_leader_emerges_within_three_election_timeouts() {
    let fleet = build_fleet(3).await;
    for node in &fleet.nodes {
        let (keep_tx, keep_rx) = mpsc::unbounded_channel();
        std::mem::forget(keep_tx);
        node.start(keep_rx);
    }

    // 3 × max election timeout
    let deadline = tokio::time::Instant::now() + Duration::from_millis(900);
    let mut elected = Vec::new();
    while tokio::time::Instant::now() < deadline {
        elected = leaders(&fleet.nodes).await;
        if !elected.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(elected.len(), 1, "expected exactly one leader, got {elected:?}");

    // For the next second leadership must stay unique per term (a deposed
    // leader may linger for a heartbeat before stepping down)
    for _ in 0..20 {
        let now = leaders(&fleet.nodes).await;
        let mut terms = Vec::new();
        for &index in &now {
            terms.push(fleet.nodes[index].current_term().await);
        }
        terms.sort_unstable();
        let unique_terms = {
            let mut t = terms.clone();
            t.dedup();
            t.len()
        };
        assert_eq!(
            unique_terms,
            terms.len(),
            "two leaders share a term: {now:?} {terms:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(leaders(&fleet.nodes).await.len(), 1);

    for tx in &fleet.shutdowns {
        let _ = tx.send(true);
    }
}

#[tokio::test]
async fn killing_the_leader_elects_a_successor_in_a_higher_term() {
    let fleet = build_fleet(3).await;
    for node in &fleet.nodes {
        let (keep_tx, keep_rx) = mpsc::unbounded_channel();
        std::mem::forget(keep_tx);
        node.start(keep_rx);
    }

    // Wait for the first leader
    let mut first_leader = None;
    for _ in 0..40 {
        let elected = leaders(&fleet.nodes).await;
        if let Some(&index) = elected.first() {
            first_leader = Some(index);
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let first_leader = first_leader.expect("no initial leader elected");
    let first_term = fleet.nodes[first_leader].current_term().await;

    // Partition the old leader: drop it from the router and stop its tasks
    {
        let mut routes = fleet.router.write().await;
        let dead_id = fleet.nodes[first_leader].node_id().to_string();
        routes.retain(|_, node| node.node_id() != dead_id);
    }
    let _ = fleet.shutdowns[first_leader].send(true);

    // A successor must appear among the survivors with a strictly greater term
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
    let mut successor = None;
    while tokio::time::Instant::now() < deadline {
        for (i, node) in fleet.nodes.iter().enumerate() {
            if i == first_leader {
                continue;
            }
            if node.role().await == RaftRole::Leader {
                successor = Some(i);
            }
        }
        if successor.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let successor = successor.expect("no successor elected after leader death");
    let successor_term = fleet.nodes[successor].current_term().await;
    assert!(
        successor_term > first_term,
        "successor term {successor_term} not greater than {first_term}"
    );

    for tx in &fleet.shutdowns {
        let _ = tx.send(true);
    }
}
