//! End-to-end placement flows: bin-pack saturation, quota-gated scheduling,
//! and reservation-backed placement.

use constellation::cluster::Node;
use constellation::config::SchedulerConfig;
use constellation::scheduler::{
    PlacementPreferences, PlacementStrategy, ResourceQuota, ResourceRequest, Scheduler,
};
use tokio::sync::watch;

fn scheduler(enforce_quotas: bool) -> Scheduler {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    Scheduler::new(
        SchedulerConfig {
            enforce_quotas,
            ..Default::default()
        },
        rx,
    )
}

fn node(name: &str, cpu: f64, ram_mb: u64) -> Node {
    let mut node = Node::new(name, "10.1.0.1", 7946);
    node.cpu_total = cpu;
    node.cpu_available = cpu;
    node.ram_total_mb = ram_mb;
    node.ram_available_mb = ram_mb;
    node.max_instances = 64;
    node
}

#[tokio::test]
async fn binpack_saturates_nodes_in_order_then_exhausts() {
    let scheduler = scheduler(false);
    let n1 = node("n1", 8.0, 16_384);
    let n2 = node("n2", 8.0, 16_384);
    scheduler.register_node(&n1).await.unwrap();
    scheduler.register_node(&n2).await.unwrap();
    let cluster = vec![n1.clone(), n2.clone()];

    let request = ResourceRequest::new(4.0, 8_192);
    let prefs = PlacementPreferences::new(PlacementStrategy::BinPack);

    let mut placements = Vec::new();
    loop {
        match scheduler.schedule(&request, &prefs, &cluster).await {
            Ok(decision) => {
                scheduler.allocate(&decision.node_id, &request).await.unwrap();
                placements.push(decision.node_id);
            }
            Err(_) => break,
        }
    }

    // Both nodes hold two instances each; n1 filled before n2 was touched
    assert_eq!(placements.len(), 4);
    assert_eq!(placements[0], n1.id);
    assert_eq!(placements[1], n1.id);
    assert_eq!(placements[2], n2.id);
    assert_eq!(placements[3], n2.id);

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_scheduled, 4);
    assert_eq!(stats.total_failed, 1);
}

#[tokio::test]
async fn quota_gate_runs_before_scoring() {
    let scheduler = scheduler(true);
    let n1 = node("n1", 64.0, 262_144);
    scheduler.register_node(&n1).await.unwrap();
    let cluster = vec![n1.clone()];

    scheduler
        .create_quota(ResourceQuota::new(
            "team-a",
            ResourceRequest {
                cpu_cores: 4.0,
                ram_mb: 8_192,
                disk_mb: 0,
                ..Default::default()
            },
            10,
        ))
        .await
        .unwrap();

    let request = ResourceRequest::new(2.0, 4_096);
    let prefs = PlacementPreferences::default();

    // First placement fits the quota
    let decision = scheduler
        .schedule_in_namespace("team-a", &request, &prefs, &cluster)
        .await
        .unwrap();
    scheduler.allocate(&decision.node_id, &request).await.unwrap();
    scheduler.charge_quota("team-a", &request).await.unwrap();

    // The node has plenty of room, but the namespace does not
    let over = ResourceRequest::new(3.0, 2_048);
    let denied = scheduler
        .schedule_in_namespace("team-a", &over, &prefs, &cluster)
        .await;
    assert!(denied.is_err());

    // Other namespaces are unaffected
    assert!(scheduler
        .schedule_in_namespace("team-b", &over, &prefs, &cluster)
        .await
        .is_ok());
}

#[tokio::test]
async fn reservation_flow_claims_and_releases() {
    let scheduler = scheduler(true);
    let n1 = node("n1", 8.0, 16_384);
    scheduler.register_node(&n1).await.unwrap();

    scheduler
        .create_quota(ResourceQuota::new(
            "batch",
            ResourceRequest {
                cpu_cores: 8.0,
                ram_mb: 16_384,
                disk_mb: 0,
                ..Default::default()
            },
            4,
        ))
        .await
        .unwrap();

    let request = ResourceRequest::new(4.0, 8_192);
    let reservation = scheduler.reserve("batch", &request, 300, 5).await.unwrap();

    // The reservation charge leaves room for only one more of the same size
    assert!(scheduler.check_quota("batch", &request).await);
    let second = scheduler.reserve("batch", &request, 300, 5).await.unwrap();
    assert!(!scheduler.check_quota("batch", &request).await);

    // Claim one, release the other: headroom returns
    scheduler.claim_reservation(&reservation.id).await.unwrap();
    scheduler.release_reservation(&second.id).await.unwrap();
    assert!(scheduler.check_quota("batch", &request).await);
}

#[tokio::test]
async fn spread_with_spread_strategy_balances_across_nodes() {
    let scheduler = scheduler(false);
    let nodes: Vec<Node> = (1..=3)
        .map(|i| node(&format!("n{i}"), 8.0, 16_384))
        .collect();
    for n in &nodes {
        scheduler.register_node(n).await.unwrap();
    }

    let request = ResourceRequest::new(2.0, 2_048);
    let prefs = PlacementPreferences::new(PlacementStrategy::Spread);

    let mut counts = std::collections::HashMap::new();
    for _ in 0..6 {
        let decision = scheduler.schedule(&request, &prefs, &nodes).await.unwrap();
        scheduler.allocate(&decision.node_id, &request).await.unwrap();
        *counts.entry(decision.node_id).or_insert(0) += 1;
    }

    // Perfectly balanced: two instances per node
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&c| c == 2));
}
