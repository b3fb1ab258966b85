//! Gossip dissemination and SWIM-style failure detection.
//!
//! Two cooperating periodic tasks drive membership: the gossip task fans
//! heartbeats (plus piggy-backed state updates) out to random peers, and the
//! health task walks the registry applying the ALIVE → SUSPECT → DEAD
//! lifecycle. The receive loop answers probes and folds remote claims into
//! the local view, honoring incarnation-based refutes.

use crate::cluster::node::{Node, NodeState};
use crate::cluster::wire::{self, Message, MessageKind};
use crate::cluster::ClusterShared;
use crate::types::now_ms;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Receive-loop poll granularity; shutdown is observed within one poll
const RECV_POLL_MS: u64 = 100;

/// Single receive loop for the control socket. Gossip/SWIM frames are handled
/// here; consensus frames are forwarded to the Raft channel untouched.
pub(crate) async fn receive_loop(
    shared: Arc<ClusterShared>,
    raft_inbound: mpsc::UnboundedSender<(Message, SocketAddr)>,
    shutdown: &mut watch::Receiver<bool>,
) {
    debug!("cluster '{}' receive loop started", shared.cluster_name);
    loop {
        if *shutdown.borrow() {
            break;
        }
        match shared.transport.recv(RECV_POLL_MS).await {
            Ok(Some((msg, from))) => {
                shared.bump_received().await;
                match msg.kind {
                    MessageKind::RequestVote
                    | MessageKind::RequestVoteReply
                    | MessageKind::RaftHeartbeat
                    | MessageKind::RaftHeartbeatReply => {
                        let _ = raft_inbound.send((msg, from));
                    }
                    _ => handle_message(&shared, msg, from).await,
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("receive loop error: {e}");
                tokio::time::sleep(Duration::from_millis(RECV_POLL_MS)).await;
            }
        }
    }
    debug!("cluster receive loop stopped");
}

/// Periodic gossip: heartbeat up to `fanout` random live peers, piggy-backing
/// announcements for any nodes whose state changed since the last round.
pub(crate) async fn gossip_loop(shared: Arc<ClusterShared>, shutdown: &mut watch::Receiver<bool>) {
    debug!("gossip task started");
    let mut interval =
        tokio::time::interval(Duration::from_millis(shared.config.gossip_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        gossip_tick(&shared).await;
    }
    debug!("gossip task stopped");
}

pub(crate) async fn gossip_tick(shared: &Arc<ClusterShared>) {
    let targets: Vec<(String, String)> = {
        let nodes = shared.nodes.read().await;
        let mut candidates: Vec<(String, String)> = nodes
            .values()
            .filter(|n| {
                n.id != shared.local_id
                    && n.state != NodeState::Dead
                    && n.state != NodeState::Left
            })
            .map(|n| (n.id.clone(), n.socket_addr()))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(shared.config.gossip_fanout);
        candidates
    };

    if targets.is_empty() {
        return;
    }

    // Piggy-back pending state updates on this round
    let dirty_nodes: Vec<Node> = {
        let mut dirty = shared.dirty.lock().await;
        let ids: Vec<String> = dirty.drain().collect();
        let nodes = shared.nodes.read().await;
        ids.into_iter().filter_map(|id| nodes.get(&id).cloned()).collect()
    };

    let heartbeat = Message::control(MessageKind::Heartbeat, &shared.local_id);
    let mut sent = 0u64;

    for (_, addr) in &targets {
        if shared.transport.send(&heartbeat, addr).await.is_ok() {
            sent += 1;
        }
        for node in &dirty_nodes {
            let kind = match node.state {
                NodeState::Alive => MessageKind::GossipAnnounce,
                NodeState::Suspect => MessageKind::GossipSuspect,
                NodeState::Dead => MessageKind::GossipConfirm,
                NodeState::Left => MessageKind::GossipLeave,
            };
            let msg = Message::new(kind, &shared.local_id, wire::encode_node(node));
            if shared.transport.send(&msg, addr).await.is_ok() {
                sent += 1;
            }
        }
    }
    shared.bump_sent(sent).await;
}

/// Periodic SWIM health check: probe, suspect, confirm, evict.
pub(crate) async fn health_loop(shared: Arc<ClusterShared>, shutdown: &mut watch::Receiver<bool>) {
    debug!("health check task started");
    let mut interval =
        tokio::time::interval(Duration::from_millis(shared.config.health_interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        health_tick(&shared).await;
    }
    debug!("health check task stopped");
}

pub(crate) async fn health_tick(shared: &Arc<ClusterShared>) {
    let now = now_ms();
    expire_pending_pings(shared, now).await;

    // Decide transitions on a snapshot, then apply; sends happen lock-free
    let snapshot: Vec<Node> = {
        let nodes = shared.nodes.read().await;
        nodes
            .values()
            .filter(|n| n.id != shared.local_id)
            .cloned()
            .collect()
    };

    for node in snapshot {
        let elapsed = now.saturating_sub(node.last_seen_ms);
        match node.state {
            NodeState::Alive if elapsed <= shared.config.suspect_timeout_ms => {
                send_ping(shared, &node, now).await;
            }
            NodeState::Alive => {
                warn!(
                    "⚠️ Node {} silent for {}ms, marking SUSPECT",
                    node.name, elapsed
                );
                if let Some(updated) = set_state(shared, &node.id, NodeState::Suspect).await {
                    shared.mark_dirty(&node.id).await;
                    shared.broadcast(MessageKind::GossipSuspect, &updated).await;
                }
            }
            NodeState::Suspect if elapsed <= shared.config.dead_timeout_ms => {
                indirect_ping(shared, &node).await;
            }
            NodeState::Suspect => {
                warn!("💀 Node {} confirmed DEAD after {}ms", node.name, elapsed);
                if let Some(updated) = set_state(shared, &node.id, NodeState::Dead).await {
                    shared.mark_dirty(&node.id).await;
                    shared.broadcast(MessageKind::GossipConfirm, &updated).await;
                }
            }
            NodeState::Dead | NodeState::Left => {}
        }
    }

    shared.evict_expired().await;
}

/// Direct SWIM probe; the answering PONG clears `failed_pings`
async fn send_ping(shared: &Arc<ClusterShared>, node: &Node, now: u64) {
    {
        let mut pending = shared.pending_pings.lock().await;
        if pending.contains_key(&node.id) {
            return;
        }
        pending.insert(node.id.clone(), now);
    }
    let ping = Message::control(MessageKind::Ping, &shared.local_id);
    if shared.transport.send(&ping, &node.socket_addr()).await.is_ok() {
        shared.bump_sent(1).await;
    }
}

/// Indirect probe for a SUSPECT node: pick a random relay peer and reprobe
/// the target. The wire enumeration has no relayed-ping kind, so the probe
/// itself still travels directly.
async fn indirect_ping(shared: &Arc<ClusterShared>, target: &Node) {
    let relay = {
        let nodes = shared.nodes.read().await;
        let candidates: Vec<Node> = nodes
            .values()
            .filter(|n| {
                n.id != shared.local_id && n.id != target.id && n.state == NodeState::Alive
            })
            .cloned()
            .collect();
        candidates.choose(&mut rand::thread_rng()).cloned()
    };

    let Some(relay) = relay else {
        // No relay available; fall back to a direct probe
        send_ping(shared, target, now_ms()).await;
        return;
    };

    debug!(
        "indirect ping to {} via relay {}",
        target.name, relay.name
    );
    let ping = Message::control(MessageKind::Ping, &shared.local_id);
    let _ = shared.transport.send(&ping, &target.socket_addr()).await;
    shared.bump_sent(1).await;
}

async fn expire_pending_pings(shared: &Arc<ClusterShared>, now: u64) {
    let expired: Vec<String> = {
        let mut pending = shared.pending_pings.lock().await;
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, sent)| now.saturating_sub(**sent) > shared.config.ping_timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            pending.remove(id);
        }
        ids
    };

    if expired.is_empty() {
        return;
    }
    let mut nodes = shared.nodes.write().await;
    for id in expired {
        if let Some(node) = nodes.get_mut(&id) {
            node.failed_pings += 1;
            debug!("ping to {} unanswered ({} failures)", node.name, node.failed_pings);
        }
    }
}

/// Apply a membership transition if the SWIM lattice allows it
async fn set_state(
    shared: &Arc<ClusterShared>,
    node_id: &str,
    next: NodeState,
) -> Option<Node> {
    let mut nodes = shared.nodes.write().await;
    let node = nodes.get_mut(node_id)?;
    if !node.state.can_transition_to(next) {
        return None;
    }
    node.state = next;
    Some(node.clone())
}

/// Fold one received gossip/SWIM frame into the local view
pub(crate) async fn handle_message(shared: &Arc<ClusterShared>, msg: Message, from: SocketAddr) {
    match msg.kind {
        MessageKind::Ping => {
            let pong = Message::control(MessageKind::Pong, &shared.local_id);
            if shared.transport.send(&pong, &from.to_string()).await.is_ok() {
                shared.bump_sent(1).await;
            }
        }

        MessageKind::Pong => {
            shared.pending_pings.lock().await.remove(&msg.sender_id);
            let mut nodes = shared.nodes.write().await;
            if let Some(node) = nodes.get_mut(&msg.sender_id) {
                if node.state.can_transition_to(NodeState::Alive) {
                    node.state = NodeState::Alive;
                }
                node.failed_pings = 0;
                node.mark_seen();
            }
        }

        MessageKind::Heartbeat => {
            let mut nodes = shared.nodes.write().await;
            if let Some(node) = nodes.get_mut(&msg.sender_id) {
                node.mark_seen();
            }
        }

        MessageKind::GossipAnnounce => {
            if let Ok(announced) = wire::decode_node(&msg.payload) {
                merge_node(shared, announced).await;
            }
        }

        MessageKind::GossipSuspect => {
            let Ok(suspect) = wire::decode_node(&msg.payload) else {
                return;
            };
            if suspect.id == shared.local_id {
                refute(shared).await;
                return;
            }
            let updated = {
                let mut nodes = shared.nodes.write().await;
                match nodes.get_mut(&suspect.id) {
                    // A refute with higher incarnation wins over the claim
                    Some(node)
                        if node.state == NodeState::Alive
                            && suspect.incarnation >= node.incarnation =>
                    {
                        node.state = NodeState::Suspect;
                        info!("⚠️ Node {} marked SUSPECT by gossip", node.name);
                        Some(node.id.clone())
                    }
                    _ => None,
                }
            };
            if let Some(id) = updated {
                shared.mark_dirty(&id).await;
            }
        }

        MessageKind::GossipConfirm => {
            let Ok(dead) = wire::decode_node(&msg.payload) else {
                return;
            };
            if dead.id == shared.local_id {
                refute(shared).await;
                return;
            }
            let mut nodes = shared.nodes.write().await;
            if let Some(node) = nodes.get_mut(&dead.id) {
                if node.state != NodeState::Dead {
                    info!("💀 Node {} confirmed DEAD by gossip", node.name);
                    node.state = NodeState::Dead;
                }
            }
        }

        MessageKind::GossipLeave => {
            let Ok(left) = wire::decode_node(&msg.payload) else {
                return;
            };
            let mut nodes = shared.nodes.write().await;
            if let Some(node) = nodes.get_mut(&left.id) {
                info!("👋 Node {} LEFT the cluster", node.name);
                node.state = NodeState::Left;
            }
        }

        MessageKind::SyncRequest => {
            let all: Vec<Node> = {
                let nodes = shared.nodes.read().await;
                nodes.values().cloned().collect()
            };
            let response = Message::new(
                MessageKind::SyncResponse,
                &shared.local_id,
                wire::encode_node_list(&all),
            );
            if shared
                .transport
                .send(&response, &from.to_string())
                .await
                .is_ok()
            {
                shared.bump_sent(1).await;
            }
        }

        MessageKind::SyncResponse => {
            if let Ok(nodes) = wire::decode_node_list(&msg.payload) {
                for node in nodes {
                    merge_node(shared, node).await;
                }
            }
        }

        // Consensus kinds are routed before this function is reached
        MessageKind::RequestVote
        | MessageKind::RequestVoteReply
        | MessageKind::RaftHeartbeat
        | MessageKind::RaftHeartbeatReply => {}
    }
}

/// Insert an unknown node or fold a newer view into a known one.
/// Claims carrying a lower incarnation than our view are stale and dropped.
async fn merge_node(shared: &Arc<ClusterShared>, mut incoming: Node) {
    if incoming.id == shared.local_id {
        return;
    }
    incoming.mark_seen();

    let mut nodes = shared.nodes.write().await;
    match nodes.get_mut(&incoming.id) {
        None => {
            info!(
                "➕ Discovered node {} ({}) via gossip",
                incoming.name,
                incoming.socket_addr()
            );
            nodes.insert(incoming.id.clone(), incoming);
        }
        Some(existing) if incoming.incarnation >= existing.incarnation => {
            existing.apply_update(&incoming);
        }
        Some(_) => {}
    }
}

/// Someone claims we are suspect/dead: bump our incarnation and re-announce
async fn refute(shared: &Arc<ClusterShared>) {
    let local = {
        let mut nodes = shared.nodes.write().await;
        let local = nodes
            .get_mut(&shared.local_id)
            .expect("local node is always registered");
        local.refute_suspicion();
        local.clone()
    };
    info!(
        "🛡️ Refuting suspicion about ourselves (incarnation {})",
        local.incarnation
    );
    shared
        .broadcast(MessageKind::GossipAnnounce, &local)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterManager;
    use crate::config::ControllerConfig;

    async fn test_cluster() -> ClusterManager {
        let mut config = ControllerConfig::default();
        config.node_name = "local".to_string();
        config.bind_address = "127.0.0.1".to_string();
        config.control_port = 0;
        let (_tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration by leaking it; tasks are
        // never started in these unit tests.
        std::mem::forget(_tx);
        ClusterManager::new(&config, rx).await.unwrap()
    }

    fn from_addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn announce_inserts_unknown_node() {
        let cluster = test_cluster().await;
        let remote = Node::new("beta", "10.0.0.2", 7946);
        let msg = Message::new(
            MessageKind::GossipAnnounce,
            &remote.id,
            wire::encode_node(&remote),
        );

        handle_message(&cluster.shared, msg, from_addr()).await;
        let stored = cluster.find_node("beta@10.0.0.2").await.unwrap();
        assert_eq!(stored.state, NodeState::Alive);
    }

    #[tokio::test]
    async fn stale_announce_is_ignored() {
        let cluster = test_cluster().await;
        let mut remote = Node::new("beta", "10.0.0.2", 7946);
        remote.incarnation = 5;
        remote.current_instances = 9;
        cluster.add_node(remote.clone()).await.unwrap();

        let mut stale = remote.clone();
        stale.incarnation = 2;
        stale.current_instances = 1;
        let msg = Message::new(
            MessageKind::GossipAnnounce,
            &stale.id,
            wire::encode_node(&stale),
        );
        handle_message(&cluster.shared, msg, from_addr()).await;

        let stored = cluster.find_node(&remote.id).await.unwrap();
        assert_eq!(stored.current_instances, 9);
    }

    #[tokio::test]
    async fn suspect_only_demotes_alive_nodes() {
        let cluster = test_cluster().await;
        let remote = Node::new("beta", "10.0.0.2", 7946);
        cluster.add_node(remote.clone()).await.unwrap();

        let msg = Message::new(
            MessageKind::GossipSuspect,
            "other",
            wire::encode_node(&remote),
        );
        handle_message(&cluster.shared, msg.clone(), from_addr()).await;
        assert_eq!(
            cluster.find_node(&remote.id).await.unwrap().state,
            NodeState::Suspect
        );

        // A second SUSPECT against an already-suspect node changes nothing
        handle_message(&cluster.shared, msg, from_addr()).await;
        assert_eq!(
            cluster.find_node(&remote.id).await.unwrap().state,
            NodeState::Suspect
        );
    }

    #[tokio::test]
    async fn higher_local_incarnation_beats_suspicion() {
        let cluster = test_cluster().await;
        let mut remote = Node::new("beta", "10.0.0.2", 7946);
        remote.incarnation = 10;
        cluster.add_node(remote.clone()).await.unwrap();

        let mut claim = remote.clone();
        claim.incarnation = 3;
        let msg = Message::new(
            MessageKind::GossipSuspect,
            "other",
            wire::encode_node(&claim),
        );
        handle_message(&cluster.shared, msg, from_addr()).await;
        assert_eq!(
            cluster.find_node(&remote.id).await.unwrap().state,
            NodeState::Alive
        );
    }

    #[tokio::test]
    async fn suspicion_about_self_is_refuted_with_higher_incarnation() {
        let cluster = test_cluster().await;
        let local_before = cluster.local_node().await;

        let msg = Message::new(
            MessageKind::GossipSuspect,
            "other",
            wire::encode_node(&local_before),
        );
        handle_message(&cluster.shared, msg, from_addr()).await;

        let local_after = cluster.local_node().await;
        assert_eq!(local_after.state, NodeState::Alive);
        assert_eq!(local_after.incarnation, local_before.incarnation + 1);
    }

    #[tokio::test]
    async fn confirm_marks_dead_and_leave_marks_left() {
        let cluster = test_cluster().await;
        let remote = Node::new("beta", "10.0.0.2", 7946);
        cluster.add_node(remote.clone()).await.unwrap();

        let confirm = Message::new(
            MessageKind::GossipConfirm,
            "other",
            wire::encode_node(&remote),
        );
        handle_message(&cluster.shared, confirm, from_addr()).await;
        assert_eq!(
            cluster.find_node(&remote.id).await.unwrap().state,
            NodeState::Dead
        );

        let gamma = Node::new("gamma", "10.0.0.3", 7946);
        cluster.add_node(gamma.clone()).await.unwrap();
        let leave = Message::new(MessageKind::GossipLeave, &gamma.id, wire::encode_node(&gamma));
        handle_message(&cluster.shared, leave, from_addr()).await;
        assert_eq!(
            cluster.find_node(&gamma.id).await.unwrap().state,
            NodeState::Left
        );
    }

    #[tokio::test]
    async fn pong_restores_alive_and_clears_failures() {
        let cluster = test_cluster().await;
        let mut remote = Node::new("beta", "10.0.0.2", 7946);
        remote.state = NodeState::Suspect;
        remote.failed_pings = 4;
        cluster.add_node(remote.clone()).await.unwrap();

        let pong = Message::control(MessageKind::Pong, &remote.id);
        handle_message(&cluster.shared, pong, from_addr()).await;

        let stored = cluster.find_node(&remote.id).await.unwrap();
        assert_eq!(stored.state, NodeState::Alive);
        assert_eq!(stored.failed_pings, 0);
    }

    #[tokio::test]
    async fn sync_response_merges_unknown_members() {
        let cluster = test_cluster().await;
        let a = Node::new("beta", "10.0.0.2", 7946);
        let b = Node::new("gamma", "10.0.0.3", 7946);
        let msg = Message::new(
            MessageKind::SyncResponse,
            "seed",
            wire::encode_node_list(&[a, b]),
        );

        handle_message(&cluster.shared, msg, from_addr()).await;
        assert!(cluster.find_node("beta@10.0.0.2").await.is_some());
        assert!(cluster.find_node("gamma@10.0.0.3").await.is_some());
        assert_eq!(cluster.stats().await.total_nodes, 3);
    }
}
