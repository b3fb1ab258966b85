use crate::config::{ControllerConfig, GossipConfig};
use crate::error::{ClusterError, Result};
use crate::types::now_ms;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

pub mod gossip;
pub mod node;
pub mod transport;
pub mod wire;

pub use node::{Node, NodeState};
pub use transport::UdpTransport;
pub use wire::{Message, MessageKind};

/// Snapshot of cluster membership health
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterStats {
    pub total_nodes: usize,
    pub alive_nodes: usize,
    pub suspect_nodes: usize,
    pub dead_nodes: usize,
    pub left_nodes: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// State shared between the cluster manager and its background tasks
pub(crate) struct ClusterShared {
    pub cluster_name: String,
    pub local_id: String,
    pub nodes: RwLock<HashMap<String, Node>>,
    pub transport: Arc<UdpTransport>,
    pub config: GossipConfig,
    /// node_id -> ping sent timestamp, awaiting PONG
    pub pending_pings: Mutex<HashMap<String, u64>>,
    /// nodes whose state changed since the last gossip round
    pub dirty: Mutex<HashSet<String>>,
    pub messages_sent: Mutex<u64>,
    pub messages_received: Mutex<u64>,
}

/// Cluster membership manager: authoritative node registry plus the gossip
/// and SWIM failure-detection tasks that keep it converged.
pub struct ClusterManager {
    shared: Arc<ClusterShared>,
    shutdown: watch::Receiver<bool>,
}

impl ClusterManager {
    /// Create the cluster layer and seed the registry with the local node
    pub async fn new(
        config: &ControllerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_address, config.control_port);
        let transport = Arc::new(UdpTransport::bind(&bind).await?);
        // Port 0 binds ephemerally; advertise the port actually assigned
        let bound_port = transport.local_addr()?.port();

        let mut local = Node::local(&config.node_name, &config.bind_address, bound_port);
        local.max_instances = config.max_instances;

        info!(
            "🌐 Cluster '{}' initializing: node {} ({})",
            config.cluster_name,
            local.name,
            local.socket_addr()
        );

        let mut nodes = HashMap::new();
        let local_id = local.id.clone();
        nodes.insert(local_id.clone(), local);

        let shared = Arc::new(ClusterShared {
            cluster_name: config.cluster_name.clone(),
            local_id,
            nodes: RwLock::new(nodes),
            transport,
            config: config.gossip.clone(),
            pending_pings: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            messages_sent: Mutex::new(0),
            messages_received: Mutex::new(0),
        });

        Ok(Self { shared, shutdown })
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn transport(&self) -> Arc<UdpTransport> {
        Arc::clone(&self.shared.transport)
    }

    /// Add a node to the registry; duplicates are rejected
    pub async fn add_node(&self, node: Node) -> Result<()> {
        let mut nodes = self.shared.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(ClusterError::NodeAlreadyExists { node_id: node.id }.into());
        }
        info!("➕ Node joined registry: {} ({})", node.name, node.socket_addr());
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node, returning its prior state
    pub async fn remove_node(&self, node_id: &str) -> Result<NodeState> {
        let mut nodes = self.shared.nodes.write().await;
        match nodes.remove(node_id) {
            Some(node) => {
                info!("➖ Node removed from registry: {}", node.name);
                Ok(node.state)
            }
            None => Err(ClusterError::NodeNotFound {
                node_id: node_id.to_string(),
            }
            .into()),
        }
    }

    pub async fn find_node(&self, node_id: &str) -> Option<Node> {
        self.shared.nodes.read().await.get(node_id).cloned()
    }

    /// Refresh the mutable fields of a known node without reidentifying it
    pub async fn update_node(&self, update: &Node) -> Result<()> {
        let mut nodes = self.shared.nodes.write().await;
        match nodes.get_mut(&update.id) {
            Some(existing) => {
                existing.apply_update(update);
                Ok(())
            }
            None => Err(ClusterError::NodeNotFound {
                node_id: update.id.clone(),
            }
            .into()),
        }
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.shared.nodes.read().await.values().cloned().collect()
    }

    pub async fn alive_nodes(&self) -> Vec<Node> {
        self.shared
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.state == NodeState::Alive)
            .cloned()
            .collect()
    }

    pub async fn local_node(&self) -> Node {
        self.shared
            .nodes
            .read()
            .await
            .get(&self.shared.local_id)
            .cloned()
            .expect("local node is always registered")
    }

    /// Contact the seed nodes: announce ourselves and request a state sync
    pub async fn join(&self, seeds: &[String]) -> Result<()> {
        let local = self.local_node().await;
        info!("🤝 Joining cluster via {} seed node(s)", seeds.len());

        for seed in seeds {
            let announce = Message::new(
                MessageKind::GossipAnnounce,
                &self.shared.local_id,
                wire::encode_node(&local),
            );
            let sync = Message::control(MessageKind::SyncRequest, &self.shared.local_id);

            if let Err(e) = self.shared.transport.send(&announce, seed).await {
                warn!("seed {seed} unreachable: {e}");
                continue;
            }
            let _ = self.shared.transport.send(&sync, seed).await;
            self.shared.bump_sent(2).await;
        }
        Ok(())
    }

    /// Gracefully leave: mark LEFT and tell every reachable peer
    pub async fn leave(&self) -> Result<()> {
        info!("👋 Leaving cluster gracefully");
        let local = {
            let mut nodes = self.shared.nodes.write().await;
            let local = nodes
                .get_mut(&self.shared.local_id)
                .expect("local node is always registered");
            local.state = NodeState::Left;
            local.clone()
        };
        self.shared
            .broadcast(MessageKind::GossipLeave, &local)
            .await;
        Ok(())
    }

    /// Spawn the receive loop, the gossip task, and the SWIM health task.
    ///
    /// Consensus frames received on the shared socket are forwarded to
    /// `raft_inbound` untouched; the cluster layer never interprets them.
    pub fn start(&self, raft_inbound: mpsc::UnboundedSender<(Message, SocketAddr)>) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            gossip::receive_loop(shared, raft_inbound, &mut shutdown).await;
        });

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            gossip::gossip_loop(shared, &mut shutdown).await;
        });

        let shared = Arc::clone(&self.shared);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            gossip::health_loop(shared, &mut shutdown).await;
        });
    }

    pub async fn stats(&self) -> ClusterStats {
        let nodes = self.shared.nodes.read().await;
        let mut stats = ClusterStats {
            total_nodes: nodes.len(),
            ..Default::default()
        };
        for node in nodes.values() {
            match node.state {
                NodeState::Alive => stats.alive_nodes += 1,
                NodeState::Suspect => stats.suspect_nodes += 1,
                NodeState::Dead => stats.dead_nodes += 1,
                NodeState::Left => stats.left_nodes += 1,
            }
        }
        stats.messages_sent = *self.shared.messages_sent.lock().await;
        stats.messages_received = *self.shared.messages_received.lock().await;
        stats
    }
}

impl ClusterShared {
    pub(crate) async fn bump_sent(&self, count: u64) {
        *self.messages_sent.lock().await += count;
    }

    pub(crate) async fn bump_received(&self) {
        *self.messages_received.lock().await += 1;
    }

    /// Mark a node as changed so the next gossip round piggy-backs it
    pub(crate) async fn mark_dirty(&self, node_id: &str) {
        self.dirty.lock().await.insert(node_id.to_string());
    }

    /// Send a node-record message to every reachable (non-DEAD, non-LEFT) peer
    pub(crate) async fn broadcast(&self, kind: MessageKind, node: &Node) {
        let targets: Vec<String> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|n| {
                    n.id != self.local_id
                        && n.state != NodeState::Dead
                        && n.state != NodeState::Left
                })
                .map(|n| n.socket_addr())
                .collect()
        };

        let msg = Message::new(kind, &self.local_id, wire::encode_node(node));
        let mut sent = 0u64;
        for target in targets {
            if self.transport.send(&msg, &target).await.is_ok() {
                sent += 1;
            }
        }
        self.bump_sent(sent).await;
    }

    /// Sweep confirmed-DEAD nodes whose retention window has elapsed
    pub(crate) async fn evict_expired(&self) {
        let now = now_ms();
        let mut nodes = self.nodes.write().await;
        nodes.retain(|_, node| {
            let expired = node.state == NodeState::Dead
                && now.saturating_sub(node.last_seen_ms) > self.config.dead_retention_ms;
            if expired {
                debug!("evicting dead node {} after retention", node.name);
            }
            !expired
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.node_name = "local".to_string();
        config.bind_address = "127.0.0.1".to_string();
        config.control_port = 0;
        config
    }

    fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn registry_rejects_duplicate_ids() {
        let (_tx, rx) = shutdown_pair();
        let cluster = ClusterManager::new(&test_config(), rx).await.unwrap();

        let node = Node::new("beta", "10.0.0.2", 7946);
        cluster.add_node(node.clone()).await.unwrap();
        assert!(cluster.add_node(node).await.is_err());
    }

    #[tokio::test]
    async fn remove_returns_prior_state() {
        let (_tx, rx) = shutdown_pair();
        let cluster = ClusterManager::new(&test_config(), rx).await.unwrap();

        let mut node = Node::new("beta", "10.0.0.2", 7946);
        node.state = NodeState::Suspect;
        cluster.add_node(node).await.unwrap();

        let prior = cluster.remove_node("beta@10.0.0.2").await.unwrap();
        assert_eq!(prior, NodeState::Suspect);
        assert!(cluster.remove_node("beta@10.0.0.2").await.is_err());
    }

    #[tokio::test]
    async fn update_refreshes_without_reidentifying() {
        let (_tx, rx) = shutdown_pair();
        let cluster = ClusterManager::new(&test_config(), rx).await.unwrap();

        let node = Node::new("beta", "10.0.0.2", 7946);
        cluster.add_node(node.clone()).await.unwrap();

        let mut newer = node.clone();
        newer.incarnation = 5;
        newer.current_instances = 3;
        newer.name = "should-not-change".to_string();
        cluster.update_node(&newer).await.unwrap();

        let stored = cluster.find_node(&node.id).await.unwrap();
        assert_eq!(stored.incarnation, 5);
        assert_eq!(stored.current_instances, 3);
        assert_eq!(stored.name, "beta");
    }

    #[tokio::test]
    async fn local_node_is_always_alive_in_registry() {
        let (_tx, rx) = shutdown_pair();
        let cluster = ClusterManager::new(&test_config(), rx).await.unwrap();
        let local = cluster.local_node().await;
        assert_eq!(local.state, NodeState::Alive);
        assert_eq!(cluster.stats().await.total_nodes, 1);
    }

    #[tokio::test]
    async fn dead_nodes_are_evicted_once_retention_expires() {
        let (_tx, rx) = shutdown_pair();
        let mut config = test_config();
        config.gossip.dead_retention_ms = 0;
        let cluster = ClusterManager::new(&config, rx).await.unwrap();

        let mut dead = Node::new("gone", "10.0.0.9", 7946);
        dead.state = NodeState::Dead;
        dead.last_seen_ms = now_ms().saturating_sub(1000);
        cluster.add_node(dead).await.unwrap();

        cluster.shared.evict_expired().await;
        assert!(cluster.find_node("gone@10.0.0.9").await.is_none());
    }
}
