use crate::cluster::{Node, NodeState};
use crate::config::DhtConfig;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub mod locks;

pub use locks::{Lock, LockManager, LockMode, LockStats};

/// 160-bit position on the hash ring (SHA-1)
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingHash(pub [u8; 20]);

impl RingHash {
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    pub fn of_str(s: &str) -> Self {
        Self::of(s.as_bytes())
    }
}

impl std::fmt::Display for RingHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RingHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RingHash({self})")
    }
}

/// A hash-space token owned by a physical node
#[derive(Debug, Clone)]
pub struct VirtualNode {
    pub node_id: String,
    pub vnode_index: usize,
    pub hash: RingHash,
}

/// Where a content-addressed file lives
#[derive(Debug, Clone, Serialize)]
pub struct FileLocation {
    pub path: String,
    #[serde(serialize_with = "serialize_hash")]
    pub hash: RingHash,
    /// Ordered, distinct, ALIVE replica holders
    pub replicas: Vec<String>,
}

fn serialize_hash<S: serde::Serializer>(hash: &RingHash, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hash.to_string())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DhtStats {
    pub vnode_count: usize,
    pub physical_nodes: usize,
    pub vnodes_per_node: usize,
    pub replication_factor: usize,
}

/// Consistent-hash ring with virtual nodes.
///
/// The ring is kept sorted on every mutation so lookups are a binary search.
/// Liveness comes from the caller's cluster snapshot; the ring itself only
/// stores physical node ids.
pub struct DhtRing {
    config: DhtConfig,
    ring: RwLock<Vec<VirtualNode>>,
}

impl DhtRing {
    pub fn new(config: DhtConfig) -> Self {
        info!(
            "🔗 DHT ring initialized ({} vnodes/node, rf={})",
            config.vnodes_per_node, config.replication_factor
        );
        Self {
            config,
            ring: RwLock::new(Vec::new()),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.config.replication_factor
    }

    /// Insert `vnodes_per_node` virtual nodes for a physical node.
    /// Adding a node that is already present is a no-op.
    pub async fn add_node(&self, node_id: &str) {
        let mut ring = self.ring.write().await;
        if ring.iter().any(|v| v.node_id == node_id) {
            return;
        }
        for index in 0..self.config.vnodes_per_node {
            let hash = RingHash::of_str(&format!("{node_id}-{index}"));
            ring.push(VirtualNode {
                node_id: node_id.to_string(),
                vnode_index: index,
                hash,
            });
        }
        ring.sort_by(|a, b| a.hash.cmp(&b.hash));
        debug!("dht: added {} ({} vnodes total)", node_id, ring.len());
    }

    /// Purge every virtual node of a physical node; returns how many left the ring
    pub async fn remove_node(&self, node_id: &str) -> usize {
        let mut ring = self.ring.write().await;
        let before = ring.len();
        ring.retain(|v| v.node_id != node_id);
        let removed = before - ring.len();
        if removed > 0 {
            debug!("dht: removed {} ({} vnodes)", node_id, removed);
        }
        removed
    }

    pub async fn vnode_count(&self) -> usize {
        self.ring.read().await.len()
    }

    /// Smallest virtual node whose hash is ≥ the target, wrapping to the
    /// ring's start past the top of the keyspace
    pub async fn successor(&self, target: &RingHash) -> Option<VirtualNode> {
        let ring = self.ring.read().await;
        if ring.is_empty() {
            return None;
        }
        let idx = ring.partition_point(|v| v.hash < *target);
        let idx = if idx == ring.len() { 0 } else { idx };
        Some(ring[idx].clone())
    }

    /// Walk the ring from the successor collecting distinct ALIVE physical
    /// nodes until `count` are gathered or the ring is exhausted.
    pub async fn replicas(
        &self,
        target: &RingHash,
        count: usize,
        cluster_nodes: &[Node],
    ) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }
        let alive: HashMap<&str, &Node> = cluster_nodes
            .iter()
            .filter(|n| n.state == NodeState::Alive)
            .map(|n| (n.id.as_str(), n))
            .collect();

        let ring = self.ring.read().await;
        if ring.is_empty() {
            return Vec::new();
        }

        let start = {
            let idx = ring.partition_point(|v| v.hash < *target);
            if idx == ring.len() { 0 } else { idx }
        };

        let mut seen: HashSet<&str> = HashSet::new();
        let mut replicas = Vec::with_capacity(count);

        for offset in 0..ring.len() {
            if replicas.len() >= count {
                break;
            }
            let vnode = &ring[(start + offset) % ring.len()];
            if seen.contains(vnode.node_id.as_str()) {
                continue;
            }
            seen.insert(vnode.node_id.as_str());
            if alive.contains_key(vnode.node_id.as_str()) {
                replicas.push(vnode.node_id.clone());
            }
        }
        replicas
    }

    /// Resolve the replica set for a file path
    pub async fn locate_file(&self, path: &str, cluster_nodes: &[Node]) -> FileLocation {
        let hash = RingHash::of_str(path);
        let replicas = self
            .replicas(&hash, self.config.replication_factor, cluster_nodes)
            .await;
        FileLocation {
            path: path.to_string(),
            hash,
            replicas,
        }
    }

    /// The [min, max] hash range covered by a node's virtual nodes
    pub async fn key_range(&self, node_id: &str) -> Option<(RingHash, RingHash)> {
        let ring = self.ring.read().await;
        let mut range: Option<(RingHash, RingHash)> = None;
        for vnode in ring.iter().filter(|v| v.node_id == node_id) {
            range = Some(match range {
                None => (vnode.hash, vnode.hash),
                Some((lo, hi)) => (lo.min(vnode.hash), hi.max(vnode.hash)),
            });
        }
        range
    }

    pub async fn stats(&self) -> DhtStats {
        let ring = self.ring.read().await;
        let physical: HashSet<&str> = ring.iter().map(|v| v.node_id.as_str()).collect();
        DhtStats {
            vnode_count: ring.len(),
            physical_nodes: physical.len(),
            vnodes_per_node: self.config.vnodes_per_node,
            replication_factor: self.config.replication_factor,
        }
    }
}
