use crate::cluster::{Node, NodeState};
use crate::config::SchedulerConfig;
use crate::error::{Result, ScheduleError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

pub mod constraints;
pub mod quota;

pub use constraints::{
    AffinityRule, ConstraintKind, ConstraintOperator, PlacementConstraint, PlacementPreferences,
    PlacementStrategy,
};
pub use quota::{Reservation, ResourceQuota};

/// What an instance asks for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_cores: f64,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: u64,
    pub needs_gpu: bool,
    pub gpu_count: u32,
}

impl ResourceRequest {
    pub fn new(cpu_cores: f64, ram_mb: u64) -> Self {
        Self {
            cpu_cores,
            ram_mb,
            ..Default::default()
        }
    }
}

/// Per-node accounting: totals, availability, and allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResources {
    pub node_id: String,

    pub cpu_total: f64,
    pub cpu_available: f64,
    pub cpu_allocated: f64,

    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
    pub ram_allocated_mb: u64,

    pub disk_total_mb: u64,
    pub disk_available_mb: u64,
    pub disk_allocated_mb: u64,

    pub gpu_total: u32,
    pub gpu_available: u32,

    pub instance_count: u32,
    pub instance_capacity: u32,

    pub labels: HashMap<String, String>,
    pub taints: HashSet<String>,
}

impl NodeResources {
    fn from_node(node: &Node) -> Self {
        let mut labels = HashMap::new();
        labels.insert("node.id".to_string(), node.id.clone());
        Self {
            node_id: node.id.clone(),
            cpu_total: node.cpu_total,
            cpu_available: node.cpu_available,
            cpu_allocated: 0.0,
            ram_total_mb: node.ram_total_mb,
            ram_available_mb: node.ram_available_mb,
            ram_allocated_mb: 0,
            disk_total_mb: 0,
            disk_available_mb: 0,
            disk_allocated_mb: 0,
            gpu_total: 0,
            gpu_available: 0,
            instance_count: node.current_instances,
            instance_capacity: node.max_instances,
            labels,
            taints: HashSet::new(),
        }
    }

    pub fn cpu_utilization(&self) -> f64 {
        if self.cpu_total == 0.0 {
            return 0.0;
        }
        self.cpu_allocated / self.cpu_total
    }

    pub fn ram_utilization(&self) -> f64 {
        if self.ram_total_mb == 0 {
            return 0.0;
        }
        self.ram_allocated_mb as f64 / self.ram_total_mb as f64
    }

    /// Mean of CPU and RAM utilization, as a 0..1 fraction
    pub fn overall_utilization(&self) -> f64 {
        (self.cpu_utilization() + self.ram_utilization()) / 2.0
    }

    /// Would every requested dimension fit right now?
    pub fn fits(&self, request: &ResourceRequest) -> bool {
        self.cpu_available >= request.cpu_cores
            && self.ram_available_mb >= request.ram_mb
            && self.disk_available_mb >= request.disk_mb
            && (!request.needs_gpu || self.gpu_available >= request.gpu_count)
            && self.instance_count < self.instance_capacity
    }

    fn utilization_after(&self, request: &ResourceRequest) -> f64 {
        let cpu_after = if self.cpu_total == 0.0 {
            0.0
        } else {
            (self.cpu_allocated + request.cpu_cores) / self.cpu_total
        };
        let ram_after = if self.ram_total_mb == 0 {
            0.0
        } else {
            (self.ram_allocated_mb + request.ram_mb) as f64 / self.ram_total_mb as f64
        };
        (cpu_after + ram_after) / 2.0
    }
}

/// Outcome of a successful placement
#[derive(Debug, Clone, Serialize)]
pub struct SchedulingDecision {
    pub node_id: String,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub registered_nodes: usize,
    pub total_scheduled: u64,
    pub total_failed: u64,
    pub active_reservations: usize,
}

/// Resource-aware placement engine.
///
/// Owns per-node accounting keyed by node id; liveness comes from the caller's
/// cluster snapshot so no two subsystem locks are ever held together.
pub struct Scheduler {
    config: SchedulerConfig,
    nodes: RwLock<HashMap<String, NodeResources>>,
    pub(crate) quotas: RwLock<HashMap<String, ResourceQuota>>,
    pub(crate) reservations: RwLock<HashMap<String, Reservation>>,
    /// node_id -> service names placed there, for affinity scoring
    placements: RwLock<HashMap<String, HashSet<String>>>,
    stats: Mutex<SchedulerStats>,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, shutdown: watch::Receiver<bool>) -> Self {
        info!(
            "📋 Scheduler initialized (quotas {})",
            if config.enforce_quotas { "enforced" } else { "off" }
        );
        Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            quotas: RwLock::new(HashMap::new()),
            reservations: RwLock::new(HashMap::new()),
            placements: RwLock::new(HashMap::new()),
            stats: Mutex::new(SchedulerStats::default()),
            shutdown,
        }
    }

    /// Track a node's resources. Re-registering an existing node keeps the
    /// current accounting untouched.
    pub async fn register_node(&self, node: &Node) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(&node.id) {
            debug!("scheduler tracking node {}", node.id);
            nodes.insert(node.id.clone(), NodeResources::from_node(node));
        }
        Ok(())
    }

    pub async fn unregister_node(&self, node_id: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if nodes.remove(node_id).is_none() {
            return Err(ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            }
            .into());
        }
        self.placements.write().await.remove(node_id);
        Ok(())
    }

    pub async fn node_resources(&self, node_id: &str) -> Option<NodeResources> {
        self.nodes.read().await.get(node_id).cloned()
    }

    /// Commit an allocation. Fails without side effects when any dimension is
    /// under-provisioned.
    pub async fn allocate(&self, node_id: &str, request: &ResourceRequest) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;

        if !res.fits(request) {
            return Err(ScheduleError::InsufficientResources {
                node_id: node_id.to_string(),
            }
            .into());
        }

        res.cpu_allocated += request.cpu_cores;
        res.cpu_available -= request.cpu_cores;
        res.ram_allocated_mb += request.ram_mb;
        res.ram_available_mb -= request.ram_mb;
        res.disk_allocated_mb += request.disk_mb;
        res.disk_available_mb -= request.disk_mb;
        if request.needs_gpu {
            res.gpu_available -= request.gpu_count;
        }
        res.instance_count += 1;
        Ok(())
    }

    /// Inverse of `allocate`
    pub async fn release(&self, node_id: &str, request: &ResourceRequest) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;

        res.cpu_allocated = (res.cpu_allocated - request.cpu_cores).max(0.0);
        res.cpu_available = (res.cpu_available + request.cpu_cores).min(res.cpu_total);
        res.ram_allocated_mb = res.ram_allocated_mb.saturating_sub(request.ram_mb);
        res.ram_available_mb = (res.ram_available_mb + request.ram_mb).min(res.ram_total_mb);
        res.disk_allocated_mb = res.disk_allocated_mb.saturating_sub(request.disk_mb);
        res.disk_available_mb = (res.disk_available_mb + request.disk_mb).min(res.disk_total_mb);
        if request.needs_gpu {
            res.gpu_available = (res.gpu_available + request.gpu_count).min(res.gpu_total);
        }
        res.instance_count = res.instance_count.saturating_sub(1);
        Ok(())
    }

    pub async fn add_label(&self, node_id: &str, key: &str, value: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;
        res.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub async fn remove_label(&self, node_id: &str, key: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;
        res.labels.remove(key);
        Ok(())
    }

    pub async fn get_label(&self, node_id: &str, key: &str) -> Option<String> {
        self.nodes
            .read()
            .await
            .get(node_id)
            .and_then(|r| r.labels.get(key).cloned())
    }

    pub async fn add_taint(&self, node_id: &str, taint: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;
        res.taints.insert(taint.to_string());
        Ok(())
    }

    pub async fn remove_taint(&self, node_id: &str, taint: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let res = nodes
            .get_mut(node_id)
            .ok_or_else(|| ScheduleError::NodeNotRegistered {
                node_id: node_id.to_string(),
            })?;
        res.taints.remove(taint);
        Ok(())
    }

    /// Record that a service instance landed on a node (feeds affinity scoring)
    pub async fn record_placement(&self, node_id: &str, service_name: &str) {
        self.placements
            .write()
            .await
            .entry(node_id.to_string())
            .or_default()
            .insert(service_name.to_string());
    }

    pub async fn remove_placement(&self, node_id: &str, service_name: &str) {
        if let Some(services) = self.placements.write().await.get_mut(node_id) {
            services.remove(service_name);
        }
    }

    /// Pick the best feasible node for a request.
    ///
    /// `cluster_nodes` is the caller's current membership snapshot; only ALIVE
    /// nodes are considered. Returns `NoFeasibleNode` when nothing fits.
    pub async fn schedule(
        &self,
        request: &ResourceRequest,
        prefs: &PlacementPreferences,
        cluster_nodes: &[Node],
    ) -> Result<SchedulingDecision> {
        let nodes = self.nodes.read().await;
        let placements = self.placements.read().await;

        let mut best: Option<(f64, String)> = None;

        for node in cluster_nodes {
            if node.state != NodeState::Alive {
                continue;
            }
            let Some(res) = nodes.get(&node.id) else {
                continue;
            };
            if !is_feasible(res, request, prefs) {
                continue;
            }

            let score = score_node(res, request, prefs, placements.get(&node.id));
            let better = match &best {
                None => true,
                Some((best_score, best_id)) => {
                    score > *best_score || (score == *best_score && node.id < *best_id)
                }
            };
            if better {
                best = Some((score, node.id.clone()));
            }
        }

        drop(placements);
        drop(nodes);

        let mut stats = self.stats.lock().await;
        match best {
            Some((score, node_id)) => {
                stats.total_scheduled += 1;
                debug!("scheduled onto {} (score {:.1})", node_id, score);
                Ok(SchedulingDecision {
                    reason: format!("selected node {node_id} (score {score:.1})"),
                    node_id,
                    score,
                })
            }
            None => {
                stats.total_failed += 1;
                warn!("no feasible node for request {:?}", request);
                Err(ScheduleError::NoFeasibleNode.into())
            }
        }
    }

    /// Quota-gated variant: the namespace check runs before any scoring
    pub async fn schedule_in_namespace(
        &self,
        namespace: &str,
        request: &ResourceRequest,
        prefs: &PlacementPreferences,
        cluster_nodes: &[Node],
    ) -> Result<SchedulingDecision> {
        if self.config.enforce_quotas && !self.check_quota(namespace, request).await {
            self.stats.lock().await.total_failed += 1;
            return Err(ScheduleError::QuotaExceeded {
                namespace: namespace.to_string(),
            }
            .into());
        }
        self.schedule(request, prefs, cluster_nodes).await
    }

    pub async fn stats(&self) -> SchedulerStats {
        let mut stats = self.stats.lock().await.clone();
        stats.registered_nodes = self.nodes.read().await.len();
        stats.active_reservations = self.reservations.read().await.len();
        stats
    }

    /// Spawn the reservation expiry sweep
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let interval_ms = self.config.reservation_sweep_interval_ms;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                scheduler.sweep_expired_reservations().await;
            }
        });
    }
}

/// Node is ALIVE (checked by the caller), resources fit, instance headroom
/// exists, every REQUIRED constraint matches, every taint is tolerated.
fn is_feasible(
    res: &NodeResources,
    request: &ResourceRequest,
    prefs: &PlacementPreferences,
) -> bool {
    if !res.fits(request) {
        return false;
    }
    for constraint in &prefs.constraints {
        if constraint.kind == ConstraintKind::Required && !constraint.matches(&res.labels) {
            return false;
        }
    }
    res.taints
        .iter()
        .all(|taint| prefs.tolerations.iter().any(|t| t == taint))
}

/// strategy score + matched preferred-constraint weights + affinity weights
fn score_node(
    res: &NodeResources,
    request: &ResourceRequest,
    prefs: &PlacementPreferences,
    hosted: Option<&HashSet<String>>,
) -> f64 {
    let base = match prefs.strategy {
        PlacementStrategy::BinPack => 100.0 * res.utilization_after(request),
        PlacementStrategy::Spread | PlacementStrategy::Affinity => {
            100.0 * (1.0 - res.overall_utilization())
        }
        PlacementStrategy::Random => rand::thread_rng().gen_range(0..100) as f64,
    };

    let preferred: i64 = prefs
        .constraints
        .iter()
        .filter(|c| c.kind == ConstraintKind::Preferred && c.matches(&res.labels))
        .map(|c| c.weight)
        .sum();

    let affinity: i64 = prefs
        .affinity_rules
        .iter()
        .filter(|rule| hosted.is_some_and(|services| services.contains(&rule.service_name)))
        .map(|rule| if rule.anti_affinity { -rule.weight } else { rule.weight })
        .sum();

    base + preferred as f64 + affinity as f64
}
