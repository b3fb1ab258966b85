//! Constellation - distributed orchestration runtime
//!
//! This crate provides cluster membership with SWIM-style failure detection,
//! Raft-lite leader election, resource-aware placement, a consistent-hash
//! content placement layer, service-mesh primitives, and a metrics-driven
//! autoscaling and alerting pipeline.

pub mod autoscale;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod dht;
pub mod error;
pub mod mesh;
pub mod monitoring;
pub mod scheduler;
pub mod types;

pub use config::ControllerConfig;
pub use error::{ConstellationError, Result};

// Export main types at root level
pub use cluster::{ClusterManager, Node, NodeState};
pub use consensus::{RaftNode, RaftRole};
pub use dht::{DhtRing, LockManager, LockMode};
pub use mesh::{ServiceMesh, ServiceRegistry};
pub use monitoring::{AlertEngine, MetricsStore};
pub use scheduler::{PlacementPreferences, ResourceRequest, Scheduler};

// Re-export anyhow for compatibility
pub use anyhow;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{info, warn};

/// Re-exports for easier API usage
pub mod api {
    pub use crate::autoscale::{AutoScaler, ScaleDirection, ScalingPolicy, ScalingRule};
    pub use crate::cluster::{ClusterManager, Node, NodeState};
    pub use crate::config::ControllerConfig;
    pub use crate::consensus::{RaftNode, RaftRole};
    pub use crate::dht::{DhtRing, FileLocation, Lock, LockManager, LockMode, RingHash};
    pub use crate::mesh::{
        CircuitBreakerRegistry, CircuitState, LbAlgorithm, LoadBalancer, ServiceEndpoint,
        ServiceHealth, ServiceMesh, ServiceQuery, ServiceRegistry,
    };
    pub use crate::monitoring::{
        AlertEngine, AlertSeverity, AlertState, ChannelKind, CompareOp, MetricKind, MetricsStore,
    };
    pub use crate::scheduler::{
        AffinityRule, ConstraintOperator, PlacementConstraint, PlacementPreferences,
        PlacementStrategy, ResourceQuota, ResourceRequest, Scheduler, SchedulingDecision,
    };
    pub use crate::types::{InstanceInfo, InstanceState, ResourceLimits};
    pub use crate::{ConstellationRuntime, ConstellationStatus};
}

/// Aggregate snapshot across every subsystem
#[derive(Debug, Clone, Serialize)]
pub struct ConstellationStatus {
    pub cluster: cluster::ClusterStats,
    pub consensus: consensus::RaftStatus,
    pub scheduler: scheduler::SchedulerStats,
    pub dht: dht::DhtStats,
    pub locks: dht::LockStats,
    pub registry: mesh::RegistryStats,
    pub load_balancer: mesh::LbStats,
    pub circuits: mesh::CircuitStats,
    pub metrics: monitoring::MetricsStats,
    pub autoscaler: autoscale::ScalerStats,
    pub alerts: monitoring::AlertStats,
}

/// Owns every subsystem handle and wires them in dependency order:
/// cluster feeds the scheduler and DHT, which feed the mesh, which feeds
/// the monitoring pipeline; consensus rides the cluster transport.
pub struct ConstellationRuntime {
    config: ControllerConfig,
    shutdown_tx: watch::Sender<bool>,

    pub cluster: Arc<ClusterManager>,
    pub consensus: Arc<RaftNode>,
    pub scheduler: Arc<Scheduler>,
    pub dht: Arc<DhtRing>,
    pub locks: Arc<LockManager>,
    pub mesh: Arc<ServiceMesh>,
    pub metrics: Arc<MetricsStore>,
    pub autoscaler: Arc<autoscale::AutoScaler>,
    pub alerts: Arc<AlertEngine>,

    raft_outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, cluster::Message)>>>,
}

impl ConstellationRuntime {
    /// Create every subsystem without starting background tasks
    pub async fn new(config: ControllerConfig) -> Result<Self> {
        info!(
            "🌌 Constellation starting: node '{}' in cluster '{}'",
            config.node_name, config.cluster_name
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cluster = Arc::new(ClusterManager::new(&config, shutdown_rx.clone()).await?);

        let (raft_outbound_tx, raft_outbound_rx) = mpsc::unbounded_channel();
        let consensus = Arc::new(RaftNode::new(
            cluster.local_id(),
            config.consensus.clone(),
            raft_outbound_tx,
            shutdown_rx.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            shutdown_rx.clone(),
        ));
        let dht = Arc::new(DhtRing::new(config.dht.clone()));
        let locks = Arc::new(LockManager::new(
            config.locks.clone(),
            cluster.local_id(),
            shutdown_rx.clone(),
        ));
        let mesh = Arc::new(ServiceMesh::new(&config, shutdown_rx.clone()));
        let metrics = Arc::new(MetricsStore::new(config.metrics.clone(), shutdown_rx.clone()));
        let autoscaler = Arc::new(autoscale::AutoScaler::new(
            config.autoscaler.clone(),
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        ));
        let alerts = Arc::new(AlertEngine::new(
            config.alerts.clone(),
            Arc::clone(&metrics),
            shutdown_rx,
        ));

        // The local node participates in placement from the start
        let local = cluster.local_node().await;
        scheduler.register_node(&local).await?;
        dht.add_node(&local.id).await;

        Ok(Self {
            config,
            shutdown_tx,
            cluster,
            consensus,
            scheduler,
            dht,
            locks,
            mesh,
            metrics,
            autoscaler,
            alerts,
            raft_outbound_rx: Mutex::new(Some(raft_outbound_rx)),
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Start every background task and join the configured seed nodes
    pub async fn start(&self) -> Result<()> {
        // Consensus frames flow: receive loop -> raft inbound; raft outbound
        // -> transport forwarder
        let (raft_inbound_tx, raft_inbound_rx) = mpsc::unbounded_channel();
        self.cluster.start(raft_inbound_tx);
        self.consensus.start(raft_inbound_rx);

        if let Some(mut outbound_rx) = self.raft_outbound_rx.lock().await.take() {
            let transport = self.cluster.transport();
            let mut shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = outbound_rx.recv() => {
                            match received {
                                Some((target, msg)) => {
                                    let _ = transport.send(&msg, &target).await;
                                }
                                None => break,
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            });
        }

        self.scheduler.start();
        self.locks.start();
        self.mesh.start();
        self.metrics.start();
        self.autoscaler.start();
        self.alerts.start();
        self.spawn_membership_sync();

        if self.config.enable_clustering && !self.config.seed_nodes.is_empty() {
            self.cluster.join(&self.config.seed_nodes).await?;
        }

        info!("✅ Constellation runtime started");
        Ok(())
    }

    /// Keep consensus peers, scheduler accounting, and the DHT ring aligned
    /// with cluster membership.
    fn spawn_membership_sync(&self) {
        let cluster = Arc::clone(&self.cluster);
        let consensus = Arc::clone(&self.consensus);
        let scheduler = Arc::clone(&self.scheduler);
        let dht = Arc::clone(&self.dht);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(1000));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                let local_id = cluster.local_id().to_string();
                for node in cluster.nodes().await {
                    match node.state {
                        NodeState::Alive => {
                            if node.id != local_id {
                                consensus.add_peer(&node.id, node.socket_addr()).await;
                            }
                            let _ = scheduler.register_node(&node).await;
                            dht.add_node(&node.id).await;
                        }
                        NodeState::Dead | NodeState::Left => {
                            consensus.remove_peer(&node.id).await;
                            dht.remove_node(&node.id).await;
                        }
                        NodeState::Suspect => {}
                    }
                }
            }
        });
    }

    /// Gracefully leave the cluster and stop every background task.
    /// Each task observes the flag within one of its ticks.
    pub async fn shutdown(&self) -> Result<()> {
        info!("🛑 Constellation shutting down");
        if self.config.enable_clustering {
            if let Err(e) = self.cluster.leave().await {
                warn!("graceful leave failed: {e}");
            }
        }
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Snapshot every subsystem's stats
    pub async fn status(&self) -> ConstellationStatus {
        ConstellationStatus {
            cluster: self.cluster.stats().await,
            consensus: self.consensus.status().await,
            scheduler: self.scheduler.stats().await,
            dht: self.dht.stats().await,
            locks: self.locks.stats().await,
            registry: self.mesh.registry.stats().await,
            load_balancer: self.mesh.balancer.stats().await,
            circuits: self.mesh.circuits.stats().await,
            metrics: self.metrics.stats().await,
            autoscaler: self.autoscaler.stats().await,
            alerts: self.alerts.stats().await,
        }
    }
}
