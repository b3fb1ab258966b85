use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level controller configuration bundle.
///
/// Every subsystem takes its defaults from here; a TOML file can override any
/// section. Unset sections fall back to the documented defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// This node's name (defaults to the host name)
    pub node_name: String,
    /// Cluster name
    pub cluster_name: String,
    /// Control plane port (gossip, SWIM, consensus)
    pub control_port: u16,
    /// Data plane port
    pub data_port: u16,
    /// Bind address for cluster communication
    pub bind_address: String,
    /// Maximum instances this node will host
    pub max_instances: u32,
    /// Enable multi-node clustering
    pub enable_clustering: bool,
    /// Seed nodes to contact at join time ("host:port")
    pub seed_nodes: Vec<String>,

    pub gossip: GossipConfig,
    pub consensus: ConsensusConfig,
    pub scheduler: SchedulerConfig,
    pub dht: DhtConfig,
    pub locks: LockConfig,
    pub registry: RegistryConfig,
    pub load_balancer: LoadBalancerConfig,
    pub circuit: CircuitConfig,
    pub metrics: MetricsConfig,
    pub autoscaler: ScalerConfig,
    pub alerts: AlertConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            cluster_name: "default".to_string(),
            control_port: 7946,
            data_port: 7947,
            bind_address: "0.0.0.0".to_string(),
            max_instances: 1000,
            enable_clustering: false,
            seed_nodes: Vec::new(),
            gossip: GossipConfig::default(),
            consensus: ConsensusConfig::default(),
            scheduler: SchedulerConfig::default(),
            dht: DhtConfig::default(),
            locks: LockConfig::default(),
            registry: RegistryConfig::default(),
            load_balancer: LoadBalancerConfig::default(),
            circuit: CircuitConfig::default(),
            metrics: MetricsConfig::default(),
            autoscaler: ScalerConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "node-1".to_string())
}

impl ControllerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

/// Gossip + SWIM failure detection tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GossipConfig {
    /// How often the gossip task runs
    pub gossip_interval_ms: u64,
    /// How many random peers receive each gossip round
    pub gossip_fanout: usize,
    /// How often the health-check task runs
    pub health_interval_ms: u64,
    /// Silence before an ALIVE node is demoted to SUSPECT
    pub suspect_timeout_ms: u64,
    /// Silence before a SUSPECT node is confirmed DEAD
    pub dead_timeout_ms: u64,
    /// How long a direct ping may wait for its pong
    pub ping_timeout_ms: u64,
    /// How long confirmed-DEAD nodes are retained before eviction
    pub dead_retention_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            gossip_interval_ms: 1000,
            gossip_fanout: 3,
            health_interval_ms: 2000,
            suspect_timeout_ms: 5000,
            dead_timeout_ms: 10_000,
            ping_timeout_ms: 1000,
            dead_retention_ms: 300_000,
        }
    }
}

/// Raft-lite election timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Enforce per-namespace quotas before scheduling
    pub enforce_quotas: bool,
    /// How often expired reservations are swept
    pub reservation_sweep_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enforce_quotas: false,
            reservation_sweep_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Virtual nodes per physical node
    pub vnodes_per_node: usize,
    /// Desired replica count for placement lookups
    pub replication_factor: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            vnodes_per_node: 150,
            replication_factor: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockConfig {
    /// Default lock lease when the caller does not specify one
    pub default_lease_ms: u64,
    /// Upper bound on how long an acquire may block
    pub max_wait_ms: u64,
    /// How often expired locks are swept
    pub sweep_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 30_000,
            max_wait_ms: 60_000,
            sweep_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub heartbeat_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Inactive services idle longer than this are removed
    pub cleanup_after_ms: u64,
    pub enable_health_checks: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 15_000,
            health_check_interval_ms: 10_000,
            cleanup_interval_ms: 30_000,
            cleanup_after_ms: 300_000,
            enable_health_checks: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    /// Default algorithm for services without an explicit policy
    pub algorithm: String,
    pub health_check_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub sticky_sessions: bool,
    pub session_timeout_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: "round_robin".to_string(),
            health_check_enabled: true,
            max_retries: 3,
            retry_delay_ms: 100,
            sticky_sessions: false,
            session_timeout_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub window_ms: u64,
    pub error_rate_threshold: f64,
    /// How often the rolling window is refreshed
    pub refresh_interval_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_ms: 60_000,
            window_ms: 10_000,
            error_rate_threshold: 0.5,
            refresh_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring buffer capacity per metric
    pub history_size: usize,
    /// Points older than this are purged
    pub retention_secs: u64,
    /// How often the retention task runs
    pub retention_sweep_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            history_size: 100,
            retention_secs: 3600,
            retention_sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub evaluation_interval_ms: u64,
    pub default_cooldown_secs: u64,
    pub enable_predictive: bool,
    pub prediction_confidence_threshold: f64,
    /// History window the predictor fits its slope over
    pub prediction_rate_window_secs: u64,
    /// Bounded scaling-event history
    pub max_events: usize,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 10_000,
            default_cooldown_secs: 300,
            enable_predictive: false,
            prediction_confidence_threshold: 0.8,
            prediction_rate_window_secs: 300,
            max_events: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AlertConfig {
    pub evaluation_interval_ms: u64,
    pub default_breach_threshold: u32,
    pub enable_notifications: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 10_000,
            default_breach_threshold: 3,
            enable_notifications: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let config = ControllerConfig::default();
        assert_eq!(config.control_port, 7946);
        assert_eq!(config.data_port, 7947);
        assert_eq!(config.gossip.gossip_interval_ms, 1000);
        assert_eq!(config.gossip.gossip_fanout, 3);
        assert_eq!(config.gossip.suspect_timeout_ms, 5000);
        assert_eq!(config.gossip.dead_timeout_ms, 10_000);
        assert_eq!(config.consensus.heartbeat_interval_ms, 50);
        assert_eq!(config.consensus.election_timeout_min_ms, 150);
        assert_eq!(config.consensus.election_timeout_max_ms, 300);
        assert_eq!(config.dht.vnodes_per_node, 150);
        assert_eq!(config.dht.replication_factor, 3);
        assert_eq!(config.metrics.history_size, 100);
        assert_eq!(config.metrics.retention_secs, 3600);
        assert_eq!(config.autoscaler.default_cooldown_secs, 300);
        assert_eq!(config.alerts.default_breach_threshold, 3);
        assert!(!config.scheduler.enforce_quotas);
    }

    #[test]
    fn toml_round_trip_preserves_overrides() {
        let mut config = ControllerConfig::default();
        config.cluster_name = "prod-west".to_string();
        config.gossip.gossip_fanout = 5;

        let toml_text = config.to_toml().unwrap();
        let parsed: ControllerConfig = toml::from_str(&toml_text).unwrap();
        assert_eq!(parsed.cluster_name, "prod-west");
        assert_eq!(parsed.gossip.gossip_fanout, 5);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("constellation.toml");
        std::fs::write(&path, "cluster_name = \"lab\"\n[gossip]\ngossip_fanout = 7\n").unwrap();

        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.gossip.gossip_fanout, 7);
        assert_eq!(config.gossip.gossip_interval_ms, 1000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = ControllerConfig::load("/nonexistent/constellation.toml");
        assert!(result.is_err());
    }
}
