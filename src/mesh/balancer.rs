use crate::config::LoadBalancerConfig;
use crate::error::{MeshError, Result};
use crate::mesh::registry::{ServiceEndpoint, ServiceHealth, ServiceQuery, ServiceRegistry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Endpoint selection algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LbAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
    /// Degenerates to round-robin while endpoint weights are absent
    WeightedRoundRobin,
    LeastResponseTime,
    IpHash,
}

impl LbAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "round_robin" => Some(Self::RoundRobin),
            "least_connections" => Some(Self::LeastConnections),
            "random" => Some(Self::Random),
            "weighted_round_robin" => Some(Self::WeightedRoundRobin),
            "least_response_time" => Some(Self::LeastResponseTime),
            "ip_hash" => Some(Self::IpHash),
            _ => None,
        }
    }
}

/// Per-service balancing policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbPolicy {
    pub algorithm: LbAlgorithm,
    pub health_check_enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub sticky_sessions: bool,
    pub session_timeout_ms: u64,
}

impl LbPolicy {
    fn from_config(config: &LoadBalancerConfig) -> Self {
        Self {
            algorithm: LbAlgorithm::parse(&config.algorithm).unwrap_or_default(),
            health_check_enabled: config.health_check_enabled,
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            sticky_sessions: config.sticky_sessions,
            session_timeout_ms: config.session_timeout_ms,
        }
    }
}

#[derive(Debug)]
struct BalancerState {
    policy: LbPolicy,
    /// Per-endpoint pick counters for round-robin
    counters: HashMap<String, u64>,
    total_requests: u64,
    failed_requests: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LbStats {
    pub active_balancers: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
}

/// Routes requests to healthy endpoints by per-service policy
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    default_policy: LbPolicy,
    balancers: RwLock<HashMap<String, BalancerState>>,
    successes: Mutex<u64>,
    failures: Mutex<u64>,
}

impl LoadBalancer {
    pub fn new(config: &LoadBalancerConfig, registry: Arc<ServiceRegistry>) -> Self {
        let default_policy = LbPolicy::from_config(config);
        info!(
            "⚖️ Load balancer initialized (default {:?})",
            default_policy.algorithm
        );
        Self {
            registry,
            default_policy,
            balancers: RwLock::new(HashMap::new()),
            successes: Mutex::new(0),
            failures: Mutex::new(0),
        }
    }

    /// Install an explicit policy for a service
    pub async fn set_policy(&self, service_name: &str, policy: LbPolicy) {
        let mut balancers = self.balancers.write().await;
        match balancers.get_mut(service_name) {
            Some(state) => state.policy = policy,
            None => {
                balancers.insert(
                    service_name.to_string(),
                    BalancerState {
                        policy,
                        counters: HashMap::new(),
                        total_requests: 0,
                        failed_requests: 0,
                    },
                );
            }
        }
    }

    pub async fn policy(&self, service_name: &str) -> LbPolicy {
        self.balancers
            .read()
            .await
            .get(service_name)
            .map(|s| s.policy.clone())
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// Pick an endpoint for a request.
    ///
    /// Endpoints are filtered by tag when given, and to HEALTHY ∧ active when
    /// the policy has health checks on. `NoEndpoint` when nothing qualifies.
    pub async fn route(
        &self,
        service_name: &str,
        client_id: Option<&str>,
        tag: Option<&str>,
    ) -> Result<ServiceEndpoint> {
        let endpoints = match tag {
            Some(tag) => {
                self.registry
                    .find(&ServiceQuery {
                        name: Some(service_name.to_string()),
                        tag: Some(tag.to_string()),
                        min_health: Some(ServiceHealth::Healthy),
                        only_active: true,
                        ..Default::default()
                    })
                    .await
            }
            None => self.registry.find_by_name(service_name).await,
        };

        let mut balancers = self.balancers.write().await;
        let state = balancers
            .entry(service_name.to_string())
            .or_insert_with(|| BalancerState {
                policy: self.default_policy.clone(),
                counters: HashMap::new(),
                total_requests: 0,
                failed_requests: 0,
            });

        let candidates: Vec<&ServiceEndpoint> = if state.policy.health_check_enabled {
            endpoints
                .iter()
                .filter(|e| e.health == ServiceHealth::Healthy && e.active)
                .collect()
        } else {
            endpoints.iter().collect()
        };

        if candidates.is_empty() {
            return Err(MeshError::NoEndpoint {
                service: service_name.to_string(),
            }
            .into());
        }

        let selected = select_endpoint(state, &candidates, client_id).clone();
        state.total_requests += 1;
        debug!(
            "routed {} -> {} ({:?})",
            service_name, selected.endpoint, state.policy.algorithm
        );
        Ok(selected)
    }

    /// Report a completed request: feeds both LB counters and registry stats
    pub async fn report(
        &self,
        service_name: &str,
        endpoint_id: &str,
        ok: bool,
        response_time_ms: f64,
    ) -> Result<()> {
        {
            let mut balancers = self.balancers.write().await;
            if let Some(state) = balancers.get_mut(service_name) {
                if !ok {
                    state.failed_requests += 1;
                }
            }
        }
        if ok {
            *self.successes.lock().await += 1;
        } else {
            *self.failures.lock().await += 1;
        }
        self.registry
            .record_request(endpoint_id, ok, response_time_ms)
            .await
    }

    pub async fn stats(&self) -> LbStats {
        let balancers = self.balancers.read().await;
        LbStats {
            active_balancers: balancers.len(),
            total_requests: balancers.values().map(|s| s.total_requests).sum(),
            successful_requests: *self.successes.lock().await,
            failed_requests: *self.failures.lock().await,
        }
    }
}

fn select_endpoint<'a>(
    state: &mut BalancerState,
    candidates: &[&'a ServiceEndpoint],
    client_id: Option<&str>,
) -> &'a ServiceEndpoint {
    match state.policy.algorithm {
        LbAlgorithm::RoundRobin | LbAlgorithm::WeightedRoundRobin => {
            let mut selected = 0;
            let mut min_count = u64::MAX;
            for (i, endpoint) in candidates.iter().enumerate() {
                let count = *state.counters.get(&endpoint.service_id).unwrap_or(&0);
                if count < min_count {
                    min_count = count;
                    selected = i;
                }
            }
            let chosen = candidates[selected];
            *state.counters.entry(chosen.service_id.clone()).or_insert(0) += 1;
            chosen
        }

        LbAlgorithm::LeastConnections => candidates
            .iter()
            .min_by_key(|e| e.request_count.saturating_sub(e.error_count))
            .copied()
            .unwrap(),

        LbAlgorithm::LeastResponseTime => candidates
            .iter()
            .min_by(|a, b| {
                a.avg_response_ms
                    .partial_cmp(&b.avg_response_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
            .unwrap(),

        LbAlgorithm::Random => candidates[rand::thread_rng().gen_range(0..candidates.len())],

        LbAlgorithm::IpHash => match client_id {
            Some(client) => candidates[(djb2(client) % candidates.len() as u64) as usize],
            None => candidates[rand::thread_rng().gen_range(0..candidates.len())],
        },
    }
}

/// djb2 string hash, stable per client id
fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}
