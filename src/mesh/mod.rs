use crate::config::ControllerConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio::sync::watch;

pub mod balancer;
pub mod circuit;
pub mod registry;

pub use balancer::{LbAlgorithm, LbPolicy, LbStats, LoadBalancer};
pub use circuit::{CircuitBreaker, CircuitBreakerRegistry, CircuitState, CircuitStats};
pub use registry::{
    RegistryStats, ServiceEndpoint, ServiceHealth, ServiceQuery, ServiceRegistry,
};

/// Service-mesh dataplane: registry, load balancer, circuit breakers.
///
/// The balancer reads the registry; the breakers guard whatever targets the
/// caller routes through. `guarded_route` composes all three.
pub struct ServiceMesh {
    pub registry: Arc<ServiceRegistry>,
    pub balancer: Arc<LoadBalancer>,
    pub circuits: Arc<CircuitBreakerRegistry>,
}

impl ServiceMesh {
    pub fn new(config: &ControllerConfig, shutdown: watch::Receiver<bool>) -> Self {
        let registry = Arc::new(ServiceRegistry::new(
            config.registry.clone(),
            shutdown.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            &config.load_balancer,
            Arc::clone(&registry),
        ));
        let circuits = Arc::new(CircuitBreakerRegistry::new(config.circuit.clone(), shutdown));
        Self {
            registry,
            balancer,
            circuits,
        }
    }

    /// Route through the balancer with the target's circuit breaker in front.
    /// Rejected requests never reach endpoint selection.
    pub async fn guarded_route(
        &self,
        service_name: &str,
        client_id: Option<&str>,
        tag: Option<&str>,
    ) -> Result<ServiceEndpoint> {
        if !self.circuits.allow_request(service_name).await {
            return Err(crate::error::MeshError::NoEndpoint {
                service: service_name.to_string(),
            }
            .into());
        }
        self.balancer.route(service_name, client_id, tag).await
    }

    /// Report an outcome to both the balancer and the circuit breaker
    pub async fn report(
        &self,
        service_name: &str,
        endpoint_id: &str,
        ok: bool,
        response_time_ms: f64,
    ) -> Result<()> {
        if ok {
            self.circuits.record_success(service_name).await?;
        } else {
            self.circuits.record_failure(service_name).await?;
        }
        self.balancer
            .report(service_name, endpoint_id, ok, response_time_ms)
            .await
    }

    /// Spawn the registry health/cleanup tasks and the breaker window refresher
    pub fn start(&self) {
        self.registry.start();
        self.circuits.start();
    }
}
