use crate::config::RegistryConfig;
use crate::error::{MeshError, Result};
use crate::types::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

/// Service health, ordered by the stable wire enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceHealth {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// One registered service instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub service_id: String,
    pub service_name: String,
    /// host:port (or socket path)
    pub endpoint: String,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,

    pub health: ServiceHealth,
    pub last_heartbeat_ms: u64,
    pub registered_at_ms: u64,

    pub request_count: u64,
    pub error_count: u64,
    pub avg_response_ms: f64,

    pub node_id: Option<String>,
    pub active: bool,
}

/// Discovery filter
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub tag: Option<String>,
    pub min_health: Option<ServiceHealth>,
    pub node_id: Option<String>,
    pub only_active: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub unhealthy_services: usize,
    pub inactive_services: usize,
    pub total_registrations: u64,
    pub total_deregistrations: u64,
}

/// Service-id → endpoint catalog with heartbeat-driven health.
///
/// A background health task downgrades endpoints whose heartbeat went silent;
/// a cleanup task eventually removes long-inactive entries.
pub struct ServiceRegistry {
    config: RegistryConfig,
    services: RwLock<HashMap<String, ServiceEndpoint>>,
    registrations: Mutex<u64>,
    deregistrations: Mutex<u64>,
    shutdown: watch::Receiver<bool>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, shutdown: watch::Receiver<bool>) -> Self {
        info!(
            "🗂️ Service registry initialized (heartbeat timeout {}ms)",
            config.heartbeat_timeout_ms
        );
        Self {
            config,
            services: RwLock::new(HashMap::new()),
            registrations: Mutex::new(0),
            deregistrations: Mutex::new(0),
            shutdown,
        }
    }

    /// Register a service instance. Every registration mints a fresh id, so
    /// register → deregister → register yields distinct ids.
    pub async fn register(
        &self,
        service_name: &str,
        endpoint: &str,
        tags: Vec<String>,
    ) -> ServiceEndpoint {
        let now = now_ms();
        let service = ServiceEndpoint {
            service_id: format!("{}-{}-{}", service_name, now, rand::random::<u16>() % 10_000),
            service_name: service_name.to_string(),
            endpoint: endpoint.to_string(),
            tags,
            metadata: HashMap::new(),
            health: ServiceHealth::Healthy,
            last_heartbeat_ms: now,
            registered_at_ms: now,
            request_count: 0,
            error_count: 0,
            avg_response_ms: 0.0,
            node_id: None,
            active: true,
        };

        debug!(
            "service registered: {} at {}",
            service.service_id, service.endpoint
        );
        self.services
            .write()
            .await
            .insert(service.service_id.clone(), service.clone());
        *self.registrations.lock().await += 1;
        service
    }

    /// Remove a service instance. Idempotent: unknown ids are fine.
    pub async fn deregister(&self, service_id: &str) {
        if self.services.write().await.remove(service_id).is_some() {
            debug!("service deregistered: {service_id}");
            *self.deregistrations.lock().await += 1;
        }
    }

    /// Refresh a service's liveness timestamp
    pub async fn heartbeat(&self, service_id: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;
        service.last_heartbeat_ms = now_ms();
        if !service.active {
            service.active = true;
            service.health = ServiceHealth::Healthy;
        }
        Ok(())
    }

    pub async fn set_health(&self, service_id: &str, health: ServiceHealth) -> Result<()> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;
        service.health = health;
        Ok(())
    }

    pub async fn set_metadata(&self, service_id: &str, key: &str, value: &str) -> Result<()> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;
        service.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Fold one request observation into an endpoint's load stats
    pub async fn record_request(
        &self,
        service_id: &str,
        ok: bool,
        response_time_ms: f64,
    ) -> Result<()> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(service_id)
            .ok_or_else(|| MeshError::ServiceNotFound {
                service_id: service_id.to_string(),
            })?;
        service.request_count += 1;
        if !ok {
            service.error_count += 1;
        }
        service.avg_response_ms = response_time_ms;
        Ok(())
    }

    pub async fn get(&self, service_id: &str) -> Option<ServiceEndpoint> {
        self.services.read().await.get(service_id).cloned()
    }

    pub async fn find_by_name(&self, service_name: &str) -> Vec<ServiceEndpoint> {
        self.find(&ServiceQuery {
            name: Some(service_name.to_string()),
            only_active: true,
            ..Default::default()
        })
        .await
    }

    pub async fn find_by_tag(&self, tag: &str) -> Vec<ServiceEndpoint> {
        self.find(&ServiceQuery {
            tag: Some(tag.to_string()),
            only_active: true,
            ..Default::default()
        })
        .await
    }

    /// Filtered discovery. Results are ordered by registration time so
    /// selection algorithms see a stable sequence.
    pub async fn find(&self, query: &ServiceQuery) -> Vec<ServiceEndpoint> {
        let services = self.services.read().await;
        let mut results: Vec<ServiceEndpoint> = services
            .values()
            .filter(|s| {
                if query.only_active && !s.active {
                    return false;
                }
                if let Some(name) = &query.name {
                    if &s.service_name != name {
                        return false;
                    }
                }
                if let Some(tag) = &query.tag {
                    if !s.tags.iter().any(|t| t == tag) {
                        return false;
                    }
                }
                if let Some(min) = query.min_health {
                    if s.health < min {
                        return false;
                    }
                }
                if let Some(node) = &query.node_id {
                    if s.node_id.as_deref() != Some(node.as_str()) {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.registered_at_ms
                .cmp(&b.registered_at_ms)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });
        results
    }

    pub async fn list_all(&self) -> Vec<ServiceEndpoint> {
        let services = self.services.read().await;
        let mut all: Vec<ServiceEndpoint> = services.values().cloned().collect();
        all.sort_by(|a, b| a.registered_at_ms.cmp(&b.registered_at_ms));
        all
    }

    /// Downgrade endpoints whose heartbeat exceeded the timeout
    pub async fn health_tick(&self) {
        if !self.config.enable_health_checks {
            return;
        }
        let now = now_ms();
        let mut services = self.services.write().await;
        for service in services.values_mut() {
            if !service.active {
                continue;
            }
            if now.saturating_sub(service.last_heartbeat_ms) > self.config.heartbeat_timeout_ms {
                warn!(
                    "service {} missed heartbeats, marking UNHEALTHY",
                    service.service_id
                );
                service.health = ServiceHealth::Unhealthy;
                service.active = false;
            }
        }
    }

    /// Remove inactive services whose last heartbeat is long gone
    pub async fn cleanup_tick(&self) {
        let now = now_ms();
        let cutoff = self.config.cleanup_after_ms;
        let mut removed = 0u64;
        {
            let mut services = self.services.write().await;
            services.retain(|_, s| {
                let stale = !s.active && now.saturating_sub(s.last_heartbeat_ms) > cutoff;
                if stale {
                    removed += 1;
                }
                !stale
            });
        }
        if removed > 0 {
            debug!("registry cleanup removed {removed} stale services");
            *self.deregistrations.lock().await += removed;
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let services = self.services.read().await;
        let mut stats = RegistryStats {
            total_services: services.len(),
            total_registrations: *self.registrations.lock().await,
            total_deregistrations: *self.deregistrations.lock().await,
            ..Default::default()
        };
        for service in services.values() {
            if !service.active {
                stats.inactive_services += 1;
                continue;
            }
            match service.health {
                ServiceHealth::Healthy => stats.healthy_services += 1,
                ServiceHealth::Degraded => stats.degraded_services += 1,
                ServiceHealth::Unhealthy => stats.unhealthy_services += 1,
                ServiceHealth::Unknown => {}
            }
        }
        stats
    }

    /// Spawn the health-check and cleanup tasks
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let health_interval = self.config.health_check_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(health_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                registry.health_tick().await;
            }
        });

        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let cleanup_interval = self.config.cleanup_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(cleanup_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                registry.cleanup_tick().await;
            }
        });
    }
}
