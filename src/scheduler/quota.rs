use crate::error::{Result, ScheduleError};
use crate::scheduler::{ResourceRequest, Scheduler};
use crate::types::now_ms;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Per-namespace resource quota with optional burst headroom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub namespace: String,
    /// Hard ceilings
    pub hard: ResourceRequest,
    /// Current usage charged against the quota
    pub used: ResourceRequest,
    pub max_instances: u32,
    pub used_instances: u32,
    /// Bursting stretches CPU/RAM/disk ceilings by `burst_pct`
    pub burst_allowed: bool,
    pub burst_pct: f64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl ResourceQuota {
    pub fn new(namespace: impl Into<String>, hard: ResourceRequest, max_instances: u32) -> Self {
        let now = now_ms();
        Self {
            namespace: namespace.into(),
            hard,
            used: ResourceRequest::default(),
            max_instances,
            used_instances: 0,
            burst_allowed: false,
            burst_pct: 0.0,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn with_burst(mut self, burst_pct: f64) -> Self {
        self.burst_allowed = true;
        self.burst_pct = burst_pct;
        self
    }

    fn burst_factor(&self) -> f64 {
        if self.burst_allowed {
            1.0 + self.burst_pct / 100.0
        } else {
            1.0
        }
    }

    /// Would this request stay within the (possibly burst-stretched) ceilings?
    pub fn admits(&self, request: &ResourceRequest) -> bool {
        let factor = self.burst_factor();
        self.used.cpu_cores + request.cpu_cores <= self.hard.cpu_cores * factor
            && (self.used.ram_mb + request.ram_mb) as f64 <= self.hard.ram_mb as f64 * factor
            && (self.used.disk_mb + request.disk_mb) as f64 <= self.hard.disk_mb as f64 * factor
            && self.used_instances < self.max_instances
    }

    fn charge(&mut self, request: &ResourceRequest) {
        self.used.cpu_cores += request.cpu_cores;
        self.used.ram_mb += request.ram_mb;
        self.used.disk_mb += request.disk_mb;
        self.used_instances += 1;
        self.updated_at_ms = now_ms();
    }

    fn refund(&mut self, request: &ResourceRequest) {
        self.used.cpu_cores = (self.used.cpu_cores - request.cpu_cores).max(0.0);
        self.used.ram_mb = self.used.ram_mb.saturating_sub(request.ram_mb);
        self.used.disk_mb = self.used.disk_mb.saturating_sub(request.disk_mb);
        self.used_instances = self.used_instances.saturating_sub(1);
        self.updated_at_ms = now_ms();
    }
}

/// Time-bounded claim on resources, charged against its namespace quota until
/// it is claimed or expires
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub namespace: String,
    pub resources: ResourceRequest,
    pub node_id: Option<String>,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    pub priority: i32,
    pub in_use: bool,
}

impl Scheduler {
    /// Install a quota. An existing quota for the namespace is kept untouched.
    pub async fn create_quota(&self, quota: ResourceQuota) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        if !quotas.contains_key(&quota.namespace) {
            info!("quota created for namespace '{}'", quota.namespace);
            quotas.insert(quota.namespace.clone(), quota);
        }
        Ok(())
    }

    /// Replace the ceilings of an existing quota, preserving current usage
    pub async fn update_quota(&self, update: ResourceQuota) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        let quota =
            quotas
                .get_mut(&update.namespace)
                .ok_or_else(|| ScheduleError::QuotaNotFound {
                    namespace: update.namespace.clone(),
                })?;
        quota.hard = update.hard;
        quota.max_instances = update.max_instances;
        quota.burst_allowed = update.burst_allowed;
        quota.burst_pct = update.burst_pct;
        quota.updated_at_ms = now_ms();
        Ok(())
    }

    pub async fn delete_quota(&self, namespace: &str) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        quotas
            .remove(namespace)
            .map(|_| ())
            .ok_or_else(|| {
                ScheduleError::QuotaNotFound {
                    namespace: namespace.to_string(),
                }
                .into()
            })
    }

    pub async fn get_quota(&self, namespace: &str) -> Option<ResourceQuota> {
        self.quotas.read().await.get(namespace).cloned()
    }

    /// Hard-limit check. Namespaces without a quota are unlimited.
    pub async fn check_quota(&self, namespace: &str, request: &ResourceRequest) -> bool {
        match self.quotas.read().await.get(namespace) {
            Some(quota) => quota.admits(request),
            None => true,
        }
    }

    /// Charge usage against a namespace quota
    pub async fn charge_quota(&self, namespace: &str, request: &ResourceRequest) -> Result<()> {
        let mut quotas = self.quotas.write().await;
        if let Some(quota) = quotas.get_mut(namespace) {
            if !quota.admits(request) {
                return Err(ScheduleError::QuotaExceeded {
                    namespace: namespace.to_string(),
                }
                .into());
            }
            quota.charge(request);
        }
        Ok(())
    }

    /// Return previously charged usage to a namespace quota
    pub async fn refund_quota(&self, namespace: &str, request: &ResourceRequest) {
        let mut quotas = self.quotas.write().await;
        if let Some(quota) = quotas.get_mut(namespace) {
            quota.refund(request);
        }
    }

    /// Reserve resources ahead of instance creation. The reservation counts
    /// against the namespace quota immediately.
    pub async fn reserve(
        &self,
        namespace: &str,
        request: &ResourceRequest,
        ttl_secs: u64,
        priority: i32,
    ) -> Result<Reservation> {
        self.charge_quota(namespace, request).await?;

        let now = now_ms();
        let reservation = Reservation {
            id: format!("res-{}-{}", now, rand::random::<u16>() % 10_000),
            namespace: namespace.to_string(),
            resources: request.clone(),
            node_id: None,
            created_at_ms: now,
            expires_at_ms: now + ttl_secs * 1000,
            priority,
            in_use: false,
        };

        debug!(
            "reserved {:?} for '{}' until {} ({})",
            request, namespace, reservation.expires_at_ms, reservation.id
        );
        self.reservations
            .write()
            .await
            .insert(reservation.id.clone(), reservation.clone());
        Ok(reservation)
    }

    /// Drop a reservation, refunding its quota charge if it was never claimed
    pub async fn release_reservation(&self, reservation_id: &str) -> Result<()> {
        let removed = self.reservations.write().await.remove(reservation_id);
        match removed {
            Some(reservation) => {
                if !reservation.in_use {
                    self.refund_quota(&reservation.namespace, &reservation.resources)
                        .await;
                }
                Ok(())
            }
            None => Err(ScheduleError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }
            .into()),
        }
    }

    /// Mark a reservation as consumed by an instance
    pub async fn claim_reservation(&self, reservation_id: &str) -> Result<Reservation> {
        let mut reservations = self.reservations.write().await;
        let reservation = reservations.get_mut(reservation_id).ok_or_else(|| {
            ScheduleError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }
        })?;
        reservation.in_use = true;
        Ok(reservation.clone())
    }

    /// Remove expired unclaimed reservations, refunding their quota charges
    pub async fn sweep_expired_reservations(&self) {
        let now = now_ms();
        let expired: Vec<Reservation> = {
            let mut reservations = self.reservations.write().await;
            let ids: Vec<String> = reservations
                .values()
                .filter(|r| !r.in_use && r.expires_at_ms <= now)
                .map(|r| r.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| reservations.remove(id))
                .collect()
        };

        for reservation in expired {
            debug!("reservation {} expired, refunding quota", reservation.id);
            self.refund_quota(&reservation.namespace, &reservation.resources)
                .await;
        }
    }
}
