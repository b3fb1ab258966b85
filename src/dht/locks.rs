//! Distributed lock manager for file and key coordination.
//!
//! Shared locks stack; an exclusive lock excludes everything else. Acquire
//! accepts a timeout (0 = non-blocking try, >0 = bounded wait) and every lock
//! carries a lease that the expiry sweep reclaims if the owner disappears.

use crate::config::LockConfig;
use crate::error::{ConstellationError, LockError, Result};
use crate::types::now_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, watch};
use tracing::{debug, info};
use uuid::Uuid;

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockMode {
    /// Multiple readers
    Shared,
    /// Single writer
    Exclusive,
}

/// A granted lock lease
#[derive(Debug, Clone, Serialize)]
pub struct Lock {
    pub resource: String,
    pub lock_id: String,
    pub owner_id: String,
    pub mode: LockMode,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LockStats {
    pub total_locks: usize,
    pub shared_locks: usize,
    pub exclusive_locks: usize,
}

/// Wait-loop granularity while blocking on a contended resource
const WAIT_SLICE_MS: u64 = 50;

pub struct LockManager {
    config: LockConfig,
    owner_id: String,
    /// resource -> current holders
    locks: Mutex<HashMap<String, Vec<Lock>>>,
    released: Notify,
    shutdown: watch::Receiver<bool>,
}

impl LockManager {
    pub fn new(
        config: LockConfig,
        owner_id: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            owner_id: owner_id.into(),
            locks: Mutex::new(HashMap::new()),
            released: Notify::new(),
            shutdown,
        }
    }

    /// Acquire a lock on a resource.
    ///
    /// `timeout_ms == 0` tries once and reports `Timeout` immediately if the
    /// resource is held in a conflicting mode; a positive timeout waits up to
    /// that long (clamped to the configured maximum).
    pub async fn acquire(
        &self,
        resource: &str,
        mode: LockMode,
        timeout_ms: u64,
    ) -> Result<Lock> {
        let deadline = now_ms() + timeout_ms.min(self.config.max_wait_ms);

        loop {
            if let Some(lock) = self.try_grant(resource, mode).await {
                return Ok(lock);
            }
            if timeout_ms == 0 || now_ms() >= deadline {
                return Err(ConstellationError::Timeout {
                    what: format!("lock on {resource}"),
                });
            }

            let remaining = deadline.saturating_sub(now_ms()).min(WAIT_SLICE_MS);
            let _ = tokio::time::timeout(
                Duration::from_millis(remaining.max(1)),
                self.released.notified(),
            )
            .await;
        }
    }

    /// Non-blocking acquire
    pub async fn try_acquire(&self, resource: &str, mode: LockMode) -> Result<Lock> {
        self.acquire(resource, mode, 0).await
    }

    async fn try_grant(&self, resource: &str, mode: LockMode) -> Option<Lock> {
        let mut locks = self.locks.lock().await;
        let holders = locks.entry(resource.to_string()).or_default();

        // Drop expired leases opportunistically before deciding
        let now = now_ms();
        holders.retain(|l| l.expires_at_ms > now);

        let compatible = holders.is_empty()
            || (mode == LockMode::Shared && holders.iter().all(|l| l.mode == LockMode::Shared));
        if !compatible {
            return None;
        }

        let lock = Lock {
            resource: resource.to_string(),
            lock_id: Uuid::new_v4().to_string(),
            owner_id: self.owner_id.clone(),
            mode,
            acquired_at_ms: now,
            expires_at_ms: now + self.config.default_lease_ms,
        };
        debug!("lock granted: {} {:?} on {}", lock.lock_id, mode, resource);
        holders.push(lock.clone());
        Some(lock)
    }

    /// Release a held lock and wake any waiters
    pub async fn release(&self, lock_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().await;
        for (resource, holders) in locks.iter_mut() {
            if let Some(pos) = holders.iter().position(|l| l.lock_id == lock_id) {
                holders.remove(pos);
                debug!("lock released: {} on {}", lock_id, resource);
                drop(locks);
                self.released.notify_waiters();
                return Ok(());
            }
        }
        Err(LockError::LockNotFound {
            lock_id: lock_id.to_string(),
        }
        .into())
    }

    /// Extend a lease
    pub async fn renew(&self, lock_id: &str, additional_ms: u64) -> Result<Lock> {
        let mut locks = self.locks.lock().await;
        for holders in locks.values_mut() {
            if let Some(lock) = holders.iter_mut().find(|l| l.lock_id == lock_id) {
                lock.expires_at_ms += additional_ms;
                return Ok(lock.clone());
            }
        }
        Err(LockError::LockNotFound {
            lock_id: lock_id.to_string(),
        }
        .into())
    }

    pub async fn is_held(&self, resource: &str) -> bool {
        let now = now_ms();
        self.locks
            .lock()
            .await
            .get(resource)
            .is_some_and(|holders| holders.iter().any(|l| l.expires_at_ms > now))
    }

    /// Admin operation: drop every lease on a resource
    pub async fn force_unlock(&self, resource: &str) -> usize {
        let mut locks = self.locks.lock().await;
        let dropped = locks.remove(resource).map(|h| h.len()).unwrap_or(0);
        drop(locks);
        if dropped > 0 {
            info!("force-unlocked {resource} ({dropped} leases)");
            self.released.notify_waiters();
        }
        dropped
    }

    /// Reclaim expired leases and wake waiters
    pub async fn sweep_expired(&self) {
        let now = now_ms();
        let mut swept = 0usize;
        {
            let mut locks = self.locks.lock().await;
            for holders in locks.values_mut() {
                let before = holders.len();
                holders.retain(|l| l.expires_at_ms > now);
                swept += before - holders.len();
            }
            locks.retain(|_, holders| !holders.is_empty());
        }
        if swept > 0 {
            debug!("swept {swept} expired lock leases");
            self.released.notify_waiters();
        }
    }

    pub async fn stats(&self) -> LockStats {
        let locks = self.locks.lock().await;
        let mut stats = LockStats::default();
        for holders in locks.values() {
            for lock in holders {
                stats.total_locks += 1;
                match lock.mode {
                    LockMode::Shared => stats.shared_locks += 1,
                    LockMode::Exclusive => stats.exclusive_locks += 1,
                }
            }
        }
        stats
    }

    /// Spawn the lease expiry sweep
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let interval_ms = self.config.sweep_interval_ms;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                manager.sweep_expired().await;
            }
        });
    }
}
