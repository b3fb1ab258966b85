use crate::config::CircuitConfig;
use crate::error::{MeshError, Result};
use crate::types::now_ms;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing; requests are rejected
    Open,
    /// Probation: trial requests are admitted
    HalfOpen,
}

/// Per-target breaker keyed on error rate and consecutive failures
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreaker {
    pub name: String,
    pub state: CircuitState,
    pub config: CircuitConfig,

    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,

    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure_ms: u64,
    pub state_changed_at_ms: u64,

    pub window_requests: u64,
    pub window_failures: u64,
    pub window_start_ms: u64,

    pub enabled: bool,
}

impl CircuitBreaker {
    fn new(name: &str, config: CircuitConfig) -> Self {
        let now = now_ms();
        Self {
            name: name.to_string(),
            state: CircuitState::Closed,
            config,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_ms: 0,
            state_changed_at_ms: now,
            window_start_ms: now,
            window_requests: 0,
            window_failures: 0,
            enabled: true,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.window_requests == 0 {
            return 0.0;
        }
        self.window_failures as f64 / self.window_requests as f64
    }

    fn transition(&mut self, next: CircuitState) {
        debug!("circuit {}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
        self.state_changed_at_ms = now_ms();
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitStats {
    pub total_circuits: usize,
    pub closed_circuits: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

/// Catalog of per-target circuit breakers plus the rolling-window refresher
pub struct CircuitBreakerRegistry {
    defaults: CircuitConfig,
    circuits: RwLock<HashMap<String, CircuitBreaker>>,
    shutdown: watch::Receiver<bool>,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitConfig, shutdown: watch::Receiver<bool>) -> Self {
        info!(
            "🔌 Circuit breakers initialized (failure threshold {}, window {}ms)",
            defaults.failure_threshold, defaults.window_ms
        );
        Self {
            defaults,
            circuits: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Create a breaker for a target; an existing one is returned unchanged
    pub async fn create(&self, name: &str, config: Option<CircuitConfig>) -> CircuitBreaker {
        let mut circuits = self.circuits.write().await;
        circuits
            .entry(name.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(name, config.unwrap_or_else(|| self.defaults.clone()))
            })
            .clone()
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.circuits
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                MeshError::CircuitNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.circuits.read().await.get(name).cloned()
    }

    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(name).ok_or_else(|| MeshError::CircuitNotFound {
            name: name.to_string(),
        })?;
        circuit.enabled = enabled;
        Ok(())
    }

    /// Gate a request. Unknown targets get a breaker with default config.
    ///
    /// OPEN rejects until `open_timeout_ms` has elapsed, then admits one probe
    /// and moves to HALF_OPEN. HALF_OPEN and CLOSED admit.
    pub async fn allow_request(&self, name: &str) -> bool {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.defaults.clone()));

        if !circuit.enabled {
            return true;
        }

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = now_ms().saturating_sub(circuit.state_changed_at_ms);
                if elapsed >= circuit.config.open_timeout_ms {
                    circuit.transition(CircuitState::HalfOpen);
                    circuit.consecutive_successes = 0;
                    true
                } else {
                    circuit.rejected_requests += 1;
                    false
                }
            }
        }
    }

    pub async fn record_success(&self, name: &str) -> Result<()> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(name).ok_or_else(|| MeshError::CircuitNotFound {
            name: name.to_string(),
        })?;

        circuit.total_requests += 1;
        circuit.successful_requests += 1;
        circuit.window_requests += 1;
        circuit.consecutive_failures = 0;
        circuit.consecutive_successes += 1;

        if circuit.state == CircuitState::HalfOpen
            && circuit.consecutive_successes >= circuit.config.success_threshold
        {
            info!("circuit {} recovered, closing", circuit.name);
            circuit.transition(CircuitState::Closed);
            circuit.consecutive_successes = 0;
        }
        Ok(())
    }

    pub async fn record_failure(&self, name: &str) -> Result<()> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(name).ok_or_else(|| MeshError::CircuitNotFound {
            name: name.to_string(),
        })?;

        let now = now_ms();
        circuit.total_requests += 1;
        circuit.failed_requests += 1;
        circuit.window_requests += 1;
        circuit.window_failures += 1;
        circuit.consecutive_failures += 1;
        circuit.consecutive_successes = 0;
        circuit.last_failure_ms = now;

        let over_consecutive =
            circuit.consecutive_failures >= circuit.config.failure_threshold;
        let over_error_rate = circuit.window_requests > 0
            && circuit.error_rate() >= circuit.config.error_rate_threshold;
        // Any failure while probing re-opens immediately
        let probing = circuit.state == CircuitState::HalfOpen;

        if (over_consecutive || over_error_rate || probing)
            && circuit.state != CircuitState::Open
        {
            warn!(
                "circuit {} opening ({} consecutive failures, {:.0}% window error rate)",
                circuit.name,
                circuit.consecutive_failures,
                circuit.error_rate() * 100.0
            );
            circuit.transition(CircuitState::Open);
        }
        Ok(())
    }

    /// Force a breaker open
    pub async fn trip(&self, name: &str) -> Result<()> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(name).ok_or_else(|| MeshError::CircuitNotFound {
            name: name.to_string(),
        })?;
        circuit.transition(CircuitState::Open);
        Ok(())
    }

    /// Reset a breaker to pristine CLOSED
    pub async fn reset(&self, name: &str) -> Result<()> {
        let mut circuits = self.circuits.write().await;
        let circuit = circuits.get_mut(name).ok_or_else(|| MeshError::CircuitNotFound {
            name: name.to_string(),
        })?;
        let config = circuit.config.clone();
        *circuit = CircuitBreaker::new(name, config);
        Ok(())
    }

    /// Roll windows forward and promote timed-out OPEN breakers to HALF_OPEN
    pub async fn refresh_tick(&self) {
        let now = now_ms();
        let mut circuits = self.circuits.write().await;
        for circuit in circuits.values_mut() {
            if now.saturating_sub(circuit.window_start_ms) >= circuit.config.window_ms {
                circuit.window_requests = 0;
                circuit.window_failures = 0;
                circuit.window_start_ms = now;
            }
            if circuit.state == CircuitState::Open
                && now.saturating_sub(circuit.state_changed_at_ms)
                    >= circuit.config.open_timeout_ms
            {
                circuit.transition(CircuitState::HalfOpen);
                circuit.consecutive_successes = 0;
            }
        }
    }

    pub async fn stats(&self) -> CircuitStats {
        let circuits = self.circuits.read().await;
        let mut stats = CircuitStats {
            total_circuits: circuits.len(),
            ..Default::default()
        };
        for circuit in circuits.values() {
            match circuit.state {
                CircuitState::Closed => stats.closed_circuits += 1,
                CircuitState::Open => stats.open_circuits += 1,
                CircuitState::HalfOpen => stats.half_open_circuits += 1,
            }
            stats.total_requests += circuit.total_requests;
            stats.total_failures += circuit.failed_requests;
            stats.total_rejections += circuit.rejected_requests;
        }
        stats
    }

    /// Spawn the rolling-window refresher
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let interval_ms = self.defaults.refresh_interval_ms;
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
                registry.refresh_tick().await;
            }
        });
    }
}
