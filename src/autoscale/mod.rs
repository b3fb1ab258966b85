use crate::config::ScalerConfig;
use crate::error::{ConstellationError, MonitoringError, Result};
use crate::monitoring::{CompareOp, MetricsStore};
use crate::types::now_ms;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info};

pub mod predictive;

pub use predictive::Prediction;

/// Hard cap on rules per policy
pub const MAX_RULES_PER_POLICY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScaleDirection {
    Up,
    Down,
}

/// What drives a rule's metric fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerKind {
    /// Windowed average vs. threshold
    Threshold,
    /// Rate of change vs. threshold
    Rate,
    /// Linear extrapolation vs. threshold
    Predictive,
    /// Time-based schedule (reserved; never triggers in this build)
    Schedule,
}

/// One scaling rule inside a policy
#[derive(Debug, Clone, Serialize)]
pub struct ScalingRule {
    pub metric_name: String,
    pub trigger: TriggerKind,
    pub op: CompareOp,
    pub threshold: f64,
    pub eval_period_secs: u64,
    pub breach_count_required: u32,
    pub direction: ScaleDirection,
    /// Instances added (Up) or removed (Down) per action
    pub adjustment: u32,
    pub enabled: bool,

    // Runtime evaluation state
    pub breach_count: u32,
    pub first_breach_ms: u64,
}

impl ScalingRule {
    pub fn threshold_rule(
        metric_name: impl Into<String>,
        op: CompareOp,
        threshold: f64,
        direction: ScaleDirection,
        adjustment: u32,
    ) -> Self {
        Self {
            metric_name: metric_name.into(),
            trigger: TriggerKind::Threshold,
            op,
            threshold,
            eval_period_secs: 60,
            breach_count_required: 1,
            direction,
            adjustment,
            enabled: true,
            breach_count: 0,
            first_breach_ms: 0,
        }
    }
}

/// Scaling policy for one target service
#[derive(Debug, Clone, Serialize)]
pub struct ScalingPolicy {
    pub name: String,
    pub target_service: String,

    pub min_instances: u32,
    pub max_instances: u32,
    pub current_instances: u32,

    pub rules: Vec<ScalingRule>,

    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub last_scale_up_ms: u64,
    pub last_scale_down_ms: u64,

    pub scale_up_count: u64,
    pub scale_down_count: u64,
    pub total_evaluations: u64,

    pub enabled: bool,
}

impl ScalingPolicy {
    fn in_cooldown(&self, direction: ScaleDirection, now: u64) -> bool {
        let (last, cooldown_secs) = match direction {
            ScaleDirection::Up => (self.last_scale_up_ms, self.scale_up_cooldown_secs),
            ScaleDirection::Down => (self.last_scale_down_ms, self.scale_down_cooldown_secs),
        };
        last != 0 && now < last + cooldown_secs * 1000
    }
}

/// Emitted on every effective scale action
#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub policy_name: String,
    pub service_name: String,
    pub direction: ScaleDirection,
    pub adjustment: u32,
    pub instances_before: u32,
    pub instances_after: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScalerStats {
    pub total_policies: usize,
    pub active_policies: usize,
    pub total_scale_ups: u64,
    pub total_scale_downs: u64,
    pub total_evaluations: u64,
}

/// Threshold/rate/predictive autoscaler over the metrics store.
///
/// The actual instance creation is the external controller's job; this layer
/// only decides counts and emits events.
pub struct AutoScaler {
    config: ScalerConfig,
    metrics: Arc<MetricsStore>,
    policies: RwLock<HashMap<String, ScalingPolicy>>,
    events: Mutex<VecDeque<ScalingEvent>>,
    shutdown: watch::Receiver<bool>,
}

impl AutoScaler {
    pub fn new(
        config: ScalerConfig,
        metrics: Arc<MetricsStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        info!(
            "📈 Autoscaler initialized (cooldown {}s, predictive {})",
            config.default_cooldown_secs,
            if config.enable_predictive { "on" } else { "off" }
        );
        Self {
            config,
            metrics,
            policies: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            shutdown,
        }
    }

    /// Create a scaling policy; an existing one with the name is kept
    pub async fn create_policy(
        &self,
        name: &str,
        target_service: &str,
        min_instances: u32,
        max_instances: u32,
    ) -> ScalingPolicy {
        let mut policies = self.policies.write().await;
        policies
            .entry(name.to_string())
            .or_insert_with(|| ScalingPolicy {
                name: name.to_string(),
                target_service: target_service.to_string(),
                min_instances,
                max_instances,
                current_instances: min_instances,
                rules: Vec::new(),
                scale_up_cooldown_secs: self.config.default_cooldown_secs,
                scale_down_cooldown_secs: self.config.default_cooldown_secs,
                last_scale_up_ms: 0,
                last_scale_down_ms: 0,
                scale_up_count: 0,
                scale_down_count: 0,
                total_evaluations: 0,
                enabled: true,
            })
            .clone()
    }

    pub async fn destroy_policy(&self, name: &str) -> Result<()> {
        self.policies
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                MonitoringError::PolicyNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn get_policy(&self, name: &str) -> Option<ScalingPolicy> {
        self.policies.read().await.get(name).cloned()
    }

    pub async fn set_policy_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.with_policy(name, |p| p.enabled = enabled).await
    }

    pub async fn set_cooldowns(&self, name: &str, up_secs: u64, down_secs: u64) -> Result<()> {
        self.with_policy(name, |p| {
            p.scale_up_cooldown_secs = up_secs;
            p.scale_down_cooldown_secs = down_secs;
        })
        .await
    }

    /// Record the externally-observed instance count
    pub async fn set_current_instances(&self, name: &str, count: u32) -> Result<()> {
        self.with_policy(name, |p| p.current_instances = count).await
    }

    async fn with_policy(
        &self,
        name: &str,
        mutate: impl FnOnce(&mut ScalingPolicy),
    ) -> Result<()> {
        let mut policies = self.policies.write().await;
        let policy = policies
            .get_mut(name)
            .ok_or_else(|| MonitoringError::PolicyNotFound {
                name: name.to_string(),
            })?;
        mutate(policy);
        Ok(())
    }

    /// Attach a rule to a policy (bounded at 16 per policy)
    pub async fn add_rule(&self, policy_name: &str, rule: ScalingRule) -> Result<()> {
        let mut policies = self.policies.write().await;
        let policy =
            policies
                .get_mut(policy_name)
                .ok_or_else(|| MonitoringError::PolicyNotFound {
                    name: policy_name.to_string(),
                })?;
        if policy.rules.len() >= MAX_RULES_PER_POLICY {
            return Err(ConstellationError::InvalidParameter {
                reason: format!("policy {policy_name} already has {MAX_RULES_PER_POLICY} rules"),
            });
        }
        policy.rules.push(rule);
        Ok(())
    }

    pub async fn remove_rule(&self, policy_name: &str, index: usize) -> Result<()> {
        let mut policies = self.policies.write().await;
        let policy =
            policies
                .get_mut(policy_name)
                .ok_or_else(|| MonitoringError::PolicyNotFound {
                    name: policy_name.to_string(),
                })?;
        if index >= policy.rules.len() {
            return Err(ConstellationError::InvalidParameter {
                reason: format!("rule index {index} out of range"),
            });
        }
        policy.rules.remove(index);
        Ok(())
    }

    /// Linear extrapolation of a metric `horizon_secs` ahead
    pub async fn predict(&self, metric_name: &str, horizon_secs: u64) -> Prediction {
        let window = self.config.prediction_rate_window_secs;
        let current = self.metrics.current(metric_name).await.unwrap_or(0.0);
        let slope = self.metrics.rate(metric_name, window).await;
        let samples = self.metrics.samples_in_window(metric_name, window).await;
        predictive::extrapolate(metric_name, current, slope, samples, horizon_secs)
    }

    /// Evaluate every enabled policy once
    pub async fn evaluate_tick(&self) {
        // Phase 1: snapshot what each live rule needs, without the lock held
        // across metric fetches
        let probes: Vec<(String, usize, TriggerKind, String, u64)> = {
            let policies = self.policies.read().await;
            policies
                .values()
                .filter(|p| p.enabled)
                .flat_map(|p| {
                    p.rules
                        .iter()
                        .enumerate()
                        .filter(|(_, r)| r.enabled)
                        .map(|(i, r)| {
                            (
                                p.name.clone(),
                                i,
                                r.trigger,
                                r.metric_name.clone(),
                                r.eval_period_secs,
                            )
                        })
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        let mut values: HashMap<(String, usize), Option<f64>> = HashMap::new();
        for (policy_name, index, trigger, metric, period) in probes {
            let value = match trigger {
                TriggerKind::Threshold => Some(self.metrics.average(&metric, period).await),
                TriggerKind::Rate => Some(self.metrics.rate(&metric, period).await),
                TriggerKind::Predictive => {
                    if self.config.enable_predictive {
                        let prediction = self.predict(&metric, period).await;
                        (prediction.confidence >= self.config.prediction_confidence_threshold)
                            .then_some(prediction.predicted_value)
                    } else {
                        None
                    }
                }
                TriggerKind::Schedule => None,
            };
            values.insert((policy_name, index), value);
        }

        // Phase 2: fold values into breach counters and fire scale actions
        let now = now_ms();
        let mut actions: Vec<ScalingEvent> = Vec::new();
        {
            let mut policies = self.policies.write().await;
            for policy in policies.values_mut() {
                if !policy.enabled {
                    continue;
                }
                policy.total_evaluations += 1;
                let cooling_up = policy.in_cooldown(ScaleDirection::Up, now);
                let cooling_down = policy.in_cooldown(ScaleDirection::Down, now);
                let policy_name = policy.name.clone();

                let mut pending: Option<(ScaleDirection, u32, String)> = None;
                for (index, rule) in policy.rules.iter_mut().enumerate() {
                    if !rule.enabled {
                        continue;
                    }
                    let cooling = match rule.direction {
                        ScaleDirection::Up => cooling_up,
                        ScaleDirection::Down => cooling_down,
                    };
                    if cooling {
                        continue;
                    }
                    let Some(Some(value)) =
                        values.get(&(policy_name.clone(), index)).copied()
                    else {
                        continue;
                    };

                    if rule.op.evaluate(value, rule.threshold) {
                        rule.breach_count += 1;
                        if rule.breach_count == 1 {
                            rule.first_breach_ms = now;
                        }
                        if rule.breach_count >= rule.breach_count_required && pending.is_none() {
                            pending = Some((
                                rule.direction,
                                rule.adjustment,
                                format!(
                                    "rule triggered: {} {} {:.2} (value {:.2})",
                                    rule.metric_name,
                                    rule.op.symbol(),
                                    rule.threshold,
                                    value
                                ),
                            ));
                            rule.breach_count = 0;
                            rule.first_breach_ms = 0;
                        }
                    } else {
                        rule.breach_count = 0;
                        rule.first_breach_ms = 0;
                    }
                }

                if let Some((direction, adjustment, reason)) = pending {
                    if let Some(event) = scale_policy(policy, direction, adjustment, &reason, now)
                    {
                        actions.push(event);
                    }
                }
            }
        }

        for event in actions {
            self.push_event(event).await;
        }
    }

    /// Manually drive a scale action (clamped; no-op inside the bounds)
    pub async fn scale(
        &self,
        policy_name: &str,
        direction: ScaleDirection,
        adjustment: u32,
        reason: &str,
    ) -> Result<Option<ScalingEvent>> {
        let now = now_ms();
        let event = {
            let mut policies = self.policies.write().await;
            let policy =
                policies
                    .get_mut(policy_name)
                    .ok_or_else(|| MonitoringError::PolicyNotFound {
                        name: policy_name.to_string(),
                    })?;
            scale_policy(policy, direction, adjustment, reason, now)
        };
        if let Some(event) = event.clone() {
            self.push_event(event).await;
        }
        Ok(event)
    }

    async fn push_event(&self, event: ScalingEvent) {
        info!(
            "⚖️ Scaling {}: {} {} -> {} ({})",
            event.service_name,
            event.policy_name,
            event.instances_before,
            event.instances_after,
            event.reason
        );
        let mut events = self.events.lock().await;
        if events.len() >= self.config.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub async fn events(&self, limit: usize) -> Vec<ScalingEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> ScalerStats {
        let policies = self.policies.read().await;
        ScalerStats {
            total_policies: policies.len(),
            active_policies: policies.values().filter(|p| p.enabled).count(),
            total_scale_ups: policies.values().map(|p| p.scale_up_count).sum(),
            total_scale_downs: policies.values().map(|p| p.scale_down_count).sum(),
            total_evaluations: policies.values().map(|p| p.total_evaluations).sum(),
        }
    }

    /// Spawn the evaluation task
    pub fn start(self: &Arc<Self>) {
        let scaler = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let interval_ms = self.config.evaluation_interval_ms;
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
                scaler.evaluate_tick().await;
            }
        });
    }
}

/// Clamp to [min, max] and apply. No event when the count would not change.
fn scale_policy(
    policy: &mut ScalingPolicy,
    direction: ScaleDirection,
    adjustment: u32,
    reason: &str,
    now: u64,
) -> Option<ScalingEvent> {
    let before = policy.current_instances;
    let target = match direction {
        ScaleDirection::Up => before.saturating_add(adjustment),
        ScaleDirection::Down => before.saturating_sub(adjustment),
    };
    let after = target.clamp(policy.min_instances, policy.max_instances);
    if after == before {
        debug!(
            "scale request for {} is a no-op at {} instances",
            policy.name, before
        );
        return None;
    }

    policy.current_instances = after;
    match direction {
        ScaleDirection::Up => {
            policy.last_scale_up_ms = now;
            policy.scale_up_count += 1;
        }
        ScaleDirection::Down => {
            policy.last_scale_down_ms = now;
            policy.scale_down_count += 1;
        }
    }

    Some(ScalingEvent {
        policy_name: policy.name.clone(),
        service_name: policy.target_service.clone(),
        direction,
        adjustment,
        instances_before: before,
        instances_after: after,
        reason: reason.to_string(),
        timestamp: Utc::now(),
    })
}
