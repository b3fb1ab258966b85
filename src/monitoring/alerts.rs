use crate::config::AlertConfig;
use crate::error::{MonitoringError, Result};
use crate::monitoring::{CompareOp, MetricsStore};
use crate::types::now_ms;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

const MAX_ALERT_EVENTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertState {
    Ok,
    Pending,
    Firing,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelKind {
    Log,
    Email,
    Slack,
    Webhook,
    Pagerduty,
}

/// Notification sink bound to alert rules by name
#[derive(Debug, Clone, Serialize)]
pub struct NotificationChannel {
    pub name: String,
    pub kind: ChannelKind,
    pub endpoint: String,
    pub enabled: bool,
}

/// Threshold condition over a metric
#[derive(Debug, Clone, Serialize)]
pub struct AlertCondition {
    pub metric: String,
    pub op: CompareOp,
    pub threshold: f64,
    /// Averaging window; 0 compares the instantaneous value
    pub duration_secs: u64,
}

/// One alert rule with its evaluation state
#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub name: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub state: AlertState,
    pub message: String,

    pub breach_count: u32,
    pub breach_threshold: u32,
    pub first_breach_ms: u64,
    pub fired_at_ms: u64,
    pub resolved_at_ms: u64,

    pub channels: Vec<String>,
    pub enabled: bool,
    pub fire_count: u64,
    pub resolve_count: u64,
}

/// Emitted on every FIRING/RESOLVED transition
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub rule_name: String,
    pub state: AlertState,
    pub severity: AlertSeverity,
    pub message: String,
    pub metric_value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub total_rules: usize,
    pub firing_alerts: usize,
    pub total_fires: u64,
    pub total_resolves: u64,
    pub total_notifications: u64,
}

/// Rule evaluation over the metrics store with pending → firing → resolved
/// transitions and channel fan-out.
pub struct AlertEngine {
    config: AlertConfig,
    metrics: Arc<MetricsStore>,
    rules: RwLock<HashMap<String, AlertRule>>,
    channels: RwLock<HashMap<String, NotificationChannel>>,
    events: Mutex<VecDeque<AlertEvent>>,
    notifications_sent: Mutex<u64>,
    shutdown: watch::Receiver<bool>,
}

impl AlertEngine {
    pub fn new(
        config: AlertConfig,
        metrics: Arc<MetricsStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        info!(
            "🚨 Alert engine initialized (breach threshold {})",
            config.default_breach_threshold
        );
        Self {
            config,
            metrics,
            rules: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            notifications_sent: Mutex::new(0),
            shutdown,
        }
    }

    /// Install an alert rule; an existing rule with the name is kept
    pub async fn create_rule(
        &self,
        name: &str,
        metric: &str,
        op: CompareOp,
        threshold: f64,
        duration_secs: u64,
        severity: AlertSeverity,
    ) -> AlertRule {
        let mut rules = self.rules.write().await;
        rules
            .entry(name.to_string())
            .or_insert_with(|| AlertRule {
                name: name.to_string(),
                condition: AlertCondition {
                    metric: metric.to_string(),
                    op,
                    threshold,
                    duration_secs,
                },
                severity,
                state: AlertState::Ok,
                message: format!("{metric} {} {threshold}", op.symbol()),
                breach_count: 0,
                breach_threshold: self.config.default_breach_threshold,
                first_breach_ms: 0,
                fired_at_ms: 0,
                resolved_at_ms: 0,
                channels: Vec::new(),
                enabled: true,
                fire_count: 0,
                resolve_count: 0,
            })
            .clone()
    }

    pub async fn delete_rule(&self, name: &str) -> Result<()> {
        self.rules
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                MonitoringError::AlertRuleNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn get_rule(&self, name: &str) -> Option<AlertRule> {
        self.rules.read().await.get(name).cloned()
    }

    pub async fn set_rule_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(name)
            .ok_or_else(|| MonitoringError::AlertRuleNotFound {
                name: name.to_string(),
            })?;
        rule.enabled = enabled;
        Ok(())
    }

    pub async fn set_rule_message(&self, name: &str, message: &str) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(name)
            .ok_or_else(|| MonitoringError::AlertRuleNotFound {
                name: name.to_string(),
            })?;
        rule.message = message.to_string();
        Ok(())
    }

    pub async fn set_breach_threshold(&self, name: &str, threshold: u32) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(name)
            .ok_or_else(|| MonitoringError::AlertRuleNotFound {
                name: name.to_string(),
            })?;
        rule.breach_threshold = threshold.max(1);
        Ok(())
    }

    pub async fn create_channel(
        &self,
        name: &str,
        kind: ChannelKind,
        endpoint: &str,
    ) -> NotificationChannel {
        let mut channels = self.channels.write().await;
        channels
            .entry(name.to_string())
            .or_insert_with(|| NotificationChannel {
                name: name.to_string(),
                kind,
                endpoint: endpoint.to_string(),
                enabled: true,
            })
            .clone()
    }

    pub async fn delete_channel(&self, name: &str) -> Result<()> {
        self.channels
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                MonitoringError::ChannelNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn set_channel_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .get_mut(name)
            .ok_or_else(|| MonitoringError::ChannelNotFound {
                name: name.to_string(),
            })?;
        channel.enabled = enabled;
        Ok(())
    }

    /// Bind a notification channel to a rule
    pub async fn bind_channel(&self, rule_name: &str, channel_name: &str) -> Result<()> {
        if !self.channels.read().await.contains_key(channel_name) {
            return Err(MonitoringError::ChannelNotFound {
                name: channel_name.to_string(),
            }
            .into());
        }
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_name)
            .ok_or_else(|| MonitoringError::AlertRuleNotFound {
                name: rule_name.to_string(),
            })?;
        if !rule.channels.iter().any(|c| c == channel_name) {
            rule.channels.push(channel_name.to_string());
        }
        Ok(())
    }

    /// Evaluate every enabled rule once
    pub async fn evaluate_tick(&self) {
        // Fetch metric values without holding the rules lock
        let probes: Vec<(String, String, u64)> = {
            let rules = self.rules.read().await;
            rules
                .values()
                .filter(|r| r.enabled)
                .map(|r| {
                    (
                        r.name.clone(),
                        r.condition.metric.clone(),
                        r.condition.duration_secs,
                    )
                })
                .collect()
        };

        let mut values = HashMap::new();
        for (rule_name, metric, duration) in probes {
            let value = if duration > 0 {
                self.metrics.average(&metric, duration).await
            } else {
                self.metrics.current(&metric).await.unwrap_or(0.0)
            };
            values.insert(rule_name, value);
        }

        let mut transitions: Vec<(AlertRule, AlertState, f64)> = Vec::new();
        {
            let mut rules = self.rules.write().await;
            for rule in rules.values_mut() {
                if !rule.enabled {
                    continue;
                }
                let Some(&value) = values.get(&rule.name) else {
                    continue;
                };
                let breached = rule.condition.op.evaluate(value, rule.condition.threshold);

                if breached {
                    rule.breach_count += 1;
                    if rule.breach_count == 1 {
                        rule.first_breach_ms = now_ms();
                        if rule.state != AlertState::Firing {
                            rule.state = AlertState::Pending;
                        }
                    }
                    if rule.breach_count >= rule.breach_threshold
                        && rule.state != AlertState::Firing
                    {
                        rule.state = AlertState::Firing;
                        rule.fired_at_ms = now_ms();
                        rule.fire_count += 1;
                        transitions.push((rule.clone(), AlertState::Firing, value));
                    }
                } else {
                    if rule.state == AlertState::Firing {
                        rule.state = AlertState::Resolved;
                        rule.resolved_at_ms = now_ms();
                        rule.resolve_count += 1;
                        transitions.push((rule.clone(), AlertState::Resolved, value));
                    } else if rule.state == AlertState::Pending {
                        rule.state = AlertState::Ok;
                    }
                    rule.breach_count = 0;
                    rule.first_breach_ms = 0;
                }
            }
        }

        for (rule, state, value) in transitions {
            self.emit(&rule, state, value).await;
        }
    }

    async fn emit(&self, rule: &AlertRule, state: AlertState, metric_value: f64) {
        let event = AlertEvent {
            rule_name: rule.name.clone(),
            state,
            severity: rule.severity,
            message: rule.message.clone(),
            metric_value,
            timestamp: Utc::now(),
        };

        match state {
            AlertState::Firing => warn!(
                "🚨 ALERT FIRING: {} ({:?}) value={:.2}",
                rule.name, rule.severity, metric_value
            ),
            AlertState::Resolved => info!("✅ Alert resolved: {}", rule.name),
            _ => {}
        }

        {
            let mut events = self.events.lock().await;
            if events.len() >= MAX_ALERT_EVENTS {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        if self.config.enable_notifications {
            self.fan_out(rule, &event).await;
        }
    }

    /// Deliver an event to every enabled channel bound to the rule.
    /// Delivery failures are logged, never retried.
    async fn fan_out(&self, rule: &AlertRule, event: &AlertEvent) {
        let channels = self.channels.read().await;
        for channel_name in &rule.channels {
            let Some(channel) = channels.get(channel_name) else {
                debug!("alert channel {channel_name} no longer exists, skipping");
                continue;
            };
            if !channel.enabled {
                continue;
            }
            match deliver(channel, event) {
                Ok(()) => *self.notifications_sent.lock().await += 1,
                Err(e) => error!(
                    "notification via {} ({:?}) failed: {e}",
                    channel.name, channel.kind
                ),
            }
        }
    }

    pub async fn events(&self, limit: usize) -> Vec<AlertEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn firing(&self) -> Vec<AlertRule> {
        self.rules
            .read()
            .await
            .values()
            .filter(|r| r.state == AlertState::Firing)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> AlertStats {
        let rules = self.rules.read().await;
        AlertStats {
            total_rules: rules.len(),
            firing_alerts: rules
                .values()
                .filter(|r| r.state == AlertState::Firing)
                .count(),
            total_fires: rules.values().map(|r| r.fire_count).sum(),
            total_resolves: rules.values().map(|r| r.resolve_count).sum(),
            total_notifications: *self.notifications_sent.lock().await,
        }
    }

    /// Spawn the evaluation task
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
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
                engine.evaluate_tick().await;
            }
        });
    }
}

/// Channel delivery. LOG writes through tracing; the external transports are
/// represented by their log line — the core carries no SMTP/HTTP clients.
fn deliver(channel: &NotificationChannel, event: &AlertEvent) -> Result<()> {
    match channel.kind {
        ChannelKind::Log => {
            info!(
                "[alert:{}] {:?} {} value={:.2}",
                channel.name, event.state, event.message, event.metric_value
            );
        }
        ChannelKind::Email | ChannelKind::Slack | ChannelKind::Webhook | ChannelKind::Pagerduty => {
            info!(
                "[alert:{}] {:?} -> {} : {:?} {}",
                channel.name, channel.kind, channel.endpoint, event.state, event.message
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;
    use crate::monitoring::MetricKind;
    use pretty_assertions::assert_eq;

    async fn engine() -> (Arc<MetricsStore>, AlertEngine) {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let metrics = Arc::new(MetricsStore::new(MetricsConfig::default(), rx.clone()));
        metrics
            .register("cpu", MetricKind::Gauge, HashMap::new())
            .await
            .unwrap();
        let engine = AlertEngine::new(AlertConfig::default(), Arc::clone(&metrics), rx);
        (metrics, engine)
    }

    #[tokio::test]
    async fn rule_fires_after_breach_threshold_evaluations() {
        let (metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Critical)
            .await;

        metrics.set("cpu", 95.0).await.unwrap();

        engine.evaluate_tick().await;
        assert_eq!(
            engine.get_rule("cpu-high").await.unwrap().state,
            AlertState::Pending
        );

        engine.evaluate_tick().await;
        engine.evaluate_tick().await;
        let rule = engine.get_rule("cpu-high").await.unwrap();
        assert_eq!(rule.state, AlertState::Firing);
        assert_eq!(rule.fire_count, 1);
        assert!(rule.fired_at_ms > 0);
    }

    #[tokio::test]
    async fn firing_rule_resolves_when_breach_clears() {
        let (metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Warning)
            .await;

        metrics.set("cpu", 95.0).await.unwrap();
        for _ in 0..3 {
            engine.evaluate_tick().await;
        }
        assert_eq!(
            engine.get_rule("cpu-high").await.unwrap().state,
            AlertState::Firing
        );

        metrics.set("cpu", 40.0).await.unwrap();
        engine.evaluate_tick().await;

        let rule = engine.get_rule("cpu-high").await.unwrap();
        assert_eq!(rule.state, AlertState::Resolved);
        assert_eq!(rule.resolve_count, 1);
        assert_eq!(rule.breach_count, 0);

        let events = engine.events(10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].state, AlertState::Resolved);
        assert_eq!(events[1].state, AlertState::Firing);
    }

    #[tokio::test]
    async fn pending_returns_to_ok_without_firing() {
        let (metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Info)
            .await;

        metrics.set("cpu", 95.0).await.unwrap();
        engine.evaluate_tick().await;
        metrics.set("cpu", 10.0).await.unwrap();
        engine.evaluate_tick().await;

        let rule = engine.get_rule("cpu-high").await.unwrap();
        assert_eq!(rule.state, AlertState::Ok);
        assert_eq!(rule.fire_count, 0);
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let (metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Info)
            .await;
        engine.set_rule_enabled("cpu-high", false).await.unwrap();

        metrics.set("cpu", 95.0).await.unwrap();
        for _ in 0..5 {
            engine.evaluate_tick().await;
        }
        assert_eq!(
            engine.get_rule("cpu-high").await.unwrap().state,
            AlertState::Ok
        );
    }

    #[tokio::test]
    async fn disabled_channels_are_skipped_in_fan_out() {
        let (metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Critical)
            .await;
        engine.set_breach_threshold("cpu-high", 1).await.unwrap();
        engine.create_channel("ops-log", ChannelKind::Log, "").await;
        engine
            .create_channel("pager", ChannelKind::Pagerduty, "https://pd.example")
            .await;
        engine.set_channel_enabled("pager", false).await.unwrap();
        engine.bind_channel("cpu-high", "ops-log").await.unwrap();
        engine.bind_channel("cpu-high", "pager").await.unwrap();

        metrics.set("cpu", 95.0).await.unwrap();
        engine.evaluate_tick().await;

        // Only the enabled channel delivered
        assert_eq!(engine.stats().await.total_notifications, 1);
    }

    #[tokio::test]
    async fn binding_unknown_channel_is_an_error() {
        let (_metrics, engine) = engine().await;
        engine
            .create_rule("cpu-high", "cpu", CompareOp::Gt, 80.0, 0, AlertSeverity::Info)
            .await;
        assert!(engine.bind_channel("cpu-high", "nope").await.is_err());
    }
}
