//! Autoscaling pipeline: metric feed → rule evaluation → bounded scaling
//! with cooldowns, plus the alert engine's transition lifecycle.

use constellation::autoscale::{AutoScaler, ScaleDirection, ScalingRule};
use constellation::config::{AlertConfig, MetricsConfig, ScalerConfig};
use constellation::monitoring::{
    AlertEngine, AlertSeverity, AlertState, ChannelKind, CompareOp, MetricKind, MetricsStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

async fn pipeline() -> (Arc<MetricsStore>, AutoScaler) {
    let rx = shutdown();
    let metrics = Arc::new(MetricsStore::new(MetricsConfig::default(), rx.clone()));
    metrics
        .register("cpu_percent", MetricKind::Gauge, HashMap::new())
        .await
        .unwrap();
    let scaler = AutoScaler::new(ScalerConfig::default(), Arc::clone(&metrics), rx);
    (metrics, scaler)
}

#[tokio::test]
async fn cooldown_blocks_repeat_scaling_until_it_expires() {
    let (metrics, scaler) = pipeline().await;
    scaler.create_policy("web", "web-svc", 1, 10).await;
    scaler
        .add_rule(
            "web",
            ScalingRule::threshold_rule("cpu_percent", CompareOp::Gt, 70.0, ScaleDirection::Up, 1),
        )
        .await
        .unwrap();
    // 1-second cooldown in place of the production 60s
    scaler.set_cooldowns("web", 1, 1).await.unwrap();

    // Three breaching evaluations inside the cooldown: only the first scales
    for _ in 0..3 {
        metrics.set("cpu_percent", 85.0).await.unwrap();
        scaler.evaluate_tick().await;
    }
    assert_eq!(scaler.get_policy("web").await.unwrap().current_instances, 2);

    // After the cooldown expires, the next breach scales again
    tokio::time::sleep(Duration::from_millis(1100)).await;
    metrics.set("cpu_percent", 85.0).await.unwrap();
    scaler.evaluate_tick().await;
    assert_eq!(scaler.get_policy("web").await.unwrap().current_instances, 3);

    let events = scaler.events(10).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.direction == ScaleDirection::Up));
}

#[tokio::test]
async fn up_and_down_rules_respect_their_bounds() {
    let (metrics, scaler) = pipeline().await;
    scaler.create_policy("web", "web-svc", 2, 4).await;
    scaler
        .add_rule(
            "web",
            ScalingRule::threshold_rule("cpu_percent", CompareOp::Gt, 70.0, ScaleDirection::Up, 2),
        )
        .await
        .unwrap();
    scaler
        .add_rule(
            "web",
            ScalingRule::threshold_rule("cpu_percent", CompareOp::Lt, 20.0, ScaleDirection::Down, 1),
        )
        .await
        .unwrap();
    scaler.set_cooldowns("web", 0, 0).await.unwrap();

    // Hot: climbs to the ceiling and stays there
    metrics.set("cpu_percent", 90.0).await.unwrap();
    scaler.evaluate_tick().await;
    scaler.evaluate_tick().await;
    assert_eq!(scaler.get_policy("web").await.unwrap().current_instances, 4);

    // Cold: enough low samples pull the windowed average under the floor
    // threshold, and the count descends to the minimum
    for _ in 0..8 {
        metrics.set("cpu_percent", 5.0).await.unwrap();
    }
    for _ in 0..4 {
        scaler.evaluate_tick().await;
    }
    assert_eq!(scaler.get_policy("web").await.unwrap().current_instances, 2);
}

#[tokio::test]
async fn scale_up_strictly_increases_scale_down_strictly_decreases() {
    let (_metrics, scaler) = pipeline().await;
    scaler.create_policy("web", "web-svc", 1, 10).await;
    scaler.set_current_instances("web", 5).await.unwrap();

    let up = scaler
        .scale("web", ScaleDirection::Up, 2, "manual")
        .await
        .unwrap()
        .expect("scale-up event");
    assert!(up.instances_after > up.instances_before);

    let down = scaler
        .scale("web", ScaleDirection::Down, 3, "manual")
        .await
        .unwrap()
        .expect("scale-down event");
    assert!(down.instances_after < down.instances_before);
}

#[tokio::test]
async fn alert_lifecycle_fires_and_resolves_with_notifications() {
    let rx = shutdown();
    let metrics = Arc::new(MetricsStore::new(MetricsConfig::default(), rx.clone()));
    metrics
        .register("error_rate", MetricKind::Gauge, HashMap::new())
        .await
        .unwrap();
    let alerts = AlertEngine::new(AlertConfig::default(), Arc::clone(&metrics), rx);

    alerts
        .create_rule(
            "errors-high",
            "error_rate",
            CompareOp::Ge,
            0.05,
            0,
            AlertSeverity::Critical,
        )
        .await;
    alerts.create_channel("ops", ChannelKind::Log, "").await;
    alerts.bind_channel("errors-high", "ops").await.unwrap();

    // Breach threshold defaults to 3 consecutive evaluations
    metrics.set("error_rate", 0.2).await.unwrap();
    for _ in 0..3 {
        alerts.evaluate_tick().await;
    }
    let rule = alerts.get_rule("errors-high").await.unwrap();
    assert_eq!(rule.state, AlertState::Firing);
    assert_eq!(alerts.firing().await.len(), 1);

    metrics.set("error_rate", 0.0).await.unwrap();
    alerts.evaluate_tick().await;
    let rule = alerts.get_rule("errors-high").await.unwrap();
    assert_eq!(rule.state, AlertState::Resolved);

    let stats = alerts.stats().await;
    assert_eq!(stats.total_fires, 1);
    assert_eq!(stats.total_resolves, 1);
    // One notification for the fire, one for the resolve
    assert_eq!(stats.total_notifications, 2);
}
