use crate::config::MetricsConfig;
use crate::error::{MonitoringError, Result};
use crate::types::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info};

pub mod alerts;

pub use alerts::{
    AlertEngine, AlertEvent, AlertRule, AlertSeverity, AlertState, AlertStats, ChannelKind,
    NotificationChannel,
};

/// Metric semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    /// Current value (CPU%, memory)
    Gauge,
    /// Cumulative value (requests)
    Counter,
    /// Distribution (response times)
    Histogram,
    /// Statistical summary
    Summary,
}

/// Comparison operators shared by alert conditions and scaling rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Gt,
    Lt,
    Eq,
    Ge,
    Le,
}

impl CompareOp {
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Eq => (value - threshold).abs() < f64::EPSILON,
            CompareOp::Ge => value >= threshold,
            CompareOp::Le => value <= threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Eq => "=",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
        }
    }
}

/// One sample in a metric's ring buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricPoint {
    pub value: f64,
    pub timestamp_s: u64,
}

/// Named series with bounded history and running aggregates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub labels: HashMap<String, String>,

    pub current_value: f64,
    pub last_updated_s: u64,

    history: Vec<MetricPoint>,
    history_index: usize,
    history_count: usize,
    capacity: usize,

    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    pub sample_count: u64,
}

impl Metric {
    fn new(name: &str, kind: MetricKind, labels: HashMap<String, String>, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            labels,
            current_value: 0.0,
            last_updated_s: 0,
            history: Vec::with_capacity(capacity),
            history_index: 0,
            history_count: 0,
            capacity,
            min_value: 0.0,
            max_value: 0.0,
            avg_value: 0.0,
            sample_count: 0,
        }
    }

    fn push(&mut self, value: f64, timestamp_s: u64) {
        self.current_value = value;
        self.last_updated_s = timestamp_s;

        let point = MetricPoint { value, timestamp_s };
        if self.history.len() < self.capacity {
            self.history.push(point);
        } else {
            self.history[self.history_index] = point;
        }
        self.history_index = (self.history_index + 1) % self.capacity;
        self.history_count = (self.history_count + 1).min(self.capacity);

        if self.sample_count == 0 {
            self.min_value = value;
            self.max_value = value;
        } else {
            self.min_value = self.min_value.min(value);
            self.max_value = self.max_value.max(value);
        }
        // Running mean over all samples seen
        self.avg_value =
            (self.avg_value * self.sample_count as f64 + value) / (self.sample_count as f64 + 1.0);
        self.sample_count += 1;
    }

    pub fn history_count(&self) -> usize {
        self.history_count
    }

    /// Points no older than `window_s` seconds
    pub fn window(&self, window_s: u64) -> Vec<MetricPoint> {
        let cutoff = now_secs().saturating_sub(window_s);
        self.history
            .iter()
            .filter(|p| p.timestamp_s >= cutoff)
            .copied()
            .collect()
    }

    /// Drop points older than the retention horizon, compacting the ring
    fn purge_older_than(&mut self, cutoff_s: u64) {
        let kept: Vec<MetricPoint> = self
            .history
            .iter()
            .filter(|p| p.timestamp_s >= cutoff_s)
            .copied()
            .collect();
        self.history_count = kept.len();
        self.history_index = if kept.len() < self.capacity { kept.len() } else { 0 };
        self.history = kept;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsStats {
    pub total_metrics: usize,
    pub total_samples: u64,
    pub total_updates: u64,
}

/// In-memory metrics registry keyed by name.
///
/// Reads and read-modify-writes share one store lock, so increments from
/// concurrent tasks serialize cleanly.
pub struct MetricsStore {
    config: MetricsConfig,
    metrics: RwLock<HashMap<String, Metric>>,
    totals: Mutex<(u64, u64)>,
    shutdown: watch::Receiver<bool>,
}

impl MetricsStore {
    pub fn new(config: MetricsConfig, shutdown: watch::Receiver<bool>) -> Self {
        info!(
            "📊 Metrics store initialized (history {}, retention {}s)",
            config.history_size, config.retention_secs
        );
        Self {
            config,
            metrics: RwLock::new(HashMap::new()),
            totals: Mutex::new((0, 0)),
            shutdown,
        }
    }

    /// Register a metric. Registering an existing name keeps the series.
    pub async fn register(
        &self,
        name: &str,
        kind: MetricKind,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::new(name, kind, labels, self.config.history_size));
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> Result<()> {
        self.metrics
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| {
                MonitoringError::MetricNotFound {
                    name: name.to_string(),
                }
                .into()
            })
    }

    pub async fn get(&self, name: &str) -> Option<Metric> {
        self.metrics.read().await.get(name).cloned()
    }

    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Set a gauge
    pub async fn set(&self, name: &str, value: f64) -> Result<()> {
        self.update(name, value, now_secs()).await
    }

    /// Increment a counter. The read-modify-write runs under the store lock,
    /// so concurrent increments never lose updates.
    pub async fn increment(&self, name: &str, delta: f64) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        let metric = metrics
            .get_mut(name)
            .ok_or_else(|| MonitoringError::MetricNotFound {
                name: name.to_string(),
            })?;
        let next = metric.current_value + delta;
        metric.push(next, now_secs());
        drop(metrics);
        self.bump_totals().await;
        Ok(())
    }

    /// Record an observation (histograms/summaries)
    pub async fn record(&self, name: &str, value: f64) -> Result<()> {
        self.update(name, value, now_secs()).await
    }

    pub async fn update(&self, name: &str, value: f64, timestamp_s: u64) -> Result<()> {
        let mut metrics = self.metrics.write().await;
        let metric = metrics
            .get_mut(name)
            .ok_or_else(|| MonitoringError::MetricNotFound {
                name: name.to_string(),
            })?;
        metric.push(value, timestamp_s);
        drop(metrics);
        self.bump_totals().await;
        Ok(())
    }

    async fn bump_totals(&self) {
        let mut totals = self.totals.lock().await;
        totals.0 += 1;
        totals.1 += 1;
    }

    pub async fn current(&self, name: &str) -> Option<f64> {
        self.metrics.read().await.get(name).map(|m| m.current_value)
    }

    /// Mean of the points inside the window; 0 when the window is empty
    pub async fn average(&self, name: &str, window_s: u64) -> f64 {
        let metrics = self.metrics.read().await;
        let Some(metric) = metrics.get(name) else {
            return 0.0;
        };
        let points = metric.window(window_s);
        if points.is_empty() {
            return 0.0;
        }
        points.iter().map(|p| p.value).sum::<f64>() / points.len() as f64
    }

    pub async fn min(&self, name: &str) -> Option<f64> {
        self.metrics.read().await.get(name).map(|m| m.min_value)
    }

    pub async fn max(&self, name: &str) -> Option<f64> {
        self.metrics.read().await.get(name).map(|m| m.max_value)
    }

    /// (last − first) / (last_ts − first_ts) over the window, per second
    pub async fn rate(&self, name: &str, window_s: u64) -> f64 {
        let metrics = self.metrics.read().await;
        let Some(metric) = metrics.get(name) else {
            return 0.0;
        };
        let points = metric.window(window_s);
        let first = points.iter().min_by_key(|p| p.timestamp_s);
        let last = points.iter().max_by_key(|p| p.timestamp_s);
        match (first, last) {
            (Some(a), Some(b)) if b.timestamp_s > a.timestamp_s => {
                (b.value - a.value) / (b.timestamp_s - a.timestamp_s) as f64
            }
            _ => 0.0,
        }
    }

    /// Percentile over the stored history; `p` is a 0..=1 fraction
    pub async fn percentile(&self, name: &str, p: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&p) {
            return Err(MonitoringError::PercentileOutOfRange { value: p }.into());
        }
        let metrics = self.metrics.read().await;
        let metric = metrics
            .get(name)
            .ok_or_else(|| MonitoringError::MetricNotFound {
                name: name.to_string(),
            })?;
        if metric.history_count == 0 {
            return Ok(0.0);
        }
        let mut values: Vec<f64> = metric.history.iter().map(|pt| pt.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = (p * (values.len() - 1) as f64) as usize;
        Ok(values[index])
    }

    /// How many stored points fall inside the window
    pub async fn samples_in_window(&self, name: &str, window_s: u64) -> usize {
        let metrics = self.metrics.read().await;
        metrics
            .get(name)
            .map(|m| m.window(window_s).len())
            .unwrap_or(0)
    }

    /// Purge points older than the retention horizon. Best-effort: usable
    /// history may temporarily shrink.
    pub async fn retention_tick(&self) {
        let cutoff = now_secs().saturating_sub(self.config.retention_secs);
        let mut metrics = self.metrics.write().await;
        for metric in metrics.values_mut() {
            metric.purge_older_than(cutoff);
        }
        debug!("metrics retention sweep done");
    }

    pub async fn stats(&self) -> MetricsStats {
        let totals = self.totals.lock().await;
        MetricsStats {
            total_metrics: self.metrics.read().await.len(),
            total_samples: totals.0,
            total_updates: totals.1,
        }
    }

    /// Spawn the retention sweep
    pub fn start(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let interval_ms = self.config.retention_sweep_interval_ms;
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
                store.retention_tick().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> MetricsStore {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        MetricsStore::new(MetricsConfig::default(), rx)
    }

    async fn gauge(store: &MetricsStore, name: &str) {
        store
            .register(name, MetricKind::Gauge, HashMap::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn min_current_max_invariant_holds() {
        let store = store();
        gauge(&store, "cpu").await;

        for value in [40.0, 90.0, 10.0, 60.0] {
            store.set("cpu", value).await.unwrap();
            let metric = store.get("cpu").await.unwrap();
            assert!(metric.min_value <= metric.current_value);
            assert!(metric.current_value <= metric.max_value);
        }

        let metric = store.get("cpu").await.unwrap();
        assert_eq!(metric.min_value, 10.0);
        assert_eq!(metric.max_value, 90.0);
        assert_eq!(metric.avg_value, 50.0);
    }

    #[tokio::test]
    async fn history_saturates_at_capacity() {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let store = MetricsStore::new(
            MetricsConfig {
                history_size: 10,
                ..Default::default()
            },
            rx,
        );
        gauge(&store, "cpu").await;

        for i in 0..25 {
            store.set("cpu", i as f64).await.unwrap();
        }
        let metric = store.get("cpu").await.unwrap();
        assert_eq!(metric.history_count(), 10);
        assert_eq!(metric.sample_count, 25);
        assert_eq!(metric.current_value, 24.0);
    }

    #[tokio::test]
    async fn unknown_metric_reports_not_found() {
        let store = store();
        assert!(store.set("missing", 1.0).await.is_err());
        assert!(store.increment("missing", 1.0).await.is_err());
        assert!(store.current("missing").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_increments_never_lose_updates() {
        let store = Arc::new(store());
        store
            .register("requests", MetricKind::Counter, HashMap::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment("requests", 1.0).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.current("requests").await, Some(1000.0));
    }

    #[tokio::test]
    async fn rate_is_delta_over_time() {
        let store = store();
        gauge(&store, "bytes").await;

        let now = now_secs();
        store.update("bytes", 100.0, now - 10).await.unwrap();
        store.update("bytes", 300.0, now).await.unwrap();

        let rate = store.rate("bytes", 60).await;
        assert_eq!(rate, 20.0);
    }

    #[tokio::test]
    async fn average_respects_the_window() {
        let store = store();
        gauge(&store, "cpu").await;

        let now = now_secs();
        store.update("cpu", 1000.0, now - 500).await.unwrap();
        store.update("cpu", 10.0, now - 2).await.unwrap();
        store.update("cpu", 20.0, now).await.unwrap();

        assert_eq!(store.average("cpu", 60).await, 15.0);
    }

    #[tokio::test]
    async fn percentile_sorts_a_copy() {
        let store = store();
        gauge(&store, "latency").await;
        for value in [5.0, 1.0, 9.0, 3.0, 7.0] {
            store.record("latency", value).await.unwrap();
        }

        assert_eq!(store.percentile("latency", 0.0).await.unwrap(), 1.0);
        assert_eq!(store.percentile("latency", 0.5).await.unwrap(), 5.0);
        assert_eq!(store.percentile("latency", 1.0).await.unwrap(), 9.0);
        assert!(store.percentile("latency", 1.5).await.is_err());
    }

    #[tokio::test]
    async fn retention_purges_old_points() {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        let store = MetricsStore::new(
            MetricsConfig {
                retention_secs: 60,
                ..Default::default()
            },
            rx,
        );
        gauge(&store, "cpu").await;

        let now = now_secs();
        store.update("cpu", 1.0, now - 3600).await.unwrap();
        store.update("cpu", 2.0, now).await.unwrap();

        store.retention_tick().await;
        let metric = store.get("cpu").await.unwrap();
        assert_eq!(metric.history_count(), 1);
    }
}
