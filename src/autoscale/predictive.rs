//! Predictive load estimation by linear extrapolation.
//!
//! The slope is fitted over a recent rate window and projected forward; the
//! confidence score grows with how well-populated that window is.

use serde::Serialize;

/// Full confidence needs at least this many points in the fit window
const CONFIDENT_SAMPLE_COUNT: usize = 10;

/// A projected metric value with an opaque 0–1 confidence score
#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub metric_name: String,
    pub predicted_value: f64,
    pub confidence: f64,
    pub horizon_secs: u64,
}

/// `current + slope × horizon`
pub fn extrapolate(
    metric_name: &str,
    current: f64,
    slope_per_sec: f64,
    samples_in_window: usize,
    horizon_secs: u64,
) -> Prediction {
    let confidence = (samples_in_window as f64 / CONFIDENT_SAMPLE_COUNT as f64).min(1.0);
    Prediction {
        metric_name: metric_name.to_string(),
        predicted_value: current + slope_per_sec * horizon_secs as f64,
        confidence,
        horizon_secs,
    }
}
