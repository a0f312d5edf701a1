//! Stateful anomaly scorers consumed by the alarm pipeline.
//!
//! A detector is fed consecutive chunks of one channel's values and keeps whatever
//! history it needs between calls, so two calls with the same input can disagree.

mod bitmap;
mod zscore;

pub use bitmap::BitmapDetector;
pub use zscore::ZScoreDetector;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Anomalous segment reported by a detector. `begin` and `end` are inclusive indices
/// into the slice passed to [`AnomalyDetector::detect`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub score: f64,
    pub begin: usize,
    pub end: usize,
}

pub trait AnomalyDetector: Send {
    /// Advances the detector with `values` (time ordered, no NaNs). Detections come
    /// back highest score first.
    fn detect(&mut self, values: &[f64]) -> Vec<Detection>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Bitmap,
    Zscore,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorSettings {
    pub kind: DetectorKind,
    pub word_size: usize,
    pub window_factor: usize,
    pub lead_window_factor: usize,
    pub lag_window_factor: usize,
    pub threshold_sigma: f64,
    pub warmup_scores: usize,
    pub history: usize,
    pub min_history: usize,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Bitmap,
            word_size: 5,
            window_factor: 2,
            lead_window_factor: 2,
            lag_window_factor: 4,
            threshold_sigma: 3.0,
            warmup_scores: 8,
            history: 50,
            min_history: 2,
        }
    }
}

pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn AnomalyDetector> + Send + Sync>;

pub fn factory(settings: &DetectorSettings) -> DetectorFactory {
    let settings = settings.clone();
    match settings.kind {
        DetectorKind::Bitmap => Arc::new(move || Box::new(BitmapDetector::new(&settings))),
        DetectorKind::Zscore => Arc::new(move || Box::new(ZScoreDetector::new(&settings))),
    }
}

/// Collapses flagged `(index, score)` points into contiguous segments, keeping the
/// maximum score per segment, and orders them by descending score.
fn merge_flagged(flagged: &[(usize, usize, f64)]) -> Vec<Detection> {
    let mut segments: Vec<Detection> = Vec::new();
    for &(begin, end, score) in flagged {
        match segments.last_mut() {
            Some(last) if begin <= last.end + 1 => {
                last.end = last.end.max(end);
                last.score = last.score.max(score);
            }
            _ => segments.push(Detection { score, begin, end }),
        }
    }
    segments.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.begin.cmp(&b.begin)));
    segments
}

/// Welford accumulator.
#[derive(Clone, Debug, Default)]
struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}
