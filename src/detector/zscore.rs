use super::{merge_flagged, AnomalyDetector, Detection, DetectorSettings};
use std::collections::VecDeque;

const MIN_STD: f64 = 1e-9;

#[derive(Debug)]
pub struct ZScoreDetector {
    threshold_sigma: f64,
    capacity: usize,
    min_history: usize,
    history: VecDeque<f64>,
}

impl ZScoreDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        let capacity = settings.history.max(2);
        Self {
            threshold_sigma: settings.threshold_sigma,
            capacity,
            min_history: settings.min_history.clamp(2, capacity),
            history: VecDeque::with_capacity(capacity),
        }
    }

    fn z_score(&self, value: f64) -> Option<f64> {
        if self.history.len() < self.min_history {
            return None;
        }
        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let var = self
            .history
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / (n - 1.0);
        Some((value - mean).abs() / var.sqrt().max(MIN_STD))
    }
}

impl AnomalyDetector for ZScoreDetector {
    fn detect(&mut self, values: &[f64]) -> Vec<Detection> {
        let mut flagged = Vec::new();
        for (idx, &value) in values.iter().enumerate() {
            if let Some(z) = self.z_score(value) {
                if z > self.threshold_sigma {
                    flagged.push((idx, idx, z));
                }
            }
            if self.history.len() == self.capacity {
                self.history.pop_front();
            }
            self.history.push_back(value);
        }
        merge_flagged(&flagged)
    }
}
