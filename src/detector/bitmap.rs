use super::{merge_flagged, AnomalyDetector, Detection, DetectorSettings, RunningStats};
use std::collections::VecDeque;

const ALPHABET: usize = 4;
const CELLS: usize = ALPHABET * ALPHABET;
/// Equiprobable N(0,1) breakpoints for a four-letter alphabet.
const BREAKPOINTS: [f64; ALPHABET - 1] = [-0.674_489_750_196_081_7, 0.0, 0.674_489_750_196_081_7];
const FLAT_STD: f64 = 1e-10;
const MIN_SCORE_STD: f64 = 1e-6;

/// Time-series bitmap detector.
///
/// Every position splits the recent history into a lag window (the past) and a lead
/// window (what came next). Each window is summarised as a level-2 bitmap of SAX
/// symbol pairs and the squared distance between the two bitmaps is the score. A
/// score is anomalous when it sits more than `threshold_sigma` deviations above the
/// scores this detector has produced so far.
#[derive(Debug)]
pub struct BitmapDetector {
    word_size: usize,
    frame: usize,
    window: usize,
    lag: usize,
    lead: usize,
    threshold_sigma: f64,
    warmup_scores: usize,
    history: VecDeque<f64>,
    scores: RunningStats,
}

impl BitmapDetector {
    pub fn new(settings: &DetectorSettings) -> Self {
        let word_size = settings.word_size.max(2);
        let frame = settings.window_factor.max(1);
        let window = word_size * frame;
        let lag = settings.lag_window_factor.max(1) * window;
        let lead = settings.lead_window_factor.max(1) * window;
        Self {
            word_size,
            frame,
            window,
            lag,
            lead,
            threshold_sigma: settings.threshold_sigma,
            warmup_scores: settings.warmup_scores,
            history: VecDeque::with_capacity(lag + lead),
            scores: RunningStats::default(),
        }
    }

    fn sax_word(&self, values: &[f64]) -> Vec<usize> {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std = (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt();
        values
            .chunks(self.frame)
            .take(self.word_size)
            .map(|chunk| {
                let paa = chunk.iter().sum::<f64>() / chunk.len() as f64;
                let normalized = if std < FLAT_STD { 0.0 } else { (paa - mean) / std };
                BREAKPOINTS.iter().filter(|&&b| b <= normalized).count()
            })
            .collect()
    }

    fn bitmap(&self, region: &[f64]) -> [f64; CELLS] {
        let mut cells = [0.0; CELLS];
        if region.len() < self.window {
            return cells;
        }
        for start in 0..=region.len() - self.window {
            let word = self.sax_word(&region[start..start + self.window]);
            for pair in word.windows(2) {
                cells[pair[0] * ALPHABET + pair[1]] += 1.0;
            }
        }
        let max = cells.iter().cloned().fold(0.0, f64::max);
        if max > 0.0 {
            for cell in cells.iter_mut() {
                *cell /= max;
            }
        }
        cells
    }

    fn score_at(&self, buffer: &[f64], boundary: usize) -> f64 {
        let lag = self.bitmap(&buffer[boundary - self.lag..boundary]);
        let lead = self.bitmap(&buffer[boundary..boundary + self.lead]);
        lag.iter()
            .zip(lead.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    fn is_anomalous(&self, score: f64) -> Option<f64> {
        if self.scores.count < self.warmup_scores.max(2) {
            return None;
        }
        let z = (score - self.scores.mean) / self.scores.std_dev().max(MIN_SCORE_STD);
        (z > self.threshold_sigma).then_some(z)
    }
}

impl AnomalyDetector for BitmapDetector {
    fn detect(&mut self, values: &[f64]) -> Vec<Detection> {
        if values.is_empty() {
            return Vec::new();
        }
        let old_len = self.history.len();
        let mut buffer: Vec<f64> = self.history.iter().copied().collect();
        buffer.extend_from_slice(values);

        // Each boundary is scored once: the first call that completes its lead window.
        let first = self.lag.max((old_len + 1).saturating_sub(self.lead));
        let mut flagged = Vec::new();
        if buffer.len() >= self.lag + self.lead {
            for boundary in first..=buffer.len() - self.lead {
                let score = self.score_at(&buffer, boundary);
                if self.is_anomalous(score).is_some() {
                    let begin = boundary.saturating_sub(old_len);
                    let end = boundary + self.lead - 1 - old_len;
                    flagged.push((begin, end, score));
                }
                self.scores.push(score);
            }
        }

        let keep = self.lag + self.lead - 1;
        let skip = buffer.len().saturating_sub(keep);
        self.history = buffer.into_iter().skip(skip).collect();

        merge_flagged(&flagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sawtooth(len: usize) -> Vec<f64> {
        (0..len).map(|i| (i % 10) as f64).collect()
    }

    fn detector() -> BitmapDetector {
        BitmapDetector::new(&DetectorSettings::default())
    }

    #[test]
    fn window_geometry_follows_factors() {
        let detector = detector();
        assert_eq!(detector.window, 10);
        assert_eq!(detector.lag, 40);
        assert_eq!(detector.lead, 20);
    }

    #[test]
    fn flat_window_maps_to_middle_symbol() {
        let detector = detector();
        assert_eq!(detector.sax_word(&[5.0; 10]), vec![2; 5]);
    }

    #[test]
    fn history_is_trimmed_between_calls() {
        let mut detector = detector();
        detector.detect(&sawtooth(500));
        assert_eq!(detector.history.len(), 59);
        assert_eq!(detector.scores.count, 500 - 60 + 1);
        detector.detect(&sawtooth(5));
        assert_eq!(detector.scores.count, 500 - 60 + 1 + 5);
    }

    #[test]
    fn flags_pattern_break_after_warmup() {
        let mut warmed = detector();
        warmed.detect(&sawtooth(400));

        let mut chunk = sawtooth(20);
        chunk.extend(std::iter::repeat(50.0).take(20));
        chunk.extend(sawtooth(20));

        let detections = warmed.detect(&chunk);
        assert!(!detections.is_empty());
        let top = detections[0];
        assert!(top.begin <= top.end);
        assert!(top.end < chunk.len());

        // Same input without history: a single boundary, nothing to compare against.
        let mut cold = detector();
        assert!(cold.detect(&chunk).is_empty());
        assert_eq!(cold.scores.count, 1);
    }
}
