use super::rolling::RollingBuffer;
use crate::batch::{Sample, SourceId};
use crate::error::MonitorError;
use crate::filter::{butterworth_bandpass, BandPass};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionerSettings {
    pub filter_order: u32,
    pub min_order: u32,
    pub low_cut: f64,
    pub high_cut: f64,
    pub min_std_threshold: f64,
    pub buffer_capacity: usize,
    pub sample_rate_hz: f64,
}

impl Default for ConditionerSettings {
    fn default() -> Self {
        Self {
            filter_order: 144,
            min_order: 60,
            low_cut: 0.5,
            high_cut: 100.0,
            min_std_threshold: 0.3,
            buffer_capacity: 4000,
            sample_rate_hz: 500.0,
        }
    }
}

#[derive(Debug)]
pub struct SignalConditioner {
    settings: ConditionerSettings,
    buffers: Mutex<HashMap<SourceId, Arc<Mutex<RollingBuffer>>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n).sqrt()
}

impl SignalConditioner {
    pub fn new(settings: ConditionerSettings) -> Self {
        Self {
            settings,
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ConditionerSettings {
        &self.settings
    }

    pub(in crate::monitor) fn provision(&self, source_id: &SourceId) {
        lock(&self.buffers)
            .entry(source_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RollingBuffer::new(self.settings.buffer_capacity))));
    }

    pub(in crate::monitor) fn release(&self, source_id: &SourceId) -> bool {
        lock(&self.buffers).remove(source_id).is_some()
    }

    pub fn buffered_len(&self, source_id: &SourceId) -> Option<usize> {
        let buffer = lock(&self.buffers).get(source_id).cloned()?;
        let len = lock(&buffer).len();
        Some(len)
    }

    /// Quiet input lacks the excitation a high-order filter needs.
    fn select_order(&self, new_values: &[f64]) -> u32 {
        if std_dev(new_values) <= self.settings.min_std_threshold {
            self.settings.min_order
        } else {
            self.settings.filter_order
        }
    }

    /// Filters `samples` against the source's buffered history. The output has one
    /// entry per input sample with the same timestamps; missing (NaN) readings pass
    /// through untouched and never enter the buffer.
    pub fn condition(
        &self,
        source_id: &SourceId,
        samples: &[Sample],
    ) -> Result<Vec<Sample>, MonitorError> {
        let buffer = lock(&self.buffers)
            .get(source_id)
            .cloned()
            .ok_or_else(|| MonitorError::UnknownSource(source_id.clone()))?;

        let present: Vec<usize> = samples
            .iter()
            .enumerate()
            .filter(|(_, sample)| !sample.value.is_nan())
            .map(|(idx, _)| idx)
            .collect();
        if present.is_empty() {
            return Ok(samples.to_vec());
        }
        let new_values: Vec<f64> = present.iter().map(|&idx| samples[idx].value).collect();

        let mut buffer = lock(&buffer);
        let evicted = buffer.extend(&new_values);
        let order = self.select_order(&new_values);
        let signal = if new_values.len() > buffer.capacity() {
            new_values.clone()
        } else {
            buffer.contents()
        };
        let params = BandPass {
            order,
            low_cut_hz: self.settings.low_cut,
            high_cut_hz: self.settings.high_cut,
            sample_rate_hz: self.settings.sample_rate_hz,
        };

        let filtered = match butterworth_bandpass(&signal, &params) {
            Ok(filtered) => filtered,
            Err(err) => {
                tracing::warn!(
                    source = %source_id,
                    error = %err,
                    order,
                    buffer_len = buffer.len(),
                    new_samples = new_values.len(),
                    "conditioning degenerate; passing raw values through"
                );
                return Ok(samples.to_vec());
            }
        };
        tracing::trace!(
            source = %source_id,
            order,
            evicted,
            buffer_len = buffer.len(),
            "conditioned noisy channel"
        );

        let tail = &filtered[filtered.len() - new_values.len()..];
        let mut output = samples.to_vec();
        for (&idx, &value) in present.iter().zip(tail.iter()) {
            output[idx].value = value;
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn source() -> SourceId {
        SourceId::parse("S1").unwrap()
    }

    fn samples(values: &[f64]) -> Vec<Sample> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Sample::new(base + TimeDelta::milliseconds(2 * i as i64), v))
            .collect()
    }

    fn conditioner(capacity: usize) -> SignalConditioner {
        let conditioner = SignalConditioner::new(ConditionerSettings {
            buffer_capacity: capacity,
            filter_order: 8,
            min_order: 2,
            ..ConditionerSettings::default()
        });
        conditioner.provision(&source());
        conditioner
    }

    #[test]
    fn output_is_aligned_to_input_timestamps() {
        let conditioner = conditioner(64);
        let input = samples(&[0.1, 0.9, -0.4, 1.3, 0.2]);
        let output = conditioner.condition(&source(), &input).unwrap();
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(output.iter()) {
            assert_eq!(a.timestamp, b.timestamp);
            assert!(b.value.is_finite());
        }
    }

    #[test]
    fn buffer_is_capped_across_batches() {
        let conditioner = conditioner(10);
        for _ in 0..5 {
            let input = samples(&[1.0, 2.0, 3.0, 4.0]);
            let output = conditioner.condition(&source(), &input).unwrap();
            assert_eq!(output.len(), 4);
        }
        assert_eq!(conditioner.buffered_len(&source()), Some(10));
    }

    #[test]
    fn oversized_batch_still_returns_every_sample() {
        let conditioner = conditioner(4);
        let input = samples(&[1.0, 5.0, 2.0, 8.0, 3.0, 9.0, 1.0]);
        let output = conditioner.condition(&source(), &input).unwrap();
        assert_eq!(output.len(), 7);
        assert_eq!(conditioner.buffered_len(&source()), Some(4));
    }

    #[test]
    fn flat_buffer_yields_finite_output() {
        let conditioner = conditioner(100);
        let input = samples(&[2.5; 40]);
        let output = conditioner.condition(&source(), &input).unwrap();
        assert!(output.iter().all(|s| s.value.is_finite()));
    }

    #[test]
    fn missing_values_pass_through_and_skip_buffer() {
        let conditioner = conditioner(100);
        let input = samples(&[1.0, f64::NAN, 3.0]);
        let output = conditioner.condition(&source(), &input).unwrap();
        assert_eq!(output.len(), 3);
        assert!(output[1].value.is_nan());
        assert!(output[0].value.is_finite() && output[2].value.is_finite());
        assert_eq!(conditioner.buffered_len(&source()), Some(2));
    }

    #[test]
    fn filter_failure_falls_back_to_raw_values() {
        let conditioner = conditioner(100);
        let input = samples(&[1e308, -1e308, 1e308, -1e308]);
        let output = conditioner.condition(&source(), &input).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn order_drops_for_quiet_input() {
        let conditioner = conditioner(100);
        assert_eq!(conditioner.select_order(&[1.0, 1.1, 0.9]), 2);
        assert_eq!(conditioner.select_order(&[1.0, 5.0, -3.0]), 8);
        assert_eq!(conditioner.select_order(&[7.0]), 2);
    }

    fn params(order: u32) -> BandPass {
        BandPass {
            order,
            low_cut_hz: 0.5,
            high_cut_hz: 100.0,
            sample_rate_hz: 500.0,
        }
    }

    #[test]
    fn filters_the_whole_buffer_with_the_batch_order() {
        let conditioner = conditioner(100);
        let noisy = [1.0, 5.0, -3.0, 4.0, -2.0, 6.0, 0.0, 3.0];
        let quiet = [1.0, 1.1, 0.9, 1.05];
        conditioner.condition(&source(), &samples(&noisy)).unwrap();
        let output = conditioner.condition(&source(), &samples(&quiet)).unwrap();

        let history: Vec<f64> = noisy.iter().chain(quiet.iter()).copied().collect();
        let low_order = butterworth_bandpass(&history, &params(2)).unwrap();
        let high_order = butterworth_bandpass(&history, &params(8)).unwrap();
        let expected = &low_order[low_order.len() - quiet.len()..];
        let unexpected = &high_order[high_order.len() - quiet.len()..];

        for (sample, want) in output.iter().zip(expected) {
            assert!((sample.value - want).abs() < 1e-9);
        }
        assert!(output
            .iter()
            .zip(unexpected)
            .any(|(sample, other)| (sample.value - other).abs() > 1e-9));
    }

    #[test]
    fn sources_keep_separate_histories() {
        let conditioner = conditioner(100);
        let other = SourceId::parse("S2").unwrap();
        conditioner.provision(&other);
        let warmup: Vec<f64> = (0..32).map(|i| (i as f64 * 0.7).sin() * 4.0).collect();
        conditioner.condition(&other, &samples(&warmup)).unwrap();
        assert_eq!(conditioner.buffered_len(&source()), Some(0));

        let batch = samples(&[0.4, 2.2, -1.7, 3.1, -0.6]);
        let fresh = conditioner.condition(&source(), &batch).unwrap();
        let warmed = conditioner.condition(&other, &batch).unwrap();
        assert_eq!(conditioner.buffered_len(&source()), Some(5));
        assert_eq!(conditioner.buffered_len(&other), Some(37));
        assert!(fresh
            .iter()
            .zip(warmed.iter())
            .any(|(a, b)| (a.value - b.value).abs() > 1e-9));
    }

    #[test]
    fn unknown_source_is_rejected() {
        let conditioner = conditioner(10);
        let other = SourceId::parse("S9").unwrap();
        assert!(matches!(
            conditioner.condition(&other, &samples(&[1.0])),
            Err(MonitorError::UnknownSource(_))
        ));
    }
}
