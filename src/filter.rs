//! Frequency-domain Butterworth band-pass used to condition noisy channels.
//!
//! The signal is transformed with a forward FFT, each bin is scaled by the magnitude
//! response of an order-`n` Butterworth low-pass at `high_cut_hz` times an order-`n`
//! high-pass at `low_cut_hz`, and the real part of the inverse transform is returned.

use rustfft::{num_complex::Complex, FftPlanner};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("invalid band-pass parameters: {0}")]
    InvalidParameters(String),
    #[error("band-pass produced {count} non-finite samples")]
    NonFinite { count: usize },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BandPass {
    pub order: u32,
    pub low_cut_hz: f64,
    pub high_cut_hz: f64,
    pub sample_rate_hz: f64,
}

impl BandPass {
    fn validate(&self) -> Result<(), FilterError> {
        if self.order == 0 {
            return Err(FilterError::InvalidParameters("order must be positive".into()));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(FilterError::InvalidParameters(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if !(self.low_cut_hz.is_finite() && self.high_cut_hz.is_finite())
            || self.low_cut_hz < 0.0
            || self.low_cut_hz >= self.high_cut_hz
        {
            return Err(FilterError::InvalidParameters(format!(
                "cutoffs must satisfy 0 <= low < high, got {}..{}",
                self.low_cut_hz, self.high_cut_hz
            )));
        }
        Ok(())
    }

    /// Magnitude response at `freq_hz`.
    pub fn gain(&self, freq_hz: f64) -> f64 {
        let exponent = 2.0 * self.order as f64;
        let low_pass = 1.0 / (1.0 + (freq_hz / self.high_cut_hz).powf(exponent)).sqrt();
        let high_pass = if self.low_cut_hz <= 0.0 {
            1.0
        } else if freq_hz <= 0.0 {
            0.0
        } else {
            1.0 / (1.0 + (self.low_cut_hz / freq_hz).powf(exponent)).sqrt()
        };
        low_pass * high_pass
    }
}

pub fn butterworth_bandpass(signal: &[f64], params: &BandPass) -> Result<Vec<f64>, FilterError> {
    params.validate()?;
    let n = signal.len();
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    forward.process(&mut buffer);

    let resolution = params.sample_rate_hz / n as f64;
    for (bin, value) in buffer.iter_mut().enumerate() {
        // Bins above n/2 mirror the negative frequencies.
        let mirrored = if bin <= n / 2 { bin } else { n - bin };
        *value *= params.gain(mirrored as f64 * resolution);
    }

    inverse.process(&mut buffer);

    let scale = n as f64;
    let output: Vec<f64> = buffer.iter().map(|c| c.re / scale).collect();
    let non_finite = output.iter().filter(|v| !v.is_finite()).count();
    if non_finite > 0 {
        return Err(FilterError::NonFinite { count: non_finite });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn params(order: u32) -> BandPass {
        BandPass {
            order,
            low_cut_hz: 0.5,
            high_cut_hz: 100.0,
            sample_rate_hz: 500.0,
        }
    }

    fn sine(freq_hz: f64, len: usize, sample_rate_hz: f64) -> Vec<f64> {
        (0..len)
            .map(|i| (2.0 * PI * freq_hz * i as f64 / sample_rate_hz).sin())
            .collect()
    }

    fn rms(values: &[f64]) -> f64 {
        (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
    }

    #[test]
    fn passes_in_band_tone() {
        let input = sine(10.0, 1000, 500.0);
        let output = butterworth_bandpass(&input, &params(8)).unwrap();
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(output.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn attenuates_out_of_band_tone() {
        let input = sine(200.0, 1000, 500.0);
        let output = butterworth_bandpass(&input, &params(8)).unwrap();
        assert!(rms(&output) < 0.05 * rms(&input));
    }

    #[test]
    fn constant_signal_stays_finite() {
        let input = vec![3.25; 4000];
        let output = butterworth_bandpass(&input, &params(144)).unwrap();
        assert_eq!(output.len(), 4000);
        assert!(output.iter().all(|v| v.is_finite() && v.abs() < 1e-9));
    }

    #[test]
    fn high_order_gain_does_not_overflow() {
        let filter = params(144);
        for freq in [0.0, 0.01, 0.5, 50.0, 100.0, 250.0] {
            let gain = filter.gain(freq);
            assert!(gain.is_finite());
            assert!((0.0..=1.0).contains(&gain));
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        let mut bad = params(4);
        bad.low_cut_hz = 120.0;
        assert!(matches!(
            butterworth_bandpass(&[1.0, 2.0], &bad),
            Err(FilterError::InvalidParameters(_))
        ));
        bad = params(0);
        assert!(butterworth_bandpass(&[1.0], &bad).is_err());
    }

    #[test]
    fn nan_input_is_reported_not_returned() {
        let input = vec![1.0, f64::NAN, 2.0, 3.0];
        assert!(matches!(
            butterworth_bandpass(&input, &params(4)),
            Err(FilterError::NonFinite { .. })
        ));
    }

    #[test]
    fn empty_signal_is_empty() {
        assert!(butterworth_bandpass(&[], &params(4)).unwrap().is_empty());
    }
}
