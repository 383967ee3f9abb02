//! # Pitch Detection Module
//!
//! The [`PitchEstimator`] trait is the boundary to whatever turns a windowed
//! frame into a fundamental frequency. The built-in implementation is a YIN
//! estimator with optional spectral refinement.
//!
//! ## Features
//! - YIN pitch detection compensated for the Hann analysis window
//! - Octave error prevention by taking the first qualifying dip
//! - Global-minimum fallback, bounded so broadband noise still reads as silence
//! - Parabolic interpolation for sub-sample accuracy
//! - Optional spectrum refinement for well-resolved estimates

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TunerError};
use crate::fft::SpectrumAnalyzer;
use crate::preprocess::Window;

/// Turns one conditioned frame into a fundamental frequency.
#[cfg_attr(test, mockall::automock)]
pub trait PitchEstimator: Send {
    /// Estimated fundamental in Hz, or 0.0 when no pitch was found.
    fn estimate(&mut self, frame: &[f32]) -> f32;

    /// Frees the estimator's resources. Later estimates return 0.0.
    /// Calling it more than once is harmless.
    fn release(&mut self);
}

/// Available estimation algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Yin,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Yin => write!(f, "YIN"),
        }
    }
}

impl FromStr for Algorithm {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "yin" => Ok(Algorithm::Yin),
            other => Err(TunerError::Estimator(format!("unknown pitch algorithm '{other}'"))),
        }
    }
}

/// Everything needed to build an estimator for one detection session.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorSpec {
    pub algorithm: Algorithm,
    pub frame_size: usize,
    pub hop_size: usize,
    pub sample_rate: u32,
    /// YIN absolute threshold; dips above it are treated as noise.
    pub threshold: f32,
    pub spectral_refinement: bool,
}

impl EstimatorSpec {
    pub fn yin(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            algorithm: Algorithm::Yin,
            frame_size,
            hop_size: frame_size,
            sample_rate,
            threshold: crate::config::YIN_THRESHOLD,
            spectral_refinement: false,
        }
    }
}

/// Builds the estimator described by `spec`.
pub fn new_estimator(spec: &EstimatorSpec) -> Result<Box<dyn PitchEstimator>> {
    if spec.frame_size < 4 {
        return Err(TunerError::Estimator(format!(
            "frame size {} is too small",
            spec.frame_size
        )));
    }
    if spec.sample_rate == 0 {
        return Err(TunerError::Estimator("sample rate must be positive".into()));
    }
    match spec.algorithm {
        Algorithm::Yin => Ok(Box::new(YinEstimator::new(spec))),
    }
}

/// Above this, a global-minimum fallback is treated as noise rather than pitch.
const FALLBACK_LIMIT: f32 = 0.5;

/// YIN estimator for Hann-windowed frames, with preallocated working buffers.
///
/// Per frame:
/// 1. Window-compensated squared difference over lags `1..3N/4`
/// 2. Cumulative mean normalization
/// 3. First lag below the absolute threshold, walked down to its local
///    minimum (avoids picking a lower octave); if none qualifies, the global
///    minimum
/// 4. Parabolic interpolation around the chosen lag
///
/// Each windowed sample is cross-weighted with the window value at the
/// compared position, so `x[i]·w[i+τ] - x[i+τ]·w[i]` vanishes for a periodic
/// signal at its period whatever the taper. Each lag is then normalized by
/// its overlapping window energy.
pub struct YinEstimator {
    sample_rate: u32,
    frame_size: usize,
    threshold: f32,
    window: Window,
    /// `sum((w[i]·w[i+τ])²)` per lag; only lags where it is positive are kept.
    lag_energy: Vec<f32>,
    yin_buffer: Vec<f32>,
    spectrum: Option<SpectrumAnalyzer>,
    released: bool,
}

impl YinEstimator {
    pub fn new(spec: &EstimatorSpec) -> Self {
        let window = Window::hann(spec.frame_size);
        let lag_energy = overlap_energy(window.coefficients(), spec.frame_size * 3 / 4);
        Self {
            sample_rate: spec.sample_rate,
            frame_size: spec.frame_size,
            threshold: spec.threshold,
            yin_buffer: vec![0.0; lag_energy.len()],
            lag_energy,
            window,
            spectrum: spec
                .spectral_refinement
                .then(|| SpectrumAnalyzer::new(spec.frame_size)),
            released: false,
        }
    }

    fn detect(&mut self, signal: &[f32]) -> Option<f32> {
        let max_lag = self.yin_buffer.len();
        if max_lag < 3 {
            return None;
        }
        let w = self.window.coefficients();
        let yin = &mut self.yin_buffer;

        // --- Window-compensated difference function ---
        yin[0] = 0.0;
        for tau in 1..max_lag {
            let mut diff = 0.0;
            for i in 0..self.frame_size - tau {
                let delta = signal[i] * w[i + tau] - signal[i + tau] * w[i];
                diff += delta * delta;
            }
            yin[tau] = diff / self.lag_energy[tau];
        }

        // --- Cumulative mean normalized difference ---
        let mut running_sum = 0.0;
        yin[0] = 1.0;
        for (tau, value) in yin.iter_mut().enumerate().skip(1) {
            running_sum += *value;
            if running_sum != 0.0 {
                *value *= tau as f32 / running_sum;
            } else {
                *value = 1.0;
            }
        }

        // --- Absolute threshold, global minimum as fallback ---
        let mut period = 0;
        for tau in 2..max_lag {
            if yin[tau] < self.threshold {
                period = tau;
                while period + 1 < max_lag && yin[period + 1] < yin[period] {
                    period += 1;
                }
                break;
            }
        }
        if period == 0 {
            period = (2..max_lag).min_by(|&a, &b| yin[a].total_cmp(&yin[b]))?;
            if yin[period] > FALLBACK_LIMIT {
                return None;
            }
        }
        if period + 1 >= max_lag {
            return None;
        }

        let y1 = yin[period - 1];
        let y2 = yin[period];
        let y3 = yin[period + 1];
        let curvature = y1 - 2.0 * y2 + y3;
        let period_float = if curvature != 0.0 {
            period as f32 + (y1 - y3) / (2.0 * curvature)
        } else {
            period as f32
        };

        let frequency = self.sample_rate as f32 / period_float;
        if frequency.is_finite() && frequency > 20.0 {
            Some(frequency)
        } else {
            None
        }
    }
}

/// Overlapping window energy for lags `0..max_lag`, cut before the first lag
/// whose overlap is entirely zero.
fn overlap_energy(window: &[f32], max_lag: usize) -> Vec<f32> {
    let mut energy = Vec::with_capacity(max_lag);
    for tau in 0..max_lag.min(window.len()) {
        let sum: f64 = window
            .iter()
            .zip(&window[tau..])
            .map(|(&a, &b)| {
                let product = f64::from(a) * f64::from(b);
                product * product
            })
            .sum();
        if sum <= 0.0 {
            break;
        }
        energy.push(sum as f32);
    }
    energy
}

impl PitchEstimator for YinEstimator {
    fn estimate(&mut self, frame: &[f32]) -> f32 {
        if self.released || frame.len() != self.frame_size {
            return 0.0;
        }
        let Some(rough) = self.detect(frame) else {
            return 0.0;
        };
        match self.spectrum.as_mut() {
            Some(analyzer) => {
                let magnitudes = analyzer.magnitudes(frame);
                refine_from_spectrum(magnitudes, rough, self.sample_rate).unwrap_or(rough)
            }
            None => rough,
        }
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.yin_buffer = Vec::new();
        self.spectrum = None;
    }
}

/// Lowest spectrum bin at which refinement is attempted.
pub const MIN_REFINE_BIN: f32 = 10.0;

/// Refines a frequency estimate using a magnitude spectrum.
///
/// Looks for the strongest bin within two bins of the rough estimate and
/// interpolates a parabola through the log magnitudes around it. Falls back
/// to the rough estimate whenever the neighbourhood is unusable, including
/// estimates closer than [`MIN_REFINE_BIN`] bins to DC, where the window's
/// main lobe overlaps its own mirror image.
pub fn refine_from_spectrum(
    spectrum_magnitudes: &[f32],
    rough_freq: f32,
    sample_rate: u32,
) -> Option<f32> {
    if rough_freq <= 0.0 || spectrum_magnitudes.len() < 3 {
        return None;
    }
    let fft_size = spectrum_magnitudes.len() * 2;
    let bin_width = sample_rate as f32 / fft_size as f32;
    let target_bin = rough_freq / bin_width;
    if target_bin < MIN_REFINE_BIN {
        return Some(rough_freq);
    }
    let last_bin = spectrum_magnitudes.len() - 1;

    let start_bin = (target_bin - 2.0).max(0.0) as usize;
    let end_bin = ((target_bin + 2.0).min(last_bin as f32)) as usize;
    if start_bin >= end_bin {
        return Some(rough_freq);
    }

    let peak_bin = start_bin
        + spectrum_magnitudes[start_bin..=end_bin]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(offset, _)| offset)?;

    if peak_bin == 0 || peak_bin >= last_bin {
        return Some(rough_freq);
    }

    let y1 = spectrum_magnitudes[peak_bin - 1].ln();
    let y2 = spectrum_magnitudes[peak_bin].ln();
    let y3 = spectrum_magnitudes[peak_bin + 1].ln();
    if !(y1.is_finite() && y2.is_finite() && y3.is_finite()) {
        return Some(rough_freq);
    }

    let denominator = 2.0 * y2 - y1 - y3;
    if denominator.abs() < 1e-6 {
        return Some(rough_freq);
    }

    let interpolated_bin = peak_bin as f32 + (y3 - y1) / (2.0 * denominator);
    let refined = interpolated_bin * bin_width;
    if refined.is_finite() && refined > 0.0 {
        Some(refined)
    } else {
        Some(rough_freq)
    }
}
