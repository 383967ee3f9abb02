//! # Frame Preprocessing
//!
//! Noise gating and windowing applied to every frame before it reaches the
//! pitch estimator.

use std::sync::Arc;

/// Precomputed Hann window coefficients.
///
/// The window is symmetric and tapers to exactly zero at both ends
/// (`coefficients[0] == coefficients[N - 1] == 0`).
#[derive(Debug, Clone)]
pub struct Window {
    coefficients: Arc<[f32]>,
}

impl Window {
    pub fn hann(size: usize) -> Self {
        let coefficients: Vec<f32> = if size < 2 {
            vec![0.0; size]
        } else {
            let n_minus_1 = (size - 1) as f64;
            (0..size)
                .map(|i| {
                    // Force exact zeros at the edges and mirror the second half
                    // so rounding cannot break symmetry.
                    let k = i.min(size - 1 - i) as f64;
                    if k == 0.0 {
                        0.0
                    } else {
                        (0.5 * (1.0 - (2.0 * std::f64::consts::PI * k / n_minus_1).cos())) as f32
                    }
                })
                .collect()
        };
        Self { coefficients: coefficients.into() }
    }

    pub fn coefficients(&self) -> &[f32] {
        &self.coefficients
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }
}

/// Root-mean-square amplitude of a frame. An empty frame has RMS 0.
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / frame.len() as f64).sqrt() as f32
}

/// Result of gating one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    /// RMS at or below the threshold; the frame must not be analysed.
    Closed { rms: f32 },
    /// RMS above the threshold; the conditioned frame is ready.
    Open { rms: f32 },
}

/// Frame length did not match the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLengthMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl std::fmt::Display for FrameLengthMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected a frame of {} samples, got {}", self.expected, self.actual)
    }
}

impl std::error::Error for FrameLengthMismatch {}

/// Applies the noise gate and the window to incoming frames.
///
/// Owns one scratch buffer of window length so conditioning a frame does not
/// allocate on the audio delivery path.
#[derive(Debug, Clone)]
pub struct FramePreprocessor {
    window: Window,
    threshold: f32,
    scratch: Vec<f32>,
}

impl FramePreprocessor {
    pub fn new(window: Window, threshold: f32) -> Self {
        let scratch = vec![0.0; window.len()];
        Self { window, threshold, scratch }
    }

    /// Gates `frame` and, if it is loud enough, writes the windowed copy into
    /// the scratch buffer (see [`FramePreprocessor::conditioned`]).
    pub fn process(&mut self, frame: &[f32]) -> Result<Gate, FrameLengthMismatch> {
        if frame.len() != self.window.len() {
            return Err(FrameLengthMismatch {
                expected: self.window.len(),
                actual: frame.len(),
            });
        }

        let level = rms(frame);
        if level <= self.threshold {
            return Ok(Gate::Closed { rms: level });
        }

        for ((out, &sample), &coeff) in self
            .scratch
            .iter_mut()
            .zip(frame)
            .zip(self.window.coefficients())
        {
            *out = sample * coeff;
        }
        Ok(Gate::Open { rms: level })
    }

    /// The most recently conditioned frame. Only meaningful right after
    /// [`FramePreprocessor::process`] returned [`Gate::Open`].
    pub fn conditioned(&self) -> &[f32] {
        &self.scratch
    }
}
