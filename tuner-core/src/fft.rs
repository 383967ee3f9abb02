//! # Fast Fourier Transform (FFT) Module
//!
//! Magnitude spectra for refining pitch estimates. Frames arriving here are
//! already windowed by the preprocessor, so no window is applied again.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Removes the DC offset from a signal by making its average value zero.
fn remove_dc_offset(signal: &mut [Complex<f32>]) {
    let len = signal.len();
    if len == 0 {
        return;
    }
    let avg = signal.iter().map(|c| c.re).sum::<f32>() / len as f32;
    if avg.abs() > 1e-6 {
        for sample in signal.iter_mut() {
            sample.re -= avg;
        }
    }
}

/// Forward FFT planned once for a fixed frame size, with reusable buffers.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(frame_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_size);
        let scratch = vec![Complex { re: 0.0, im: 0.0 }; fft.get_inplace_scratch_len()];
        Self {
            fft,
            buffer: vec![Complex { re: 0.0, im: 0.0 }; frame_size],
            scratch,
            magnitudes: vec![0.0; frame_size / 2],
        }
    }

    /// Magnitude spectrum up to the Nyquist frequency (`frame_size / 2` bins).
    ///
    /// A frame of the wrong length yields an all-zero spectrum.
    pub fn magnitudes(&mut self, frame: &[f32]) -> &[f32] {
        if frame.len() != self.buffer.len() {
            self.magnitudes.iter_mut().for_each(|m| *m = 0.0);
            return &self.magnitudes;
        }

        for (slot, &sample) in self.buffer.iter_mut().zip(frame) {
            *slot = Complex { re: sample, im: 0.0 };
        }
        remove_dc_offset(&mut self.buffer);
        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (mag, c) in self.magnitudes.iter_mut().zip(&self.buffer) {
            *mag = c.norm(); // .norm() is sqrt(re^2 + im^2)
        }
        &self.magnitudes
    }
}
