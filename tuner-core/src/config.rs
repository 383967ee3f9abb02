//! # Configuration
//!
//! Compile-time defaults for the analysis pipeline and the runtime
//! [`TunerConfig`] that can be loaded from (and saved to) a JSON file.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Result, TunerError};

/// Sample rate requested from the audio source, in Hz.
pub const SAMPLE_RATE: u32 = 44_100;

/// Number of samples per analysis frame (~23ms at 44.1kHz).
pub const FRAME_SIZE: usize = 1024;

/// RMS amplitude at or below which a frame is treated as silence.
pub const NOISE_GATE_THRESHOLD: f32 = 0.005;

/// Pending pitch values the handoff buffer holds before new ones are dropped.
pub const HANDOFF_CAPACITY: usize = 100;

/// Concert pitch anchor for the note table.
pub const REFERENCE_A4: f32 = 440.0;

/// Absolute threshold on the YIN cumulative mean normalized difference.
pub const YIN_THRESHOLD: f32 = 0.1;

/// Runtime configuration of the pitch tracker.
///
/// Every field falls back to its compile-time default when missing from a
/// config file, so a file only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Samples per frame.
    pub frame_size: usize,
    /// Noise gate threshold on the [-1, 1] amplitude scale.
    pub noise_gate_threshold: f32,
    /// Capacity of the bounded pitch handoff buffer.
    pub handoff_capacity: usize,
    /// Frequency of A4 in Hz.
    pub reference_a4: f32,
    /// YIN absolute threshold.
    pub yin_threshold: f32,
    /// Refine YIN estimates against the frame's magnitude spectrum.
    pub spectral_refinement: bool,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            noise_gate_threshold: NOISE_GATE_THRESHOLD,
            handoff_capacity: HANDOFF_CAPACITY,
            reference_a4: REFERENCE_A4,
            yin_threshold: YIN_THRESHOLD,
            spectral_refinement: false,
        }
    }
}

impl TunerConfig {
    /// Loads a configuration from a JSON file and validates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path.as_ref())?;
        let mut data = String::new();
        file.read_to_string(&mut data)?;
        let config: TunerConfig = serde_json::from_str(&data)?;
        config.validate()?;
        log::info!("Loaded tuner config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json_string = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;
        Ok(())
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(TunerError::Config("sample_rate must be positive".into()));
        }
        if self.frame_size < 4 {
            return Err(TunerError::Config(format!(
                "frame_size must be at least 4 samples, got {}",
                self.frame_size
            )));
        }
        if !(self.noise_gate_threshold.is_finite() && self.noise_gate_threshold > 0.0) {
            return Err(TunerError::Config(format!(
                "noise_gate_threshold must be a positive number, got {}",
                self.noise_gate_threshold
            )));
        }
        if self.handoff_capacity == 0 {
            return Err(TunerError::Config("handoff_capacity must be positive".into()));
        }
        if !(self.reference_a4.is_finite() && self.reference_a4 > 0.0) {
            return Err(TunerError::Config(format!(
                "reference_a4 must be a positive frequency, got {}",
                self.reference_a4
            )));
        }
        if !(self.yin_threshold > 0.0 && self.yin_threshold < 1.0) {
            return Err(TunerError::Config(format!(
                "yin_threshold must lie in (0, 1), got {}",
                self.yin_threshold
            )));
        }
        Ok(())
    }
}
