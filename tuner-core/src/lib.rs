// tuner-core/src/lib.rs

//! The core logic for the real-time pitch tracker.
//! This crate is responsible for audio capture, frame conditioning, pitch
//! estimation, note resolution and the start/stop lifecycle of the
//! background analysis. It is completely headless and contains no UI code.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod detector;
pub mod error;
pub mod fft;
pub mod notes;
pub mod pitch;
pub mod preprocess;
pub mod tuning;

pub use config::TunerConfig;
pub use detector::{PitchDetector, Status};
pub use error::{Result, TunerError};

/// The latest pitch reading.
///
/// Published as a whole so readers never see a pitch from one estimate
/// paired with the note or cents of another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    /// Detected fundamental frequency in Hz; 0.0 means no pitch yet.
    pub pitch: f32,
    /// Name of the closest note, empty when nothing was detected.
    pub note: String,
    /// Deviation from the closest note in cents.
    pub cents: f32,
}

impl DetectionResult {
    /// True until a first pitch has been published.
    pub fn is_empty(&self) -> bool {
        self.pitch == 0.0
    }
}
