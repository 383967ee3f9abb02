//! # Musical Tuning Module
//!
//! Resolves a detected frequency onto the note table: the closest note and
//! the signed deviation from it in cents.
//!
//! Cents are a logarithmic unit of pitch measurement where:
//! - 100 cents = 1 semitone
//! - 1200 cents = 1 octave
//! - Positive values indicate sharpness, negative values indicate flatness

use std::sync::Arc;

use crate::notes::{Note, NoteTable, NOTES};

/// Maps frequencies onto a [`NoteTable`]. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct PitchResolver {
    table: Arc<NoteTable>,
}

impl PitchResolver {
    pub fn new(table: Arc<NoteTable>) -> Self {
        Self { table }
    }

    /// Resolver over an equal-tempered table anchored at `reference_a4`.
    pub fn with_reference(reference_a4: f32) -> Self {
        Self::new(Arc::new(NoteTable::equal_tempered(reference_a4)))
    }

    pub fn table(&self) -> &NoteTable {
        &self.table
    }

    /// Finds the table entry closest to `freq`.
    ///
    /// Entries are scanned in ascending frequency order and only a strictly
    /// smaller distance replaces the current best, so when `freq` sits exactly
    /// between two notes the lower one wins.
    pub fn find_closest_note(&self, freq: f32) -> Option<&Note> {
        find_closest_in(&self.table, freq)
    }

    /// Cents from `note`'s reference frequency to `freq`; 0 when the note is
    /// not in the table.
    pub fn calculate_cents(&self, freq: f32, note: &str) -> f32 {
        calculate_cents_deviation(freq, self.table.frequency_of(note).unwrap_or(0.0))
    }

    /// Closest note name and cents deviation. An empty table (or a frequency
    /// that cannot be compared) yields an empty name and 0 cents.
    pub fn resolve(&self, freq: f32) -> (String, f32) {
        match self.find_closest_note(freq) {
            Some(note) => (note.name.clone(), calculate_cents_deviation(freq, note.frequency)),
            None => (String::new(), 0.0),
        }
    }
}

impl Default for PitchResolver {
    fn default() -> Self {
        Self::new(Arc::new(NOTES.clone()))
    }
}

fn find_closest_in(table: &NoteTable, freq: f32) -> Option<&Note> {
    if !freq.is_finite() {
        return None;
    }
    let mut closest: Option<(&Note, f32)> = None;
    for note in table.notes() {
        let diff = (freq - note.frequency).abs();
        match closest {
            Some((_, best)) if diff >= best => {}
            _ => closest = Some((note, diff)),
        }
    }
    closest.map(|(note, _)| note)
}

/// Calculates the deviation from a target frequency in cents.
///
/// A non-positive target (an unresolved note) or a non-positive measured
/// frequency returns 0 instead of NaN or infinity.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    if target_freq <= 0.0 || freq <= 0.0 {
        return 0.0;
    }
    let cents = 1200.0 * (freq / target_freq).log2();
    if cents.is_finite() { cents } else { 0.0 }
}
