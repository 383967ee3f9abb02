//! # Note Table
//!
//! Equal-tempered mapping from note names ("A4", "C#3") to reference
//! frequencies. The table is an ordered sequence sorted by ascending
//! frequency; the closest-note scan in [`crate::tuning`] relies on that
//! order for its tie-break.

use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::REFERENCE_A4;

/// Pitch class names, sharps only, starting at C so octave numbers change
/// at the start of each row.
const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Lowest and highest octave in the default table (C0 to B8).
const FIRST_OCTAVE: i32 = 0;
const LAST_OCTAVE: i32 = 8;

/// MIDI number of A4, the tuning anchor.
const A4_MIDI: i32 = 69;

/// Represents a single musical note with its name and frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    /// Note name (e.g., "A4", "C#3")
    pub name: String,
    /// Frequency in Hz
    pub frequency: f32,
}

/// Immutable, frequency-ordered set of notes with a name index.
#[derive(Debug, Clone)]
pub struct NoteTable {
    notes: Vec<Note>,
    by_name: BTreeMap<String, usize>,
}

/// The default table: C0 to B8 anchored at A4 = 440 Hz.
pub static NOTES: Lazy<NoteTable> = Lazy::new(|| NoteTable::equal_tempered(REFERENCE_A4));

impl NoteTable {
    /// Builds the C0..B8 table in equal temperament around `reference_a4`.
    ///
    /// The formula is f = f0 * 2^(n/12), where f0 is A4 and n is the signed
    /// number of semitones away from A4.
    pub fn equal_tempered(reference_a4: f32) -> Self {
        let mut notes = Vec::with_capacity(((LAST_OCTAVE - FIRST_OCTAVE + 1) * 12) as usize);
        for octave in FIRST_OCTAVE..=LAST_OCTAVE {
            for (pitch_class, name) in NOTE_NAMES.iter().enumerate() {
                let midi = 12 * (octave + 1) + pitch_class as i32;
                let semitones = (midi - A4_MIDI) as f64;
                let frequency = reference_a4 as f64 * 2f64.powf(semitones / 12.0);
                notes.push(Note {
                    name: format!("{name}{octave}"),
                    frequency: frequency as f32,
                });
            }
        }
        Self::from_notes(notes)
    }

    /// Builds a table from arbitrary entries.
    ///
    /// Entries are sorted by ascending frequency. Entries with a non-positive
    /// or non-finite frequency are skipped, and a repeated name keeps its
    /// first occurrence.
    pub fn from_notes(notes: impl IntoIterator<Item = Note>) -> Self {
        let mut unique: Vec<Note> = Vec::new();
        let mut seen = BTreeSet::new();
        for note in notes {
            if !(note.frequency.is_finite() && note.frequency > 0.0) {
                log::warn!("Skipping note {} with invalid frequency {}", note.name, note.frequency);
                continue;
            }
            if !seen.insert(note.name.clone()) {
                log::warn!("Skipping duplicate note name {}", note.name);
                continue;
            }
            unique.push(note);
        }
        unique.sort_by(|a, b| a.frequency.total_cmp(&b.frequency));

        let by_name = unique
            .iter()
            .enumerate()
            .map(|(i, note)| (note.name.clone(), i))
            .collect();

        Self { notes: unique, by_name }
    }

    /// Reference frequency of `name`, or `None` if the table has no such note.
    pub fn frequency_of(&self, name: &str) -> Option<f32> {
        self.by_name.get(name).map(|&i| self.notes[i].frequency)
    }

    /// All entries in ascending frequency order.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

impl Default for NoteTable {
    fn default() -> Self {
        NOTES.clone()
    }
}
