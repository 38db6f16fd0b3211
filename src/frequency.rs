//! Equal-tempered note to frequency mapping, anchored at note 60 = middle C.

use std::time::Duration;

/// Frequency of note 60 in Hz.
pub const MIDDLE_C_HZ: f32 = 261.63;

const MIDDLE_C: i32 = 60;

/// `261.63 * 2^((note - 60) / 12)`.
///
/// No range check: every `u8` maps to a finite, positive frequency
/// (about 8.2 Hz for note 0 up to roughly 20 MHz for note 255).
pub fn frequency(note: u8) -> f32 {
    let offset = i32::from(note) - MIDDLE_C;
    MIDDLE_C_HZ * 2f32.powf(offset as f32 / 12.0)
}

/// One note of a playback run. Derived at play time, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackEvent {
    pub note: u8,
    pub frequency: f32,
    pub on: Duration,
    pub off: Duration,
}

impl PlaybackEvent {
    pub fn new(note: u8, on: Duration, off: Duration) -> Self {
        Self {
            note,
            frequency: frequency(note),
            on,
            off,
        }
    }

    /// Oscillation period of the square wave, `1 / frequency`.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.frequency))
    }
}
