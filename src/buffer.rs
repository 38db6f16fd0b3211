//! The stored note sequence.
//!
//! Writes replace the whole sequence; readers take a [`NoteSequence`] copy so a
//! playback run never observes a write that lands mid-melody.

use std::fmt;

use crate::config::CAPACITY;

/// A fixed-capacity run of note bytes. `Copy`, so snapshots are plain values.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NoteSequence {
    data: [u8; CAPACITY],
    len: usize,
}

impl NoteSequence {
    pub const fn empty() -> Self {
        Self {
            data: [0u8; CAPACITY],
            len: 0,
        }
    }

    /// Copies up to [`CAPACITY`] bytes from `notes`; anything beyond is dropped.
    pub fn from_slice(notes: &[u8]) -> Self {
        let len = notes.len().min(CAPACITY);
        let mut data = [0u8; CAPACITY];
        data[..len].copy_from_slice(&notes[..len]);
        Self { data, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.as_slice().iter().copied()
    }
}

impl Default for NoteSequence {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for NoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

/// Space-separated upper-case hex, e.g. `3C 48 30`.
impl fmt::UpperHex for NoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

/// Most recently accepted write, bounded to `capacity` bytes.
#[derive(Debug, Clone)]
pub struct NoteBuffer {
    capacity: usize,
    current: NoteSequence,
}

impl NoteBuffer {
    /// `capacity` is clamped to [`CAPACITY`], the size of the backing store.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(CAPACITY),
            current: NoteSequence::empty(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replaces the stored sequence with `notes`, truncated to capacity.
    ///
    /// The admission gate has already refused over-length writes; the clamp
    /// here stands on its own so the two checks can never overflow the store.
    /// Returns the number of bytes stored. An empty slice stores nothing to play.
    pub fn apply(&mut self, notes: &[u8]) -> usize {
        let len = notes.len().min(self.capacity);
        self.current = NoteSequence::from_slice(&notes[..len]);
        len
    }

    pub fn snapshot(&self) -> NoteSequence {
        self.current
    }
}

impl Default for NoteBuffer {
    fn default() -> Self {
        Self::new(CAPACITY)
    }
}
