//! Admission gate for characteristic writes.
//!
//! Nothing here touches the note buffer: the caller stores the bytes only
//! after an [`Verdict::Accept`].

use log::debug;

use crate::config::{ValueGate, CAPACITY};
use crate::error::{Rejection, Verdict};
use crate::service::AttrHandle;

/// One write as delivered by the transport, alive for a single authorize/apply cycle.
#[derive(Debug, Clone, Copy)]
pub struct PendingWrite<'a> {
    pub handle: AttrHandle,
    pub data: &'a [u8],
}

impl<'a> PendingWrite<'a> {
    pub fn new(handle: AttrHandle, data: &'a [u8]) -> Self {
        Self { handle, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WriteAuthorizer {
    capacity: usize,
    gate: Option<ValueGate>,
    bounded: Vec<AttrHandle>,
}

impl WriteAuthorizer {
    /// `capacity` is clamped to [`CAPACITY`], the same bound the buffer uses.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.min(CAPACITY),
            gate: None,
            bounded: Vec::new(),
        }
    }

    pub fn with_value_gate(mut self, gate: Option<ValueGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Marks `handle` as a bounded field; the gate's `bounded_ceiling` then applies to it.
    pub fn bound_field(&mut self, handle: AttrHandle) {
        if !self.bounded.contains(&handle) {
            self.bounded.push(handle);
        }
    }

    pub fn is_bounded(&self, handle: AttrHandle) -> bool {
        self.bounded.contains(&handle)
    }

    pub fn authorize(&self, write: &PendingWrite<'_>) -> Verdict {
        let verdict = Verdict::from(self.check(write));
        if let Verdict::Reject(r) = verdict {
            debug!("write to {} refused: {r}", write.handle);
        }
        verdict
    }

    fn check(&self, write: &PendingWrite<'_>) -> Result<(), Rejection> {
        let len = write.len();
        if len == 0 || len > self.capacity {
            return Err(Rejection::InvalidLength {
                len,
                capacity: self.capacity,
            });
        }

        let Some(gate) = self.gate else {
            return Ok(());
        };

        let ceiling = if self.is_bounded(write.handle) {
            gate.ceiling.min(gate.bounded_ceiling)
        } else {
            gate.ceiling
        };

        match write.data.iter().position(|&b| b >= ceiling) {
            Some(index) => Err(Rejection::InvalidValue {
                index,
                value: write.data[index],
                ceiling,
            }),
            None => Ok(()),
        }
    }
}
