// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Slave handles: the per-device view of the process image.

use crate::types::{Error, Result, SlaveDescriptor, SlavePos};
use std::{
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// The capability the cyclic exchange needs from a device driver.
///
/// Once per PDO update the bus hands a snapshot of the slave's raw input
/// image to [`SlaveHandle::accept_inputs`] and asks
/// [`SlaveHandle::yield_outputs`] for the raw output image.  Both slices
/// have exactly the lengths the handle declares, which must match the
/// active PDO mapping or the bus refuses to go operational.
///
/// Both calls happen on the bus's PDO thread while consumers may access
/// the handle concurrently, so implementations keep their buffers behind
/// a lock and copy them as a whole.
pub trait SlaveHandle: Send + Sync {
    fn position(&self) -> SlavePos;

    fn input_len(&self) -> usize;

    fn output_len(&self) -> usize;

    fn accept_inputs(&self, data: &[u8]);

    fn yield_outputs(&self, data: &mut [u8]);

    /// Called by `close()` before the last frame is sent.
    fn safe_stop(&self) {}

    /// Called after the bus recovered from a connection loss.
    fn on_reconnect(&self) {}
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type CycleFn = Box<dyn Fn(&GenericSlave) + Send + Sync>;

/// Byte buffer pass-through for any device.
pub struct GenericSlave {
    position: SlavePos,
    input: Mutex<Vec<u8>>,
    output: Mutex<Vec<u8>>,
    on_cycle: Option<CycleFn>,
}

impl GenericSlave {
    pub fn new(position: u16, input_len: usize, output_len: usize) -> Self {
        GenericSlave {
            position: SlavePos::from(position),
            input: Mutex::new(vec![0; input_len]),
            output: Mutex::new(vec![0; output_len]),
            on_cycle: None,
        }
    }

    /// A handle sized after a discovered slave.
    pub fn for_slave(desc: &SlaveDescriptor) -> Self {
        Self::new(desc.position.into(), desc.input_bytes(), desc.output_bytes())
    }

    /// Runs `f` after every input snapshot, on the PDO thread.
    pub fn on_cycle(mut self, f: impl Fn(&GenericSlave) + Send + Sync + 'static) -> Self {
        self.on_cycle = Some(Box::new(f));
        self
    }

    /// Copy of the latest input snapshot.
    pub fn input(&self) -> Vec<u8> {
        lock(&self.input).clone()
    }

    /// Runs `f` on the latest input snapshot without copying it.
    pub fn with_input<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&lock(&self.input))
    }

    pub fn output(&self) -> Vec<u8> {
        lock(&self.output).clone()
    }

    /// Replaces the whole output image.
    pub fn set_output(&self, data: &[u8]) -> Result<()> {
        let mut output = lock(&self.output);
        if data.len() != output.len() {
            return Err(Error::BufferLength {
                position: self.position,
                expected: output.len(),
                actual: data.len(),
            });
        }
        output.copy_from_slice(data);
        Ok(())
    }

    /// Modifies the output image in place.
    pub fn update_output<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut lock(&self.output))
    }
}

impl SlaveHandle for GenericSlave {
    fn position(&self) -> SlavePos {
        self.position
    }

    fn input_len(&self) -> usize {
        lock(&self.input).len()
    }

    fn output_len(&self) -> usize {
        lock(&self.output).len()
    }

    fn accept_inputs(&self, data: &[u8]) {
        {
            let mut input = lock(&self.input);
            if input.len() == data.len() {
                input.copy_from_slice(data);
            }
        }
        if let Some(f) = &self.on_cycle {
            f(self);
        }
    }

    fn yield_outputs(&self, data: &mut [u8]) {
        let output = lock(&self.output);
        if output.len() == data.len() {
            data.copy_from_slice(&output);
        }
    }

    fn safe_stop(&self) {
        lock(&self.output).iter_mut().for_each(|b| *b = 0);
    }
}

impl fmt::Debug for GenericSlave {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GenericSlave")
            .field("position", &self.position)
            .field("input", &*lock(&self.input))
            .field("output", &*lock(&self.output))
            .finish()
    }
}
