// Part of ethercat-bus. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Typed handles for Beckhoff terminals with their factory PDO assignment.

use crate::slave::{lock, SlaveHandle};
use crate::types::{SlaveId, SlavePos};
use byteorder::{ByteOrder, LittleEndian as LE};
use std::sync::Mutex;

pub const VENDOR_ID: u32 = 0x0000_0002;

pub const EK1100_ID: SlaveId = SlaveId { vendor_id: VENDOR_ID, product_code: 0x044C_2C52 };
pub const EL1008_ID: SlaveId = SlaveId { vendor_id: VENDOR_ID, product_code: 0x03F0_3052 };
pub const EL2008_ID: SlaveId = SlaveId { vendor_id: VENDOR_ID, product_code: 0x07D8_3052 };
pub const EL3104_ID: SlaveId = SlaveId { vendor_id: VENDOR_ID, product_code: 0x0C20_3052 };
pub const EL4132_ID: SlaveId = SlaveId { vendor_id: VENDOR_ID, product_code: 0x1024_3052 };

/// Bus coupler, no process data.
#[derive(Debug)]
pub struct Ek1100 {
    position: SlavePos,
}

impl Ek1100 {
    pub fn new(position: u16) -> Self {
        Ek1100 { position: position.into() }
    }
}

impl SlaveHandle for Ek1100 {
    fn position(&self) -> SlavePos {
        self.position
    }
    fn input_len(&self) -> usize {
        0
    }
    fn output_len(&self) -> usize {
        0
    }
    fn accept_inputs(&self, _: &[u8]) {}
    fn yield_outputs(&self, _: &mut [u8]) {}
}

/// 8 channel digital input terminal.
#[derive(Debug)]
pub struct El1008 {
    position: SlavePos,
    input: Mutex<u8>,
}

impl El1008 {
    pub fn new(position: u16) -> Self {
        El1008 { position: position.into(), input: Mutex::new(0) }
    }

    /// All channels, channel 1 in bit 0.
    pub fn inputs(&self) -> u8 {
        *lock(&self.input)
    }

    /// Channels are numbered 1 to 8 like on the terminal.
    pub fn channel(&self, ch: u8) -> bool {
        (1..=8).contains(&ch) && self.inputs() & (1 << (ch - 1)) != 0
    }
}

impl SlaveHandle for El1008 {
    fn position(&self) -> SlavePos {
        self.position
    }
    fn input_len(&self) -> usize {
        1
    }
    fn output_len(&self) -> usize {
        0
    }
    fn accept_inputs(&self, data: &[u8]) {
        if let Some(b) = data.first() {
            *lock(&self.input) = *b;
        }
    }
    fn yield_outputs(&self, _: &mut [u8]) {}
}

/// 8 channel digital output terminal.
#[derive(Debug)]
pub struct El2008 {
    position: SlavePos,
    output: Mutex<u8>,
}

impl El2008 {
    pub fn new(position: u16) -> Self {
        El2008 { position: position.into(), output: Mutex::new(0) }
    }

    pub fn outputs(&self) -> u8 {
        *lock(&self.output)
    }

    pub fn set_outputs(&self, value: u8) {
        *lock(&self.output) = value;
    }

    /// Channels are numbered 1 to 8 like on the terminal.
    pub fn set_channel(&self, ch: u8, on: bool) {
        if !(1..=8).contains(&ch) {
            return;
        }
        let mut out = lock(&self.output);
        if on {
            *out |= 1 << (ch - 1);
        } else {
            *out &= !(1 << (ch - 1));
        }
    }
}

impl SlaveHandle for El2008 {
    fn position(&self) -> SlavePos {
        self.position
    }
    fn input_len(&self) -> usize {
        0
    }
    fn output_len(&self) -> usize {
        1
    }
    fn accept_inputs(&self, _: &[u8]) {}
    fn yield_outputs(&self, data: &mut [u8]) {
        if let Some(b) = data.first_mut() {
            *b = *lock(&self.output);
        }
    }
    fn safe_stop(&self) {
        self.set_outputs(0);
    }
}

/// One channel of an analog input terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalogInput {
    pub status: u16,
    pub value: i16,
}

impl AnalogInput {
    pub fn underrange(&self) -> bool {
        self.status & 0x0001 != 0
    }

    pub fn overrange(&self) -> bool {
        self.status & 0x0002 != 0
    }

    pub fn error(&self) -> bool {
        self.status & 0x0040 != 0
    }
}

/// 4 channel analog input terminal, status word and value per channel.
#[derive(Debug)]
pub struct El3104 {
    position: SlavePos,
    channels: Mutex<[AnalogInput; 4]>,
}

impl El3104 {
    pub fn new(position: u16) -> Self {
        El3104 { position: position.into(), channels: Mutex::new([AnalogInput::default(); 4]) }
    }

    pub fn channels(&self) -> [AnalogInput; 4] {
        *lock(&self.channels)
    }

    /// Channels are numbered 1 to 4.
    pub fn channel(&self, ch: usize) -> Option<AnalogInput> {
        ch.checked_sub(1).and_then(|i| self.channels().get(i).copied())
    }
}

impl SlaveHandle for El3104 {
    fn position(&self) -> SlavePos {
        self.position
    }
    fn input_len(&self) -> usize {
        16
    }
    fn output_len(&self) -> usize {
        0
    }
    fn accept_inputs(&self, data: &[u8]) {
        if data.len() != 16 {
            return;
        }
        let mut decoded = [AnalogInput::default(); 4];
        for (ch, raw) in decoded.iter_mut().zip(data.chunks_exact(4)) {
            ch.status = LE::read_u16(&raw[0..2]);
            ch.value = LE::read_i16(&raw[2..4]);
        }
        *lock(&self.channels) = decoded;
    }
    fn yield_outputs(&self, _: &mut [u8]) {}
}

/// 2 channel analog output terminal.
#[derive(Debug)]
pub struct El4132 {
    position: SlavePos,
    values: Mutex<[i16; 2]>,
}

impl El4132 {
    pub fn new(position: u16) -> Self {
        El4132 { position: position.into(), values: Mutex::new([0; 2]) }
    }

    pub fn values(&self) -> [i16; 2] {
        *lock(&self.values)
    }

    /// Channels are numbered 1 and 2.
    pub fn set_value(&self, ch: usize, value: i16) {
        if (1..=2).contains(&ch) {
            lock(&self.values)[ch - 1] = value;
        }
    }
}

impl SlaveHandle for El4132 {
    fn position(&self) -> SlavePos {
        self.position
    }
    fn input_len(&self) -> usize {
        0
    }
    fn output_len(&self) -> usize {
        4
    }
    fn accept_inputs(&self, _: &[u8]) {}
    fn yield_outputs(&self, data: &mut [u8]) {
        if data.len() == 4 {
            LE::write_i16_into(&self.values(), data);
        }
    }
    fn safe_stop(&self) {
        *lock(&self.values) = [0; 2];
    }
}
