// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Switch-selected reference voltage ("soft-DAC") of a measurement board.
//!
//! The reference is chosen by four expander pins. The pins are switched one at
//! a time with a settle delay in front of every write, so the analog
//! multiplexer never sees more than one changing select line.
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use octotrack_log::diagnostic;

use crate::devices::mcp23017::Mcp23017;
use crate::{Bus, Error, Result};

/// Expander pins driving the select lines, lowest bit first.
pub const GAIN_PINS: [u8; 4] = [8, 9, 10, 11];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainLevel {
    pub pattern: [bool; 4],
    /// Reference voltage produced by the pattern.
    pub reference: f64,
}

const fn level(bits: u8, reference: f64) -> GainLevel {
    GainLevel {
        pattern: [bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0],
        reference,
    }
}

pub const GAIN_TABLE: [GainLevel; 8] = [
    level(0b0000, 0.035),
    level(0b0001, 0.310),
    level(0b0010, 0.656),
    level(0b0011, 0.930),
    level(0b0100, 1.378),
    level(0b0101, 1.672),
    level(0b0110, 2.00),
    level(0b0111, 2.29),
];

#[derive(Debug, Clone)]
pub struct GainStage {
    index: usize,
    settle: Duration,
}

impl GainStage {
    /// Drive the select pins to `index` and return the resulting stage.
    pub fn initialize<I: I2c, D: DelayNs>(
        bus: &mut Bus<I, D>,
        expander: &mut Mcp23017,
        settle: Duration,
        index: usize,
    ) -> Result<Self> {
        check_index(index)?;
        let mut stage = GainStage { index, settle };
        stage.set_gain(bus, expander, index)?;
        Ok(stage)
    }

    /// Select table row `index`.
    ///
    /// The stored index only changes once all four pins were written. If a
    /// write fails the pins may be left between two rows; the next successful
    /// call rewrites every pin.
    pub fn set_gain<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        expander: &mut Mcp23017,
        index: usize,
    ) -> Result<()> {
        check_index(index)?;
        let level = &GAIN_TABLE[index];
        for (&pin, &high) in GAIN_PINS.iter().zip(level.pattern.iter()) {
            bus.settle(self.settle);
            expander.set_pin_output(bus, pin, high)?;
        }
        self.index = index;
        diagnostic!("Gain stage set to level {} ({} V)", index, level.reference);
        Ok(())
    }

    pub fn gain(&self) -> usize {
        self.index
    }

    /// Reference voltage of the selected row.
    pub fn voltage(&self) -> f64 {
        GAIN_TABLE[self.index].reference
    }

    pub fn levels() -> usize {
        GAIN_TABLE.len()
    }
}

fn check_index(index: usize) -> Result<()> {
    if index >= GAIN_TABLE.len() {
        return Err(Error::InvalidGain {
            index,
            levels: GAIN_TABLE.len(),
        });
    }
    Ok(())
}
