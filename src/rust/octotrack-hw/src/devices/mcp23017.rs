// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! MCP23017 16-bit GPIO expander.
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::{Bus, Error, Result};

// Register addresses in the power-on bank layout (IOCON.BANK = 0).
pub(crate) const REG_IODIRA: u8 = 0x00;
pub(crate) const REG_IODIRB: u8 = 0x01;
pub(crate) const REG_OLATA: u8 = 0x14;
pub(crate) const REG_OLATB: u8 = 0x15;

pub const PINS: u8 = 16;

/// Driver with a shadow copy of the direction and output latch registers.
#[derive(Debug, Clone)]
pub struct Mcp23017 {
    address: u8,
    iodir: u16,
    olat: u16,
}

impl Mcp23017 {
    /// All pins are inputs after power-on.
    pub fn new(address: u8) -> Self {
        Mcp23017 {
            address,
            iodir: 0xFFFF,
            olat: 0x0000,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Drive `pin` as an output at the given level.
    ///
    /// The latch is written before the direction so the pin never glitches to
    /// a stale level when it turns into an output.
    pub fn set_pin_output<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        pin: u8,
        high: bool,
    ) -> Result<()> {
        if pin >= PINS {
            return Err(Error::new(format!("GPIO expander has no pin {pin}")));
        }
        let mask = 1u16 << pin;
        let olat = if high {
            self.olat | mask
        } else {
            self.olat & !mask
        };
        let iodir = self.iodir & !mask;
        let (olat_reg, iodir_reg, shift) = if pin < 8 {
            (REG_OLATA, REG_IODIRA, 0)
        } else {
            (REG_OLATB, REG_IODIRB, 8)
        };
        bus.write(self.address, &[olat_reg, (olat >> shift) as u8])?;
        self.olat = olat;
        if iodir != self.iodir {
            bus.write(self.address, &[iodir_reg, (iodir >> shift) as u8])?;
            self.iodir = iodir;
        }
        Ok(())
    }

    /// Level last written to `pin`, `None` while it is an input.
    pub fn output_level(&self, pin: u8) -> Option<bool> {
        if pin >= PINS || self.iodir & (1 << pin) != 0 {
            return None;
        }
        Some(self.olat & (1 << pin) != 0)
    }
}
