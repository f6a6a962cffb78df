// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! MCP4728 quad 12-bit DAC.
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;

use crate::{Bus, Result};

const MULTI_WRITE: u8 = 0x40;
pub(crate) const RAW_MAX: u16 = 0x0FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DacChannel {
    A,
    B,
    C,
    D,
}

impl DacChannel {
    pub const ALL: [DacChannel; 4] = [DacChannel::A, DacChannel::B, DacChannel::C, DacChannel::D];

    pub fn index(self) -> u8 {
        match self {
            DacChannel::A => 0,
            DacChannel::B => 1,
            DacChannel::C => 2,
            DacChannel::D => 3,
        }
    }
}

/// Output amplifier gain, only effective with the internal reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DacGain {
    #[default]
    X1,
    X2,
}

/// Convert a 16-bit scaled value to the 12-bit code of the converter.
pub fn raw_value(value: u16) -> u16 {
    value >> 4
}

#[derive(Debug, Clone)]
pub struct Mcp4728 {
    address: u8,
    codes: [u16; 4],
}

impl Mcp4728 {
    pub fn new(address: u8) -> Self {
        Mcp4728 {
            address,
            codes: [0; 4],
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// 12-bit code last written to `channel`.
    pub fn code(&self, channel: DacChannel) -> u16 {
        self.codes[usize::from(channel.index())]
    }

    /// Write a 16-bit scaled `value` to one output, using VDD as reference.
    pub fn write<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        channel: DacChannel,
        value: u16,
        gain: DacGain,
    ) -> Result<()> {
        let raw = raw_value(value);
        bus.write(self.address, &multi_write_frame(channel, raw, gain))?;
        self.codes[usize::from(channel.index())] = raw;
        Ok(())
    }
}

fn multi_write_frame(channel: DacChannel, raw: u16, gain: DacGain) -> [u8; 3] {
    // VREF = VDD, normal power mode.
    let vref = 0u8;
    let power_down = 0u8;
    let gain_bit = match gain {
        DacGain::X1 => 0u8,
        DacGain::X2 => 1u8,
    };
    let raw = raw & RAW_MAX;
    [
        MULTI_WRITE | (channel.index() << 1),
        (vref << 7) | (power_down << 5) | (gain_bit << 4) | (raw >> 8) as u8,
        (raw & 0xFF) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimDelay};

    #[test]
    fn test_frame_layout() {
        assert_eq!(multi_write_frame(DacChannel::A, 0x0ABC, DacGain::X1), [0x40, 0x0A, 0xBC]);
        assert_eq!(multi_write_frame(DacChannel::D, 0x0123, DacGain::X2), [0x46, 0x11, 0x23]);
    }

    #[test]
    fn test_raw_value_drops_low_nibble() {
        assert_eq!(raw_value(0xFFFF), 0x0FFF);
        assert_eq!(raw_value(0x1234), 0x0123);
        assert_eq!(raw_value(0x000F), 0);
    }

    #[test]
    fn test_write_reaches_device() {
        let sim = SimBus::new();
        sim.add_board(2, 1);
        let mut bus = Bus::new(sim.clone(), SimDelay::default());
        bus.select(2).unwrap();
        let mut dac = Mcp4728::new(99);
        dac.write(&mut bus, DacChannel::C, 0x8000, DacGain::X1).unwrap();
        assert_eq!(dac.code(DacChannel::C), 0x0800);
        assert_eq!(sim.dac_code(2, 99, DacChannel::C), Some(0x0800));
    }
}
