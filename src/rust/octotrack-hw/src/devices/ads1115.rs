// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! ADS1115 16-bit delta-sigma ADC, used in single-shot differential mode.
use std::fmt;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use serde::{Deserialize, Serialize};

use crate::{Bus, Error, Result};

pub(crate) const REG_CONVERSION: u8 = 0x00;
pub(crate) const REG_CONFIG: u8 = 0x01;

pub(crate) const CONFIG_OS: u16 = 0x8000;
pub(crate) const CONFIG_MUX_SHIFT: u16 = 12;
pub(crate) const CONFIG_PGA_SHIFT: u16 = 9;
const CONFIG_MODE_SINGLE: u16 = 0x0100;
const CONFIG_DATA_RATE_8SPS: u16 = 0x0000;
const CONFIG_COMPARATOR_DISABLE: u16 = 0x0003;

/// One conversion at 8 samples per second, plus margin for the internal oscillator.
const CONVERSION_TIME: Duration = Duration::from_millis(130);
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const MAX_POLLS: usize = 20;

/// Programmable gain amplifier setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AdcGain {
    One,
    Two,
    Four,
    Eight,
    Sixteen,
}

impl AdcGain {
    /// Input voltage mapped to the full code range.
    pub fn full_scale(self) -> f64 {
        match self {
            AdcGain::One => 4.096,
            AdcGain::Two => 2.048,
            AdcGain::Four => 1.024,
            AdcGain::Eight => 0.512,
            AdcGain::Sixteen => 0.256,
        }
    }

    pub(crate) fn pga_bits(self) -> u16 {
        match self {
            AdcGain::One => 0b001,
            AdcGain::Two => 0b010,
            AdcGain::Four => 0b011,
            AdcGain::Eight => 0b100,
            AdcGain::Sixteen => 0b101,
        }
    }

    pub fn factor(self) -> u8 {
        self.into()
    }
}

impl TryFrom<u8> for AdcGain {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(AdcGain::One),
            2 => Ok(AdcGain::Two),
            4 => Ok(AdcGain::Four),
            8 => Ok(AdcGain::Eight),
            16 => Ok(AdcGain::Sixteen),
            other => Err(Error::new(format!(
                "Unsupported ADC gain {other}, expected one of 1, 2, 4, 8, 16"
            ))),
        }
    }
}

impl From<AdcGain> for u8 {
    fn from(gain: AdcGain) -> u8 {
        match gain {
            AdcGain::One => 1,
            AdcGain::Two => 2,
            AdcGain::Four => 4,
            AdcGain::Eight => 8,
            AdcGain::Sixteen => 16,
        }
    }
}

impl fmt::Display for AdcGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.factor())
    }
}

/// Input pair of a differential measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferentialPair {
    /// Cell voltage.
    Ain0Ain1,
    /// Voltage across the shunt.
    Ain2Ain3,
}

impl DifferentialPair {
    pub(crate) fn mux_bits(self) -> u16 {
        match self {
            DifferentialPair::Ain0Ain1 => 0b000,
            DifferentialPair::Ain2Ain3 => 0b011,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ads1115 {
    address: u8,
    gain: AdcGain,
}

impl Ads1115 {
    pub fn new(address: u8) -> Self {
        Ads1115 {
            address,
            gain: AdcGain::One,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn gain(&self) -> AdcGain {
        self.gain
    }

    /// The gain is sent with the configuration of the next conversion.
    pub fn set_gain(&mut self, gain: AdcGain) {
        self.gain = gain;
    }

    /// Run one single-shot conversion and return the input voltage.
    pub fn read_differential<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        pair: DifferentialPair,
    ) -> Result<f64> {
        let config = CONFIG_OS
            | (pair.mux_bits() << CONFIG_MUX_SHIFT)
            | (self.gain.pga_bits() << CONFIG_PGA_SHIFT)
            | CONFIG_MODE_SINGLE
            | CONFIG_DATA_RATE_8SPS
            | CONFIG_COMPARATOR_DISABLE;
        let [hi, lo] = config.to_be_bytes();
        bus.write(self.address, &[REG_CONFIG, hi, lo])?;
        bus.pause(CONVERSION_TIME);
        self.wait_for_conversion(bus)?;

        let mut raw = [0u8; 2];
        bus.write_read(self.address, &[REG_CONVERSION], &mut raw)?;
        Ok(counts_to_volts(i16::from_be_bytes(raw), self.gain))
    }

    fn wait_for_conversion<I: I2c, D: DelayNs>(&self, bus: &mut Bus<I, D>) -> Result<()> {
        let mut status = [0u8; 2];
        for _ in 0..MAX_POLLS {
            bus.write_read(self.address, &[REG_CONFIG], &mut status)?;
            if u16::from_be_bytes(status) & CONFIG_OS != 0 {
                return Ok(());
            }
            bus.pause(POLL_INTERVAL);
        }
        Err(Error::ConversionTimeout(self.address))
    }
}

pub fn counts_to_volts(counts: i16, gain: AdcGain) -> f64 {
    f64::from(counts) * gain.full_scale() / 32768.0
}
