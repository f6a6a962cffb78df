// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The interface the control loops use to drive one cell.
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use octotrack_hw::{AdcGain, Channel, MpptState};

use crate::Result;

/// Actuation, read-back and tracker state of one cell.
///
/// Implemented by hardware channels; the sweep and tracking loops only see
/// this trait.
pub trait CellProbe {
    /// Apply `voltage`, clamped to the channel limits. Returns the applied voltage.
    fn set_voltage(&mut self, voltage: f64) -> Result<f64>;

    fn read_voltage(&mut self) -> Result<f64>;

    fn read_current(&mut self) -> Result<f64>;

    fn read_voltage_and_current(&mut self) -> Result<(f64, f64)> {
        let voltage = self.read_voltage()?;
        let current = self.read_current()?;
        Ok((voltage, current))
    }

    /// Raw code on the DAC output.
    fn dac_value(&self) -> u16;

    /// ADC gains of the voltage and the current read.
    fn gains(&self) -> (AdcGain, AdcGain);

    fn voltage_limits(&self) -> (f64, f64);

    fn mppt(&self) -> &MpptState;

    fn mppt_mut(&mut self) -> &mut MpptState;

    /// Block for a pacing interval.
    fn pause(&mut self, duration: Duration);
}

impl<I: I2c, D: DelayNs> CellProbe for Channel<'_, I, D> {
    fn set_voltage(&mut self, voltage: f64) -> Result<f64> {
        Ok(Channel::set_voltage(self, voltage)?)
    }

    fn read_voltage(&mut self) -> Result<f64> {
        Ok(Channel::read_voltage(self)?)
    }

    fn read_current(&mut self) -> Result<f64> {
        Ok(Channel::read_current(self)?)
    }

    fn dac_value(&self) -> u16 {
        Channel::dac_value(self)
    }

    fn gains(&self) -> (AdcGain, AdcGain) {
        Channel::gains(self)
    }

    fn voltage_limits(&self) -> (f64, f64) {
        self.config().voltage_limits
    }

    fn mppt(&self) -> &MpptState {
        Channel::mppt(self)
    }

    fn mppt_mut(&mut self) -> &mut MpptState {
        Channel::mppt_mut(self)
    }

    fn pause(&mut self, duration: Duration) {
        Channel::pause(self, duration);
    }
}
