// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Actuation and read-back of a single cell channel.
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use octotrack_log::diagnostic;

use crate::board::{BoardDevices, CHANNELS};
use crate::config::ChannelConfig;
use crate::devices::ads1115::{AdcGain, DifferentialPair};
use crate::devices::mcp4728::{DacChannel, DacGain};
use crate::{Bus, Error, Result};

/// Search direction of the perturb-and-observe tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Up,
    Down,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Tracker state of one channel.
///
/// The step size always lies within `[min_dv, max_dv]`; every setter clamps.
#[derive(Debug, Clone, PartialEq)]
pub struct MpptState {
    last_v: f64,
    direction: Direction,
    last_p: f64,
    dv: f64,
    min_dv: f64,
    max_dv: f64,
}

impl MpptState {
    pub fn new(initial_dv: f64, min_dv: f64, max_dv: f64) -> Self {
        let (min_dv, max_dv) = if min_dv <= max_dv {
            (min_dv, max_dv)
        } else {
            (max_dv, min_dv)
        };
        MpptState {
            last_v: 0.0,
            direction: Direction::Up,
            last_p: 0.0,
            dv: initial_dv.max(min_dv).min(max_dv),
            min_dv,
            max_dv,
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.initial_dv, config.min_dv, config.max_dv)
    }

    pub fn last_v(&self) -> f64 {
        self.last_v
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn last_p(&self) -> f64 {
        self.last_p
    }

    pub fn dv(&self) -> f64 {
        self.dv
    }

    pub fn min_dv(&self) -> f64 {
        self.min_dv
    }

    pub fn max_dv(&self) -> f64 {
        self.max_dv
    }

    pub fn set_last_v(&mut self, voltage: f64) {
        self.last_v = voltage;
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn set_last_p(&mut self, power: f64) {
        self.last_p = power;
    }

    pub fn set_dv(&mut self, dv: f64) {
        // `max` first so NaN ends up at the lower bound.
        self.dv = dv.max(self.min_dv).min(self.max_dv);
    }
}

/// DAC chip and output a channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacBinding {
    /// 0 for DAC-0, 1 for DAC-1.
    pub chip: usize,
    pub output: DacChannel,
}

impl DacBinding {
    /// Channels 0-3 sit on DAC-0 outputs A-D, channels 4-7 on DAC-1.
    pub fn for_index(index: usize) -> Result<Self> {
        if index >= CHANNELS {
            return Err(Error::InvalidBoardChannel(index));
        }
        Ok(DacBinding {
            chip: index / 4,
            output: DacChannel::ALL[index % 4],
        })
    }
}

/// Persistent state of one channel, owned by its board.
#[derive(Debug, Clone)]
pub struct ChannelState {
    index: usize,
    binding: DacBinding,
    config: ChannelConfig,
    dac_gain: DacGain,
    gain_voltage: AdcGain,
    gain_current: AdcGain,
    mppt: MpptState,
}

impl ChannelState {
    pub fn new(index: usize, config: &ChannelConfig) -> Result<Self> {
        Ok(ChannelState {
            index,
            binding: DacBinding::for_index(index)?,
            config: config.clone(),
            dac_gain: DacGain::X1,
            gain_voltage: config.adc_gain_voltage,
            gain_current: config.adc_gain_current,
            mppt: MpptState::from_config(config),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn binding(&self) -> DacBinding {
        self.binding
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn mppt(&self) -> &MpptState {
        &self.mppt
    }

    /// ADC gains of the voltage and the current read.
    pub fn gains(&self) -> (AdcGain, AdcGain) {
        (self.gain_voltage, self.gain_current)
    }

    /// Clamp `voltage` to the channel's limits.
    pub fn clamp_voltage(&self, voltage: f64) -> f64 {
        let (lo, hi) = self.config.voltage_limits;
        voltage.max(lo).min(hi)
    }

    /// 16-bit scaled DAC value for an already clamped voltage.
    pub fn dac_value_for(&self, voltage: f64) -> u16 {
        let value = (voltage + self.config.dac_offset) * self.config.dac_scale;
        value.clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

/// A channel borrowed together with its board's devices and the bus.
///
/// Obtained from [`crate::Board::channel`]; the borrow guarantees that no
/// other channel of the same board uses the analog multiplexer or the ADC
/// while this view exists.
pub struct Channel<'a, I, D> {
    bus: &'a mut Bus<I, D>,
    devices: &'a mut BoardDevices,
    state: &'a mut ChannelState,
    board_id: &'a str,
}

impl<'a, I, D> Channel<'a, I, D> {
    pub(crate) fn new(
        bus: &'a mut Bus<I, D>,
        devices: &'a mut BoardDevices,
        state: &'a mut ChannelState,
        board_id: &'a str,
    ) -> Self {
        Channel {
            bus,
            devices,
            state,
            board_id,
        }
    }

    pub fn id(&self) -> String {
        format!("{}channel_{}", self.board_id, self.state.index)
    }

    pub fn index(&self) -> usize {
        self.state.index
    }

    pub fn state(&self) -> &ChannelState {
        self.state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.state.config
    }

    pub fn mppt(&self) -> &MpptState {
        &self.state.mppt
    }

    pub fn mppt_mut(&mut self) -> &mut MpptState {
        &mut self.state.mppt
    }

    pub fn gains(&self) -> (AdcGain, AdcGain) {
        self.state.gains()
    }

    pub fn set_gains(&mut self, voltage: AdcGain, current: AdcGain) {
        self.state.gain_voltage = voltage;
        self.state.gain_current = current;
    }

    /// 12-bit code currently on the bound DAC output.
    pub fn dac_value(&self) -> u16 {
        let binding = self.state.binding;
        self.devices.dacs[binding.chip].code(binding.output)
    }
}

impl<I: I2c, D: DelayNs> Channel<'_, I, D> {
    /// Drive the cell to `voltage`, clamped to the channel limits.
    ///
    /// Returns the voltage that was actually applied.
    pub fn set_voltage(&mut self, voltage: f64) -> Result<f64> {
        if !voltage.is_finite() {
            return Err(Error::new(format!(
                "Refusing to apply non-finite voltage {voltage} to {}",
                self.id()
            )));
        }
        let applied = self.state.clamp_voltage(voltage);
        let value = self.state.dac_value_for(applied);
        let binding = self.state.binding;
        self.devices.dacs[binding.chip].write(self.bus, binding.output, value, self.state.dac_gain)?;
        diagnostic!("{}: set {} V (code {})", self.id(), applied, value);
        Ok(applied)
    }

    /// Cell voltage in volt.
    pub fn read_voltage(&mut self) -> Result<f64> {
        let gain = self.state.gain_voltage;
        self.read_pair(DifferentialPair::Ain0Ain1, gain)
    }

    /// Cell current in ampere, from the voltage across the shunt.
    pub fn read_current(&mut self) -> Result<f64> {
        let gain = self.state.gain_current;
        let shunt = self.read_pair(DifferentialPair::Ain2Ain3, gain)?;
        Ok(shunt / self.state.config.shunt_resistance)
    }

    pub fn read_voltage_and_current(&mut self) -> Result<(f64, f64)> {
        let voltage = self.read_voltage()?;
        let current = self.read_current()?;
        Ok((voltage, current))
    }

    pub fn pause(&mut self, duration: Duration) {
        self.bus.pause(duration);
    }

    fn read_pair(&mut self, pair: DifferentialPair, gain: AdcGain) -> Result<f64> {
        let settle = self.state.config.adc_settle();
        self.devices.select_analog_channel(self.bus, self.state.index)?;
        self.bus.settle(settle);
        self.devices.adc.set_gain(gain);
        self.bus.settle(settle);
        self.devices.adc.read_differential(self.bus, pair)
    }
}
