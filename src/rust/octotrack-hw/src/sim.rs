// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Register-level simulation of a rig: bus switch, boards and cells.
//!
//! [`SimBus`] implements the `embedded-hal` I2C trait and answers like the
//! real devices: the bus switch routes traffic to the selected sub-buses, the
//! GPIO expanders, DACs and ADCs keep their registers, and a conversion
//! started on an ADC measures the cell currently routed to it by the analog
//! multiplexer. [`SimDelay`] only counts the time it was asked to wait.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{self, ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};

use crate::board::{ANALOG_MUX_MAP, MUX_ADDRESS_PINS, MUX_ENABLE_PIN};
use crate::bus::{BUS_SWITCH_ADDRESS, SWITCH_CHANNELS};
use crate::channel::DacBinding;
use crate::config::ChannelConfig;
use crate::devices::ads1115::{CONFIG_MUX_SHIFT, CONFIG_OS, CONFIG_PGA_SHIFT, REG_CONFIG, REG_CONVERSION};
use crate::devices::mcp23017::{REG_IODIRA, REG_IODIRB, REG_OLATA, REG_OLATB};
use crate::devices::mcp4728::{DacChannel, RAW_MAX};
use crate::discovery::{BoardAddresses, Route};

const EXPANDER_REGISTERS: usize = 0x16;

/// Electrical model of the device under test on one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimCell {
    /// Ohmic load; the current follows the applied voltage.
    Resistor { ohm: f64 },
    /// Illuminated diode: `I = isc - i0 * (exp(V / n_vt) - 1)`.
    Photovoltaic { isc: f64, i0: f64, n_vt: f64 },
}

impl SimCell {
    pub fn resistor(ohm: f64) -> Self {
        SimCell::Resistor { ohm }
    }

    /// Cell with short-circuit current `isc` (A) and open-circuit voltage `voc` (V).
    pub fn photovoltaic(isc: f64, voc: f64) -> Self {
        let n_vt = 0.05;
        SimCell::Photovoltaic {
            isc,
            i0: isc / ((voc / n_vt).exp() - 1.0),
            n_vt,
        }
    }

    pub fn current(&self, voltage: f64) -> f64 {
        match *self {
            SimCell::Resistor { ohm } => voltage / ohm,
            SimCell::Photovoltaic { isc, i0, n_vt } => isc - i0 * ((voltage / n_vt).exp() - 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimError(ErrorKind);

impl SimError {
    fn no_device() -> Self {
        SimError(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))
    }

    fn rejected() -> Self {
        SimError(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data))
    }
}

impl i2c::Error for SimError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

#[derive(Debug)]
struct SimExpander {
    registers: [u8; EXPANDER_REGISTERS],
    pointer: u8,
}

impl Default for SimExpander {
    fn default() -> Self {
        let mut registers = [0u8; EXPANDER_REGISTERS];
        registers[usize::from(REG_IODIRA)] = 0xFF;
        registers[usize::from(REG_IODIRB)] = 0xFF;
        SimExpander {
            registers,
            pointer: 0,
        }
    }
}

impl SimExpander {
    fn write(&mut self, bytes: &[u8]) {
        let Some((&pointer, data)) = bytes.split_first() else {
            return;
        };
        self.pointer = pointer % EXPANDER_REGISTERS as u8;
        for &byte in data {
            self.registers[usize::from(self.pointer)] = byte;
            self.pointer = (self.pointer + 1) % EXPANDER_REGISTERS as u8;
        }
    }

    fn read(&mut self, buffer: &mut [u8]) {
        for byte in buffer {
            *byte = self.registers[usize::from(self.pointer)];
            self.pointer = (self.pointer + 1) % EXPANDER_REGISTERS as u8;
        }
    }

    /// Levels of the pins configured as outputs.
    fn outputs(&self) -> u16 {
        let iodir = u16::from_le_bytes([
            self.registers[usize::from(REG_IODIRA)],
            self.registers[usize::from(REG_IODIRB)],
        ]);
        let olat = u16::from_le_bytes([
            self.registers[usize::from(REG_OLATA)],
            self.registers[usize::from(REG_OLATB)],
        ]);
        olat & !iodir
    }
}

#[derive(Debug, Default)]
struct SimAdc {
    pointer: u8,
    config: u16,
    conversion: i16,
}

impl SimAdc {
    fn read(&self, buffer: &mut [u8]) {
        let value = match self.pointer {
            REG_CONVERSION => self.conversion.to_be_bytes(),
            // Single-shot conversions finish instantly.
            REG_CONFIG => (self.config | CONFIG_OS).to_be_bytes(),
            _ => [0, 0],
        };
        for (byte, value) in buffer.iter_mut().zip(value.into_iter().chain(std::iter::repeat(0))) {
            *byte = value;
        }
    }
}

#[derive(Debug, Default)]
struct SimDac {
    codes: [u16; 4],
}

impl SimDac {
    fn write(&mut self, bytes: &[u8]) {
        for frame in bytes.chunks_exact(3) {
            // Multi-write command 0b01000xxx.
            if frame[0] & 0xF8 != 0x40 {
                continue;
            }
            let channel = usize::from((frame[0] >> 1) & 0x03);
            self.codes[channel] = ((u16::from(frame[1] & 0x0F) << 8) | u16::from(frame[2])) & RAW_MAX;
        }
    }
}

#[derive(Debug)]
enum SimDevice {
    Expander(SimExpander),
    Adc(SimAdc),
    Dac(SimDac),
}

#[derive(Debug, Default)]
struct RigState {
    switch_mask: u8,
    failing_switch_channels: BTreeSet<u8>,
    adc_failures: usize,
    /// Devices per bus-switch channel, by address.
    sub_buses: BTreeMap<u8, BTreeMap<u8, SimDevice>>,
    /// Address offset of every board per bus-switch channel, by ADC address.
    adc_offsets: HashMap<(u8, u8), u8>,
    cells: HashMap<Route, SimCell>,
    channel: ChannelConfig,
}

impl RigState {
    /// First selected sub-bus on which `address` answers.
    fn locate(&self, address: u8) -> Result<u8, SimError> {
        (0..SWITCH_CHANNELS)
            .filter(|&switch| self.switch_mask & (1 << switch) != 0)
            .find(|switch| {
                self.sub_buses
                    .get(switch)
                    .is_some_and(|devices| devices.contains_key(&address))
            })
            .ok_or_else(SimError::no_device)
    }

    fn device_mut(&mut self, switch: u8, address: u8) -> Result<&mut SimDevice, SimError> {
        self.sub_buses
            .get_mut(&switch)
            .and_then(|devices| devices.get_mut(&address))
            .ok_or_else(SimError::no_device)
    }

    fn expander(&self, switch: u8, address: u8) -> Option<&SimExpander> {
        match self.sub_buses.get(&switch)?.get(&address)? {
            SimDevice::Expander(expander) => Some(expander),
            _ => None,
        }
    }

    fn dac(&self, switch: u8, address: u8) -> Option<&SimDac> {
        match self.sub_buses.get(&switch)?.get(&address)? {
            SimDevice::Dac(dac) => Some(dac),
            _ => None,
        }
    }

    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), SimError> {
        if address == BUS_SWITCH_ADDRESS {
            let Some(&mask) = bytes.last() else {
                return Ok(());
            };
            if self
                .failing_switch_channels
                .iter()
                .any(|&channel| mask & (1 << channel) != 0)
            {
                return Err(SimError::rejected());
            }
            self.switch_mask = mask;
            return Ok(());
        }
        let switch = self.locate(address)?;
        let is_adc = matches!(self.device_mut(switch, address)?, SimDevice::Adc(_));
        if let Some(config) = conversion_request(bytes).filter(|_| is_adc) {
            return self.start_conversion(switch, address, config);
        }
        match self.device_mut(switch, address)? {
            SimDevice::Expander(expander) => expander.write(bytes),
            SimDevice::Adc(adc) => {
                if let Some(&pointer) = bytes.first() {
                    adc.pointer = pointer;
                }
            }
            SimDevice::Dac(dac) => dac.write(bytes),
        }
        Ok(())
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), SimError> {
        if address == BUS_SWITCH_ADDRESS {
            buffer.fill(self.switch_mask);
            return Ok(());
        }
        let switch = self.locate(address)?;
        match self.device_mut(switch, address)? {
            SimDevice::Expander(expander) => expander.read(buffer),
            SimDevice::Adc(adc) => adc.read(buffer),
            SimDevice::Dac(_) => buffer.fill(0),
        }
        Ok(())
    }

    fn start_conversion(&mut self, switch: u8, address: u8, config: u16) -> Result<(), SimError> {
        if self.adc_failures > 0 {
            self.adc_failures -= 1;
            return Err(SimError::rejected());
        }
        let conversion = self.convert(switch, address, config);
        if let SimDevice::Adc(adc) = self.device_mut(switch, address)? {
            adc.pointer = REG_CONFIG;
            adc.config = config & !CONFIG_OS;
            adc.conversion = conversion;
        }
        Ok(())
    }

    fn convert(&self, switch: u8, adc_address: u8, config: u16) -> i16 {
        let full_scale = match (config >> CONFIG_PGA_SHIFT) & 0x07 {
            0 => 6.144,
            1 => 4.096,
            2 => 2.048,
            3 => 1.024,
            4 => 0.512,
            _ => 0.256,
        };
        let (voltage, current) = self.operating_point(switch, adc_address);
        let input = match (config >> CONFIG_MUX_SHIFT) & 0x07 {
            0b000 => voltage,
            0b011 => current * self.channel.shunt_resistance,
            _ => 0.0,
        };
        (input / full_scale * 32768.0).round().clamp(-32768.0, 32767.0) as i16
    }

    /// Voltage and current of the channel the analog multiplexer routes to the ADC.
    fn operating_point(&self, switch: u8, adc_address: u8) -> (f64, f64) {
        let Some(&offset) = self.adc_offsets.get(&(switch, adc_address)) else {
            return (0.0, 0.0);
        };
        let addresses = BoardAddresses::for_offset(offset);
        let Some(expander) = self.expander(switch, addresses.expander) else {
            return (0.0, 0.0);
        };
        let outputs = expander.outputs();
        if outputs & (1 << MUX_ENABLE_PIN) != 0 {
            return (0.0, 0.0);
        }
        let mux_address = MUX_ADDRESS_PINS
            .iter()
            .enumerate()
            .filter(|&(_, &pin)| outputs & (1 << pin) != 0)
            .fold(0usize, |acc, (bit, _)| acc | (1 << bit));
        let channel = ANALOG_MUX_MAP[mux_address];
        let Ok(binding) = DacBinding::for_index(channel) else {
            return (0.0, 0.0);
        };
        let dac_address = if binding.chip == 0 {
            addresses.dac0
        } else {
            addresses.dac1
        };
        let code = self
            .dac(switch, dac_address)
            .map_or(0, |dac| dac.codes[usize::from(binding.output.index())]);
        let voltage = f64::from(code << 4) / self.channel.dac_scale - self.channel.dac_offset;
        let route = Route {
            switch_channel: switch,
            board: offset,
            channel,
        };
        let current = self
            .cells
            .get(&route)
            .map_or(0.0, |cell| cell.current(voltage));
        (voltage, current)
    }
}

/// ADC configuration write that starts a single-shot conversion.
fn conversion_request(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [REG_CONFIG, hi, lo, ..] => {
            let config = u16::from_be_bytes([*hi, *lo]);
            (config & CONFIG_OS != 0).then_some(config)
        }
        _ => None,
    }
}

/// Shared handle to a simulated rig. Clones see the same hardware.
#[derive(Debug, Clone, Default)]
pub struct SimBus(Arc<Mutex<RigState>>);

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RigState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a complete board at `offset` behind bus-switch channel `switch`.
    pub fn add_board(&self, switch: u8, offset: u8) {
        let addresses = BoardAddresses::for_offset(offset);
        let mut rig = self.lock();
        let devices = rig.sub_buses.entry(switch).or_default();
        devices.insert(addresses.expander, SimDevice::Expander(SimExpander::default()));
        devices.insert(addresses.adc, SimDevice::Adc(SimAdc::default()));
        devices.insert(addresses.dac0, SimDevice::Dac(SimDac::default()));
        devices.insert(addresses.dac1, SimDevice::Dac(SimDac::default()));
        rig.adc_offsets.insert((switch, addresses.adc), offset);
    }

    /// Unplug a single device.
    pub fn remove_device(&self, switch: u8, address: u8) {
        if let Some(devices) = self.lock().sub_buses.get_mut(&switch) {
            devices.remove(&address);
        }
    }

    pub fn attach_cell(&self, route: Route, cell: SimCell) {
        self.lock().cells.insert(route, cell);
    }

    /// Let the bus switch reject every selection that includes `channel`.
    pub fn fail_switch_channel(&self, channel: u8) {
        self.lock().failing_switch_channels.insert(channel);
    }

    /// Reject the next `count` conversion requests on any ADC.
    pub fn fail_adc_reads(&self, count: usize) {
        self.lock().adc_failures = count;
    }

    pub fn switch_mask(&self) -> u8 {
        self.lock().switch_mask
    }

    /// Output pins driven high on the expander of a board, `None` without board.
    pub fn expander_outputs(&self, switch: u8, offset: u8) -> Option<u16> {
        let address = BoardAddresses::for_offset(offset).expander;
        self.lock()
            .expander(switch, address)
            .map(SimExpander::outputs)
    }

    /// 12-bit code of one DAC output.
    pub fn dac_code(&self, switch: u8, address: u8, channel: DacChannel) -> Option<u16> {
        self.lock()
            .dac(switch, address)
            .map(|dac| dac.codes[usize::from(channel.index())])
    }

    /// Voltage applied to the channel at `route`, as set by its DAC.
    pub fn applied_voltage(&self, route: Route) -> Option<f64> {
        let rig = self.lock();
        let addresses = BoardAddresses::for_offset(route.board);
        let binding = DacBinding::for_index(route.channel).ok()?;
        let address = if binding.chip == 0 {
            addresses.dac0
        } else {
            addresses.dac1
        };
        let code = rig.dac(route.switch_channel, address)?.codes[usize::from(binding.output.index())];
        Some(f64::from(code << 4) / rig.channel.dac_scale - rig.channel.dac_offset)
    }
}

impl ErrorType for SimBus {
    type Error = SimError;
}

impl I2c for SimBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut rig = self.lock();
        for operation in operations {
            match operation {
                Operation::Write(bytes) => rig.write(address, bytes)?,
                Operation::Read(buffer) => rig.read(address, buffer)?,
            }
        }
        Ok(())
    }
}

/// Delay provider that records the requested time instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct SimDelay {
    elapsed_ns: Arc<AtomicU64>,
}

impl SimDelay {
    /// Total time waited through this delay and its clones.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Relaxed))
    }
}

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns.fetch_add(u64::from(ns), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photovoltaic_model() {
        let cell = SimCell::photovoltaic(0.02, 0.6);
        assert!((cell.current(0.0) - 0.02).abs() < 1e-12);
        assert!(cell.current(0.6).abs() < 1e-9);
        assert!(cell.current(0.7) < 0.0);
    }

    #[test]
    fn test_unselected_devices_do_not_answer() {
        let mut sim = SimBus::new();
        sim.add_board(1, 0);
        let mut buffer = [0u8; 1];
        assert!(sim.read(32, &mut buffer).is_err());
        sim.write(BUS_SWITCH_ADDRESS, &[1 << 1]).unwrap();
        assert!(sim.read(32, &mut buffer).is_ok());
    }

    #[test]
    fn test_failing_switch_channel() {
        let mut sim = SimBus::new();
        sim.fail_switch_channel(4);
        assert!(sim.write(BUS_SWITCH_ADDRESS, &[1 << 4]).is_err());
        assert!(sim.write(BUS_SWITCH_ADDRESS, &[1 << 3]).is_ok());
        assert_eq!(sim.switch_mask(), 1 << 3);
    }

    #[test]
    fn test_delay_accumulates() {
        let mut delay = SimDelay::default();
        let observer = delay.clone();
        delay.delay_ms(3);
        delay.delay_us(5);
        assert_eq!(observer.elapsed(), Duration::from_micros(3005));
    }
}
