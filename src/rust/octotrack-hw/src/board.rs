// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! A measurement board: GPIO expander, ADC, two DACs and eight channels.
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use octotrack_log::{diagnostic, info};

use crate::channel::{Channel, ChannelState};
use crate::config::HardwareConfig;
use crate::devices::ads1115::Ads1115;
use crate::devices::mcp23017::Mcp23017;
use crate::devices::mcp4728::Mcp4728;
use crate::discovery::BoardAddresses;
use crate::gain_stage::GainStage;
use crate::{Bus, Error, Result};

pub const CHANNELS: usize = 8;

/// Multiplexer input wired to each logical channel, by mux address.
pub(crate) const ANALOG_MUX_MAP: [usize; CHANNELS] = [6, 5, 4, 7, 3, 0, 2, 1];
/// Expander pins carrying the three mux address bits, lowest bit first.
pub(crate) const MUX_ADDRESS_PINS: [u8; 3] = [4, 5, 6];
/// Active-low enable of the analog multiplexer.
pub(crate) const MUX_ENABLE_PIN: u8 = 7;

/// Devices shared by all channels of a board.
#[derive(Debug)]
pub struct BoardDevices {
    pub(crate) expander: Mcp23017,
    pub(crate) adc: Ads1115,
    pub(crate) dacs: [Mcp4728; 2],
    pub(crate) gain_stage: GainStage,
}

impl BoardDevices {
    /// Route logical channel `channel` to the ADC inputs.
    pub fn select_analog_channel<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        channel: usize,
    ) -> Result<()> {
        let address = mux_address(channel)?;
        for (bit, &pin) in MUX_ADDRESS_PINS.iter().enumerate() {
            self.expander
                .set_pin_output(bus, pin, (address >> bit) & 1 == 1)?;
        }
        diagnostic!("Analog mux: channel {} on mux input {}", channel, address);
        Ok(())
    }

    pub fn enable_analog_mux<I: I2c, D: DelayNs>(&mut self, bus: &mut Bus<I, D>) -> Result<()> {
        self.expander.set_pin_output(bus, MUX_ENABLE_PIN, false)
    }

    pub fn disable_analog_mux<I: I2c, D: DelayNs>(&mut self, bus: &mut Bus<I, D>) -> Result<()> {
        self.expander.set_pin_output(bus, MUX_ENABLE_PIN, true)
    }
}

/// Mux address of a logical channel.
pub fn mux_address(channel: usize) -> Result<usize> {
    ANALOG_MUX_MAP
        .iter()
        .position(|&c| c == channel)
        .ok_or(Error::InvalidBoardChannel(channel))
}

#[derive(Debug)]
pub struct Board {
    switch_channel: Option<u8>,
    addresses: BoardAddresses,
    id: String,
    devices: BoardDevices,
    channels: [ChannelState; CHANNELS],
}

impl Board {
    /// Construct the board behind `offset` on the currently selected sub-bus.
    ///
    /// The gain stage is driven to its initial level, so the devices must
    /// answer. A failure here leaves no board behind.
    pub fn new<I: I2c, D: DelayNs>(
        bus: &mut Bus<I, D>,
        offset: u8,
        config: &HardwareConfig,
    ) -> Result<Self> {
        let addresses = BoardAddresses::for_offset(offset);
        let switch_channel = bus.active_channel();
        let mut expander = Mcp23017::new(addresses.expander);
        let gain_stage = GainStage::initialize(
            bus,
            &mut expander,
            config.gain_stage_settle(),
            config.gain_stage_index,
        )?;
        let devices = BoardDevices {
            expander,
            adc: Ads1115::new(addresses.adc),
            dacs: [Mcp4728::new(addresses.dac0), Mcp4728::new(addresses.dac1)],
            gain_stage,
        };
        let mut channels = Vec::with_capacity(CHANNELS);
        for index in 0..CHANNELS {
            channels.push(ChannelState::new(index, &config.channel)?);
        }
        let channels: [ChannelState; CHANNELS] = channels
            .try_into()
            .map_err(|_| Error::new("Board channel table has the wrong length"))?;
        let id = board_id(switch_channel, offset);
        info!(
            "Initialized board {} (gain stage {} V)",
            id,
            devices.gain_stage.voltage()
        );
        Ok(Board {
            switch_channel,
            addresses,
            id,
            devices,
            channels,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn offset(&self) -> u8 {
        self.addresses.offset
    }

    pub fn switch_channel(&self) -> Option<u8> {
        self.switch_channel
    }

    pub fn addresses(&self) -> &BoardAddresses {
        &self.addresses
    }

    pub fn gain_stage(&self) -> &GainStage {
        &self.devices.gain_stage
    }

    pub fn channel_state(&self, index: usize) -> Option<&ChannelState> {
        self.channels.get(index)
    }

    pub fn channel_states(&self) -> impl Iterator<Item = &ChannelState> {
        self.channels.iter()
    }

    /// Borrow channel `index` for actuation and read-back.
    ///
    /// The caller must have selected this board's sub-bus.
    pub fn channel<'a, I, D>(
        &'a mut self,
        bus: &'a mut Bus<I, D>,
        index: usize,
    ) -> Result<Channel<'a, I, D>> {
        let state = self
            .channels
            .get_mut(index)
            .ok_or(Error::InvalidBoardChannel(index))?;
        Ok(Channel::new(bus, &mut self.devices, state, &self.id))
    }

    pub fn set_gain_stage<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        index: usize,
    ) -> Result<()> {
        let devices = &mut self.devices;
        devices
            .gain_stage
            .set_gain(bus, &mut devices.expander, index)
    }

    pub fn select_analog_channel<I: I2c, D: DelayNs>(
        &mut self,
        bus: &mut Bus<I, D>,
        channel: usize,
    ) -> Result<()> {
        self.devices.select_analog_channel(bus, channel)
    }

    pub fn enable_analog_mux<I: I2c, D: DelayNs>(&mut self, bus: &mut Bus<I, D>) -> Result<()> {
        self.devices.enable_analog_mux(bus)
    }

    pub fn disable_analog_mux<I: I2c, D: DelayNs>(&mut self, bus: &mut Bus<I, D>) -> Result<()> {
        self.devices.disable_analog_mux(bus)
    }
}

fn board_id(switch_channel: Option<u8>, offset: u8) -> String {
    match switch_channel {
        Some(switch_channel) => format!("Bus_{switch_channel}_offset{offset}_"),
        None => format!("offset{offset}_"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::devices::mcp4728::DacChannel;
    use crate::sim::{SimBus, SimCell, SimDelay};
    use crate::{AdcGain, Route};

    fn quick_config() -> HardwareConfig {
        let mut config = HardwareConfig {
            switch_settle_time: 0.0,
            gain_stage_settle_time: 0.0,
            ..Default::default()
        };
        config.channel.adc_settle_time = 0.0;
        config
    }

    fn setup(switch: u8, offset: u8) -> (SimBus, Bus<SimBus, SimDelay>, Board) {
        let sim = SimBus::new();
        sim.add_board(switch, offset);
        let mut bus = Bus::new(sim.clone(), SimDelay::default()).with_switch_settle(Duration::ZERO);
        bus.select(switch).unwrap();
        let board = Board::new(&mut bus, offset, &quick_config()).unwrap();
        (sim, bus, board)
    }

    #[test]
    fn test_mux_address_table() {
        let addresses: Vec<usize> = (0..CHANNELS).map(|c| mux_address(c).unwrap()).collect();
        assert_eq!(addresses, vec![5, 7, 6, 4, 2, 1, 0, 3]);
        assert!(mux_address(8).is_err());
    }

    #[test]
    fn test_new_board() {
        let (sim, _bus, board) = setup(3, 1);
        assert_eq!(board.id(), "Bus_3_offset1_");
        assert_eq!(board.offset(), 1);
        assert_eq!(board.switch_channel(), Some(3));
        assert_eq!(board.gain_stage().gain(), 2);
        assert_eq!(board.channel_states().count(), CHANNELS);
        // Gain level 2 drives pin 9 only.
        assert_eq!(sim.expander_outputs(3, 1), Some(1 << 9));
    }

    #[test]
    fn test_new_board_without_devices_fails() {
        let sim = SimBus::new();
        let mut bus = Bus::new(sim, SimDelay::default());
        assert!(Board::new(&mut bus, 0, &quick_config()).is_err());
    }

    #[test]
    fn test_select_analog_channel_drives_address_pins() {
        let (sim, mut bus, mut board) = setup(0, 0);
        board.select_analog_channel(&mut bus, 1).unwrap();
        // Channel 1 is mux input 7: pins 4, 5 and 6 high, next to gain pin 9.
        assert_eq!(sim.expander_outputs(0, 0), Some(0b111 << 4 | 1 << 9));
        board.select_analog_channel(&mut bus, 5).unwrap();
        assert_eq!(sim.expander_outputs(0, 0), Some(1 << 4 | 1 << 9));
        board.enable_analog_mux(&mut bus).unwrap();
        assert_eq!(sim.expander_outputs(0, 0), Some(1 << 4 | 1 << 9));
        board.disable_analog_mux(&mut bus).unwrap();
        assert_eq!(sim.expander_outputs(0, 0), Some(1 << 4 | 1 << 7 | 1 << 9));
    }

    #[test]
    fn test_channel_dac_binding() {
        let (sim, mut bus, mut board) = setup(0, 0);
        let mut channel = board.channel(&mut bus, 6).unwrap();
        assert_eq!(channel.id(), "Bus_0_offset0_channel_6");
        assert_eq!(channel.set_voltage(0.0).unwrap(), 0.0);
        assert_eq!(channel.dac_value(), 9601 >> 4);
        assert_eq!(sim.dac_code(0, 97, DacChannel::C), Some(9601 >> 4));
        assert_eq!(sim.dac_code(0, 96, DacChannel::C), Some(0));
    }

    #[test]
    fn test_set_voltage_is_clamped() {
        let (sim, mut bus, mut board) = setup(0, 0);
        let mut channel = board.channel(&mut bus, 0).unwrap();
        assert_eq!(channel.set_voltage(10.0).unwrap(), 2.5);
        assert_eq!(sim.dac_code(0, 96, DacChannel::A), Some(50561 >> 4));
        assert!(channel.set_voltage(f64::NAN).is_err());
        assert_eq!(sim.dac_code(0, 96, DacChannel::A), Some(50561 >> 4));
    }

    #[test]
    fn test_read_back_follows_cell_model() {
        let (sim, mut bus, mut board) = setup(2, 0);
        let route = Route {
            switch_channel: 2,
            board: 0,
            channel: 3,
        };
        sim.attach_cell(route, SimCell::resistor(100.0));
        let mut channel = board.channel(&mut bus, 3).unwrap();
        channel.set_voltage(0.5).unwrap();
        let (voltage, current) = channel.read_voltage_and_current().unwrap();
        assert!((voltage - 0.5).abs() < 2e-3, "voltage {voltage}");
        assert!((current - 0.005).abs() < 1e-4, "current {current}");
        assert_eq!(channel.gains(), (AdcGain::Two, AdcGain::Eight));
    }

    #[test]
    fn test_invalid_channel_index() {
        let (_sim, mut bus, mut board) = setup(0, 0);
        assert!(matches!(
            board.channel(&mut bus, 8),
            Err(Error::InvalidBoardChannel(8))
        ));
    }
}
