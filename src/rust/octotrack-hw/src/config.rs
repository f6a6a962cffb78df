// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Static hardware parameters of the measurement boards.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::devices::ads1115::AdcGain;

/// Electrical and step-size parameters shared by every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Shunt resistance in ohm.
    pub shunt_resistance: f64,
    /// Voltages outside of this window are never written to a DAC.
    pub voltage_limits: (f64, f64),
    /// Reference voltage of the soft-DAC added to every set point, in volt.
    pub dac_offset: f64,
    /// DAC codes (16-bit scale) per volt.
    pub dac_scale: f64,
    pub adc_gain_voltage: AdcGain,
    pub adc_gain_current: AdcGain,
    /// Settle time after switching the analog multiplexer and the ADC gain, in seconds.
    pub adc_settle_time: f64,
    pub initial_dv: f64,
    pub min_dv: f64,
    pub max_dv: f64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            shunt_resistance: 20.0,
            voltage_limits: (-1.5, 2.5),
            dac_offset: 0.586,
            dac_scale: 16384.0,
            adc_gain_voltage: AdcGain::Two,
            adc_gain_current: AdcGain::Eight,
            adc_settle_time: 0.1,
            initial_dv: 0.05,
            min_dv: 2e-3,
            max_dv: 0.2,
        }
    }
}

impl ChannelConfig {
    pub fn adc_settle(&self) -> Duration {
        Duration::from_secs_f64(self.adc_settle_time.max(0.0))
    }
}

/// Parameters of the bus switch, the boards and their channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Wait after every bus-switch selection, in seconds.
    pub switch_settle_time: f64,
    /// Wait before every gain-stage pin write, in seconds.
    pub gain_stage_settle_time: f64,
    /// Gain-stage level selected when a board is constructed.
    pub gain_stage_index: usize,
    /// Address offsets probed on every sub-bus.
    pub board_offsets: Vec<u8>,
    pub channel: ChannelConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            switch_settle_time: 0.1,
            gain_stage_settle_time: 0.1,
            gain_stage_index: 2,
            board_offsets: (0..4).collect(),
            channel: ChannelConfig::default(),
        }
    }
}

impl HardwareConfig {
    pub fn switch_settle(&self) -> Duration {
        Duration::from_secs_f64(self.switch_settle_time.max(0.0))
    }

    pub fn gain_stage_settle(&self) -> Duration {
        Duration::from_secs_f64(self.gain_stage_settle_time.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: HardwareConfig =
            serde_json::from_str(r#"{"board_offsets": [1], "channel": {"shunt_resistance": 10.0}}"#)
                .unwrap();
        assert_eq!(config.board_offsets, vec![1]);
        assert_eq!(config.channel.shunt_resistance, 10.0);
        assert_eq!(config.channel.adc_gain_current, AdcGain::Eight);
        assert_eq!(config.gain_stage_index, 2);
    }

    #[test]
    fn test_adc_gain_serialized_as_number() {
        let json = serde_json::to_value(ChannelConfig::default()).unwrap();
        assert_eq!(json["adc_gain_voltage"], 2);
        assert_eq!(json["adc_gain_current"], 8);
        assert!(serde_json::from_str::<ChannelConfig>(r#"{"adc_gain_voltage": 3}"#).is_err());
    }
}
