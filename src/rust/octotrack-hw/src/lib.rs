// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Hardware-channel control layer for multiplexed photovoltaic test boards.
//!
//! A single I2C controller reaches up to eight sub-buses through a bus switch.
//! Each sub-bus carries up to four measurement boards, each with a GPIO
//! expander (analog multiplexer and gain-stage control), one ADC and two
//! quad-channel DACs driving eight cell channels.
//!
//! All traffic goes through one [`Bus`] handle. Every operation that touches
//! hardware borrows it mutably, so bus-switch selection and device I/O cannot
//! interleave.

pub mod board;
pub mod bus;
pub mod channel;
pub mod config;
pub mod devices;
pub mod discovery;
pub mod gain_stage;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use board::Board;
pub use bus::Bus;
pub use channel::{Channel, ChannelState, Direction, MpptState};
pub use config::{ChannelConfig, HardwareConfig};
pub use devices::ads1115::AdcGain;
pub use discovery::{BoardAddresses, BoardRegistry, Route, discover};
pub use gain_stage::GainStage;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Bus-switch channel {0} is out of range 0..=7")]
    InvalidChannel(u8),

    #[error("Board channel {0} is out of range 0..=7")]
    InvalidBoardChannel(usize),

    #[error("Gain index {index} is out of range (table has {levels} levels)")]
    InvalidGain { index: usize, levels: usize },

    #[error("No complete device set for board offset {offset}, missing addresses {missing:?}")]
    HardwareNotFound { offset: u8, missing: Vec<u8> },

    #[error("No board registered at bus-switch channel {switch_channel}, offset {offset}")]
    BoardNotRegistered { switch_channel: u8, offset: u8 },

    #[error("I2C transfer to address {address:#04x} failed: {kind:?}")]
    Bus {
        address: u8,
        kind: embedded_hal::i2c::ErrorKind,
    },

    #[error("ADC at address {0:#04x} did not finish its conversion")]
    ConversionTimeout(u8),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn new<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        Error::Anyhow(anyhow::anyhow!(msg.to_string()))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
