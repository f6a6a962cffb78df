// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! The shared I2C bus and its bus switch.
//!
//! The bus switch routes all traffic to one of eight sub-buses. A selection
//! stays in effect for every device until the next [`Bus::select`], which
//! makes the bus a single process-wide resource: there is exactly one [`Bus`]
//! per physical controller and every board or channel operation borrows it
//! mutably.
use std::collections::BTreeSet;
use std::time::Duration;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, I2c};
use octotrack_log::diagnostic;

use crate::{Error, Result};

/// Fixed address of the bus switch.
pub const BUS_SWITCH_ADDRESS: u8 = 0x70;
/// Number of sub-buses behind the bus switch.
pub const SWITCH_CHANNELS: u8 = 8;
/// Lowest and highest non-reserved 7-bit addresses.
const SCAN_RANGE: std::ops::RangeInclusive<u8> = 0x08..=0x77;

const DEFAULT_SWITCH_SETTLE: Duration = Duration::from_millis(100);

pub struct Bus<I, D> {
    i2c: I,
    delay: D,
    switch_settle: Duration,
    active_channel: Option<u8>,
}

impl<I, D> Bus<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Bus {
            i2c,
            delay,
            switch_settle: DEFAULT_SWITCH_SETTLE,
            active_channel: None,
        }
    }

    pub fn with_switch_settle(mut self, settle: Duration) -> Self {
        self.switch_settle = settle;
        self
    }

    /// The sub-bus selected by the last successful [`Bus::select`].
    pub fn active_channel(&self) -> Option<u8> {
        self.active_channel
    }

    pub fn delay(&self) -> &D {
        &self.delay
    }

    pub fn into_parts(self) -> (I, D) {
        (self.i2c, self.delay)
    }
}

impl<I: I2c, D: DelayNs> Bus<I, D> {
    /// Route all subsequent traffic to sub-bus `channel`.
    pub fn select(&mut self, channel: u8) -> Result<()> {
        if channel >= SWITCH_CHANNELS {
            return Err(Error::InvalidChannel(channel));
        }
        // Unknown routing until the switch acknowledged the new mask.
        self.active_channel = None;
        self.write(BUS_SWITCH_ADDRESS, &[1 << channel])?;
        self.settle(self.switch_settle);
        self.active_channel = Some(channel);
        diagnostic!("Selected bus-switch channel {}", channel);
        Ok(())
    }

    /// Disconnect all sub-buses.
    pub fn deselect_all(&mut self) -> Result<()> {
        self.active_channel = None;
        self.write(BUS_SWITCH_ADDRESS, &[0x00])
    }

    /// Addresses that acknowledge a one-byte read on the active sub-bus.
    pub fn scan(&mut self) -> BTreeSet<u8> {
        let mut buffer = [0u8; 1];
        SCAN_RANGE
            .filter(|&address| self.i2c.read(address, &mut buffer).is_ok())
            .collect()
    }

    pub fn write(&mut self, address: u8, bytes: &[u8]) -> Result<()> {
        self.i2c
            .write(address, bytes)
            .map_err(|e| Error::Bus {
                address,
                kind: e.kind(),
            })
    }

    pub fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8]) -> Result<()> {
        self.i2c
            .write_read(address, bytes, buffer)
            .map_err(|e| Error::Bus {
                address,
                kind: e.kind(),
            })
    }

    /// Block for a settle delay mandated by the analog electronics.
    pub fn settle(&mut self, duration: Duration) {
        self.pause(duration);
    }

    /// Block for a pacing interval of the control loops.
    pub fn pause(&mut self, duration: Duration) {
        let micros = u32::try_from(duration.as_micros()).unwrap_or(u32::MAX);
        self.delay.delay_us(micros);
    }
}
