// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Board discovery and the registry of all boards behind the bus switch.
use std::collections::BTreeSet;
use std::fmt;

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use indexmap::IndexMap;
use octotrack_log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::config::HardwareConfig;
use crate::{Board, Bus, Error, Result};

const EXPANDER_BASE: u8 = 32;
const ADC_BASE: u8 = 72;
const DAC0_BASE: u8 = 96;
const DAC1_BASE: u8 = 97;

/// Device addresses of the board at one address offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardAddresses {
    pub offset: u8,
    pub expander: u8,
    pub adc: u8,
    pub dac0: u8,
    pub dac1: u8,
}

impl BoardAddresses {
    pub fn for_offset(offset: u8) -> Self {
        BoardAddresses {
            offset,
            expander: EXPANDER_BASE + offset,
            adc: ADC_BASE + offset,
            dac0: DAC0_BASE + 2 * offset,
            dac1: DAC1_BASE + 2 * offset,
        }
    }

    pub fn all(&self) -> [u8; 4] {
        [self.expander, self.adc, self.dac0, self.dac1]
    }
}

/// Check that every device of the board at `offset` answered the scan.
pub fn probe_offset(found: &BTreeSet<u8>, offset: u8) -> Result<BoardAddresses> {
    let addresses = BoardAddresses::for_offset(offset);
    let missing: Vec<u8> = addresses
        .all()
        .into_iter()
        .filter(|address| !found.contains(address))
        .collect();
    if !missing.is_empty() {
        return Err(Error::HardwareNotFound { offset, missing });
    }
    Ok(addresses)
}

/// Construct a board for every offset whose complete device set is present on
/// the selected sub-bus.
///
/// Incomplete device sets are skipped. An error while constructing a board
/// whose devices were all found aborts the discovery.
pub fn discover<I: I2c, D: DelayNs>(
    bus: &mut Bus<I, D>,
    offsets: &[u8],
    config: &HardwareConfig,
) -> Result<Vec<Board>> {
    let found = bus.scan();
    info!("Found I2C devices at addresses {:?}", found);
    let mut boards = Vec::new();
    for &offset in offsets {
        match probe_offset(&found, offset) {
            Ok(_) => {
                let board = Board::new(bus, offset, config)?;
                boards.push(board);
            }
            Err(err) => {
                warn!("Skipping board: {}", err);
            }
        }
    }
    Ok(boards)
}

/// Location of a channel: bus-switch channel, board offset and channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Route {
    pub switch_channel: u8,
    pub board: u8,
    pub channel: usize,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "switch {} / board {} / channel {}",
            self.switch_channel, self.board, self.channel
        )
    }
}

/// All boards, keyed by bus-switch channel and address offset.
#[derive(Debug, Default)]
pub struct BoardRegistry {
    boards: IndexMap<(u8, u8), Board>,
}

impl BoardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discover the boards behind every listed bus-switch channel.
    ///
    /// All sub-buses are disconnected again afterwards.
    pub fn initialize<I: I2c, D: DelayNs>(
        bus: &mut Bus<I, D>,
        switch_channels: impl IntoIterator<Item = u8>,
        config: &HardwareConfig,
    ) -> Result<Self> {
        let switch_channels: BTreeSet<u8> = switch_channels.into_iter().collect();
        let mut registry = BoardRegistry::new();
        for switch_channel in switch_channels {
            bus.select(switch_channel)?;
            for board in discover(bus, &config.board_offsets, config)? {
                registry.insert(switch_channel, board);
            }
        }
        bus.deselect_all()?;
        info!("Registered {} board(s)", registry.len());
        Ok(registry)
    }

    /// Returns the board previously registered at the same location, if any.
    pub fn insert(&mut self, switch_channel: u8, board: Board) -> Option<Board> {
        self.boards.insert((switch_channel, board.offset()), board)
    }

    pub fn board(&self, switch_channel: u8, offset: u8) -> Option<&Board> {
        self.boards.get(&(switch_channel, offset))
    }

    pub fn board_mut(&mut self, switch_channel: u8, offset: u8) -> Option<&mut Board> {
        self.boards.get_mut(&(switch_channel, offset))
    }

    /// Select the route's sub-bus and borrow its channel.
    pub fn channel<'a, I: I2c, D: DelayNs>(
        &'a mut self,
        bus: &'a mut Bus<I, D>,
        route: Route,
    ) -> Result<Channel<'a, I, D>> {
        let board = self
            .boards
            .get_mut(&(route.switch_channel, route.board))
            .ok_or(Error::BoardNotRegistered {
                switch_channel: route.switch_channel,
                offset: route.board,
            })?;
        bus.select(route.switch_channel)?;
        board.channel(bus, route.channel)
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    /// Boards in registration order with their bus-switch channel.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Board)> {
        self.boards
            .iter()
            .map(|(&(switch_channel, _), board)| (switch_channel, board))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sim::{SimBus, SimDelay};

    fn quick_config() -> HardwareConfig {
        HardwareConfig {
            switch_settle_time: 0.0,
            gain_stage_settle_time: 0.0,
            ..Default::default()
        }
    }

    fn bus(sim: &SimBus) -> Bus<SimBus, SimDelay> {
        Bus::new(sim.clone(), SimDelay::default()).with_switch_settle(Duration::ZERO)
    }

    #[test]
    fn test_addresses_for_offset() {
        assert_eq!(BoardAddresses::for_offset(0).all(), [32, 72, 96, 97]);
        assert_eq!(BoardAddresses::for_offset(3).all(), [35, 75, 102, 103]);
    }

    #[test]
    fn test_probe_offset() {
        let found = BTreeSet::from([32, 72, 96, 97]);
        assert!(probe_offset(&found, 0).is_ok());
        for offset in 1..4 {
            assert!(matches!(
                probe_offset(&found, offset),
                Err(Error::HardwareNotFound { .. })
            ));
        }
        let partial = BTreeSet::from([33, 73, 98]);
        match probe_offset(&partial, 1) {
            Err(Error::HardwareNotFound { offset, missing }) => {
                assert_eq!(offset, 1);
                assert_eq!(missing, vec![99]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_discover_only_complete_boards() {
        let sim = SimBus::new();
        sim.add_board(0, 0);
        sim.add_board(0, 2);
        // Offset 2 loses one DAC.
        sim.remove_device(0, 101);
        let mut bus = bus(&sim);
        bus.select(0).unwrap();
        let boards = discover(&mut bus, &[0, 1, 2, 3], &quick_config()).unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].offset(), 0);
    }

    #[test]
    fn test_discover_keeps_offset_order() {
        let sim = SimBus::new();
        sim.add_board(4, 3);
        sim.add_board(4, 1);
        let mut bus = bus(&sim);
        bus.select(4).unwrap();
        let boards = discover(&mut bus, &[3, 0, 1], &quick_config()).unwrap();
        let offsets: Vec<u8> = boards.iter().map(Board::offset).collect();
        assert_eq!(offsets, vec![3, 1]);
    }

    #[test]
    fn test_discover_propagates_construction_errors() {
        let sim = SimBus::new();
        sim.add_board(0, 0);
        let mut bus = bus(&sim);
        bus.select(0).unwrap();
        let config = HardwareConfig {
            gain_stage_index: 12,
            ..quick_config()
        };
        assert!(matches!(
            discover(&mut bus, &[0], &config),
            Err(Error::InvalidGain { index: 12, .. })
        ));
    }

    #[test]
    fn test_registry() {
        let sim = SimBus::new();
        sim.add_board(1, 0);
        sim.add_board(5, 0);
        sim.add_board(5, 3);
        let mut bus = bus(&sim);
        let mut registry = BoardRegistry::initialize(&mut bus, [5, 1, 5], &quick_config()).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(sim.switch_mask(), 0);
        assert_eq!(bus.active_channel(), None);
        let locations: Vec<(u8, u8)> = registry.iter().map(|(sw, b)| (sw, b.offset())).collect();
        assert_eq!(locations, vec![(1, 0), (5, 0), (5, 3)]);
        assert_eq!(registry.board(5, 3).unwrap().id(), "Bus_5_offset3_");

        let route = Route {
            switch_channel: 5,
            board: 3,
            channel: 2,
        };
        let channel = registry.channel(&mut bus, route).unwrap();
        assert_eq!(channel.id(), "Bus_5_offset3_channel_2");
        assert_eq!(sim.switch_mask(), 1 << 5);
    }

    #[test]
    fn test_registry_unknown_board() {
        let sim = SimBus::new();
        sim.add_board(1, 0);
        let mut bus = bus(&sim);
        let mut registry = BoardRegistry::initialize(&mut bus, [1], &quick_config()).unwrap();
        let route = Route {
            switch_channel: 2,
            board: 0,
            channel: 0,
        };
        assert!(matches!(
            registry.channel(&mut bus, route),
            Err(Error::BoardNotRegistered {
                switch_channel: 2,
                offset: 0
            })
        ));
        // Nothing was selected for an unknown board.
        assert_eq!(bus.active_channel(), None);
    }
}
