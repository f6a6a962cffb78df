// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Entry points for an external scheduler.
//!
//! The engine owns the bus, the discovered boards and the runtime state of
//! every cell. Each call is one pass; a failing cell is logged and reported
//! and never stops the pass.
use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use octotrack_hw::{BoardRegistry, Bus};
use octotrack_log::{error, info};

use crate::cell::CellState;
use crate::config::{CellConfig, MeasurementConfig};
use crate::logger::RecordSink;
use crate::mppt::{TrackReport, track_cell};
use crate::probe::CellProbe;
use crate::sweep::{MaxPowerPoint, SweepResult, run_sweep};
use crate::{Error, Result};

pub const BLINK_VOLTAGE: f64 = 2.0;
pub const BLINK_PAUSE: Duration = Duration::from_millis(100);

/// Source of the time used to schedule JV sweeps, in seconds.
pub trait Clock {
    fn now(&self) -> f64;
}

/// Wall clock, seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 * 1e-6
    }
}

/// Outcome of one pass over a set of cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub completed: Vec<String>,
    /// Failed cell ids with the error that stopped them.
    pub failed: Vec<(String, String)>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, cell_id: &str, action: &str, result: Result<()>) {
        match result {
            Ok(()) => self.completed.push(cell_id.to_string()),
            Err(err) => {
                error!("{} cell {} failed: {}", action, cell_id, err);
                self.failed.push((cell_id.to_string(), err.to_string()));
            }
        }
    }
}

pub struct MeasurementEngine<I, D, S, C = SystemClock> {
    bus: Bus<I, D>,
    registry: BoardRegistry,
    cells: HashMap<String, CellState>,
    sink: S,
    clock: C,
}

impl<I: I2c, D: DelayNs, S: RecordSink> MeasurementEngine<I, D, S> {
    /// Discover the boards of all configured cells.
    pub fn initialize(bus: Bus<I, D>, config: &MeasurementConfig, sink: S) -> Result<Self> {
        Self::with_clock(bus, config, sink, SystemClock)
    }
}

impl<I: I2c, D: DelayNs, S: RecordSink, C: Clock> MeasurementEngine<I, D, S, C> {
    pub fn with_clock(
        bus: Bus<I, D>,
        config: &MeasurementConfig,
        sink: S,
        clock: C,
    ) -> Result<Self> {
        config.check_routes()?;
        let mut bus = bus.with_switch_settle(config.hardware.switch_settle());
        let registry =
            BoardRegistry::initialize(&mut bus, config.switch_channels(), &config.hardware)?;
        info!(
            "Measurement '{}' ready with {} cell(s) on {} board(s)",
            config.id,
            config.cells.len(),
            registry.len()
        );
        Ok(MeasurementEngine {
            bus,
            registry,
            cells: HashMap::new(),
            sink,
            clock,
        })
    }

    /// One tracking pass over all active cells in ascending id order.
    pub fn track_all(&mut self, config: &MeasurementConfig) -> PassReport {
        let mut report = PassReport::default();
        for cell in config.ordered_cells() {
            let result = self.track(cell, config).map(|_| ());
            report.record(&cell.id, "Tracking", result);
        }
        report
    }

    /// Track a single cell, sweeping first when due.
    pub fn track(&mut self, cell: &CellConfig, config: &MeasurementConfig) -> Result<TrackReport> {
        let MeasurementEngine {
            bus,
            registry,
            cells,
            sink,
            clock,
        } = self;
        let state = cells.entry(cell.id.clone()).or_default();
        let mut channel = registry.channel(bus, cell.route)?;
        Ok(track_cell(&mut channel, cell, state, &config.tracking, &*clock, sink))
    }

    /// Apply `voltage` to every configured cell, including inactive ones.
    ///
    /// The trackers keep their operating point.
    pub fn set_all_cells_to_voltage(&mut self, config: &MeasurementConfig, voltage: f64) -> PassReport {
        let mut report = PassReport::default();
        for cell in config.all_cells_ordered() {
            let result = self
                .registry
                .channel(&mut self.bus, cell.route)
                .and_then(|mut channel| channel.set_voltage(voltage))
                .map(|_| ())
                .map_err(Error::from);
            report.record(&cell.id, "Setting voltage of", result);
        }
        report
    }

    /// Run a JV sweep on one cell on demand and return to its operating point.
    pub fn sweep_cell(
        &mut self,
        config: &MeasurementConfig,
        cell_id: &str,
    ) -> Result<(SweepResult, Option<MaxPowerPoint>)> {
        let cell = config
            .cell(cell_id)
            .ok_or_else(|| Error::UnknownCell(cell_id.to_string()))?;
        let MeasurementEngine {
            bus,
            registry,
            cells,
            sink,
            clock,
        } = self;
        let mut channel = registry.channel(bus, cell.route)?;
        let result = run_sweep(&mut channel, cell, &config.tracking, sink);

        let state = cells.entry(cell.id.clone()).or_default();
        state.timestamp_last_jv = Some(clock.now());
        state.last_jsc = result.jsc().or(state.last_jsc);
        state.last_voc = result.voc().or(state.last_voc);

        let last_v = channel.mppt().last_v();
        CellProbe::set_voltage(&mut channel, last_v)?;
        CellProbe::pause(&mut channel, config.tracking.jv_settle());
        let mpp = result.max_power_point();
        Ok((result, mpp))
    }

    /// Toggle the listed cells between 2 V and 0 V to find them on the rig.
    pub fn blink(&mut self, config: &MeasurementConfig, cell_ids: &[String], cycles: usize) -> PassReport {
        let mut report = PassReport::default();
        for cell_id in cell_ids {
            let result = self.blink_cell(config, cell_id, cycles);
            report.record(cell_id, "Blinking", result);
        }
        report
    }

    fn blink_cell(&mut self, config: &MeasurementConfig, cell_id: &str, cycles: usize) -> Result<()> {
        let cell = config
            .cell(cell_id)
            .ok_or_else(|| Error::UnknownCell(cell_id.to_string()))?;
        let mut channel = self.registry.channel(&mut self.bus, cell.route)?;
        for _ in 0..cycles {
            channel.set_voltage(BLINK_VOLTAGE)?;
            channel.pause(BLINK_PAUSE);
            let voltage = channel.read_voltage()?;
            info!("Cell {} reads {} V", cell_id, voltage);
            channel.pause(BLINK_PAUSE);
            channel.set_voltage(0.0)?;
            channel.pause(BLINK_PAUSE);
        }
        Ok(())
    }

    pub fn cell_state(&self, cell_id: &str) -> Option<&CellState> {
        self.cells.get(cell_id)
    }

    pub fn registry(&self) -> &BoardRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_parts(self) -> (Bus<I, D>, S) {
        (self.bus, self.sink)
    }
}
