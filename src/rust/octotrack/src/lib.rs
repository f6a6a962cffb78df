// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Measurement control for multiplexed photovoltaic test cells.
//!
//! Cells are characterized with round-trip JV sweeps and then held at their
//! maximum power point by a perturb-and-observe tracker. The
//! [`engine::MeasurementEngine`] drives one pass over all configured cells at
//! a time; an external scheduler decides how often passes run.

pub mod cell;
pub mod config;
pub mod engine;
pub mod logger;
pub mod mppt;
pub mod probe;
pub mod sweep;

pub use cell::CellState;
pub use config::{CellConfig, MeasurementConfig, TrackingParams};
pub use engine::{Clock, MeasurementEngine, PassReport, SystemClock};
pub use logger::{DataLogger, MemorySink, RecordSink, SweepRecord, TrackingRecord};
pub use mppt::{PerturbObserve, TrackReport, TrackerPhase, track_cell};
pub use probe::CellProbe;
pub use sweep::{MaxPowerPoint, SweepOutcome, SweepResult, SweepSample, max_power_point, run_sweep};

use octotrack_hw::Route;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Hardware(#[from] octotrack_hw::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Cells {first} and {second} are both routed to {route}")]
    DuplicateRoute {
        first: String,
        second: String,
        route: Route,
    },

    #[error("No cell with id '{0}' is configured")]
    UnknownCell(String),

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
