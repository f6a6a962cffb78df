// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Measurement configuration.
//!
//! The whole run is described by one JSON document. The control functions
//! receive it by reference on every call, so a changed configuration takes
//! effect with the next pass.
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use octotrack_hw::{HardwareConfig, Route};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Parameters of the tracking loop and the JV sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingParams {
    /// Step growth after a power increase.
    pub power_increase_factor: f64,
    /// Step shrink after a power decrease.
    pub power_decrease_factor: f64,
    /// Tracking iterations per cell and pass.
    pub iterations: usize,
    /// Pause after every tracking iteration, in seconds.
    pub interval: f64,
    /// Voltage step of the JV sweep.
    pub jv_step: f64,
    /// Pause between setting a sweep point and reading it, in seconds.
    pub jv_settle_time: f64,
    /// Minimum time between two JV sweeps of the same cell, in seconds.
    pub interval_next_jv: f64,
}

impl Default for TrackingParams {
    fn default() -> Self {
        TrackingParams {
            power_increase_factor: 1.1,
            power_decrease_factor: 0.3,
            iterations: 10,
            interval: 0.001,
            jv_step: 0.045,
            jv_settle_time: 0.1,
            interval_next_jv: 10000.0,
        }
    }
}

impl TrackingParams {
    pub fn interval(&self) -> Duration {
        seconds(self.interval)
    }

    pub fn jv_settle(&self) -> Duration {
        seconds(self.jv_settle_time)
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn default_max_allowed_current() -> f64 {
    0.05
}

fn default_voltage_limits_jv() -> (f64, f64) {
    (-0.3, 1.25)
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Cell identifier, usually a number.
    pub id: String,
    pub route: Route,
    /// Current magnitude that stops a JV sweep from going any higher, in ampere.
    #[serde(default = "default_max_allowed_current")]
    pub max_allowed_current: f64,
    /// Voltage window of the JV sweep.
    #[serde(default = "default_voltage_limits_jv")]
    pub voltage_limits_jv: (f64, f64),
    #[serde(default = "default_active")]
    pub active: bool,
}

impl CellConfig {
    pub fn new(id: impl Into<String>, route: Route) -> Self {
        CellConfig {
            id: id.into(),
            route,
            max_allowed_current: default_max_allowed_current(),
            voltage_limits_jv: default_voltage_limits_jv(),
            active: default_active(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    pub id: String,
    pub user: String,
    /// Root of the CSV files.
    pub local_folder: PathBuf,
    /// Root of the best-effort copies, none when unset.
    pub network_folder: Option<PathBuf>,
    pub tracking: TrackingParams,
    pub hardware: HardwareConfig,
    pub cells: Vec<CellConfig>,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        MeasurementConfig {
            id: "measurement".to_string(),
            user: String::new(),
            local_folder: PathBuf::from("data"),
            network_folder: None,
            tracking: TrackingParams::default(),
            hardware: HardwareConfig::default(),
            cells: Vec::new(),
        }
    }
}

impl MeasurementConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Fail if two cells are routed to the same channel.
    pub fn check_routes(&self) -> Result<()> {
        let mut seen: HashMap<Route, &str> = HashMap::new();
        for cell in &self.cells {
            if let Some(first) = seen.insert(cell.route, &cell.id) {
                return Err(Error::DuplicateRoute {
                    first: first.to_string(),
                    second: cell.id.clone(),
                    route: cell.route,
                });
            }
        }
        Ok(())
    }

    pub fn cell(&self, id: &str) -> Option<&CellConfig> {
        self.cells.iter().find(|cell| cell.id == id)
    }

    /// Active cells in ascending id order.
    ///
    /// Numeric ids compare by value and come before all other ids.
    pub fn ordered_cells(&self) -> Vec<&CellConfig> {
        let mut cells = self.all_cells_ordered();
        cells.retain(|cell| cell.active);
        cells
    }

    /// All configured cells, active or not, in ascending id order.
    pub fn all_cells_ordered(&self) -> Vec<&CellConfig> {
        let mut cells: Vec<&CellConfig> = self.cells.iter().collect();
        cells.sort_by(|a, b| compare_ids(&a.id, &b.id));
        cells
    }

    /// Bus-switch channels that carry at least one configured cell.
    pub fn switch_channels(&self) -> BTreeSet<u8> {
        self.cells
            .iter()
            .map(|cell| cell.route.switch_channel)
            .collect()
    }
}

pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
