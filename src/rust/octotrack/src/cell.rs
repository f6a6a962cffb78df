// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

/// Runtime state of one cell, kept across tracking passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellState {
    /// Completion time of the last JV sweep, in seconds of the engine clock.
    pub timestamp_last_jv: Option<f64>,
    /// Set once a JV sweep seeded the tracker with an operating point.
    pub initialized: bool,
    /// Short-circuit current estimated by the last sweep.
    pub last_jsc: Option<f64>,
    /// Open-circuit voltage estimated by the last sweep.
    pub last_voc: Option<f64>,
}

impl CellState {
    /// Whether a JV sweep is due at `now`.
    pub fn sweep_due(&self, now: f64, interval_next_jv: f64) -> bool {
        match self.timestamp_last_jv {
            Some(last) => now - last > interval_next_jv,
            None => true,
        }
    }
}
