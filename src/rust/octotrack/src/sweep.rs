// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Round-trip JV sweep with overcurrent cutoff, and maximum power point
//! extraction.
//!
//! A sweep visits `lo, lo + step, ...` up to the first point at or above
//! `hi`, then the same points in reverse. The first sample whose current
//! magnitude exceeds the cell's limit sets a ceiling: no point at or above
//! that voltage is applied for the rest of the sweep. The tripping sample
//! itself is kept.
use octotrack_log::{diagnostic, warn};

use crate::config::{CellConfig, TrackingParams};
use crate::logger::{RecordSink, SweepRecord, timestamp};
use crate::probe::CellProbe;

/// Absorbs float noise when the window is an exact multiple of the step.
const STEP_TOLERANCE: f64 = 1e-9;

/// Upper bound on the points of one sweep direction.
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Set points of a round-trip sweep over `[lo, hi]`.
///
/// Empty for a non-positive step, an inverted window, or a step so small
/// that one direction would exceed [`MAX_SWEEP_POINTS`].
pub fn sweep_voltages(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    let valid = step > 0.0 && lo <= hi && lo.is_finite() && hi.is_finite();
    if !valid {
        return Vec::new();
    }
    let intervals = ((hi - lo) / step - STEP_TOLERANCE).ceil().max(0.0);
    if intervals >= MAX_SWEEP_POINTS as f64 {
        warn!(
            "Sweep over [{}, {}] V with step {} V needs more than {} points, not sweeping",
            lo,
            hi,
            step,
            MAX_SWEEP_POINTS
        );
        return Vec::new();
    }
    let intervals = intervals as usize;
    let forward: Vec<f64> = (0..=intervals).map(|k| lo + k as f64 * step).collect();
    let mut points = forward.clone();
    points.extend(forward.iter().rev());
    points
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    pub set_voltage: f64,
    pub measured_voltage: f64,
    pub measured_current: f64,
}

impl SweepSample {
    pub fn power(&self) -> f64 {
        self.measured_voltage * self.measured_current
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepOutcome {
    Complete,
    /// Stopped going up at `trip_voltage` where `trip_current` was measured.
    Truncated { trip_voltage: f64, trip_current: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    pub samples: Vec<SweepSample>,
    /// Number of leading samples taken on the way up.
    pub forward_samples: usize,
    pub outcome: SweepOutcome,
    /// Points dropped because the read failed.
    pub skipped: usize,
    /// Samples the record sink failed to store.
    pub unrecorded: usize,
}

impl SweepResult {
    pub fn is_truncated(&self) -> bool {
        matches!(self.outcome, SweepOutcome::Truncated { .. })
    }

    pub fn forward(&self) -> &[SweepSample] {
        &self.samples[..self.forward_samples.min(self.samples.len())]
    }

    pub fn set_voltages(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.set_voltage).collect()
    }

    pub fn measured_voltages(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.measured_voltage).collect()
    }

    pub fn measured_currents(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.measured_current).collect()
    }

    pub fn max_power_point(&self) -> Option<MaxPowerPoint> {
        max_power_point(&self.samples)
    }

    /// Current of the sample measured closest to zero volt.
    pub fn jsc(&self) -> Option<f64> {
        self.samples
            .iter()
            .min_by(|a, b| {
                a.measured_voltage
                    .abs()
                    .total_cmp(&b.measured_voltage.abs())
            })
            .map(|s| s.measured_current)
    }

    /// Voltage where the current of the forward pass first changes sign,
    /// interpolated linearly between the neighbouring samples.
    pub fn voc(&self) -> Option<f64> {
        self.forward().windows(2).find_map(|pair| {
            let (a, b) = (&pair[0], &pair[1]);
            (a.measured_current > 0.0 && b.measured_current <= 0.0).then(|| {
                let fraction = a.measured_current / (a.measured_current - b.measured_current);
                a.measured_voltage + (b.measured_voltage - a.measured_voltage) * fraction
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxPowerPoint {
    pub set_voltage: f64,
    pub measured_voltage: f64,
    pub measured_current: f64,
}

impl MaxPowerPoint {
    pub fn power(&self) -> f64 {
        self.measured_voltage * self.measured_current
    }
}

/// Sample of maximum power among those with positive voltage and current.
///
/// Falls back to all samples when none lies in the first quadrant. Ties go to
/// the earliest sample.
pub fn max_power_point(samples: &[SweepSample]) -> Option<MaxPowerPoint> {
    let first_of_max = |best: &SweepSample, sample: &SweepSample| sample.power() > best.power();
    let best = samples
        .iter()
        .filter(|s| s.measured_voltage > 0.0 && s.measured_current > 0.0)
        .reduce(|best, s| if first_of_max(best, s) { s } else { best });
    let best = match best {
        Some(best) => best,
        None => {
            if !samples.is_empty() {
                warn!("No sample with positive voltage and current, using all samples");
            }
            samples
                .iter()
                .reduce(|best, s| if first_of_max(best, s) { s } else { best })?
        }
    };
    Some(MaxPowerPoint {
        set_voltage: best.set_voltage,
        measured_voltage: best.measured_voltage,
        measured_current: best.measured_current,
    })
}

/// Sweep `cell` over its JV window.
///
/// Failed actuations and reads skip their point. A sample the sink fails to
/// store is kept in the result; the sweep always runs to its end.
pub fn run_sweep<P, S>(
    probe: &mut P,
    cell: &CellConfig,
    params: &TrackingParams,
    sink: &mut S,
) -> SweepResult
where
    P: CellProbe + ?Sized,
    S: RecordSink + ?Sized,
{
    let (lo, hi) = cell.voltage_limits_jv;
    let points = sweep_voltages(lo, hi, params.jv_step);
    let forward_points = points.len() / 2;
    let mut result = SweepResult {
        samples: Vec::with_capacity(points.len()),
        forward_samples: 0,
        outcome: SweepOutcome::Complete,
        skipped: 0,
        unrecorded: 0,
    };

    for (k, &point) in points.iter().enumerate() {
        let above_ceiling = matches!(
            result.outcome,
            SweepOutcome::Truncated { trip_voltage, .. } if point >= trip_voltage
        );
        if above_ceiling {
            continue;
        }
        let reading = probe.set_voltage(point).and_then(|_| {
            probe.pause(params.jv_settle());
            probe.read_voltage_and_current()
        });
        let (voltage, current) = match reading {
            Ok(reading) => reading,
            Err(err) => {
                warn!("Sweep of cell {} at {} V: skipping point, {}", cell.id, point, err);
                result.skipped += 1;
                continue;
            }
        };
        result.samples.push(SweepSample {
            set_voltage: point,
            measured_voltage: voltage,
            measured_current: current,
        });
        if k < forward_points {
            result.forward_samples += 1;
        }
        let (adc_gain_v, adc_gain_c) = probe.gains();
        let record = SweepRecord {
            timestamp: timestamp(),
            set_voltage: point,
            measured_voltage: voltage,
            measured_current: current,
            dac_value: probe.dac_value(),
            adc_gain_v,
            adc_gain_c,
        };
        if let Err(err) = sink.sweep_record(&cell.id, &record) {
            warn!("Sweep of cell {} at {} V: sample not recorded, {}", cell.id, point, err);
            result.unrecorded += 1;
        }
        diagnostic!(
            "Sweep of cell {}: set {} V, measured {} V, {} A",
            cell.id,
            point,
            voltage,
            current
        );

        if current.abs() > cell.max_allowed_current && !result.is_truncated() {
            warn!(
                "Cell {}: {} A exceeds the limit of {} A at {} V, sweep truncated",
                cell.id,
                current,
                cell.max_allowed_current,
                point
            );
            result.outcome = SweepOutcome::Truncated {
                trip_voltage: point,
                trip_current: current,
            };
        }
    }
    sink.finish_sweep(&cell.id);
    result
}
