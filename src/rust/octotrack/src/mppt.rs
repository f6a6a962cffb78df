// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Perturb-and-observe maximum power point tracking.
use octotrack_hw::MpptState;
use octotrack_log::{diagnostic, info, warn};

use crate::cell::CellState;
use crate::config::{CellConfig, TrackingParams};
use crate::engine::Clock;
use crate::logger::{RecordSink, TrackingRecord, timestamp};
use crate::probe::CellProbe;
use crate::sweep::{SweepResult, run_sweep};

/// Hill-climbing step rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerturbObserve {
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl PerturbObserve {
    pub fn new(increase_factor: f64, decrease_factor: f64) -> Self {
        PerturbObserve {
            increase_factor,
            decrease_factor,
        }
    }

    pub fn from_params(params: &TrackingParams) -> Self {
        Self::new(params.power_increase_factor, params.power_decrease_factor)
    }

    /// Update `state` with the newly observed `power` and return the next
    /// operating voltage.
    ///
    /// A power gain grows the step. Anything else shrinks it and reverses the
    /// direction. The step stays within the state's bounds either way.
    pub fn step(&self, state: &mut MpptState, power: f64) -> f64 {
        if power > state.last_p() {
            state.set_dv(state.dv() * self.increase_factor);
        } else {
            state.set_dv(state.dv() * self.decrease_factor);
            state.set_direction(state.direction().flipped());
        }
        let next = state.last_v() + state.dv() * state.direction().sign();
        state.set_last_v(next);
        state.set_last_p(power);
        next
    }
}

/// Where a cell stands when a tracking pass reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerPhase {
    /// No operating point yet, a sweep runs first.
    Cold,
    /// Has an operating point but the last sweep is too old.
    Warm,
    /// Only tracking iterations.
    Tracking,
}

impl TrackerPhase {
    pub fn of(state: &CellState, now: f64, params: &TrackingParams) -> Self {
        if !state.initialized {
            TrackerPhase::Cold
        } else if state.sweep_due(now, params.interval_next_jv) {
            TrackerPhase::Warm
        } else {
            TrackerPhase::Tracking
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackReport {
    pub phase: TrackerPhase,
    pub sweep: Option<SweepResult>,
    /// Tracking records written.
    pub records: usize,
    /// Iterations lost to a failed read or a failed voltage write.
    pub skipped: usize,
    /// Samples the record sink failed to store.
    pub unrecorded: usize,
}

/// Run one tracking pass over a cell, preceded by a JV sweep when due.
///
/// Per-sample failures are logged and skipped, so the pass always runs all
/// iterations. The tracker state only advances when its new voltage was
/// applied.
pub fn track_cell<P, S, C>(
    probe: &mut P,
    cell: &CellConfig,
    state: &mut CellState,
    params: &TrackingParams,
    clock: &C,
    sink: &mut S,
) -> TrackReport
where
    P: CellProbe + ?Sized,
    S: RecordSink + ?Sized,
    C: Clock + ?Sized,
{
    let phase = TrackerPhase::of(state, clock.now(), params);
    let mut report = TrackReport {
        phase,
        sweep: None,
        records: 0,
        skipped: 0,
        unrecorded: 0,
    };

    if phase != TrackerPhase::Tracking {
        let sweep = run_sweep(probe, cell, params, sink);
        state.timestamp_last_jv = Some(clock.now());
        state.last_jsc = sweep.jsc().or(state.last_jsc);
        state.last_voc = sweep.voc().or(state.last_voc);
        if !state.initialized {
            match sweep.max_power_point() {
                Some(mpp) => {
                    let (lo, hi) = probe.voltage_limits();
                    probe.mppt_mut().set_last_v(mpp.set_voltage.max(lo).min(hi));
                    state.initialized = true;
                    info!(
                        "Initialized cell {} at {} V (set voltage {} V)",
                        cell.id,
                        mpp.measured_voltage,
                        mpp.set_voltage
                    );
                }
                None => {
                    warn!("Cell {}: sweep gave no samples, staying cold", cell.id);
                }
            }
        }
        // Back to the operating point the sweep moved away from.
        let last_v = probe.mppt().last_v();
        if let Err(err) = probe.set_voltage(last_v) {
            warn!("Cell {}: restoring {} V after the sweep failed, {}", cell.id, last_v, err);
        }
        probe.pause(params.jv_settle());
        report.sweep = Some(sweep);
    }

    let rule = PerturbObserve::from_params(params);
    for _ in 0..params.iterations {
        let (voltage, current) = match probe.read_voltage_and_current() {
            Ok(reading) => reading,
            Err(err) => {
                warn!("Tracking cell {}: skipping iteration, {}", cell.id, err);
                report.skipped += 1;
                continue;
            }
        };
        let (adc_gain_v, adc_gain_c) = probe.gains();
        let record = TrackingRecord {
            timestamp: timestamp(),
            measured_voltage: voltage,
            measured_current: current,
            dac_value: probe.dac_value(),
            adc_gain_v,
            adc_gain_c,
        };
        match sink.tracking_record(&cell.id, &record) {
            Ok(()) => report.records += 1,
            Err(err) => {
                warn!("Tracking cell {}: sample not recorded, {}", cell.id, err);
                report.unrecorded += 1;
            }
        }

        let mut next_state = probe.mppt().clone();
        let next = rule.step(&mut next_state, voltage * current);
        let (lo, hi) = probe.voltage_limits();
        let applied = next.max(lo).min(hi);
        next_state.set_last_v(applied);
        if let Err(err) = probe.set_voltage(applied) {
            warn!(
                "Tracking cell {}: skipping iteration, applying {} V failed, {}",
                cell.id,
                applied,
                err
            );
            report.skipped += 1;
            probe.pause(params.interval());
            continue;
        }
        *probe.mppt_mut() = next_state;
        diagnostic!(
            "Tracking cell {}: {} V, {} A, next {} V (dv {}, {:?})",
            cell.id,
            voltage,
            current,
            applied,
            probe.mppt().dv(),
            probe.mppt().direction()
        );
        probe.pause(params.interval());
    }
    sink.finish_tracking(&cell.id);
    report
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use octotrack_hw::{Direction, Route};
    use proptest::prelude::*;

    use super::*;
    use crate::logger::MemorySink;
    use crate::logger::testing::LimitedSink;
    use crate::probe::testing::ScriptedProbe;

    struct ManualClock(Cell<f64>);

    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            self.0.get()
        }
    }

    fn cell() -> CellConfig {
        CellConfig::new(
            "5",
            Route {
                switch_channel: 0,
                board: 0,
                channel: 1,
            },
        )
    }

    fn rule() -> PerturbObserve {
        PerturbObserve::from_params(&TrackingParams::default())
    }

    /// Cell with its maximum power point near 0.46 V.
    fn cell_model(v: f64) -> f64 {
        0.02 * (1.0 - (v / 0.8).powi(2))
    }

    #[test]
    fn test_rising_power_keeps_direction() {
        let mut state = MpptState::new(0.05, 2e-3, 0.2);
        let mut previous_dv = state.dv();
        for k in 1..30 {
            rule().step(&mut state, f64::from(k) * 1e-3);
            assert!(state.dv() >= previous_dv);
            assert!(state.dv() <= 0.2);
            assert_eq!(state.direction(), Direction::Up);
            previous_dv = state.dv();
        }
        assert_eq!(state.dv(), 0.2);
    }

    #[test]
    fn test_power_drop_flips_once() {
        let mut state = MpptState::new(0.05, 2e-3, 0.2);
        rule().step(&mut state, 0.010);
        let dv = state.dv();
        let v = state.last_v();
        let next = rule().step(&mut state, 0.005);
        assert_eq!(state.direction(), Direction::Down);
        assert!((state.dv() - dv * 0.3).abs() < 1e-15);
        assert!((next - (v - state.dv())).abs() < 1e-15);
        assert_eq!(state.last_p(), 0.005);
        rule().step(&mut state, 0.006);
        assert_eq!(state.direction(), Direction::Down);
    }

    #[test]
    fn test_equal_power_counts_as_decrease() {
        let mut state = MpptState::new(0.05, 2e-3, 0.2);
        rule().step(&mut state, 0.0);
        assert_eq!(state.direction(), Direction::Down);
    }

    #[test]
    fn test_shrinking_step_stops_at_min() {
        let mut state = MpptState::new(0.003, 2e-3, 0.2);
        rule().step(&mut state, -1.0);
        assert_eq!(state.dv(), 2e-3);
    }

    #[test]
    fn test_cold_cell_is_swept_and_seeded() {
        let mut probe = ScriptedProbe::new(cell_model);
        let mut state = CellState::default();
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(0.0));
        let params = TrackingParams::default();
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);

        assert_eq!(report.phase, TrackerPhase::Cold);
        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.samples.len(), 72);
        assert!(state.initialized);
        assert_eq!(state.timestamp_last_jv, Some(0.0));
        assert!((state.last_voc.unwrap() - 0.8).abs() < 0.01);
        assert_eq!(report.records, 10);
        assert_eq!(sink.tracking_of("5").count(), 10);
        assert_eq!(sink.finished_tracking, vec!["5".to_string()]);
        // The operating point was restored before tracking started.
        let mpp = sweep.max_power_point().unwrap();
        assert_eq!(probe.applied[72], mpp.set_voltage);
        assert!((probe.mppt().last_v() - 0.46).abs() < 0.1);
    }

    #[test]
    fn test_initialized_cell_skips_sweep_until_due() {
        let mut probe = ScriptedProbe::new(cell_model);
        let mut state = CellState::default();
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(0.0));
        let params = TrackingParams::default();
        track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);

        clock.0.set(5000.0);
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert_eq!(report.phase, TrackerPhase::Tracking);
        assert!(report.sweep.is_none());
        assert_eq!(sink.sweeps_of("5").count(), 72);

        clock.0.set(10000.5);
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert_eq!(report.phase, TrackerPhase::Warm);
        assert!(report.sweep.is_some());
        assert_eq!(state.timestamp_last_jv, Some(10000.5));
    }

    fn tracking_state() -> CellState {
        CellState {
            timestamp_last_jv: Some(0.0),
            initialized: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_failed_read_consumes_iteration() {
        let mut state = tracking_state();
        let mut probe = ScriptedProbe::new(cell_model).fail_read(0);
        probe.mppt_mut().set_last_v(0.3);
        probe.mppt_mut().set_last_p(0.004);
        let before = probe.mppt().clone();
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(1.0));
        let params = TrackingParams {
            iterations: 1,
            ..Default::default()
        };
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.records, 0);
        assert_eq!(probe.reads(), 1);
        assert!(probe.applied.is_empty());
        assert_eq!(probe.mppt().dv(), before.dv());
        assert_eq!(probe.mppt().direction(), before.direction());
        assert_eq!(probe.mppt().last_p(), before.last_p());
        assert_eq!(probe.mppt().last_v(), before.last_v());
        assert_eq!(sink.finished_tracking, vec!["5".to_string()]);
    }

    #[test]
    fn test_failed_write_keeps_tracker_on_applied_voltage() {
        let mut state = tracking_state();
        // Write 0 is the initial bias; write 5 is the last tracking step.
        let mut probe = ScriptedProbe::new(cell_model).fail_write(5);
        probe.set_voltage(0.3).unwrap();
        probe.mppt_mut().set_last_v(0.3);
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(1.0));
        let params = TrackingParams {
            iterations: 5,
            ..Default::default()
        };
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.records, 5);
        assert_eq!(probe.applied.len(), 5);
        assert_eq!(probe.mppt().last_v(), *probe.applied.last().unwrap());
        assert_eq!(sink.finished_tracking, vec!["5".to_string()]);
    }

    #[test]
    fn test_failed_write_is_retried_from_same_state() {
        let mut state = tracking_state();
        let mut probe = ScriptedProbe::new(cell_model).fail_write(1);
        probe.set_voltage(0.3).unwrap();
        probe.mppt_mut().set_last_v(0.3);
        let before = probe.mppt().clone();
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(1.0));
        let params = TrackingParams {
            iterations: 2,
            ..Default::default()
        };
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert_eq!(report.skipped, 1);
        // The second iteration sees the same reading and steps from the same
        // state, so it applies what the first one failed to.
        let mut expected = before.clone();
        let next = rule().step(&mut expected, 0.3 * cell_model(0.3));
        assert_eq!(probe.applied, vec![0.3, next]);
        assert_eq!(probe.mppt().dv(), expected.dv());
        assert_eq!(probe.mppt().direction(), expected.direction());
    }

    #[test]
    fn test_sink_failure_still_restores_operating_point() {
        let mut probe = ScriptedProbe::new(cell_model);
        let mut state = CellState::default();
        let mut sink = LimitedSink::new(35, 0);
        let clock = ManualClock(Cell::new(0.0));
        let params = TrackingParams::default();
        let report = track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);

        let sweep = report.sweep.unwrap();
        assert_eq!(sweep.samples.len(), 72);
        assert_eq!(sweep.unrecorded, 37);
        assert!(state.initialized);
        assert_eq!(state.timestamp_last_jv, Some(0.0));
        // The operating point was restored right after the sweep.
        let mpp = sweep.max_power_point().unwrap();
        assert_eq!(probe.applied[72], mpp.set_voltage);
        // Tracking kept going without its records.
        assert_eq!(report.records, 0);
        assert_eq!(report.unrecorded, 10);
        assert_eq!(probe.applied.len(), 73 + 10);
        assert_eq!(sink.inner.finished_tracking, vec!["5".to_string()]);
    }

    #[test]
    fn test_tracking_converges_near_peak() {
        let mut probe = ScriptedProbe::new(cell_model);
        let mut state = CellState::default();
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(0.0));
        let params = TrackingParams {
            iterations: 200,
            ..Default::default()
        };
        track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        let tail = &probe.applied[probe.applied.len() - 20..];
        assert!(tail.iter().all(|v| (v - 0.46).abs() < 0.1), "{tail:?}");
    }

    #[test]
    fn test_applied_voltage_is_clamped() {
        let mut state = CellState {
            timestamp_last_jv: Some(0.0),
            initialized: true,
            ..Default::default()
        };
        // Power keeps rising with voltage, pushing the tracker to the limit.
        let mut probe = ScriptedProbe::new(|_| 1.0);
        probe.set_voltage(2.4).unwrap();
        probe.mppt_mut().set_last_v(2.4);
        let mut sink = MemorySink::default();
        let clock = ManualClock(Cell::new(1.0));
        let params = TrackingParams {
            iterations: 5,
            ..Default::default()
        };
        track_cell(&mut probe, &cell(), &mut state, &params, &clock, &mut sink);
        assert!(probe.applied.iter().all(|&v| v <= 2.5));
        assert!(probe.mppt().last_v() <= 2.5);
    }

    proptest! {
        #[test]
        fn step_keeps_dv_in_bounds(
            initial_dv in 0.0f64..0.5,
            powers in prop::collection::vec(-1.0f64..1.0, 1..50),
        ) {
            let mut state = MpptState::new(initial_dv, 2e-3, 0.2);
            for power in powers {
                rule().step(&mut state, power);
                prop_assert!(state.dv() >= 2e-3 && state.dv() <= 0.2);
            }
        }
    }
}
