// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use octotrack::sweep::sweep_voltages;
use octotrack::{SweepSample, max_power_point};
use std::hint::black_box;

fn diode_sweep(step: f64) -> Vec<SweepSample> {
    sweep_voltages(-0.3, 1.25, step)
        .into_iter()
        .map(|v| SweepSample {
            set_voltage: v,
            measured_voltage: v,
            measured_current: 0.02 - 0.02 * ((v - 0.6) / 0.05).exp(),
        })
        .collect()
}

fn bench_max_power_point(c: &mut Criterion) {
    let steps = [0.045, 0.005, 0.0005];

    let mut group = c.benchmark_group("max_power_point");

    for &step in &steps {
        let samples = diode_sweep(step);
        group.bench_with_input(
            BenchmarkId::new("round_trip", samples.len()),
            &samples,
            |b, samples| {
                b.iter(|| black_box(max_power_point(black_box(samples))));
            },
        );
    }

    group.finish();
}

fn bench_no_first_quadrant(c: &mut Criterion) {
    // Every sample is filtered out, which takes the fallback path.
    let samples: Vec<SweepSample> = diode_sweep(0.0005)
        .into_iter()
        .map(|sample| SweepSample {
            measured_current: -sample.measured_current.abs() - 1e-6,
            ..sample
        })
        .collect();
    c.bench_function("max_power_point_fallback", |b| {
        b.iter(|| black_box(max_power_point(black_box(&samples))));
    });
}

criterion_group!(benches, bench_max_power_point, bench_no_first_quadrant);
criterion_main!(benches);
