// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Benchmarks for radar cluster reduction.
//!
//! Measures assignment plus merge plus directional-center reduction at
//! typical radar return counts and cluster densities.
//!
//! Run with: cargo bench --bench radar_bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use edgefirst_lidarsim::radar::{cluster_centers, RadarParams};

/// Synthetic radar frame: `n_targets` reflectors, each contributing
/// `returns_per_target` returns spread tightly in distance and azimuth.
fn generate_frame(n_targets: usize, returns_per_target: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let total = n_targets * returns_per_target;
    let mut distance = Vec::with_capacity(total);
    let mut azimuth = Vec::with_capacity(total);
    let mut elevation = Vec::with_capacity(total);

    for t in 0..n_targets {
        // Targets fan out between 5 m and 150 m across a 120 degree FoV.
        let base_distance = 5.0 + 145.0 * (t as f32 / n_targets as f32);
        let base_azimuth = -1.05 + 2.1 * ((t * 7 % n_targets) as f32 / n_targets as f32);
        for r in 0..returns_per_target {
            let jitter = (r as f32 * 0.618).fract();
            distance.push(base_distance + 0.03 * jitter);
            azimuth.push(base_azimuth + 0.002 * jitter);
            elevation.push(0.01 * jitter);
        }
    }
    (distance, azimuth, elevation)
}

fn bench_clustering(c: &mut Criterion) {
    let params = RadarParams {
        distance_separation_m: 0.3,
        azimuth_separation_rad: 0.01,
    };

    let mut group = c.benchmark_group("radar_cluster");
    for (targets, returns) in [(8, 16), (32, 32), (64, 64)] {
        let (distance, azimuth, elevation) = generate_frame(targets, returns);
        group.throughput(Throughput::Elements(distance.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", targets, returns)),
            &(distance, azimuth, elevation),
            |b, (d, a, e)| {
                b.iter(|| cluster_centers(d, a, e, &params));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_clustering);
criterion_main!(benches);
