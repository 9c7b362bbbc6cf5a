// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Benchmarks for the ground-height estimator.
//!
//! Run with: cargo bench --bench ground_bench

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use edgefirst_lidarsim::ground::detect_ground_height;
use edgefirst_lidarsim::math::Vec3f;

/// Synthetic outdoor frame: a flat ground disc plus a few obstacle
/// columns, the usual shape of a parking-lot scan.
fn generate_scene(total: usize) -> Vec<Vec3f> {
    let mut points = Vec::with_capacity(total);
    let ground = (total * 4) / 5;
    for i in 0..ground {
        let angle = i as f32 * 2.399; // golden angle
        let radius = 1.0 + 25.0 * (i as f32 / ground as f32);
        points.push(Vec3f::new(
            radius * angle.cos(),
            radius * angle.sin(),
            -1.7 + 0.02 * (angle * 3.0).sin(),
        ));
    }
    for i in ground..total {
        let column = (i % 6) as f32;
        points.push(Vec3f::new(
            4.0 + column,
            2.0 - column * 0.5,
            -1.5 + ((i % 50) as f32) * 0.05,
        ));
    }
    points
}

fn bench_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("ground_detect");
    for total in [10_000usize, 30_000, 120_000] {
        let points = generate_scene(total);
        group.throughput(Throughput::Elements(total as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(total),
            &points,
            |b, points| {
                b.iter(|| detect_ground_height(points));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_detection);
criterion_main!(benches);
