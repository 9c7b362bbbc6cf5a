// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Graph compilation and validation tests.
//!
//! Everything here exercises the host-side pipeline (ordering,
//! validation, parameter checking), which fails before any device work
//! is issued; no GPU is required.

use edgefirst_lidarsim::{Error, Field, Graph, Mat3x4f, NodePhase};

fn ray_grid(n: usize) -> Vec<Mat3x4f> {
    (0..n)
        .map(|i| Mat3x4f::translation(i as f32 * 0.01, 0.0, 1.0))
        .collect()
}

#[test]
fn cycle_is_rejected_before_any_gpu_work() {
    let graph = Graph::new();
    let a = graph.add_rays_transform(Mat3x4f::IDENTITY).unwrap();
    let b = graph.add_rays_transform(Mat3x4f::IDENTITY).unwrap();
    graph.connect(a, b).unwrap();
    graph.connect(b, a).unwrap();

    let err = graph.run().unwrap_err();
    match &err {
        Error::InvalidPipeline(msg) => {
            assert!(msg.contains("cycle detected"), "unexpected message: {}", msg)
        }
        other => panic!("expected InvalidPipeline, got {:?}", other),
    }

    // Nothing was scheduled.
    assert_eq!(graph.node_phase(a).unwrap(), NodePhase::Idle);
    assert_eq!(graph.node_phase(b).unwrap(), NodePhase::Idle);
}

#[test]
fn missing_input_is_an_invalid_pipeline() {
    let graph = Graph::new();
    let compact = graph.add_points_compact().unwrap();
    let err = graph.run().unwrap_err();
    match err {
        Error::InvalidPipeline(msg) => {
            assert!(msg.contains("exactly one input"), "unexpected: {}", msg)
        }
        other => panic!("expected InvalidPipeline, got {:?}", other),
    }
    assert_eq!(graph.node_phase(compact).unwrap(), NodePhase::Idle);
}

#[test]
fn rays_cannot_feed_a_points_node() {
    let graph = Graph::new();
    let rays = graph.add_rays_from_mat3x4f(&ray_grid(4)).unwrap();
    let compact = graph.add_points_compact().unwrap();
    graph.connect(rays, compact).unwrap();

    let err = graph.run().unwrap_err();
    match err {
        Error::InvalidPipeline(msg) => {
            assert!(msg.contains("cannot consume"), "unexpected: {}", msg)
        }
        other => panic!("expected InvalidPipeline, got {:?}", other),
    }
}

#[test]
fn required_fields_are_checked_against_the_input() {
    // A host point cloud with XYZ only cannot drive radar clustering,
    // which needs DISTANCE, AZIMUTH and ELEVATION.
    let xyz = vec![0u8; 3 * Field::Xyz.size()];
    let graph = Graph::new();
    let points = graph
        .add_points_from_array(3, &[(Field::Xyz, &xyz)])
        .unwrap();
    let radar = graph.add_radar_postprocess(0.2, 0.01).unwrap();
    graph.connect(points, radar).unwrap();

    let err = graph.run().unwrap_err();
    match err {
        Error::InvalidPipeline(msg) => {
            assert!(msg.contains("DISTANCE"), "unexpected: {}", msg)
        }
        other => panic!("expected InvalidPipeline, got {:?}", other),
    }
}

#[test]
fn connection_bookkeeping_is_validated() {
    let graph = Graph::new();
    let a = graph.add_rays_transform(Mat3x4f::IDENTITY).unwrap();
    let b = graph.add_rays_transform(Mat3x4f::IDENTITY).unwrap();

    assert!(matches!(
        graph.connect(a, a),
        Err(Error::InvalidPipeline(_))
    ));

    graph.connect(a, b).unwrap();
    assert!(matches!(
        graph.connect(a, b),
        Err(Error::InvalidPipeline(_))
    ));

    graph.disconnect(a, b).unwrap();
    assert!(matches!(
        graph.disconnect(a, b),
        Err(Error::InvalidPipeline(_))
    ));
}

#[test]
fn node_parameters_are_validated_at_construction() {
    let graph = Graph::new();

    assert!(matches!(
        graph.add_rays_from_mat3x4f(&[]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        graph.add_points_format(&[Field::RayPose]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        graph.add_points_format(&[]),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        graph.add_radar_postprocess(f32::NAN, 0.1),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        graph.add_points_noise_distance(0.0, -0.1, 0.0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        graph.add_filter_ground(-1.0, None),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn outputs_are_unreadable_before_the_first_run() {
    let graph = Graph::new();
    let rays = graph.add_rays_from_mat3x4f(&ray_grid(8)).unwrap();

    assert!(matches!(
        graph.get_width(rays),
        Err(Error::InvalidPipeline(_))
    ));
    assert!(matches!(
        graph.get_field_bytes(rays, Field::RayPose),
        Err(Error::InvalidPipeline(_))
    ));
}

#[test]
fn synchronize_without_a_run_is_a_noop() {
    let graph = Graph::new();
    graph.synchronize().unwrap();
    // Cancelling with no active run is also a no-op.
    graph.cancel();
    graph.synchronize().unwrap();
}

#[test]
fn ring_table_rides_through_a_ray_chain() {
    // Validation alone must accept ring ids flowing through transforms
    // into the ray-trace contract; build the chain and check only the
    // pre-device stages by pointing it at an empty graph run error path.
    let graph = Graph::new();
    let rays = graph.add_rays_from_mat3x4f(&ray_grid(16)).unwrap();
    let rings = graph.add_rays_ring_ids(&[0, 1, 2, 3]).unwrap();
    let moved = graph.add_rays_transform(Mat3x4f::translation(0.0, 0.0, 0.5)).unwrap();
    graph.connect(rays, rings).unwrap();
    graph.connect(rings, moved).unwrap();

    // The chain is structurally valid; with no GPU available the run
    // stops at device initialization, which is not a pipeline error.
    match graph.run() {
        Ok(()) => graph.synchronize().unwrap(),
        Err(Error::NotInitialized(_)) | Err(Error::Device(_)) => {}
        Err(other) => panic!("expected device-layer failure only, got {:?}", other),
    }
}
