// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! EdgeFirst LiDAR/Radar Simulation Library
//!
//! Simulates LiDAR and radar sensors against triangle-mesh scenes using
//! GPU ray tracing (OptiX), producing structure-of-arrays point clouds
//! with configurable post-processing.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐    ┌─────────────────────────────────────────────┐
//! │   Scene    │    │                  Graph                      │
//! │ meshes     │    │  rays ─► raytrace ─► compact ─► format ─►   │
//! │ entities   │◄───┤              │                      yield   │
//! │ GAS / IAS  │    │              └─► noise ─► radar/ground ...  │
//! └────────────┘    └─────────────────────────────────────────────┘
//! ```
//!
//! Callers build a [`Scene`] of meshes and instanced entities, assemble
//! a [`Graph`] of processing nodes, and run it. Each run compiles the
//! node DAG (topological order plus validation), commits the scene's
//! acceleration structures, and enqueues every node on a dedicated CUDA
//! stream. Point data flows between nodes as per-field device arrays;
//! see [`Field`] for the attribute catalogue.
//!
//! # Modules
//!
//! - [`scene`]: meshes, entities, textures, acceleration structures
//! - [`graph`]: the processing-graph runtime
//! - [`field`]: per-point attribute tags and layout helpers
//! - [`math`]: device-shared vector/transform types
//! - [`memory`]: device and pinned-host arrays
//! - [`radar`]: radar cluster reduction
//! - [`ground`]: ground-plane classification
//! - [`config`]: environment-driven logging/tape configuration
//!
//! # Example
//!
//! ```ignore
//! use edgefirst_lidarsim::{Field, Graph, Mat3x4f, Scene};
//! use std::sync::Arc;
//!
//! let scene = Arc::new(Scene::new());
//! let mesh = scene.add_mesh(&vertices, &indices)?;
//! scene.add_entity(mesh, Mat3x4f::IDENTITY, 0)?;
//!
//! let graph = Graph::new();
//! let rays = graph.add_rays_from_mat3x4f(&ray_poses)?;
//! let trace = graph.add_raytrace(&scene, 100.0)?;
//! let hits = graph.add_points_compact()?;
//! let out = graph.add_points_yield(&[Field::Xyz, Field::Distance])?;
//! graph.connect(rays, trace)?;
//! graph.connect(trace, hits)?;
//! graph.connect(hits, out)?;
//!
//! graph.run()?;
//! graph.synchronize()?;
//! let xyz = graph.get_field_data::<f32>(out, Field::Xyz)?;
//! ```

pub mod config;
pub mod error;
pub mod field;
pub mod graph;
pub mod ground;
pub mod math;
pub mod memory;
pub mod radar;
pub mod scene;

mod device;
mod points;
mod rays;

// Re-exports for convenience
pub use config::Config;
pub use device::gpu_available;
pub use error::{Error, Result};
pub use field::Field;
pub use graph::{Graph, NodeId, NodePhase};
pub use math::{Mat3x4f, Vec3f, Vec3i};
pub use scene::{EntityId, MeshId, Scene, TextureId};
