// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Radar-style cluster reduction for point clouds.
//!
//! Points are grouped by distance/azimuth proximity, clusters are merged
//! while their bounding boxes stay within the configured separations, and
//! each cluster is reduced to its directional center: the member point
//! closest (in L1 angular distance) to the midpoint of the cluster's
//! azimuth/elevation ranges.
//!
//! Clustering runs on the host over pinned copies of the DISTANCE,
//! AZIMUTH and ELEVATION fields; the reduced output is gathered on the
//! device from the surviving indices. Complexity is O(n*k) for
//! assignment and O(k^2) per merge pass with k clusters; radar scenes
//! keep k small.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::graph::{Accepts, Caps, ExecCtx, FieldSet, InputData, NodeImpl, NodeOutputs};
use crate::memory::{DeviceAsyncArray, HostPinnedArray};
use crate::points::{ensure_out, points_caps};

/// Clustering separations. A point joins the first cluster whose
/// bounding box, padded by these values, contains it.
#[derive(Debug, Clone, Copy)]
pub struct RadarParams {
    pub distance_separation_m: f32,
    pub azimuth_separation_rad: f32,
}

#[derive(Debug, Clone)]
struct RadarCluster {
    indices: Vec<u32>,
    min_max_distance: [f32; 2],
    min_max_azimuth: [f32; 2],
    min_max_elevation: [f32; 2],
}

impl RadarCluster {
    fn new(index: u32, distance: f32, azimuth: f32, elevation: f32) -> Self {
        Self {
            indices: vec![index],
            min_max_distance: [distance, distance],
            min_max_azimuth: [azimuth, azimuth],
            min_max_elevation: [elevation, elevation],
        }
    }

    fn add_point(&mut self, index: u32, distance: f32, azimuth: f32, elevation: f32) {
        self.indices.push(index);
        self.min_max_distance[0] = self.min_max_distance[0].min(distance);
        self.min_max_distance[1] = self.min_max_distance[1].max(distance);
        self.min_max_azimuth[0] = self.min_max_azimuth[0].min(azimuth);
        self.min_max_azimuth[1] = self.min_max_azimuth[1].max(azimuth);
        self.min_max_elevation[0] = self.min_max_elevation[0].min(elevation);
        self.min_max_elevation[1] = self.min_max_elevation[1].max(elevation);
    }

    fn is_candidate(&self, distance: f32, azimuth: f32, params: &RadarParams) -> bool {
        let d = params.distance_separation_m;
        let a = params.azimuth_separation_rad;
        distance >= self.min_max_distance[0] - d
            && distance <= self.min_max_distance[1] + d
            && azimuth >= self.min_max_azimuth[0] - a
            && azimuth <= self.min_max_azimuth[1] + a
    }

    fn can_merge_with(&self, other: &RadarCluster, params: &RadarParams) -> bool {
        let d = params.distance_separation_m;
        let a = params.azimuth_separation_rad;
        let distance_good = (self.min_max_distance[0] - other.min_max_distance[1]).abs() <= d
            && (self.min_max_distance[1] - other.min_max_distance[0]).abs() <= d;
        let azimuth_good = (self.min_max_azimuth[0] - other.min_max_azimuth[1]).abs() <= a
            && (self.min_max_azimuth[1] - other.min_max_azimuth[0]).abs() <= a;
        distance_good && azimuth_good
    }

    fn take_indices_from(&mut self, other: RadarCluster) {
        self.min_max_distance[0] = self.min_max_distance[0].min(other.min_max_distance[0]);
        self.min_max_distance[1] = self.min_max_distance[1].max(other.min_max_distance[1]);
        self.min_max_azimuth[0] = self.min_max_azimuth[0].min(other.min_max_azimuth[0]);
        self.min_max_azimuth[1] = self.min_max_azimuth[1].max(other.min_max_azimuth[1]);
        self.min_max_elevation[0] = self.min_max_elevation[0].min(other.min_max_elevation[0]);
        self.min_max_elevation[1] = self.min_max_elevation[1].max(other.min_max_elevation[1]);
        self.indices.extend(other.indices);
    }

    /// Member index closest (L1) to the midpoint of the angular bounding
    /// box. Ties resolve to the smallest index.
    fn directional_center(&self, azimuths: &[f32], elevations: &[f32]) -> u32 {
        let mean_azimuth = (self.min_max_azimuth[0] + self.min_max_azimuth[1]) / 2.0;
        let mean_elevation = (self.min_max_elevation[0] + self.min_max_elevation[1]) / 2.0;

        let mut best = self.indices[0];
        let mut best_distance = f32::MAX;
        for &i in &self.indices {
            let distance = (azimuths[i as usize] - mean_azimuth).abs()
                + (elevations[i as usize] - mean_elevation).abs();
            if distance < best_distance || (distance == best_distance && i < best) {
                best_distance = distance;
                best = i;
            }
        }
        best
    }
}

/// Cluster the points and return the directional-center index of each
/// cluster, in cluster creation order.
pub fn cluster_centers(
    distance: &[f32],
    azimuth: &[f32],
    elevation: &[f32],
    params: &RadarParams,
) -> Vec<u32> {
    if distance.is_empty() {
        return Vec::new();
    }

    let mut clusters = vec![RadarCluster::new(0, distance[0], azimuth[0], elevation[0])];
    for i in 1..distance.len() {
        let (d, az, el) = (distance[i], azimuth[i], elevation[i]);
        let slot = clusters.iter_mut().find(|c| c.is_candidate(d, az, params));
        match slot {
            Some(cluster) => cluster.add_point(i as u32, d, az, el),
            None => clusters.push(RadarCluster::new(i as u32, d, az, el)),
        }
    }

    // Merge until a full pass makes no change.
    let mut merged = true;
    while clusters.len() > 1 && merged {
        merged = false;
        'scan: for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                if clusters[i].can_merge_with(&clusters[j], params) {
                    let other = clusters.remove(j);
                    clusters[i].take_indices_from(other);
                    merged = true;
                    break 'scan;
                }
            }
        }
    }

    clusters
        .iter()
        .map(|c| c.directional_center(azimuth, elevation))
        .collect()
}

/// Cluster + directional-center reduction node.
pub(crate) struct RadarPostprocess {
    params: RadarParams,
    host_distance: HostPinnedArray<f32>,
    host_azimuth: HostPinnedArray<f32>,
    host_elevation: HostPinnedArray<f32>,
    center_indices: Arc<DeviceAsyncArray>,
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
}

impl RadarPostprocess {
    pub(crate) fn new(distance_separation_m: f32, azimuth_separation_rad: f32) -> Result<Self> {
        validate_separations(distance_separation_m, azimuth_separation_rad)?;
        Ok(Self {
            params: RadarParams {
                distance_separation_m,
                azimuth_separation_rad,
            },
            host_distance: HostPinnedArray::new(),
            host_azimuth: HostPinnedArray::new(),
            host_elevation: HostPinnedArray::new(),
            center_indices: Arc::new(DeviceAsyncArray::new(Field::RayIdx)),
            outputs: HashMap::new(),
        })
    }

    pub(crate) fn set_separations(
        &mut self,
        distance_separation_m: f32,
        azimuth_separation_rad: f32,
    ) -> Result<()> {
        validate_separations(distance_separation_m, azimuth_separation_rad)?;
        self.params = RadarParams {
            distance_separation_m,
            azimuth_separation_rad,
        };
        Ok(())
    }
}

fn validate_separations(distance_m: f32, azimuth_rad: f32) -> Result<()> {
    if !distance_m.is_finite() || !azimuth_rad.is_finite() || distance_m < 0.0 || azimuth_rad < 0.0
    {
        return Err(Error::InvalidArgument(
            "cluster separations must be finite and non-negative".into(),
        ));
    }
    Ok(())
}

impl NodeImpl for RadarPostprocess {
    fn type_name(&self) -> &'static str {
        "radar_postprocess"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::Distance, Field::Azimuth, Field::Elevation]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.remove(&Field::DynamicFormat);
        fields
    }

    // No per-field output caching here: every run gathers into fresh,
    // registry-pinned arrays.
    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];

        let centers = if input.width == 0 {
            Vec::new()
        } else {
            for (field, pinned) in [
                (Field::Distance, &mut self.host_distance),
                (Field::Azimuth, &mut self.host_azimuth),
                (Field::Elevation, &mut self.host_elevation),
            ] {
                pinned.copy_from_device(input.field(field)?, ctx.stream)?;
            }
            // Clustering reads the pinned copies on the host.
            ctx.stream.synchronize()?;
            cluster_centers(
                self.host_distance.as_slice(),
                self.host_azimuth.as_slice(),
                self.host_elevation.as_slice(),
                &self.params,
            )
        };

        self.center_indices.upload(&centers, ctx.stream)?;
        let indices_ptr = self.center_indices.device_ptr();

        let mut fields = HashMap::new();
        for (f, arr) in &input.fields {
            if *f == Field::DynamicFormat {
                continue;
            }
            let out = ensure_out(&mut self.outputs, *f);
            out.resize(centers.len(), false, false, ctx.stream)?;
            device::gpu_gather(
                ctx.stream,
                centers.len(),
                indices_ptr,
                out.device_ptr(),
                arr.device_ptr(),
                f.size(),
            )?;
            fields.insert(*f, out);
        }
        Ok(NodeOutputs {
            width: centers.len(),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEG: f32 = std::f32::consts::PI / 180.0;

    #[test]
    fn two_clusters_with_directional_centers() {
        // Three near-identical returns around 10 m plus one far return.
        let distance = [10.0, 10.05, 50.0, 10.03];
        let azimuth = [0.0, 0.1 * DEG, 0.0, 0.05 * DEG];
        let elevation = [0.0; 4];
        let params = RadarParams {
            distance_separation_m: 0.2,
            azimuth_separation_rad: 0.5 * DEG,
        };

        let centers = cluster_centers(&distance, &azimuth, &elevation, &params);
        assert_eq!(centers.len(), 2, "expected a dense cluster plus a singleton");

        // The dense cluster spans azimuth [0, 0.1deg]; its midpoint is
        // 0.05deg, which is exactly point 3.
        assert!(centers.contains(&3), "dense cluster centers on point 3");
        assert!(centers.contains(&2), "far return stays its own cluster");
    }

    #[test]
    fn clustering_is_idempotent_on_its_own_output() {
        let distance = [10.0, 10.05, 50.0, 10.03];
        let azimuth = [0.0, 0.1 * DEG, 0.0, 0.05 * DEG];
        let elevation = [0.0; 4];
        let params = RadarParams {
            distance_separation_m: 0.2,
            azimuth_separation_rad: 0.5 * DEG,
        };

        let centers = cluster_centers(&distance, &azimuth, &elevation, &params);
        let d2: Vec<f32> = centers.iter().map(|&i| distance[i as usize]).collect();
        let a2: Vec<f32> = centers.iter().map(|&i| azimuth[i as usize]).collect();
        let e2: Vec<f32> = centers.iter().map(|&i| elevation[i as usize]).collect();

        let again = cluster_centers(&d2, &a2, &e2, &params);
        let identity: Vec<u32> = (0..centers.len() as u32).collect();
        assert_eq!(again, identity, "each cluster must collapse to itself");
    }

    #[test]
    fn first_matching_cluster_wins() {
        // Both clusters could take the last point; input order says the
        // first one does.
        let distance = [10.0, 10.4, 10.2];
        let azimuth = [0.0, 0.0, 0.0];
        let elevation = [0.0; 3];
        let params = RadarParams {
            distance_separation_m: 0.25,
            azimuth_separation_rad: 1.0,
        };

        let centers = cluster_centers(&distance, &azimuth, &elevation, &params);
        assert_eq!(centers.len(), 2);
    }

    #[test]
    fn merge_rule_requires_both_dimensions() {
        let a = RadarCluster::new(0, 10.0, 0.0, 0.0);
        let mut b = RadarCluster::new(1, 10.1, 0.05, 0.0);
        let params = RadarParams {
            distance_separation_m: 0.2,
            azimuth_separation_rad: 0.1,
        };
        assert!(a.can_merge_with(&b, &params));

        // Push b's azimuth span outside the separation.
        b.add_point(2, 10.12, 0.5, 0.0);
        assert!(!a.can_merge_with(&b, &params));
    }

    #[test]
    fn directional_center_breaks_ties_toward_smallest_index() {
        let mut c = RadarCluster::new(0, 10.0, -0.1, 0.0);
        c.add_point(1, 10.0, 0.1, 0.0);
        // Midpoint azimuth is 0; both members are equidistant from it.
        let azimuth = [-0.1, 0.1];
        let elevation = [0.0, 0.0];
        assert_eq!(c.directional_center(&azimuth, &elevation), 0);
    }

    #[test]
    fn empty_input_yields_no_clusters() {
        let params = RadarParams {
            distance_separation_m: 0.1,
            azimuth_separation_rad: 0.1,
        };
        assert!(cluster_centers(&[], &[], &[], &params).is_empty());
    }
}
