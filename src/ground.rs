// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Ground-plane classification for simulated point clouds.
//!
//! 1. **Detect ground height** - Points are binned into a polar grid of
//!    azimuth sectors and range rings. Each patch's lowest returns are
//!    its seeds; a plane is fit to them by PCA (3x3 covariance plus an
//!    analytical symmetric eigendecomposition), and the patch is
//!    accepted when the fit is flat (smallest eigenvalue a small share
//!    of the trace) and upright (normal close to the height axis).
//!    Accepted patches near the lowest accepted centroid pool their
//!    seed heights; the pooled median is the ground level. This step is
//!    skipped when a known `sensor_height` is provided.
//!
//!    The simulator works in the sensor frame with gravity along -Z, so
//!    the gravity-alignment step of the full estimator reduces to using
//!    Z as the height axis; there is no IMU input.
//!
//! 2. **Smooth** - The detected height is blended with previous runs
//!    through an exponential moving average.
//!
//! 3. **Classify** - Every point within `thickness_m` above the ground
//!    level (and anything at or below it) is marked as ground in the
//!    [`Field::IsGround`] output. Chain a compact node to drop or keep
//!    the marked points.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::field::Field;
use crate::graph::{Accepts, Caps, ExecCtx, FieldSet, InputData, NodeImpl, NodeOutputs};
use crate::math::Vec3f;
use crate::memory::{DeviceAsyncArray, HostPinnedArray};
use crate::points::points_caps;
use crate::rays::forward_fields;

/// Polar grid: azimuth sectors.
const N_AZIMUTH: usize = 16;
/// Polar grid: range rings.
const N_RANGE: usize = 8;
/// Max horizontal range for the grid (meters).
const MAX_RANGE: f32 = 30.0;
/// Seeds per patch for the plane fit.
const K_SEEDS: usize = 20;
/// Minimum seeds for a valid patch.
const MIN_SEEDS: usize = 5;
/// Uprightness: |normal_z| must exceed this (cos 32 degrees).
const UPRIGHTNESS_THRESH: f32 = 0.85;
/// Flatness: smallest eigenvalue share of the covariance trace.
const FLATNESS_THRESH: f32 = 0.03;
/// Reject accepted patches whose centroid height strays further than
/// this from the lowest accepted patch (meters); culls tables/ceilings.
const ELEVATION_TOLERANCE: f32 = 1.0;
/// Minimum horizontal range for ground detection (meters).
const MIN_RANGE_M: f32 = 0.5;
/// Temporal EMA smoothing factor.
const EMA_ALPHA: f32 = 0.5;
/// Minimum accepted patches to trust a detection.
const MIN_ACCEPTED_PATCHES: usize = 3;

/// Patch-PCA ground height estimator over one frame.
///
/// Returns `None` when too few patches look like flat, upright ground.
pub fn detect_ground_height(points: &[Vec3f]) -> Option<f32> {
    let mut patches: Vec<Vec<usize>> = vec![Vec::new(); N_AZIMUTH * N_RANGE];
    let range_bin = MAX_RANGE / N_RANGE as f32;
    let azimuth_bin = std::f32::consts::TAU / N_AZIMUTH as f32;

    for (i, p) in points.iter().enumerate() {
        let horizontal = (p.x * p.x + p.y * p.y).sqrt();
        if !(MIN_RANGE_M..MAX_RANGE).contains(&horizontal) {
            continue;
        }
        let azimuth = p.y.atan2(p.x) + std::f32::consts::PI;
        let az_idx = ((azimuth / azimuth_bin) as usize).min(N_AZIMUTH - 1);
        let r_idx = ((horizontal / range_bin) as usize).min(N_RANGE - 1);
        patches[az_idx * N_RANGE + r_idx].push(i);
    }

    struct PatchInfo {
        centroid_z: f32,
        seed_heights: Vec<f32>,
    }
    let mut candidates: Vec<PatchInfo> = Vec::new();
    let mut lowest_centroid = f32::MAX;
    let mut seed_buf: Vec<(f32, usize)> = Vec::new();

    for patch in &patches {
        if patch.len() < MIN_SEEDS {
            continue;
        }

        // Seeds are the K lowest returns of the patch.
        seed_buf.clear();
        seed_buf.extend(patch.iter().map(|&i| (points[i].z, i)));
        let k = K_SEEDS.min(seed_buf.len());
        seed_buf.select_nth_unstable_by(k - 1, |a, b| a.0.total_cmp(&b.0));
        let seeds = &seed_buf[..k];

        // Plane fit: covariance of the seed points.
        let inv_k = 1.0 / k as f32;
        let mut centroid = Vec3f::ZERO;
        for &(_, i) in seeds {
            centroid = centroid + points[i];
        }
        let centroid = centroid * inv_k;

        let mut cov = [0.0f32; 6];
        for &(_, i) in seeds {
            let d = points[i] - centroid;
            cov[0] += d.x * d.x;
            cov[1] += d.x * d.y;
            cov[2] += d.x * d.z;
            cov[3] += d.y * d.y;
            cov[4] += d.y * d.z;
            cov[5] += d.z * d.z;
        }
        for c in cov.iter_mut() {
            *c *= inv_k;
        }

        let (normal, min_eig) = plane_normal(cov);
        if normal[2].abs() < UPRIGHTNESS_THRESH {
            continue;
        }
        let trace = cov[0] + cov[3] + cov[5];
        if trace < 1e-12 || min_eig / trace > FLATNESS_THRESH {
            continue;
        }

        if centroid.z < lowest_centroid {
            lowest_centroid = centroid.z;
        }
        candidates.push(PatchInfo {
            centroid_z: centroid.z,
            seed_heights: seeds.iter().map(|&(z, _)| z).collect(),
        });
    }

    // Keep only patches near the lowest accepted centroid.
    let mut accepted = 0usize;
    let mut pooled: Vec<f32> = Vec::new();
    for info in &candidates {
        if (info.centroid_z - lowest_centroid).abs() <= ELEVATION_TOLERANCE {
            accepted += 1;
            pooled.extend_from_slice(&info.seed_heights);
        }
    }
    if accepted < MIN_ACCEPTED_PATCHES || pooled.is_empty() {
        return None;
    }
    pooled.sort_by(|a, b| a.total_cmp(b));
    Some(pooled[pooled.len() / 2])
}

/// Unit normal and smallest eigenvalue of a 3x3 symmetric covariance
/// matrix packed as `[xx, xy, xz, yy, yz, zz]`.
///
/// Eigenvalues via the analytical method of Smith (1961); the normal is
/// the eigenvector of the smallest one.
fn plane_normal(cov: [f32; 6]) -> ([f32; 3], f32) {
    let a11 = cov[0] as f64;
    let a12 = cov[1] as f64;
    let a13 = cov[2] as f64;
    let a22 = cov[3] as f64;
    let a23 = cov[4] as f64;
    let a33 = cov[5] as f64;

    let q = (a11 + a22 + a33) / 3.0;
    let p1 = a12 * a12 + a13 * a13 + a23 * a23;

    let min_eig = if p1 < 1e-30 {
        // Already diagonal.
        a11.min(a22).min(a33)
    } else {
        let p2 = (a11 - q) * (a11 - q)
            + (a22 - q) * (a22 - q)
            + (a33 - q) * (a33 - q)
            + 2.0 * p1;
        let p = (p2 / 6.0).sqrt();
        let inv_p = 1.0 / p;

        let b11 = (a11 - q) * inv_p;
        let b12 = a12 * inv_p;
        let b13 = a13 * inv_p;
        let b22 = (a22 - q) * inv_p;
        let b23 = a23 * inv_p;
        let b33 = (a33 - q) * inv_p;

        let half_det = (b11 * b22 * b33 + 2.0 * b12 * b13 * b23
            - b11 * b23 * b23
            - b22 * b13 * b13
            - b33 * b12 * b12)
            / 2.0;

        let phi = half_det.clamp(-1.0, 1.0).acos() / 3.0;
        // cos(phi + 2pi/3) gives the smallest of the three roots.
        q + 2.0 * p * (phi + std::f64::consts::TAU / 3.0).cos()
    };

    let normal = eigenvector_for([a11, a12, a13, a22, a23, a33], min_eig);
    (normal, min_eig as f32)
}

/// Eigenvector of a 3x3 symmetric matrix for a known eigenvalue: the
/// largest cross product of rows of `M - lambda*I` spans its null space.
fn eigenvector_for(mat: [f64; 6], lambda: f64) -> [f32; 3] {
    let m00 = mat[0] - lambda;
    let m01 = mat[1];
    let m02 = mat[2];
    let m11 = mat[3] - lambda;
    let m12 = mat[4];
    let m22 = mat[5] - lambda;

    let cross = [
        [
            m01 * m12 - m02 * m11,
            m02 * m01 - m00 * m12,
            m00 * m11 - m01 * m01,
        ],
        [
            m01 * m22 - m02 * m12,
            m02 * m02 - m00 * m22,
            m00 * m12 - m01 * m02,
        ],
        [
            m11 * m22 - m12 * m12,
            m12 * m02 - m01 * m22,
            m01 * m12 - m11 * m02,
        ],
    ];

    let mut best = 0;
    let mut best_mag = 0.0f64;
    for (i, v) in cross.iter().enumerate() {
        let mag = v[0] * v[0] + v[1] * v[1] + v[2] * v[2];
        if mag > best_mag {
            best_mag = mag;
            best = i;
        }
    }
    if best_mag < 1e-30 {
        // Isotropic matrix: any direction works.
        return [0.0, 0.0, 1.0];
    }
    let inv = 1.0 / best_mag.sqrt();
    let v = cross[best];
    [
        (v[0] * inv) as f32,
        (v[1] * inv) as f32,
        (v[2] * inv) as f32,
    ]
}

/// Marks ground-plane points in the [`Field::IsGround`] output field.
pub(crate) struct FilterGround {
    thickness_m: f32,
    sensor_height_m: Option<f32>,
    ema_ground_height: Option<f32>,
    host_xyz: HostPinnedArray<f32>,
    mask: Vec<i32>,
    out: Arc<DeviceAsyncArray>,
}

impl FilterGround {
    pub(crate) fn new(thickness_m: f32, sensor_height_m: Option<f32>) -> Result<Self> {
        if !thickness_m.is_finite() || thickness_m < 0.0 {
            return Err(Error::InvalidArgument(
                "ground thickness must be finite and non-negative".into(),
            ));
        }
        if let Some(h) = sensor_height_m {
            if !h.is_finite() {
                return Err(Error::InvalidArgument("sensor height must be finite".into()));
            }
        }
        Ok(Self {
            thickness_m,
            sensor_height_m,
            ema_ground_height: None,
            host_xyz: HostPinnedArray::new(),
            mask: Vec::new(),
            out: Arc::new(DeviceAsyncArray::new(Field::IsGround)),
        })
    }
}

impl NodeImpl for FilterGround {
    fn type_name(&self) -> &'static str {
        "filter_ground"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::Xyz]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.insert(Field::IsGround);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let n = input.width;
        let xyz = input.field(Field::Xyz)?;

        self.host_xyz.copy_from_device(xyz, ctx.stream)?;
        ctx.stream.synchronize()?;
        let points: &[Vec3f] = bytemuck::cast_slice(self.host_xyz.as_slice());

        let ground = match self.sensor_height_m {
            Some(height) => Some(-height),
            None => {
                if let Some(detected) = detect_ground_height(points) {
                    let smoothed = match self.ema_ground_height {
                        Some(prev) => prev + EMA_ALPHA * (detected - prev),
                        None => detected,
                    };
                    self.ema_ground_height = Some(smoothed);
                }
                self.ema_ground_height
            }
        };

        self.mask.clear();
        self.mask.resize(n, 0);
        if let Some(level) = ground {
            let cut = level + self.thickness_m;
            for (flag, p) in self.mask.iter_mut().zip(points) {
                // One-sided: anything at or below the surface is ground too.
                if p.z <= cut {
                    *flag = 1;
                }
            }
        }
        self.out.upload(&self.mask, ctx.stream)?;

        let mut fields = forward_fields(input, &[Field::IsGround]);
        fields.insert(Field::IsGround, self.out.clone());
        Ok(NodeOutputs { width: n, fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A flat ring of ground returns around the sensor at the given
    /// height, dense enough to fill several patches.
    fn ground_ring(height: f32, n: usize) -> Vec<Vec3f> {
        (0..n)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / n as f32;
                let radius = 2.0 + (i % 40) as f32 * 0.25;
                Vec3f::new(radius * angle.cos(), radius * angle.sin(), height)
            })
            .collect()
    }

    #[test]
    fn detects_flat_ground_height() {
        let points = ground_ring(-1.6, 4000);
        let detected = detect_ground_height(&points).expect("flat ring must be detected");
        assert!(
            (detected + 1.6).abs() < 0.05,
            "detected {} expected about -1.6",
            detected
        );
    }

    #[test]
    fn rejects_sparse_scenes() {
        let points = ground_ring(-1.6, 20);
        assert_eq!(detect_ground_height(&points), None);
    }

    #[test]
    fn ignores_out_of_range_points() {
        let mut points = ground_ring(-1.2, 4000);
        // A far wall outside the grid must not shift the estimate.
        for i in 0..500 {
            points.push(Vec3f::new(50.0, i as f32 * 0.01, 3.0));
        }
        let detected = detect_ground_height(&points).expect("ground still detectable");
        assert!((detected + 1.2).abs() < 0.05);
    }

    #[test]
    fn rough_terrain_patches_are_rejected() {
        // Heights alternate by 1.2 m inside every patch, far too much
        // height variance for the plane fit to call flat.
        let points: Vec<Vec3f> = (0..4000)
            .map(|i| {
                let angle = i as f32 * std::f32::consts::TAU / 4000.0;
                let radius = 2.0 + (i % 40) as f32 * 0.25;
                let z = if i % 2 == 0 { -1.2 } else { 0.0 };
                Vec3f::new(radius * angle.cos(), radius * angle.sin(), z)
            })
            .collect();
        assert_eq!(detect_ground_height(&points), None);
    }

    #[test]
    fn vertical_walls_fail_the_uprightness_test() {
        // Dense vertical planes: flat fits, but their normals lie in the
        // horizontal plane.
        let mut points = Vec::new();
        for w in 0..4 {
            let x = 3.0 + w as f32 * 6.0;
            for i in 0..1000usize {
                let y = -2.0 + (i % 50) as f32 * 0.08;
                let z = -1.0 + ((i * 7) % 1000) as f32 * 0.002;
                points.push(Vec3f::new(x, y, z));
            }
        }
        assert_eq!(detect_ground_height(&points), None);
    }

    #[test]
    fn plane_normal_of_flat_samples_points_up() {
        // Covariance of points spread in x/y with no z variance.
        let (normal, min_eig) = plane_normal([2.0, 0.1, 0.0, 1.5, 0.0, 0.0]);
        assert!(normal[2].abs() > 0.99, "normal {:?}", normal);
        assert!(min_eig.abs() < 1e-6, "min eigenvalue {}", min_eig);
    }

    #[test]
    fn plane_normal_of_vertical_plane_is_horizontal() {
        // Spread in y/z only: the fitted plane is vertical, normal along x.
        let (normal, _) = plane_normal([0.0, 0.0, 0.0, 2.0, 0.2, 1.0]);
        assert!(normal[0].abs() > 0.99, "normal {:?}", normal);
    }
}
