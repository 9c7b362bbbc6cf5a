// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Vector and affine-transform types shared between the host and the device.
//!
//! All types are `#[repr(C)]` and byte-compatible with their counterparts in
//! the CUDA device programs, so they can live in device buffers and kernel
//! launch parameters without conversion.

use bytemuck::{Pod, Zeroable};
use cust::memory::DeviceCopy;

/// Three-component f32 vector.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, DeviceCopy, Pod, Zeroable)]
pub struct Vec3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3f {
    pub const ZERO: Vec3f = Vec3f {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[inline]
    pub fn dot(self, other: Vec3f) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[inline]
    pub fn cross(self, other: Vec3f) -> Vec3f {
        Vec3f::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    #[inline]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector, or zero if the length is (near) zero.
    #[inline]
    pub fn normalized(self) -> Vec3f {
        let len = self.length();
        if len > f32::EPSILON {
            self * (1.0 / len)
        } else {
            Vec3f::ZERO
        }
    }

    /// True if any component is NaN.
    #[inline]
    pub fn has_nan(self) -> bool {
        self.x.is_nan() || self.y.is_nan() || self.z.is_nan()
    }
}

impl std::ops::Add for Vec3f {
    type Output = Vec3f;
    #[inline]
    fn add(self, rhs: Vec3f) -> Vec3f {
        Vec3f::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl std::ops::Sub for Vec3f {
    type Output = Vec3f;
    #[inline]
    fn sub(self, rhs: Vec3f) -> Vec3f {
        Vec3f::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Mul<f32> for Vec3f {
    type Output = Vec3f;
    #[inline]
    fn mul(self, rhs: f32) -> Vec3f {
        Vec3f::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Three-component i32 vector; used for triangle vertex indices.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, DeviceCopy, Pod, Zeroable)]
pub struct Vec3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Vec3i {
    #[inline]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Largest component.
    #[inline]
    pub fn max_component(self) -> i32 {
        self.x.max(self.y).max(self.z)
    }

    /// Smallest component.
    #[inline]
    pub fn min_component(self) -> i32 {
        self.x.min(self.y).min(self.z)
    }
}

/// Row-major 3x4 affine transform (rotation + translation).
///
/// Rows are `[r00 r01 r02 tx]`, `[r10 r11 r12 ty]`, `[r20 r21 r22 tz]`.
///
/// When a `Mat3x4f` describes a ray, the translation column is the ray
/// origin and the direction is the rotation applied to +Z, i.e. the third
/// column of the rotation block with positive sign. This convention is
/// fixed here and used by every ray producer and consumer in the crate.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, DeviceCopy, Pod, Zeroable)]
pub struct Mat3x4f {
    pub rc: [[f32; 4]; 3],
}

impl Default for Mat3x4f {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mat3x4f {
    pub const IDENTITY: Mat3x4f = Mat3x4f {
        rc: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    /// Build from three rows of four values each.
    pub const fn from_rows(r0: [f32; 4], r1: [f32; 4], r2: [f32; 4]) -> Self {
        Self { rc: [r0, r1, r2] }
    }

    /// Pure translation.
    pub fn translation(x: f32, y: f32, z: f32) -> Self {
        let mut m = Self::IDENTITY;
        m.rc[0][3] = x;
        m.rc[1][3] = y;
        m.rc[2][3] = z;
        m
    }

    /// Rotation of `angle_rad` radians about the X axis.
    pub fn rotation_x(angle_rad: f32) -> Self {
        let (s, c) = angle_rad.sin_cos();
        Self::from_rows(
            [1.0, 0.0, 0.0, 0.0],
            [0.0, c, -s, 0.0],
            [0.0, s, c, 0.0],
        )
    }

    /// Rotation of `angle_rad` radians about the Y axis.
    pub fn rotation_y(angle_rad: f32) -> Self {
        let (s, c) = angle_rad.sin_cos();
        Self::from_rows(
            [c, 0.0, s, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [-s, 0.0, c, 0.0],
        )
    }

    /// Rotation of `angle_rad` radians about the Z axis.
    pub fn rotation_z(angle_rad: f32) -> Self {
        let (s, c) = angle_rad.sin_cos();
        Self::from_rows(
            [c, -s, 0.0, 0.0],
            [s, c, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        )
    }

    /// Affine composition `self * other` (apply `other` first).
    pub fn compose(&self, other: &Mat3x4f) -> Mat3x4f {
        let a = &self.rc;
        let b = &other.rc;
        let mut out = [[0.0f32; 4]; 3];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, v) in row.iter_mut().enumerate().take(3) {
                *v = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
            }
            row[3] = a[i][0] * b[0][3] + a[i][1] * b[1][3] + a[i][2] * b[2][3] + a[i][3];
        }
        Mat3x4f { rc: out }
    }

    /// Transform a point (rotation + translation).
    #[inline]
    pub fn transform_point(&self, p: Vec3f) -> Vec3f {
        let m = &self.rc;
        Vec3f::new(
            m[0][0] * p.x + m[0][1] * p.y + m[0][2] * p.z + m[0][3],
            m[1][0] * p.x + m[1][1] * p.y + m[1][2] * p.z + m[1][3],
            m[2][0] * p.x + m[2][1] * p.y + m[2][2] * p.z + m[2][3],
        )
    }

    /// Rotate a vector (no translation).
    #[inline]
    pub fn rotate_vector(&self, v: Vec3f) -> Vec3f {
        let m = &self.rc;
        Vec3f::new(
            m[0][0] * v.x + m[0][1] * v.y + m[0][2] * v.z,
            m[1][0] * v.x + m[1][1] * v.y + m[1][2] * v.z,
            m[2][0] * v.x + m[2][1] * v.y + m[2][2] * v.z,
        )
    }

    /// Translation column.
    #[inline]
    pub fn translation_part(&self) -> Vec3f {
        Vec3f::new(self.rc[0][3], self.rc[1][3], self.rc[2][3])
    }

    /// Ray origin for a ray-describing transform.
    #[inline]
    pub fn ray_origin(&self) -> Vec3f {
        self.translation_part()
    }

    /// Ray direction for a ray-describing transform: the rotation applied
    /// to +Z (third rotation column, positive sign).
    #[inline]
    pub fn ray_direction(&self) -> Vec3f {
        Vec3f::new(self.rc[0][2], self.rc[1][2], self.rc[2][2]).normalized()
    }

    /// Same transform with the translation column zeroed.
    pub fn rotation_only(&self) -> Mat3x4f {
        let mut m = *self;
        m.rc[0][3] = 0.0;
        m.rc[1][3] = 0.0;
        m.rc[2][3] = 0.0;
        m
    }

    /// True if any element is NaN.
    pub fn has_nan(&self) -> bool {
        self.rc.iter().flatten().any(|v| v.is_nan())
    }
}

impl From<Mat3x4f> for mint::RowMatrix3x4<f32> {
    fn from(m: Mat3x4f) -> Self {
        let r = m.rc;
        [
            r[0][0], r[0][1], r[0][2], r[0][3], //
            r[1][0], r[1][1], r[1][2], r[1][3], //
            r[2][0], r[2][1], r[2][2], r[2][3],
        ]
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn assert_close(a: Vec3f, b: Vec3f) {
        assert!(
            (a - b).length() < 1e-5,
            "vectors differ: {:?} vs {:?}",
            a,
            b
        );
    }

    #[test]
    fn identity_leaves_points_unchanged() {
        let p = Vec3f::new(1.5, -2.0, 0.25);
        assert_eq!(Mat3x4f::IDENTITY.transform_point(p), p);
    }

    #[test]
    fn translation_moves_points_but_not_vectors() {
        let t = Mat3x4f::translation(1.0, 2.0, 3.0);
        assert_close(
            t.transform_point(Vec3f::new(1.0, 1.0, 1.0)),
            Vec3f::new(2.0, 3.0, 4.0),
        );
        assert_close(
            t.rotate_vector(Vec3f::new(1.0, 1.0, 1.0)),
            Vec3f::new(1.0, 1.0, 1.0),
        );
    }

    #[test]
    fn rotation_z_quarter_turn() {
        let r = Mat3x4f::rotation_z(FRAC_PI_2);
        assert_close(
            r.transform_point(Vec3f::new(1.0, 0.0, 0.0)),
            Vec3f::new(0.0, 1.0, 0.0),
        );
    }

    #[test]
    fn compose_applies_right_operand_first() {
        let t = Mat3x4f::translation(1.0, 0.0, 0.0);
        let r = Mat3x4f::rotation_z(FRAC_PI_2);
        // Rotate then translate
        let m = t.compose(&r);
        assert_close(
            m.transform_point(Vec3f::new(1.0, 0.0, 0.0)),
            Vec3f::new(1.0, 1.0, 0.0),
        );
    }

    #[test]
    fn ray_convention_identity_points_up_z() {
        let m = Mat3x4f::translation(0.25, 0.25, 1.0);
        assert_close(m.ray_origin(), Vec3f::new(0.25, 0.25, 1.0));
        assert_close(m.ray_direction(), Vec3f::new(0.0, 0.0, 1.0));
    }

    #[test]
    fn ray_direction_follows_rotation() {
        // Rotating the frame by 180 degrees about X flips +Z to -Z.
        let m = Mat3x4f::translation(0.0, 0.0, 1.0)
            .compose(&Mat3x4f::rotation_x(std::f32::consts::PI));
        assert_close(m.ray_direction(), Vec3f::new(0.0, 0.0, -1.0));
    }
}
