// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-point attribute tags.
//!
//! Point clouds move through the processing graph as structure-of-arrays
//! data: one contiguous array per [`Field`]. Every node declares which
//! fields it needs from its input and which fields it produces. Generic
//! device kernels (gather, format) operate on raw bytes and take the
//! element size from the tag.

use bytemuck::{Pod, Zeroable};
use cust::memory::DeviceCopy;
use std::fmt;

/// Tag identifying one per-point attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Field {
    /// Hit point in world coordinates (`Vec3f`).
    Xyz,
    /// Non-zero when the ray hit geometry within range (`i32`).
    IsHit,
    /// Index of the ray that produced this point (`u32`).
    RayIdx,
    /// Id of the entity that was hit, -1 on miss (`i32`).
    EntityId,
    /// Distance from ray origin to the hit point in meters (`f32`).
    Distance,
    /// Ray azimuth in radians (`f32`).
    Azimuth,
    /// Ray elevation in radians (`f32`).
    Elevation,
    /// Surface reflectance sampled at the hit point (`f32`).
    Intensity,
    /// Laser ring (channel) id (`u16`).
    RingId,
    /// Return classification (`u8`).
    ReturnType,
    /// Capture time offset in seconds (`f64`).
    TimeStamp,
    /// Surface normal at the hit point (`Vec3f`).
    Normal,
    /// Non-zero when the point was classified as ground (`i32`).
    IsGround,
    /// Ray poses as 3x4 transforms; the currency of rays-producing nodes.
    RayPose,
    /// Interleaved output of a format node (raw bytes).
    DynamicFormat,
    /// Reserved one-byte gap in formatted output; never written.
    Padding8,
    /// Reserved two-byte gap in formatted output; never written.
    Padding16,
    /// Reserved four-byte gap in formatted output; never written.
    Padding32,
}

impl Field {
    /// Size in bytes of one element of this field.
    pub const fn size(self) -> usize {
        match self {
            Field::Xyz | Field::Normal => 12,
            Field::IsHit | Field::RayIdx | Field::EntityId | Field::IsGround => 4,
            Field::Distance | Field::Azimuth | Field::Elevation | Field::Intensity => 4,
            Field::RingId => 2,
            Field::ReturnType => 1,
            Field::TimeStamp => 8,
            Field::RayPose => 48,
            Field::DynamicFormat => 1,
            Field::Padding8 => 1,
            Field::Padding16 => 2,
            Field::Padding32 => 4,
        }
    }

    /// Padding fields reserve space in formatted output but carry no data.
    pub const fn is_padding(self) -> bool {
        matches!(self, Field::Padding8 | Field::Padding16 | Field::Padding32)
    }

    /// Fields that may appear in a formatted / yielded point cloud.
    /// `RayPose` and `DynamicFormat` are internal plumbing.
    pub const fn is_point_attribute(self) -> bool {
        !matches!(self, Field::RayPose | Field::DynamicFormat)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Field::Xyz => "XYZ",
            Field::IsHit => "IS_HIT",
            Field::RayIdx => "RAY_IDX",
            Field::EntityId => "ENTITY_ID",
            Field::Distance => "DISTANCE",
            Field::Azimuth => "AZIMUTH",
            Field::Elevation => "ELEVATION",
            Field::Intensity => "INTENSITY",
            Field::RingId => "RING_ID",
            Field::ReturnType => "RETURN_TYPE",
            Field::TimeStamp => "TIME_STAMP",
            Field::Normal => "NORMAL",
            Field::IsGround => "IS_GROUND",
            Field::RayPose => "RAY_POSE",
            Field::DynamicFormat => "DYNAMIC_FORMAT",
            Field::Padding8 => "PADDING_8",
            Field::Padding16 => "PADDING_16",
            Field::Padding32 => "PADDING_32",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Total stride of a formatted point built from `fields`, padding included.
pub fn point_size(fields: &[Field]) -> usize {
    fields.iter().map(|f| f.size()).sum()
}

/// Byte offset of each field within the formatted point, in field order.
/// Padding fields advance the offset like any other.
pub fn field_offsets(fields: &[Field]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(fields.len());
    let mut offset = 0;
    for f in fields {
        offsets.push(offset);
        offset += f.size();
    }
    offsets
}

/// One source field for the format kernel: device pointer of the SoA input,
/// element size, and destination offset within the packed point.
///
/// Mirrored in `nodeKernels.cu`.
#[repr(C)]
#[derive(Clone, Copy, Debug, DeviceCopy, Pod, Zeroable)]
pub struct GpuFieldDesc {
    pub data: u64,
    pub size: u64,
    pub dst_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_sizes_match_declared_types() {
        assert_eq!(Field::Xyz.size(), std::mem::size_of::<[f32; 3]>());
        assert_eq!(Field::Distance.size(), std::mem::size_of::<f32>());
        assert_eq!(Field::RingId.size(), std::mem::size_of::<u16>());
        assert_eq!(Field::TimeStamp.size(), std::mem::size_of::<f64>());
        assert_eq!(
            Field::RayPose.size(),
            std::mem::size_of::<crate::math::Mat3x4f>()
        );
    }

    #[test]
    fn point_size_sums_fields_with_padding() {
        let fields = [Field::Xyz, Field::Padding32, Field::Intensity];
        assert_eq!(point_size(&fields), 12 + 4 + 4);
        assert_eq!(field_offsets(&fields), vec![0, 12, 16]);
    }

    #[test]
    fn padding_detection() {
        assert!(Field::Padding16.is_padding());
        assert!(!Field::Xyz.is_padding());
        assert!(!Field::RayPose.is_point_attribute());
    }
}
