// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Ray-producing and ray-transforming nodes.
//!
//! Rays travel between nodes as [`Field::RayPose`] arrays of 3x4
//! transforms; see [`Mat3x4f`] for the origin/direction convention.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::field::Field;
use crate::graph::{Accepts, Caps, ExecCtx, FieldSet, InputData, InputMeta, NodeImpl, NodeOutputs};
use crate::math::Mat3x4f;
use crate::memory::DeviceAsyncArray;
use crate::device;

fn rays_caps(accepts: Accepts) -> Caps {
    Caps {
        produces_rays: true,
        produces_points: false,
        accepts,
    }
}

/// Forward every input field except the ones this node replaces.
pub(crate) fn forward_fields(
    input: &InputData,
    replaced: &[Field],
) -> HashMap<Field, Arc<DeviceAsyncArray>> {
    input
        .fields
        .iter()
        .filter(|(f, _)| !replaced.contains(f))
        .map(|(f, a)| (*f, a.clone()))
        .collect()
}

/// Entry node producing rays from a fixed set of 3x4 transforms.
pub(crate) struct FromMat3x4fRays {
    rays: Vec<Mat3x4f>,
    device: Arc<DeviceAsyncArray>,
    dirty: bool,
}

impl FromMat3x4fRays {
    pub(crate) fn new(rays: &[Mat3x4f]) -> Result<Self> {
        validate_rays(rays)?;
        Ok(Self {
            rays: rays.to_vec(),
            device: Arc::new(DeviceAsyncArray::new(Field::RayPose)),
            dirty: true,
        })
    }

    pub(crate) fn set_rays(&mut self, rays: &[Mat3x4f]) -> Result<()> {
        validate_rays(rays)?;
        self.rays = rays.to_vec();
        self.dirty = true;
        Ok(())
    }
}

fn validate_rays(rays: &[Mat3x4f]) -> Result<()> {
    if rays.is_empty() {
        return Err(Error::InvalidArgument("ray set is empty".into()));
    }
    if rays.iter().any(|m| m.has_nan()) {
        return Err(Error::InvalidArgument("ray transform contains NaN".into()));
    }
    Ok(())
}

impl NodeImpl for FromMat3x4fRays {
    fn type_name(&self) -> &'static str {
        "rays_from_mat3x4f"
    }

    fn caps(&self) -> Caps {
        rays_caps(Accepts::None)
    }

    fn provided_fields(&self, _inputs: &[FieldSet]) -> FieldSet {
        [Field::RayPose].into_iter().collect()
    }

    fn validate(&self, _inputs: &[InputMeta]) -> Result<()> {
        if self.rays.is_empty() {
            return Err(Error::InvalidPipeline("ray source holds no rays".into()));
        }
        // A clean device copy must mirror the stored rays exactly.
        if !self.dirty && self.device.len() != self.rays.len() {
            return Err(Error::InvalidPipeline(format!(
                "ray source device copy holds {} rays, expected {}",
                self.device.len(),
                self.rays.len()
            )));
        }
        Ok(())
    }

    fn execute(&mut self, _inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        if self.dirty || self.device.is_empty() {
            self.device.upload(&self.rays, ctx.stream)?;
            self.dirty = false;
        }
        let mut fields = HashMap::new();
        fields.insert(Field::RayPose, self.device.clone());
        Ok(NodeOutputs {
            width: self.rays.len(),
            fields,
        })
    }
}

/// Applies one affine transform to every incoming ray pose.
pub(crate) struct TransformRays {
    transform: Mat3x4f,
    out: Arc<DeviceAsyncArray>,
}

impl TransformRays {
    pub(crate) fn new(transform: Mat3x4f) -> Result<Self> {
        if transform.has_nan() {
            return Err(Error::InvalidArgument("transform contains NaN".into()));
        }
        Ok(Self {
            transform,
            out: Arc::new(DeviceAsyncArray::new(Field::RayPose)),
        })
    }

    pub(crate) fn set_transform(&mut self, transform: Mat3x4f) -> Result<()> {
        if transform.has_nan() {
            return Err(Error::InvalidArgument("transform contains NaN".into()));
        }
        self.transform = transform;
        Ok(())
    }
}

impl NodeImpl for TransformRays {
    fn type_name(&self) -> &'static str {
        "transform_rays"
    }

    fn caps(&self) -> Caps {
        rays_caps(Accepts::Rays)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::RayPose]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        inputs.first().cloned().unwrap_or_default()
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let rays_in = input.field(Field::RayPose)?;
        self.out.resize(input.width, false, false, ctx.stream)?;
        device::gpu_transform_rays(
            ctx.stream,
            input.width,
            rays_in.device_ptr(),
            self.out.device_ptr(),
            &self.transform,
        )?;
        let mut fields = forward_fields(input, &[Field::RayPose]);
        fields.insert(Field::RayPose, self.out.clone());
        Ok(NodeOutputs {
            width: input.width,
            fields,
        })
    }
}

/// Attaches a ring (channel) id to each ray, cycling the configured
/// table across the ray grid.
pub(crate) struct SetRingIds {
    ring_ids: Vec<u16>,
    device: Arc<DeviceAsyncArray>,
}

impl SetRingIds {
    pub(crate) fn new(ring_ids: &[u16]) -> Result<Self> {
        if ring_ids.is_empty() {
            return Err(Error::InvalidArgument("ring id table is empty".into()));
        }
        Ok(Self {
            ring_ids: ring_ids.to_vec(),
            device: Arc::new(DeviceAsyncArray::new(Field::RingId)),
        })
    }
}

impl NodeImpl for SetRingIds {
    fn type_name(&self) -> &'static str {
        "set_ring_ids"
    }

    fn caps(&self) -> Caps {
        rays_caps(Accepts::Rays)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::RayPose]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.insert(Field::RingId);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let expanded: Vec<u16> = (0..input.width)
            .map(|i| self.ring_ids[i % self.ring_ids.len()])
            .collect();
        self.device.upload(&expanded, ctx.stream)?;
        let mut fields = forward_fields(input, &[Field::RingId]);
        fields.insert(Field::RingId, self.device.clone());
        Ok(NodeOutputs {
            width: input.width,
            fields,
        })
    }
}

/// Attaches a per-ray capture time offset; the table length must match
/// the ray count exactly.
pub(crate) struct SetTimeOffsets {
    offsets_s: Vec<f64>,
    device: Arc<DeviceAsyncArray>,
    dirty: bool,
}

impl SetTimeOffsets {
    pub(crate) fn new(offsets_s: &[f64]) -> Result<Self> {
        if offsets_s.is_empty() {
            return Err(Error::InvalidArgument("time offset table is empty".into()));
        }
        if offsets_s.iter().any(|t| t.is_nan()) {
            return Err(Error::InvalidArgument("time offset contains NaN".into()));
        }
        Ok(Self {
            offsets_s: offsets_s.to_vec(),
            device: Arc::new(DeviceAsyncArray::new(Field::TimeStamp)),
            dirty: true,
        })
    }
}

impl NodeImpl for SetTimeOffsets {
    fn type_name(&self) -> &'static str {
        "set_time_offsets"
    }

    fn caps(&self) -> Caps {
        rays_caps(Accepts::Rays)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::RayPose]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.insert(Field::TimeStamp);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        if self.offsets_s.len() != input.width {
            return Err(Error::InvalidPipeline(format!(
                "time offset table holds {} entries for {} rays",
                self.offsets_s.len(),
                input.width
            )));
        }
        if self.dirty || self.device.len() != input.width {
            self.device.upload(&self.offsets_s, ctx.stream)?;
            self.dirty = false;
        }
        let mut fields = forward_fields(input, &[Field::TimeStamp]);
        fields.insert(Field::TimeStamp, self.device.clone());
        Ok(NodeOutputs {
            width: input.width,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_source_rejects_bad_input() {
        assert!(matches!(
            FromMat3x4fRays::new(&[]),
            Err(Error::InvalidArgument(_))
        ));
        let mut nan = Mat3x4f::IDENTITY;
        nan.rc[1][2] = f32::NAN;
        assert!(matches!(
            FromMat3x4fRays::new(&[nan]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(FromMat3x4fRays::new(&[Mat3x4f::IDENTITY]).is_ok());
    }

    #[test]
    fn ring_and_time_tables_must_be_non_empty() {
        assert!(SetRingIds::new(&[]).is_err());
        assert!(SetRingIds::new(&[0, 1, 2, 3]).is_ok());
        assert!(SetTimeOffsets::new(&[]).is_err());
        assert!(SetTimeOffsets::new(&[0.0, 1.0e-3]).is_ok());
    }
}
