// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Point-cloud producing and transforming nodes.
//!
//! Every node here follows the same contract: declare required fields,
//! size the output arrays to the incoming width, enqueue device work on
//! the run stream, and hand back the output field map. Fields a node does
//! not touch are forwarded by reference; a node never writes into another
//! node's arrays.

use std::collections::HashMap;
use std::sync::Arc;

use cust::memory::{DeviceBox, DeviceBuffer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::device::{self, RaytraceLaunchParams};
use crate::error::{Error, Result};
use crate::field::{point_size, Field, GpuFieldDesc};
use crate::graph::{Accepts, Caps, ExecCtx, FieldSet, InputData, NodeImpl, NodeOutputs};
use crate::math::Mat3x4f;
use crate::memory::{DeviceAsyncArray, HostPinnedArray};
use crate::rays::forward_fields;
use crate::scene::Scene;

pub(crate) fn points_caps(accepts: Accepts) -> Caps {
    Caps {
        produces_rays: false,
        produces_points: true,
        accepts,
    }
}

/// Fetch or lazily create a node-owned output array for `field`.
pub(crate) fn ensure_out(
    map: &mut HashMap<Field, Arc<DeviceAsyncArray>>,
    field: Field,
) -> Arc<DeviceAsyncArray> {
    map.entry(field)
        .or_insert_with(|| Arc::new(DeviceAsyncArray::new(field)))
        .clone()
}

// ---------------------------------------------------------------------------
// Raytrace
// ---------------------------------------------------------------------------

/// Casts the incoming rays against a [`Scene`] and writes the per-ray hit
/// fields. Output order matches ray order; [`Field::RayIdx`] equals the
/// launch index.
pub(crate) struct Raytrace {
    scene: Arc<Scene>,
    range_m: f32,
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
    params: Option<DeviceBox<RaytraceLaunchParams>>,
}

/// Fields the ray-trace node always produces.
const RAYTRACE_FIELDS: &[Field] = &[
    Field::Xyz,
    Field::IsHit,
    Field::RayIdx,
    Field::EntityId,
    Field::Distance,
    Field::Azimuth,
    Field::Elevation,
    Field::Intensity,
    Field::Normal,
];

impl Raytrace {
    pub(crate) fn new(scene: Arc<Scene>, range_m: f32) -> Result<Self> {
        validate_range(range_m)?;
        Ok(Self {
            scene,
            range_m,
            outputs: HashMap::new(),
            params: None,
        })
    }

    pub(crate) fn scene(&self) -> &Arc<Scene> {
        &self.scene
    }

    pub(crate) fn set_range(&mut self, range_m: f32) -> Result<()> {
        validate_range(range_m)?;
        self.range_m = range_m;
        Ok(())
    }
}

fn validate_range(range_m: f32) -> Result<()> {
    if !range_m.is_finite() || range_m <= 0.0 {
        return Err(Error::InvalidArgument(format!(
            "range must be positive and finite, got {}",
            range_m
        )));
    }
    Ok(())
}

impl NodeImpl for Raytrace {
    fn type_name(&self) -> &'static str {
        "raytrace"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Rays)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::RayPose]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields: FieldSet = RAYTRACE_FIELDS.iter().copied().collect();
        if let Some(input) = inputs.first() {
            // Per-ray annotations ride along unchanged.
            if input.contains(&Field::RingId) {
                fields.insert(Field::RingId);
            }
            if input.contains(&Field::TimeStamp) {
                fields.insert(Field::TimeStamp);
            }
        }
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let rays = input.field(Field::RayPose)?;
        let ray_count = input.width;
        if rays.len() != ray_count {
            return Err(Error::InvalidPipeline(format!(
                "ray input advertises width {} but provides {} poses",
                ray_count,
                rays.len()
            )));
        }

        let stream = ctx.stream;
        let range_m = self.range_m;
        let outputs = &mut self.outputs;
        let params_slot = &mut self.params;
        self.scene.with_commit(stream, |ias, sbt| {
            match sbt {
                Some(sbt) => {
                    for &field in RAYTRACE_FIELDS {
                        ensure_out(outputs, field).resize(ray_count, false, false, stream)?;
                    }
                    let params = RaytraceLaunchParams {
                        rays: rays.device_ptr(),
                        scene: ias,
                        out_xyz: outputs[&Field::Xyz].device_ptr(),
                        out_is_hit: outputs[&Field::IsHit].device_ptr(),
                        out_ray_idx: outputs[&Field::RayIdx].device_ptr(),
                        out_entity_id: outputs[&Field::EntityId].device_ptr(),
                        out_distance: outputs[&Field::Distance].device_ptr(),
                        out_azimuth: outputs[&Field::Azimuth].device_ptr(),
                        out_elevation: outputs[&Field::Elevation].device_ptr(),
                        out_intensity: outputs[&Field::Intensity].device_ptr(),
                        out_normal: outputs[&Field::Normal].device_ptr(),
                        ray_count: ray_count as u32,
                        range: range_m,
                    };
                    // The previous run's launch may still be in flight; its
                    // parameter block stays alive through this run's registry.
                    if let Some(old) = params_slot.take() {
                        ctx.pin(old);
                    }
                    let dbox = DeviceBox::new(&params)?;
                    device::launch_raytrace(stream, &dbox, sbt, ray_count)?;
                    *params_slot = Some(dbox);
                }
                None => {
                    // Empty scene: every ray misses.
                    for &field in RAYTRACE_FIELDS {
                        ensure_out(outputs, field).resize(ray_count, false, true, stream)?;
                    }
                }
            }
            Ok(())
        })?;

        let mut fields: HashMap<Field, Arc<DeviceAsyncArray>> = self
            .outputs
            .iter()
            .map(|(f, a)| (*f, a.clone()))
            .collect();
        for carried in [Field::RingId, Field::TimeStamp] {
            if let Some(arr) = input.fields.get(&carried) {
                fields.insert(carried, arr.clone());
            }
        }
        Ok(NodeOutputs {
            width: ray_count,
            fields,
        })
    }
}

// ---------------------------------------------------------------------------
// TransformPoints
// ---------------------------------------------------------------------------

/// Applies one affine transform to XYZ (and its rotation to NORMAL).
pub(crate) struct TransformPoints {
    transform: Mat3x4f,
    out_xyz: Arc<DeviceAsyncArray>,
    out_normal: Arc<DeviceAsyncArray>,
}

impl TransformPoints {
    pub(crate) fn new(transform: Mat3x4f) -> Result<Self> {
        if transform.has_nan() {
            return Err(Error::InvalidArgument("transform contains NaN".into()));
        }
        Ok(Self {
            transform,
            out_xyz: Arc::new(DeviceAsyncArray::new(Field::Xyz)),
            out_normal: Arc::new(DeviceAsyncArray::new(Field::Normal)),
        })
    }
}

impl NodeImpl for TransformPoints {
    fn type_name(&self) -> &'static str {
        "transform_points"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::Xyz]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        inputs.first().cloned().unwrap_or_default()
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let xyz_in = input.field(Field::Xyz)?;
        self.out_xyz.resize(input.width, false, false, ctx.stream)?;
        device::gpu_transform_points(
            ctx.stream,
            input.width,
            xyz_in.device_ptr(),
            self.out_xyz.device_ptr(),
            &self.transform,
        )?;

        let mut fields = forward_fields(input, &[Field::Xyz, Field::Normal]);
        fields.insert(Field::Xyz, self.out_xyz.clone());

        if let Some(normal_in) = input.fields.get(&Field::Normal) {
            self.out_normal.resize(input.width, false, false, ctx.stream)?;
            device::gpu_transform_points(
                ctx.stream,
                input.width,
                normal_in.device_ptr(),
                self.out_normal.device_ptr(),
                &self.transform.rotation_only(),
            )?;
            fields.insert(Field::Normal, self.out_normal.clone());
        }

        Ok(NodeOutputs {
            width: input.width,
            fields,
        })
    }
}

// ---------------------------------------------------------------------------
// Gaussian noise
// ---------------------------------------------------------------------------

/// Gaussian noise along the viewing direction; the standard deviation
/// grows linearly with measured distance.
pub(crate) struct GaussianNoiseDistance {
    mean_m: f32,
    st_dev_base_m: f32,
    st_dev_rise_per_meter: f32,
    rng: StdRng,
    samples: Arc<DeviceAsyncArray>,
    out_xyz: Arc<DeviceAsyncArray>,
    out_distance: Arc<DeviceAsyncArray>,
}

impl GaussianNoiseDistance {
    pub(crate) fn new(
        mean_m: f32,
        st_dev_base_m: f32,
        st_dev_rise_per_meter: f32,
    ) -> Result<Self> {
        if !mean_m.is_finite() || !st_dev_base_m.is_finite() || !st_dev_rise_per_meter.is_finite() {
            return Err(Error::InvalidArgument("noise parameter is not finite".into()));
        }
        if st_dev_base_m < 0.0 || st_dev_rise_per_meter < 0.0 {
            return Err(Error::InvalidArgument(
                "noise standard deviation must be non-negative".into(),
            ));
        }
        Ok(Self {
            mean_m,
            st_dev_base_m,
            st_dev_rise_per_meter,
            rng: StdRng::from_entropy(),
            samples: Arc::new(DeviceAsyncArray::new(Field::Distance)),
            out_xyz: Arc::new(DeviceAsyncArray::new(Field::Xyz)),
            out_distance: Arc::new(DeviceAsyncArray::new(Field::Distance)),
        })
    }
}

impl NodeImpl for GaussianNoiseDistance {
    fn type_name(&self) -> &'static str {
        "gaussian_noise_distance"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::Xyz, Field::Distance]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        inputs.first().cloned().unwrap_or_default()
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let n = input.width;

        let normals: Vec<f32> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        self.samples.upload(&normals, ctx.stream)?;

        self.out_xyz
            .copy_from(input.field(Field::Xyz)?, ctx.stream)?;
        self.out_distance
            .copy_from(input.field(Field::Distance)?, ctx.stream)?;
        device::gpu_apply_distance_noise(
            ctx.stream,
            n,
            self.out_xyz.device_ptr(),
            self.out_distance.device_ptr(),
            self.samples.device_ptr(),
            self.mean_m,
            self.st_dev_base_m,
            self.st_dev_rise_per_meter,
        )?;

        let mut fields = forward_fields(input, &[Field::Xyz, Field::Distance]);
        fields.insert(Field::Xyz, self.out_xyz.clone());
        fields.insert(Field::Distance, self.out_distance.clone());
        Ok(NodeOutputs { width: n, fields })
    }
}

/// Gaussian angular noise: each point is rotated about the sensor's up
/// axis by a sampled angle. Distances are preserved.
pub(crate) struct GaussianNoiseAngle {
    mean_rad: f32,
    st_dev_rad: f32,
    rng: StdRng,
    samples: Arc<DeviceAsyncArray>,
    out_xyz: Arc<DeviceAsyncArray>,
}

impl GaussianNoiseAngle {
    pub(crate) fn new(mean_rad: f32, st_dev_rad: f32) -> Result<Self> {
        if !mean_rad.is_finite() || !st_dev_rad.is_finite() || st_dev_rad < 0.0 {
            return Err(Error::InvalidArgument(
                "angular noise parameters must be finite with non-negative deviation".into(),
            ));
        }
        Ok(Self {
            mean_rad,
            st_dev_rad,
            rng: StdRng::from_entropy(),
            samples: Arc::new(DeviceAsyncArray::new(Field::Azimuth)),
            out_xyz: Arc::new(DeviceAsyncArray::new(Field::Xyz)),
        })
    }
}

impl NodeImpl for GaussianNoiseAngle {
    fn type_name(&self) -> &'static str {
        "gaussian_noise_angle"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![Field::Xyz]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        inputs.first().cloned().unwrap_or_default()
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let n = input.width;

        let normals: Vec<f32> = (0..n).map(|_| self.rng.sample(StandardNormal)).collect();
        self.samples.upload(&normals, ctx.stream)?;

        self.out_xyz
            .copy_from(input.field(Field::Xyz)?, ctx.stream)?;
        device::gpu_apply_angular_noise(
            ctx.stream,
            n,
            self.out_xyz.device_ptr(),
            self.samples.device_ptr(),
            self.mean_rad,
            self.st_dev_rad,
        )?;

        let mut fields = forward_fields(input, &[Field::Xyz]);
        fields.insert(Field::Xyz, self.out_xyz.clone());
        Ok(NodeOutputs { width: n, fields })
    }
}

// ---------------------------------------------------------------------------
// CompactByField
// ---------------------------------------------------------------------------

/// Drops points whose `field` value is zero, preserving input order for
/// the survivors.
pub(crate) struct CompactByField {
    field: Field,
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
}

impl CompactByField {
    pub(crate) fn new(field: Field) -> Result<Self> {
        if field.size() != 4 || field.is_padding() {
            return Err(Error::InvalidArgument(format!(
                "cannot compact by field {}; a 32-bit flag field is required",
                field
            )));
        }
        Ok(Self {
            field,
            outputs: HashMap::new(),
        })
    }
}

impl NodeImpl for CompactByField {
    fn type_name(&self) -> &'static str {
        "compact_by_field"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        vec![self.field]
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.remove(&Field::DynamicFormat);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let mask = input.field(self.field)?;
        let (indices, count) =
            device::gpu_compact_indices(ctx.stream, input.width, mask.device_ptr())?;
        let indices_ptr = indices.as_device_ptr().as_raw();

        let mut fields = HashMap::new();
        for (f, arr) in &input.fields {
            if *f == Field::DynamicFormat {
                // Interleaved buffers are not per-point addressable here.
                continue;
            }
            let out = ensure_out(&mut self.outputs, *f);
            out.resize(count, false, false, ctx.stream)?;
            device::gpu_gather(
                ctx.stream,
                count,
                indices_ptr,
                out.device_ptr(),
                arr.device_ptr(),
                f.size(),
            )?;
            fields.insert(*f, out);
        }
        ctx.pin(indices);
        Ok(NodeOutputs {
            width: count,
            fields,
        })
    }
}

// ---------------------------------------------------------------------------
// FormatPoints
// ---------------------------------------------------------------------------

/// Packs a caller-ordered subset of fields into one interleaved buffer.
/// Padding fields reserve space but are never written.
pub(crate) struct FormatPoints {
    fields: Vec<Field>,
    out: Arc<DeviceAsyncArray>,
}

impl FormatPoints {
    pub(crate) fn new(fields: &[Field]) -> Result<Self> {
        validate_format_fields(fields)?;
        Ok(Self {
            fields: fields.to_vec(),
            out: Arc::new(DeviceAsyncArray::new(Field::DynamicFormat)),
        })
    }

    pub(crate) fn point_size(&self) -> usize {
        point_size(&self.fields)
    }
}

pub(crate) fn validate_format_fields(fields: &[Field]) -> Result<()> {
    if fields.is_empty() {
        return Err(Error::InvalidArgument("field list is empty".into()));
    }
    for f in fields {
        if !f.is_point_attribute() {
            return Err(Error::InvalidArgument(format!(
                "field {} cannot appear in formatted output",
                f
            )));
        }
    }
    let mut seen = FieldSet::new();
    for f in fields.iter().filter(|f| !f.is_padding()) {
        if !seen.insert(*f) {
            return Err(Error::InvalidArgument(format!(
                "field {} listed twice in format",
                f
            )));
        }
    }
    Ok(())
}

impl NodeImpl for FormatPoints {
    fn type_name(&self) -> &'static str {
        "format_points"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        self.fields.iter().copied().filter(|f| !f.is_padding()).collect()
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.insert(Field::DynamicFormat);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        let n = input.width;
        let stride = self.point_size();
        self.out.resize(n * stride, false, false, ctx.stream)?;

        let mut descs = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        for f in &self.fields {
            if !f.is_padding() {
                descs.push(GpuFieldDesc {
                    data: input.field(*f)?.device_ptr(),
                    size: f.size() as u64,
                    dst_offset: offset as u64,
                });
            }
            offset += f.size();
        }
        let descs_buf = DeviceBuffer::from_slice(&descs)?;
        device::gpu_format(
            ctx.stream,
            n,
            stride,
            descs.len(),
            descs_buf.as_device_ptr().as_raw(),
            self.out.device_ptr(),
        )?;
        ctx.pin(descs_buf);

        let mut fields = forward_fields(input, &[Field::DynamicFormat]);
        fields.insert(Field::DynamicFormat, self.out.clone());
        Ok(NodeOutputs { width: n, fields })
    }
}

// ---------------------------------------------------------------------------
// YieldPoints
// ---------------------------------------------------------------------------

/// Terminal node: prefetches the requested fields into pinned host
/// memory as soon as the run reaches it.
pub(crate) struct YieldPoints {
    fields: Vec<Field>,
    host: HashMap<Field, HostPinnedArray<u8>>,
}

impl YieldPoints {
    /// Host copy of one prefetched field, if this node yields it.
    pub(crate) fn host_copy(&self, field: Field) -> Option<Vec<u8>> {
        self.host.get(&field).map(|p| p.as_slice().to_vec())
    }

    pub(crate) fn new(fields: &[Field]) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::InvalidArgument("field list is empty".into()));
        }
        for f in fields {
            if *f == Field::RayPose || f.is_padding() {
                return Err(Error::InvalidArgument(format!(
                    "field {} cannot be yielded",
                    f
                )));
            }
        }
        Ok(Self {
            fields: fields.to_vec(),
            host: HashMap::new(),
        })
    }
}

impl NodeImpl for YieldPoints {
    fn type_name(&self) -> &'static str {
        "yield_points"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn required_fields(&self) -> Vec<Field> {
        self.fields.clone()
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        inputs.first().cloned().unwrap_or_default()
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        for f in &self.fields {
            let arr = input.field(*f)?;
            let pinned = self.host.entry(*f).or_default();
            pinned.copy_from_device(arr, ctx.stream)?;
        }
        Ok(NodeOutputs {
            width: input.width,
            fields: input.fields.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// FromArrayPoints
// ---------------------------------------------------------------------------

/// Entry node over caller-supplied SoA host data.
pub(crate) struct FromArrayPoints {
    width: usize,
    data: Vec<(Field, Vec<u8>)>,
    device: HashMap<Field, Arc<DeviceAsyncArray>>,
    dirty: bool,
}

impl FromArrayPoints {
    pub(crate) fn new(width: usize, fields: &[(Field, &[u8])]) -> Result<Self> {
        if width == 0 {
            return Err(Error::InvalidArgument("point array is empty".into()));
        }
        if fields.is_empty() {
            return Err(Error::InvalidArgument("field list is empty".into()));
        }
        let mut seen = FieldSet::new();
        for (f, bytes) in fields {
            if !f.is_point_attribute() || f.is_padding() {
                return Err(Error::InvalidArgument(format!(
                    "field {} cannot be supplied from a host array",
                    f
                )));
            }
            if !seen.insert(*f) {
                return Err(Error::InvalidArgument(format!("field {} supplied twice", f)));
            }
            if bytes.len() != width * f.size() {
                return Err(Error::InvalidArgument(format!(
                    "field {} holds {} bytes, expected {} for width {}",
                    f,
                    bytes.len(),
                    width * f.size(),
                    width
                )));
            }
        }
        Ok(Self {
            width,
            data: fields.iter().map(|(f, b)| (*f, b.to_vec())).collect(),
            device: HashMap::new(),
            dirty: true,
        })
    }
}

impl NodeImpl for FromArrayPoints {
    fn type_name(&self) -> &'static str {
        "points_from_array"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::None)
    }

    fn provided_fields(&self, _inputs: &[FieldSet]) -> FieldSet {
        self.data.iter().map(|(f, _)| *f).collect()
    }

    fn execute(&mut self, _inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        if self.dirty {
            for (f, bytes) in &self.data {
                let arr = ensure_out(&mut self.device, *f);
                arr.upload(bytes.as_slice(), ctx.stream)?;
            }
            self.dirty = false;
        }
        Ok(NodeOutputs {
            width: self.width,
            fields: self.device.iter().map(|(f, a)| (*f, a.clone())).collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Merges
// ---------------------------------------------------------------------------

/// Concatenates every input's points, in connection order, over the
/// fields all inputs share.
pub(crate) struct SpatialMerge {
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
}

impl SpatialMerge {
    pub(crate) fn new() -> Self {
        Self {
            outputs: HashMap::new(),
        }
    }
}

impl NodeImpl for SpatialMerge {
    fn type_name(&self) -> &'static str {
        "spatial_merge"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::PointsMany)
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut shared = inputs.first().cloned().unwrap_or_default();
        for other in &inputs[1.min(inputs.len())..] {
            shared = shared.intersection(other).copied().collect();
        }
        shared.remove(&Field::DynamicFormat);
        shared
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let total: usize = inputs.iter().map(|i| i.width).sum();
        let mut shared: FieldSet = inputs[0].fields.keys().copied().collect();
        for input in &inputs[1..] {
            let keys: FieldSet = input.fields.keys().copied().collect();
            shared = shared.intersection(&keys).copied().collect();
        }
        shared.remove(&Field::DynamicFormat);
        if shared.is_empty() {
            return Err(Error::InvalidPipeline(
                "merge inputs share no point fields".into(),
            ));
        }

        let mut fields = HashMap::new();
        for f in shared {
            let out = ensure_out(&mut self.outputs, f);
            out.resize(total, false, false, ctx.stream)?;
            let mut offset = 0usize;
            for input in inputs {
                out.copy_region_from(input.field(f)?, offset, ctx.stream)?;
                offset += input.width;
            }
            fields.insert(f, out);
        }
        Ok(NodeOutputs {
            width: total,
            fields,
        })
    }
}

/// Accumulates the input's points across consecutive runs into growing
/// device arrays.
pub(crate) struct TemporalMerge {
    total: usize,
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
}

impl TemporalMerge {
    pub(crate) fn new() -> Self {
        Self {
            total: 0,
            outputs: HashMap::new(),
        }
    }
}

impl NodeImpl for TemporalMerge {
    fn type_name(&self) -> &'static str {
        "temporal_merge"
    }

    fn caps(&self) -> Caps {
        points_caps(Accepts::Points)
    }

    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet {
        let mut fields = inputs.first().cloned().unwrap_or_default();
        fields.remove(&Field::DynamicFormat);
        fields
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs> {
        let input = &inputs[0];
        if self.total > 0 {
            // The accumulated field set is fixed by the first run.
            for f in self.outputs.keys() {
                if !input.fields.contains_key(f) {
                    return Err(Error::InvalidPipeline(format!(
                        "input stopped providing accumulated field {}",
                        f
                    )));
                }
            }
        }
        let new_total = self.total + input.width;
        let mut fields = HashMap::new();
        for (f, arr) in &input.fields {
            if *f == Field::DynamicFormat {
                continue;
            }
            let out = ensure_out(&mut self.outputs, *f);
            out.resize(new_total, true, false, ctx.stream)?;
            out.copy_region_from(arr, self.total, ctx.stream)?;
            fields.insert(*f, out);
        }
        self.total = new_total;
        Ok(NodeOutputs {
            width: new_total,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_rejects_internal_and_duplicate_fields() {
        assert!(validate_format_fields(&[Field::Xyz, Field::Intensity]).is_ok());
        assert!(validate_format_fields(&[]).is_err());
        assert!(validate_format_fields(&[Field::RayPose]).is_err());
        assert!(validate_format_fields(&[Field::Xyz, Field::Xyz]).is_err());
        // Padding may repeat.
        assert!(
            validate_format_fields(&[Field::Xyz, Field::Padding32, Field::Padding32]).is_ok()
        );
    }

    #[test]
    fn format_point_size_covers_padding() {
        let node = FormatPoints::new(&[
            Field::Xyz,
            Field::Padding32,
            Field::Intensity,
            Field::RingId,
        ])
        .unwrap();
        assert_eq!(node.point_size(), 12 + 4 + 4 + 2);
    }

    #[test]
    fn raytrace_range_must_be_positive() {
        assert!(validate_range(10.0).is_ok());
        assert!(validate_range(0.0).is_err());
        assert!(validate_range(-1.0).is_err());
        assert!(validate_range(f32::NAN).is_err());
        assert!(validate_range(f32::INFINITY).is_err());
    }

    #[test]
    fn compact_requires_flag_sized_field() {
        assert!(CompactByField::new(Field::IsHit).is_ok());
        assert!(CompactByField::new(Field::IsGround).is_ok());
        assert!(CompactByField::new(Field::RingId).is_err());
        assert!(CompactByField::new(Field::TimeStamp).is_err());
    }

    #[test]
    fn from_array_checks_byte_lengths() {
        let xyz = vec![0u8; 2 * Field::Xyz.size()];
        let bad = vec![0u8; 5];
        assert!(FromArrayPoints::new(2, &[(Field::Xyz, &xyz)]).is_ok());
        assert!(FromArrayPoints::new(2, &[(Field::Xyz, &bad)]).is_err());
        assert!(FromArrayPoints::new(0, &[(Field::Xyz, &xyz)]).is_err());
        assert!(FromArrayPoints::new(2, &[(Field::Xyz, &xyz), (Field::Xyz, &xyz)]).is_err());
    }
}
