// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Process-global GPU state and kernel launch plumbing.
//!
//! One CUDA context, one OptiX device context, one compiled ray-tracing
//! pipeline and one node-kernel module serve the whole process. They are
//! created on first use and live until shutdown; per-graph isolation
//! happens at the stream level, not the context level.
//!
//! The device programs under `src/gpu/` are compiled to PTX by `build.rs`
//! (nvcc + `OPTIX_INSTALL_DIR`). When the build machine lacks the CUDA
//! toolchain the placeholders are empty and [`device`] reports
//! `NotInitialized`, which keeps the CPU-only parts of the crate (and its
//! tests) usable.

use std::sync::{Mutex, OnceLock};

use cust::context::{Context, ContextFlags};
use cust::device::Device;
use cust::launch;
use cust::memory::{DeviceBox, DeviceBuffer, DeviceCopy};
use cust::module::Module as CudaModule;
use cust::stream::Stream;
use cust::CudaFlags;
use optix::acceleration::TraversableHandle;
use optix::context::DeviceContext;
use optix::pipeline::{
    CompileDebugLevel, CompileOptimizationLevel, ExceptionFlags, Module as OptixModule,
    ModuleCompileOptions, Pipeline, PipelineCompileOptions, PipelineLinkOptions, ProgramGroup,
    ProgramGroupDesc, TraversableGraphFlags,
};
use optix::shader_binding_table::{SbtRecord, ShaderBindingTable};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::math::Mat3x4f;

const NODE_KERNELS_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/nodeKernels.ptx"));
const OPTIX_PROGRAMS_PTX: &str = include_str!(concat!(env!("OUT_DIR"), "/optixPrograms.ptx"));

/// Threads per block for the node kernels; matches `nodeKernels.cu`.
const BLOCK_SIZE: u32 = 256;

/// Per-entity data referenced by one hit-group SBT record.
///
/// Mirrored in `optixPrograms.cu`.
#[repr(C)]
#[derive(Clone, Copy, Debug, DeviceCopy)]
pub struct EntityShaderData {
    /// Device pointer to the mesh vertex array (`Vec3f`).
    pub vertices: u64,
    /// Device pointer to the mesh index array (`Vec3i`).
    pub indices: u64,
    /// Device pointer to the intensity texture texels (`f32`), or 0.
    pub texture: u64,
    pub tex_width: i32,
    pub tex_height: i32,
    /// Caller-assigned entity id written to the ENTITY_ID field.
    pub entity_id: i32,
    pub _pad: i32,
}

/// Launch parameters of the ray-casting pipeline.
///
/// Mirrored in `optixPrograms.cu`. Output pointers may be 0 when the
/// corresponding field is not requested; the device programs skip them.
#[repr(C)]
#[derive(Clone, Copy, Debug, DeviceCopy)]
pub struct RaytraceLaunchParams {
    /// Ray poses (`Mat3x4f`), one per launch index.
    pub rays: u64,
    pub scene: TraversableHandle,
    pub out_xyz: u64,
    pub out_is_hit: u64,
    pub out_ray_idx: u64,
    pub out_entity_id: u64,
    pub out_distance: u64,
    pub out_azimuth: u64,
    pub out_elevation: u64,
    pub out_intensity: u64,
    pub out_normal: u64,
    pub ray_count: u32,
    /// Maximum hit distance in meters; beyond it the ray is a miss.
    pub range: f32,
}

pub(crate) struct RtPipeline {
    pub pipeline: Pipeline,
    pub pg_raygen: ProgramGroup,
    pub pg_miss: ProgramGroup,
    pub pg_hitgroup: ProgramGroup,
}

/// Process-global device state.
pub(crate) struct DeviceCtx {
    // Keeps the CUDA context alive for the lifetime of the process.
    cuda: Context,
    pub optix: Mutex<DeviceContext>,
    kernels: CudaModule,
    pub rt: RtPipeline,
}

impl DeviceCtx {
    /// Bind the process context to the calling thread. The driver API
    /// requires this once per thread that issues CUDA calls.
    pub fn make_current(&self) -> Result<()> {
        cust::context::CurrentContext::set_current(&self.cuda)?;
        Ok(())
    }
}

// The wrapped driver handles are usable from any thread as long as the
// context stays alive; access to the OptiX context is serialized above.
unsafe impl Send for DeviceCtx {}
unsafe impl Sync for DeviceCtx {}

static DEVICE: OnceLock<DeviceCtx> = OnceLock::new();
static DEVICE_INIT: Mutex<()> = Mutex::new(());

/// The process-global device state, initializing it on first use.
pub(crate) fn device() -> Result<&'static DeviceCtx> {
    if let Some(ctx) = DEVICE.get() {
        return Ok(ctx);
    }
    let _guard = DEVICE_INIT.lock().unwrap();
    if let Some(ctx) = DEVICE.get() {
        return Ok(ctx);
    }
    let ctx = init_device()?;
    Ok(DEVICE.get_or_init(|| ctx))
}

/// True when a CUDA device and the compiled device programs are usable.
pub fn gpu_available() -> bool {
    device().is_ok()
}

fn init_device() -> Result<DeviceCtx> {
    if NODE_KERNELS_PTX.is_empty() || OPTIX_PROGRAMS_PTX.is_empty() {
        return Err(Error::NotInitialized(
            "device programs were not compiled; rebuild with nvcc and OPTIX_INSTALL_DIR".into(),
        ));
    }

    cust::init(CudaFlags::empty())?;
    let dev = Device::get_device(0)?;
    info!(device = %dev.name().unwrap_or_else(|_| "unknown".into()), "initializing CUDA context");
    let cuda = Context::create_and_push(ContextFlags::SCHED_AUTO | ContextFlags::MAP_HOST, dev)?;

    optix::init()?;
    let mut optix_ctx = DeviceContext::new(&cuda, false)?;

    let kernels = CudaModule::from_ptx(NODE_KERNELS_PTX, &[])?;

    let module_options = ModuleCompileOptions {
        max_register_count: 64,
        opt_level: CompileOptimizationLevel::Default,
        debug_level: CompileDebugLevel::None,
    };
    let pipeline_options = PipelineCompileOptions::new()
        .uses_motion_blur(false)
        .num_attribute_values(2)
        .num_payload_values(8)
        .traversable_graph_flags(TraversableGraphFlags::ALLOW_SINGLE_LEVEL_INSTANCING)
        .exception_flags(ExceptionFlags::NONE)
        .pipeline_launch_params_variable_name("PARAMS");

    let (module, log) = OptixModule::new(
        &mut optix_ctx,
        &module_options,
        &pipeline_options,
        OPTIX_PROGRAMS_PTX,
    )?;
    if !log.is_empty() {
        debug!(%log, "optix module compile log");
    }

    let descs = [
        ProgramGroupDesc::raygen(&module, "__raygen__castRays"),
        ProgramGroupDesc::miss(&module, "__miss__range"),
        ProgramGroupDesc::hitgroup(Some((&module, "__closesthit__surface")), None, None),
    ];
    let (groups, log) = optix_ctx.program_group_create(&descs)?;
    if !log.is_empty() {
        debug!(%log, "optix program group log");
    }

    let link_options = PipelineLinkOptions {
        max_trace_depth: 1,
        debug_level: CompileDebugLevel::None,
    };
    let (pipeline, log) = Pipeline::new(&mut optix_ctx, &pipeline_options, &link_options, &groups)?;
    if !log.is_empty() {
        debug!(%log, "optix pipeline link log");
    }

    let mut groups = groups.into_iter();
    let (pg_raygen, pg_miss, pg_hitgroup) = match (groups.next(), groups.next(), groups.next()) {
        (Some(a), Some(b), Some(c)) => (a, b, c),
        _ => return Err(Error::Device("unexpected program group count".into())),
    };

    info!("device layer ready");
    Ok(DeviceCtx {
        cuda,
        optix: Mutex::new(optix_ctx),
        kernels,
        rt: RtPipeline {
            pipeline,
            pg_raygen,
            pg_miss,
            pg_hitgroup,
        },
    })
}

fn grid_for(count: usize) -> u32 {
    ((count as u32) + BLOCK_SIZE - 1) / BLOCK_SIZE
}

/// Pack `desc_count` source fields into the interleaved output buffer.
pub(crate) fn gpu_format(
    stream: &Stream,
    count: usize,
    point_size: usize,
    desc_count: usize,
    descs: u64,
    out: u64,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kFormat")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(
            count,
            point_size,
            desc_count,
            descs,
            out
        ))?;
    }
    Ok(())
}

/// Gather `count` elements of `elem_size` bytes from `input` at `indices`.
pub(crate) fn gpu_gather(
    stream: &Stream,
    count: usize,
    indices: u64,
    out: u64,
    input: u64,
    elem_size: usize,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kGatherByIndex")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(
            count,
            indices,
            out,
            input,
            elem_size
        ))?;
    }
    Ok(())
}

/// Apply `m` to every ray pose: `out[i] = m * in[i]`.
pub(crate) fn gpu_transform_rays(
    stream: &Stream,
    count: usize,
    input: u64,
    out: u64,
    m: &Mat3x4f,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kTransformRays")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(count, input, out, *m))?;
    }
    Ok(())
}

/// Apply `m` to every point. Pass a rotation-only matrix to transform
/// direction vectors (normals).
pub(crate) fn gpu_transform_points(
    stream: &Stream,
    count: usize,
    input: u64,
    out: u64,
    m: &Mat3x4f,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kTransformPoints")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(count, input, out, *m))?;
    }
    Ok(())
}

/// Displace every hit point along its viewing direction by a per-point
/// noise sample scaled to `st_dev_base + st_dev_rise * distance`, and
/// update the distance field accordingly.
pub(crate) fn gpu_apply_distance_noise(
    stream: &Stream,
    count: usize,
    xyz: u64,
    distance: u64,
    samples: u64,
    mean: f32,
    st_dev_base: f32,
    st_dev_rise: f32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kApplyDistanceNoise")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(
            count,
            xyz,
            distance,
            samples,
            mean,
            st_dev_base,
            st_dev_rise
        ))?;
    }
    Ok(())
}

/// Rotate every point about the sensor's up axis by a per-point angular
/// noise sample (radians).
pub(crate) fn gpu_apply_angular_noise(
    stream: &Stream,
    count: usize,
    xyz: u64,
    samples: u64,
    mean: f32,
    st_dev: f32,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    let func = ctx.kernels.get_function("kApplyAngularNoise")?;
    unsafe {
        launch!(func<<<grid_for(count), BLOCK_SIZE, 0, stream>>>(
            count, xyz, samples, mean, st_dev
        ))?;
    }
    Ok(())
}

/// Order-preserving stream compaction of a non-zero i32 mask.
///
/// Returns the device array of surviving input indices and its length.
/// Performs a per-block count, a host-side exclusive scan over the block
/// counts, and a scatter; the intermediate readback drains `stream`.
pub(crate) fn gpu_compact_indices(
    stream: &Stream,
    count: usize,
    mask: u64,
) -> Result<(DeviceBuffer<u32>, usize)> {
    use cust::memory::CopyDestination as _;

    if count == 0 {
        return Ok((DeviceBuffer::from_slice(&[0u32])?, 0));
    }
    let ctx = device()?;
    let blocks = grid_for(count) as usize;

    let counts_dev = DeviceBuffer::from_slice(&vec![0u32; blocks])?;
    let func = ctx.kernels.get_function("kMaskBlockCounts")?;
    unsafe {
        launch!(func<<<blocks as u32, BLOCK_SIZE, 0, stream>>>(
            count,
            mask,
            counts_dev.as_device_ptr().as_raw()
        ))?;
    }
    stream.synchronize()?;

    let mut counts = vec![0u32; blocks];
    counts_dev.copy_to(&mut counts)?;
    let mut offsets = vec![0u32; blocks];
    let mut total = 0u32;
    for (off, c) in offsets.iter_mut().zip(&counts) {
        *off = total;
        total += c;
    }
    let total = total as usize;

    let offsets_dev = DeviceBuffer::from_slice(&offsets)?;
    let indices = unsafe { DeviceBuffer::<u32>::uninitialized(total.max(1))? };
    let func = ctx.kernels.get_function("kCompactScatter")?;
    unsafe {
        launch!(func<<<blocks as u32, BLOCK_SIZE, 0, stream>>>(
            count,
            mask,
            offsets_dev.as_device_ptr().as_raw(),
            indices.as_device_ptr().as_raw()
        ))?;
    }
    stream.synchronize()?;
    Ok((indices, total))
}

/// Launch the ray-casting pipeline with `(ray_count, 1, 1)` dimensions.
///
/// The caller owns `params` and the SBT buffers and must keep them alive
/// until the stream drains past the launch.
pub(crate) fn launch_raytrace(
    stream: &Stream,
    params: &DeviceBox<RaytraceLaunchParams>,
    sbt: &ShaderBindingTable,
    ray_count: usize,
) -> Result<()> {
    if ray_count == 0 {
        return Ok(());
    }
    let ctx = device()?;
    unsafe {
        optix::launch(
            &ctx.rt.pipeline,
            stream,
            params,
            sbt,
            ray_count as u32,
            1,
            1,
        )?;
    }
    Ok(())
}

/// Pack an SBT record for the fixed raygen/miss programs.
pub(crate) fn pack_control_records() -> Result<(SbtRecord<i32>, SbtRecord<i32>)> {
    let ctx = device()?;
    let raygen = SbtRecord::pack(0, &ctx.rt.pg_raygen)?;
    let miss = SbtRecord::pack(0, &ctx.rt.pg_miss)?;
    Ok((raygen, miss))
}

/// Pack one hit-group SBT record per entity.
pub(crate) fn pack_entity_records(
    entities: &[EntityShaderData],
) -> Result<Vec<SbtRecord<EntityShaderData>>> {
    let ctx = device()?;
    entities
        .iter()
        .map(|data| SbtRecord::pack(*data, &ctx.rt.pg_hitgroup).map_err(Error::from))
        .collect()
}
