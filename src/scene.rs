// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Scene and acceleration-structure management.
//!
//! A [`Scene`] owns triangle meshes, the entities instancing them, and
//! optional per-entity intensity textures. Each mesh carries one geometry
//! acceleration structure (GAS); the scene carries one instance
//! acceleration structure (IAS) over all visible entities.
//!
//! Structures are maintained lazily: mutations only mark state dirty, and
//! [`Scene::commit`] settles everything on the stream it is given, at the
//! start of any graph run that casts rays. The rebuild policy follows the
//! cost ladder:
//!
//! - vertex positions changed, count unchanged: GAS refit (in place)
//! - topology or vertex count changed: GAS rebuild, then compaction
//! - entity set changed: IAS rebuild (plus SBT rebuild)
//! - only entity transforms changed: IAS refit
//!
//! Build scratch is kept per mesh and per scene and reused across builds.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use cust::memory::{DeviceBox, DeviceBuffer};
use cust::memory::CopyDestination as _;
use cust::stream::Stream;
use optix::acceleration::{
    accel_build, accel_compact, accel_compute_memory_usage, AccelBuildOptions, AccelEmitDesc,
    BuildFlags, BuildOperation, GeometryFlags, IndexTriple, IndexedTriangleArray, IndicesFormat,
    Instance, InstanceArray, TraversableHandle, Vertex, VertexFormat,
};
use optix::shader_binding_table::{SbtRecord, ShaderBindingTable};
use tracing::{debug, trace};

use crate::device::{self, EntityShaderData};
use crate::error::{Error, Result};
use crate::math::{Mat3x4f, Vec3f, Vec3i};

impl Vertex for Vec3f {
    const FORMAT: VertexFormat = VertexFormat::Float3;
}

impl IndexTriple for Vec3i {
    const FORMAT: IndicesFormat = IndicesFormat::Int3;
}

/// Handle to a mesh owned by a [`Scene`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(u32);

/// Handle to an entity owned by a [`Scene`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntityId(u32);

/// Handle to a texture owned by a [`Scene`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(u32);

struct Gas {
    buf: DeviceBuffer<u8>,
    hnd: TraversableHandle,
}

struct Mesh {
    vertices: DeviceBuffer<Vec3f>,
    indices: DeviceBuffer<Vec3i>,
    gas: Option<Gas>,
    gas_needs_update: bool,
    topology_changed: bool,
    scratch: Option<DeviceBuffer<u8>>,
}

struct Texture {
    texels: DeviceBuffer<f32>,
    width: usize,
    height: usize,
}

struct Entity {
    mesh: MeshId,
    transform: Mat3x4f,
    entity_id: i32,
    texture: Option<TextureId>,
    visible: bool,
}

struct SceneSbt {
    // The table references these buffers by device address; they must
    // outlive every launch against it.
    _raygen: DeviceBuffer<SbtRecord<i32>>,
    _miss: DeviceBuffer<SbtRecord<i32>>,
    _hitgroup: DeviceBuffer<SbtRecord<EntityShaderData>>,
    table: ShaderBindingTable,
}

#[derive(Default)]
struct SceneState {
    meshes: HashMap<u32, Mesh>,
    entities: BTreeMap<u32, Entity>,
    textures: HashMap<u32, Texture>,
    next_mesh: u32,
    next_entity: u32,
    next_texture: u32,
    ias: Option<Gas>,
    ias_scratch: Option<DeviceBuffer<u8>>,
    instance_buf: Option<DeviceBuffer<Instance<'static>>>,
    instance_count: usize,
    instances_changed: bool,
    transforms_changed: bool,
    sbt: Option<SceneSbt>,
}

/// A set of mesh instances with one scene-wide instance acceleration
/// structure. Thread-safe; commits serialize on an internal mutex.
pub struct Scene {
    state: Mutex<SceneState>,
}

// Device buffers and the SBT are context-global handles; the state mutex
// serializes all access to them.
unsafe impl Send for Scene {}
unsafe impl Sync for Scene {}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SceneState::default()),
        }
    }

    /// Upload a triangle mesh and return its handle.
    pub fn add_mesh(&self, vertices: &[Vec3f], indices: &[Vec3i]) -> Result<MeshId> {
        validate_geometry(vertices, indices)?;
        let mut state = self.state.lock().unwrap();
        let vbuf = DeviceBuffer::from_slice(vertices)?;
        let ibuf = DeviceBuffer::from_slice(indices)?;
        let id = state.next_mesh;
        state.next_mesh += 1;
        state.meshes.insert(
            id,
            Mesh {
                vertices: vbuf,
                indices: ibuf,
                gas: None,
                gas_needs_update: true,
                topology_changed: false,
                scratch: None,
            },
        );
        debug!(mesh = id, vertices = vertices.len(), triangles = indices.len(), "mesh added");
        Ok(MeshId(id))
    }

    /// Replace a mesh's vertex positions.
    ///
    /// With an unchanged vertex count the GAS is refit at the next commit;
    /// a different count forces a rebuild.
    pub fn update_vertices(&self, mesh: MeshId, vertices: &[Vec3f]) -> Result<()> {
        if vertices.is_empty() {
            return Err(Error::InvalidGeometry("empty vertex array".into()));
        }
        if vertices.iter().any(|v| v.has_nan()) {
            return Err(Error::InvalidArgument("vertex contains NaN".into()));
        }
        let mut state = self.state.lock().unwrap();
        let m = state
            .meshes
            .get_mut(&mesh.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown mesh {:?}", mesh)))?;
        if vertices.len() == m.vertices.len() {
            m.vertices.copy_from(vertices)?;
        } else {
            // Topology is interpreted against the new vertex count; the
            // existing indices must still be in range.
            let max_index = vertices.len() as i32;
            let mut host_indices = vec![Vec3i::default(); m.indices.len()];
            m.indices.copy_to(&mut host_indices)?;
            if host_indices.iter().any(|t| t.max_component() >= max_index) {
                return Err(Error::InvalidGeometry(
                    "vertex update shrinks the mesh below an existing index".into(),
                ));
            }
            m.vertices = DeviceBuffer::from_slice(vertices)?;
            m.topology_changed = true;
        }
        m.gas_needs_update = true;
        Ok(())
    }

    /// Remove a mesh. Fails while any entity still instances it.
    pub fn remove_mesh(&self, mesh: MeshId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.entities.values().any(|e| e.mesh == mesh) {
            return Err(Error::InvalidArgument(format!(
                "mesh {:?} is still referenced by an entity",
                mesh
            )));
        }
        state
            .meshes
            .remove(&mesh.0)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown mesh {:?}", mesh)))
    }

    /// Instance a mesh with a world transform and a caller-chosen id that
    /// is reported in the ENTITY_ID output field.
    pub fn add_entity(&self, mesh: MeshId, transform: Mat3x4f, entity_id: i32) -> Result<EntityId> {
        if transform.has_nan() {
            return Err(Error::InvalidArgument("entity transform contains NaN".into()));
        }
        let mut state = self.state.lock().unwrap();
        if !state.meshes.contains_key(&mesh.0) {
            return Err(Error::InvalidArgument(format!("unknown mesh {:?}", mesh)));
        }
        let id = state.next_entity;
        state.next_entity += 1;
        state.entities.insert(
            id,
            Entity {
                mesh,
                transform,
                entity_id,
                texture: None,
                visible: true,
            },
        );
        state.instances_changed = true;
        Ok(EntityId(id))
    }

    pub fn set_entity_transform(&self, entity: EntityId, transform: Mat3x4f) -> Result<()> {
        if transform.has_nan() {
            return Err(Error::InvalidArgument("entity transform contains NaN".into()));
        }
        let mut state = self.state.lock().unwrap();
        let e = entity_mut(&mut state, entity)?;
        e.transform = transform;
        state.transforms_changed = true;
        Ok(())
    }

    /// Hidden entities are left out of the IAS entirely.
    pub fn set_entity_visibility(&self, entity: EntityId, visible: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let e = entity_mut(&mut state, entity)?;
        if e.visible != visible {
            e.visible = visible;
            state.instances_changed = true;
        }
        Ok(())
    }

    /// Attach (or clear) the per-entity intensity texture.
    pub fn set_entity_texture(&self, entity: EntityId, texture: Option<TextureId>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = texture {
            if !state.textures.contains_key(&t.0) {
                return Err(Error::InvalidArgument(format!("unknown texture {:?}", t)));
            }
        }
        let e = entity_mut(&mut state, entity)?;
        e.texture = texture;
        state.instances_changed = true;
        Ok(())
    }

    pub fn remove_entity(&self, entity: EntityId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .entities
            .remove(&entity.0)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown entity {:?}", entity)))?;
        state.instances_changed = true;
        Ok(())
    }

    /// Upload a row-major `width * height` reflectance texture.
    pub fn create_texture(&self, texels: &[f32], width: usize, height: usize) -> Result<TextureId> {
        if width == 0 || height == 0 || texels.len() != width * height {
            return Err(Error::InvalidArgument(format!(
                "texture data of {} texels does not match {}x{}",
                texels.len(),
                width,
                height
            )));
        }
        let mut state = self.state.lock().unwrap();
        let buf = DeviceBuffer::from_slice(texels)?;
        let id = state.next_texture;
        state.next_texture += 1;
        state.textures.insert(
            id,
            Texture {
                texels: buf,
                width,
                height,
            },
        );
        Ok(TextureId(id))
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().unwrap().entities.len()
    }

    pub fn mesh_count(&self) -> usize {
        self.state.lock().unwrap().meshes.len()
    }

    /// Settle every dirty acceleration structure on `stream` and return
    /// the IAS handle. Idempotent: a clean scene only returns the handle.
    pub fn commit(&self, stream: &Stream) -> Result<TraversableHandle> {
        self.with_commit(stream, |hnd, _| Ok(hnd))
    }

    /// Commit, then run `f` with the IAS handle and the SBT while the
    /// scene lock is held, so launches see a stable table. A scene with no
    /// visible entities commits to a null traversable and no SBT; rays
    /// against it all miss.
    pub(crate) fn with_commit<R>(
        &self,
        stream: &Stream,
        f: impl FnOnce(TraversableHandle, Option<&ShaderBindingTable>) -> Result<R>,
    ) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let dev = device::device()?;
        let octx = dev.optix.lock().unwrap();

        // Pass 1: settle every dirty GAS.
        for (id, mesh) in state.meshes.iter_mut() {
            if mesh.gas_needs_update || mesh.gas.is_none() {
                let rebuild = mesh.gas.is_none() || mesh.topology_changed;
                trace!(mesh = *id, rebuild, "building GAS");
                build_or_refit_gas(&octx, stream, mesh, rebuild)?;
                mesh.gas_needs_update = false;
                mesh.topology_changed = false;
            }
        }

        // Pass 2: settle the IAS over visible entities.
        let visible: Vec<u32> = state
            .entities
            .iter()
            .filter(|(_, e)| e.visible)
            .map(|(id, _)| *id)
            .collect();

        if visible.is_empty() {
            state.ias = None;
            state.sbt = None;
            state.instance_buf = None;
            state.instance_count = 0;
            state.instances_changed = false;
            state.transforms_changed = false;
            return f(TraversableHandle::default(), None);
        }

        let rebuild_ias = state.instances_changed || state.ias.is_none();
        if rebuild_ias || state.transforms_changed {
            let instances = build_instance_list(&state, &visible)?;
            state.instance_buf = Some(DeviceBuffer::from_slice(&instances)?);
            state.instance_count = instances.len();
            let SceneState {
                ias,
                ias_scratch,
                instance_buf,
                ..
            } = &mut *state;
            let instance_buf = instance_buf.as_ref().expect("uploaded above");
            build_or_refit_ias(&octx, stream, ias, ias_scratch, instance_buf, rebuild_ias)?;
        }
        if rebuild_ias {
            let sbt = build_sbt(&state, &visible)?;
            state.sbt = Some(sbt);
        }
        state.instances_changed = false;
        state.transforms_changed = false;

        let hnd = state
            .ias
            .as_ref()
            .map(|g| g.hnd)
            .expect("IAS settled above");
        let sbt = state.sbt.as_ref().map(|s| &s.table);
        f(hnd, sbt)
    }
}

fn entity_mut(state: &mut SceneState, entity: EntityId) -> Result<&mut Entity> {
    state
        .entities
        .get_mut(&entity.0)
        .ok_or_else(|| Error::InvalidArgument(format!("unknown entity {:?}", entity)))
}

fn validate_geometry(vertices: &[Vec3f], indices: &[Vec3i]) -> Result<()> {
    if vertices.is_empty() {
        return Err(Error::InvalidGeometry("empty vertex array".into()));
    }
    if indices.is_empty() {
        return Err(Error::InvalidGeometry("empty index array".into()));
    }
    if vertices.iter().any(|v| v.has_nan()) {
        return Err(Error::InvalidArgument("vertex contains NaN".into()));
    }
    let max = vertices.len() as i32;
    for (i, tri) in indices.iter().enumerate() {
        if tri.min_component() < 0 || tri.max_component() >= max {
            return Err(Error::InvalidGeometry(format!(
                "triangle {} references vertex outside 0..{}",
                i, max
            )));
        }
    }
    Ok(())
}

fn ensure_scratch(
    slot: &mut Option<DeviceBuffer<u8>>,
    bytes: usize,
) -> Result<&mut DeviceBuffer<u8>> {
    let needed = bytes.max(1);
    let have = slot.as_ref().map(|b| b.len()).unwrap_or(0);
    if have < needed {
        *slot = Some(unsafe { DeviceBuffer::<u8>::uninitialized(needed)? });
    }
    Ok(slot.as_mut().expect("scratch allocated above"))
}

const GAS_FLAGS: BuildFlags = BuildFlags::PREFER_FAST_TRACE
    .union(BuildFlags::ALLOW_UPDATE)
    .union(BuildFlags::ALLOW_COMPACTION);

fn build_or_refit_gas(
    octx: &optix::context::DeviceContext,
    stream: &Stream,
    mesh: &mut Mesh,
    rebuild: bool,
) -> Result<()> {
    let build_inputs = [IndexedTriangleArray::new(
        &[&mesh.vertices],
        &mesh.indices,
        &[GeometryFlags::DisableAnyHit],
    )];

    if rebuild {
        let options =
            [AccelBuildOptions::new(GAS_FLAGS).build_operation(BuildOperation::Build)];
        let sizes = accel_compute_memory_usage(octx, &options, &build_inputs)?;
        let scratch = ensure_scratch(&mut mesh.scratch, sizes.temp_size_in_bytes)?;
        let mut output = unsafe { DeviceBuffer::<u8>::uninitialized(sizes.output_size_in_bytes)? };
        let compacted_size = DeviceBox::new(&0usize)?;
        let mut properties = vec![AccelEmitDesc::CompactedSize(compacted_size.as_device_ptr())];

        let hnd = unsafe {
            accel_build(
                octx,
                stream,
                &options,
                &build_inputs,
                scratch,
                &mut output,
                &mut properties,
            )?
        };

        // Compaction needs the emitted size, which is only valid once the
        // build has finished on the stream.
        stream.synchronize()?;
        let mut size = 0usize;
        compacted_size.copy_to(&mut size)?;
        if size > 0 && size < output.len() {
            let mut compacted = unsafe { DeviceBuffer::<u8>::uninitialized(size)? };
            let hnd = unsafe { accel_compact(octx, stream, hnd, &mut compacted)? };
            mesh.gas = Some(Gas {
                buf: compacted,
                hnd,
            });
        } else {
            mesh.gas = Some(Gas { buf: output, hnd });
        }
    } else {
        let options =
            [AccelBuildOptions::new(GAS_FLAGS).build_operation(BuildOperation::Update)];
        let sizes = accel_compute_memory_usage(octx, &options, &build_inputs)?;
        let scratch = ensure_scratch(&mut mesh.scratch, sizes.temp_update_size_in_bytes)?;
        let gas = mesh
            .gas
            .as_mut()
            .expect("refit requires an existing GAS");
        let hnd = unsafe {
            accel_build(
                octx,
                stream,
                &options,
                &build_inputs,
                scratch,
                &mut gas.buf,
                &mut [],
            )?
        };
        gas.hnd = hnd;
    }
    Ok(())
}

fn build_instance_list(
    state: &SceneState,
    visible: &[u32],
) -> Result<Vec<Instance<'static>>> {
    let mut instances = Vec::with_capacity(visible.len());
    for (slot, id) in visible.iter().enumerate() {
        let e = &state.entities[id];
        let mesh = state
            .meshes
            .get(&e.mesh.0)
            .ok_or_else(|| Error::InvalidArgument(format!("entity references unknown {:?}", e.mesh)))?;
        let gas = mesh
            .gas
            .as_ref()
            .ok_or_else(|| Error::InvalidGeometry(format!("mesh {:?} has no GAS", e.mesh)))?;
        let instance = unsafe { Instance::from_handle(gas.hnd) }
            .transform(e.transform)
            .instance_id(*id)
            .sbt_offset(slot as u32)
            .visibility_mask(255);
        instances.push(instance);
    }
    Ok(instances)
}

fn build_or_refit_ias(
    octx: &optix::context::DeviceContext,
    stream: &Stream,
    ias_slot: &mut Option<Gas>,
    scratch_slot: &mut Option<DeviceBuffer<u8>>,
    instance_buf: &DeviceBuffer<Instance<'static>>,
    rebuild: bool,
) -> Result<()> {
    let build_inputs = [InstanceArray::new(instance_buf)];
    let flags = BuildFlags::PREFER_FAST_TRACE.union(BuildFlags::ALLOW_UPDATE);

    if rebuild {
        let options = [AccelBuildOptions::new(flags).build_operation(BuildOperation::Build)];
        let sizes = accel_compute_memory_usage(octx, &options, &build_inputs)?;
        let scratch = ensure_scratch(scratch_slot, sizes.temp_size_in_bytes)?;
        let mut output = unsafe { DeviceBuffer::<u8>::uninitialized(sizes.output_size_in_bytes)? };
        let hnd = unsafe {
            accel_build(
                octx,
                stream,
                &options,
                &build_inputs,
                scratch,
                &mut output,
                &mut [],
            )?
        };
        *ias_slot = Some(Gas { buf: output, hnd });
    } else {
        let options = [AccelBuildOptions::new(flags).build_operation(BuildOperation::Update)];
        let sizes = accel_compute_memory_usage(octx, &options, &build_inputs)?;
        let scratch = ensure_scratch(scratch_slot, sizes.temp_update_size_in_bytes)?;
        let ias = ias_slot.as_mut().expect("refit requires an existing IAS");
        let hnd = unsafe {
            accel_build(
                octx,
                stream,
                &options,
                &build_inputs,
                scratch,
                &mut ias.buf,
                &mut [],
            )?
        };
        ias.hnd = hnd;
    }
    Ok(())
}

fn build_sbt(state: &SceneState, visible: &[u32]) -> Result<SceneSbt> {
    let mut entity_data = Vec::with_capacity(visible.len());
    for id in visible {
        let e = &state.entities[id];
        let mesh = &state.meshes[&e.mesh.0];
        let (texture, tex_width, tex_height) = match e.texture.and_then(|t| state.textures.get(&t.0))
        {
            Some(t) => (
                t.texels.as_device_ptr().as_raw(),
                t.width as i32,
                t.height as i32,
            ),
            None => (0, 0, 0),
        };
        entity_data.push(EntityShaderData {
            vertices: mesh.vertices.as_device_ptr().as_raw(),
            indices: mesh.indices.as_device_ptr().as_raw(),
            texture,
            tex_width,
            tex_height,
            entity_id: e.entity_id,
            _pad: 0,
        });
    }

    let (raygen_rec, miss_rec) = device::pack_control_records()?;
    let hit_recs = device::pack_entity_records(&entity_data)?;

    let raygen = DeviceBuffer::from_slice(&[raygen_rec])?;
    let miss = DeviceBuffer::from_slice(&[miss_rec])?;
    let hitgroup = DeviceBuffer::from_slice(&hit_recs)?;
    let table = ShaderBindingTable::new(&raygen)
        .miss(&miss)
        .hitgroup(&hitgroup);

    Ok(SceneSbt {
        _raygen: raygen,
        _miss: miss,
        _hitgroup: hitgroup,
        table,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_validation_rejects_bad_input() {
        let tri = [
            Vec3f::new(0.0, 0.0, 0.0),
            Vec3f::new(1.0, 0.0, 0.0),
            Vec3f::new(0.0, 1.0, 0.0),
        ];
        assert!(validate_geometry(&tri, &[Vec3i::new(0, 1, 2)]).is_ok());
        assert!(matches!(
            validate_geometry(&[], &[Vec3i::new(0, 1, 2)]),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            validate_geometry(&tri, &[]),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            validate_geometry(&tri, &[Vec3i::new(0, 1, 3)]),
            Err(Error::InvalidGeometry(_))
        ));
        assert!(matches!(
            validate_geometry(&tri, &[Vec3i::new(-1, 1, 2)]),
            Err(Error::InvalidGeometry(_))
        ));
    }

    #[test]
    fn nan_vertices_are_invalid_arguments() {
        let tri = [
            Vec3f::new(0.0, 0.0, f32::NAN),
            Vec3f::new(1.0, 0.0, 0.0),
            Vec3f::new(0.0, 1.0, 0.0),
        ];
        assert!(matches!(
            validate_geometry(&tri, &[Vec3i::new(0, 1, 2)]),
            Err(Error::InvalidArgument(_))
        ));
    }
}
