// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! The processing graph runtime.
//!
//! A [`Graph`] owns a set of typed nodes wired into a DAG. Running the
//! graph discovers the reachable nodes, orders them topologically,
//! validates them, commits the scene when rays will be cast, and then
//! walks the order on a dedicated scheduler thread, enqueueing each
//! node's device work on the run's CUDA stream. `run` returns as soon as
//! the walk is underway; readback calls block until the producing node's
//! work has drained.
//!
//! Concurrency model:
//!
//! - one graph-wide lock serializes mutation and scheduling; mutating
//!   calls wait for the active run to finish first
//! - device work is ordered by the run's stream; consumers see their
//!   producers' outputs because they are enqueued later on that stream
//! - consecutive runs are chained with a CUDA event recorded at the end
//!   of each walk, so a new run's stream waits for the previous run's
//!   device work without blocking the host
//! - cancellation is cooperative: the flag is checked between nodes, and
//!   in-flight launches complete with their outputs discarded

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use cust::event::{Event, EventFlags};
use cust::stream::{Stream, StreamFlags};
use tracing::{debug, warn};

use crate::device;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::ground::FilterGround;
use crate::math::Mat3x4f;
use crate::memory::DeviceAsyncArray;
use crate::points::{
    CompactByField, FormatPoints, FromArrayPoints, GaussianNoiseAngle, GaussianNoiseDistance,
    Raytrace, SpatialMerge, TemporalMerge, TransformPoints, YieldPoints,
};
use crate::radar::RadarPostprocess;
use crate::rays::{FromMat3x4fRays, SetRingIds, SetTimeOffsets, TransformRays};
use crate::scene::Scene;

/// Handle to a node inside one [`Graph`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// Per-run lifecycle of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodePhase {
    Idle,
    Validated,
    Enqueued,
    Completed,
    /// A predecessor failed or the run was cancelled before this node.
    Skipped,
}

/// Set of fields a node advertises to its successors.
pub(crate) type FieldSet = BTreeSet<Field>;

/// Which inputs a node kind accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Accepts {
    None,
    Rays,
    Points,
    PointsMany,
}

/// Capability record driving generic validation.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Caps {
    pub produces_rays: bool,
    pub produces_points: bool,
    pub accepts: Accepts,
}

/// What validation knows about one input node.
pub(crate) struct InputMeta {
    pub name: String,
    pub produces_rays: bool,
    pub produces_points: bool,
    pub fields: FieldSet,
}

/// One input's materialized outputs handed to `execute`.
pub(crate) struct InputData {
    pub width: usize,
    pub fields: HashMap<Field, Arc<DeviceAsyncArray>>,
}

impl InputData {
    pub fn field(&self, field: Field) -> Result<&Arc<DeviceAsyncArray>> {
        self.fields.get(&field).ok_or_else(|| {
            Error::InvalidPipeline(format!("input does not provide field {}", field))
        })
    }
}

/// Outputs produced by one node execution.
pub(crate) struct NodeOutputs {
    pub width: usize,
    pub fields: HashMap<Field, Arc<DeviceAsyncArray>>,
}

/// Execution context handed to nodes while the scheduler walks the order.
pub(crate) struct ExecCtx<'a> {
    pub stream: &'a Stream,
    scratch: &'a mut Vec<Box<dyn Any + Send>>,
}

impl ExecCtx<'_> {
    /// Keep `value` alive until the run completes. Used for transient
    /// device buffers referenced by kernels already enqueued.
    pub fn pin<T: Any + Send>(&mut self, value: T) {
        self.scratch.push(Box::new(value));
    }
}

/// Behavior shared by every node kind. State lives in plain structs; the
/// graph stores them behind [`NodeKind`].
pub(crate) trait NodeImpl: Send {
    fn type_name(&self) -> &'static str;
    fn caps(&self) -> Caps;

    /// Fields this node needs from its (first) input.
    fn required_fields(&self) -> Vec<Field> {
        Vec::new()
    }

    /// Fields this node will advertise, given its inputs' advertisements.
    fn provided_fields(&self, inputs: &[FieldSet]) -> FieldSet;

    /// Kind-specific validation beyond arity/capability/field checks.
    fn validate(&self, inputs: &[InputMeta]) -> Result<()> {
        let _ = inputs;
        Ok(())
    }

    fn execute(&mut self, inputs: &[InputData], ctx: &mut ExecCtx) -> Result<NodeOutputs>;
}

pub(crate) enum NodeKind {
    FromMat3x4fRays(FromMat3x4fRays),
    TransformRays(TransformRays),
    SetRingIds(SetRingIds),
    SetTimeOffsets(SetTimeOffsets),
    Raytrace(Raytrace),
    TransformPoints(TransformPoints),
    GaussianNoiseDistance(GaussianNoiseDistance),
    GaussianNoiseAngle(GaussianNoiseAngle),
    CompactByField(CompactByField),
    FormatPoints(FormatPoints),
    YieldPoints(YieldPoints),
    FromArrayPoints(FromArrayPoints),
    SpatialMerge(SpatialMerge),
    TemporalMerge(TemporalMerge),
    RadarPostprocess(RadarPostprocess),
    FilterGround(FilterGround),
}

impl NodeKind {
    fn as_impl(&self) -> &dyn NodeImpl {
        match self {
            NodeKind::FromMat3x4fRays(s) => s,
            NodeKind::TransformRays(s) => s,
            NodeKind::SetRingIds(s) => s,
            NodeKind::SetTimeOffsets(s) => s,
            NodeKind::Raytrace(s) => s,
            NodeKind::TransformPoints(s) => s,
            NodeKind::GaussianNoiseDistance(s) => s,
            NodeKind::GaussianNoiseAngle(s) => s,
            NodeKind::CompactByField(s) => s,
            NodeKind::FormatPoints(s) => s,
            NodeKind::YieldPoints(s) => s,
            NodeKind::FromArrayPoints(s) => s,
            NodeKind::SpatialMerge(s) => s,
            NodeKind::TemporalMerge(s) => s,
            NodeKind::RadarPostprocess(s) => s,
            NodeKind::FilterGround(s) => s,
        }
    }

    fn as_impl_mut(&mut self) -> &mut dyn NodeImpl {
        match self {
            NodeKind::FromMat3x4fRays(s) => s,
            NodeKind::TransformRays(s) => s,
            NodeKind::SetRingIds(s) => s,
            NodeKind::SetTimeOffsets(s) => s,
            NodeKind::Raytrace(s) => s,
            NodeKind::TransformPoints(s) => s,
            NodeKind::GaussianNoiseDistance(s) => s,
            NodeKind::GaussianNoiseAngle(s) => s,
            NodeKind::CompactByField(s) => s,
            NodeKind::FormatPoints(s) => s,
            NodeKind::YieldPoints(s) => s,
            NodeKind::FromArrayPoints(s) => s,
            NodeKind::SpatialMerge(s) => s,
            NodeKind::TemporalMerge(s) => s,
            NodeKind::RadarPostprocess(s) => s,
            NodeKind::FilterGround(s) => s,
        }
    }
}

struct GpuEvent(Event);
// CUDA events are usable from any thread with the context current.
unsafe impl Send for GpuEvent {}
unsafe impl Sync for GpuEvent {}

struct GpuStream(Stream);
unsafe impl Send for GpuStream {}

struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<NodeId>,
    phase: NodePhase,
    width: usize,
    outputs: HashMap<Field, Arc<DeviceAsyncArray>>,
    event: Option<Arc<GpuEvent>>,
}

// Device handles held inside node state are context-global; the graph
// lock serializes all access to them.
unsafe impl Send for Node {}

#[derive(Clone, Debug)]
enum RunOutcome {
    InFlight,
    Succeeded,
    Failed(Error),
    Cancelled,
}

struct RunCtx {
    stream: Mutex<GpuStream>,
    outcome: Mutex<RunOutcome>,
    /// Recorded on the run stream after the last node's enqueue.
    done_event: Mutex<Option<Arc<GpuEvent>>>,
    /// Pins node outputs and transient device scratch until the run ends.
    registry: Mutex<RunRegistry>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct RunRegistry {
    arrays: Vec<Arc<DeviceAsyncArray>>,
    scratch: Vec<Box<dyn Any + Send>>,
}

struct GraphState {
    nodes: Vec<Node>,
    running: bool,
    run: Option<Arc<RunCtx>>,
}

struct GraphShared {
    state: Mutex<GraphState>,
    idle: Condvar,
    cancel: AtomicBool,
}

/// A processing graph. Cheap to clone; clones share the same graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphShared>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GraphShared {
                state: Mutex::new(GraphState {
                    nodes: Vec::new(),
                    running: false,
                    run: None,
                }),
                idle: Condvar::new(),
                cancel: AtomicBool::new(false),
            }),
        }
    }

    // ---- construction ----------------------------------------------------

    fn add_node(&self, kind: NodeKind) -> NodeId {
        let mut state = self.wait_idle();
        let id = state.nodes.len() as u32;
        let name = format!("{}#{}", kind.as_impl().type_name(), id);
        state.nodes.push(Node {
            name,
            kind,
            inputs: Vec::new(),
            phase: NodePhase::Idle,
            width: 0,
            outputs: HashMap::new(),
            event: None,
        });
        NodeId(id)
    }

    /// Use `parent`'s output as an input of `child`.
    pub fn connect(&self, parent: NodeId, child: NodeId) -> Result<()> {
        if parent == child {
            return Err(Error::InvalidPipeline("node cannot feed itself".into()));
        }
        let mut state = self.wait_idle();
        if parent.0 as usize >= state.nodes.len() || child.0 as usize >= state.nodes.len() {
            return Err(Error::InvalidArgument("unknown node handle".into()));
        }
        let child_node = &mut state.nodes[child.0 as usize];
        if child_node.inputs.contains(&parent) {
            return Err(Error::InvalidPipeline(format!(
                "{} is already connected to that input",
                child_node.name
            )));
        }
        child_node.inputs.push(parent);
        Ok(())
    }

    /// Remove the `parent -> child` connection.
    pub fn disconnect(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let mut state = self.wait_idle();
        let child_node = state
            .nodes
            .get_mut(child.0 as usize)
            .ok_or_else(|| Error::InvalidArgument("unknown node handle".into()))?;
        let before = child_node.inputs.len();
        child_node.inputs.retain(|p| *p != parent);
        if child_node.inputs.len() == before {
            return Err(Error::InvalidPipeline(format!(
                "{} has no such input connection",
                child_node.name
            )));
        }
        Ok(())
    }

    pub fn add_rays_from_mat3x4f(&self, rays: &[Mat3x4f]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::FromMat3x4fRays(FromMat3x4fRays::new(rays)?)))
    }

    /// Replace the ray set of a `rays_from_mat3x4f` node.
    pub fn set_rays_from_mat3x4f(&self, node: NodeId, rays: &[Mat3x4f]) -> Result<()> {
        self.with_kind(node, |kind| match kind {
            NodeKind::FromMat3x4fRays(s) => s.set_rays(rays),
            _ => Err(Error::InvalidArgument("node is not a ray source".into())),
        })
    }

    pub fn add_rays_transform(&self, transform: Mat3x4f) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::TransformRays(TransformRays::new(transform)?)))
    }

    pub fn set_rays_transform(&self, node: NodeId, transform: Mat3x4f) -> Result<()> {
        self.with_kind(node, |kind| match kind {
            NodeKind::TransformRays(s) => s.set_transform(transform),
            _ => Err(Error::InvalidArgument("node is not a ray transform".into())),
        })
    }

    pub fn add_rays_ring_ids(&self, ring_ids: &[u16]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::SetRingIds(SetRingIds::new(ring_ids)?)))
    }

    pub fn add_rays_time_offsets(&self, offsets_s: &[f64]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::SetTimeOffsets(SetTimeOffsets::new(offsets_s)?)))
    }

    /// Ray-casting node against `scene`. `range_m` is the maximum hit
    /// distance; beyond it a ray reports a miss.
    pub fn add_raytrace(&self, scene: &Arc<Scene>, range_m: f32) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::Raytrace(Raytrace::new(scene.clone(), range_m)?)))
    }

    pub fn set_raytrace_range(&self, node: NodeId, range_m: f32) -> Result<()> {
        self.with_kind(node, |kind| match kind {
            NodeKind::Raytrace(s) => s.set_range(range_m),
            _ => Err(Error::InvalidArgument("node is not a raytrace node".into())),
        })
    }

    pub fn add_points_transform(&self, transform: Mat3x4f) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::TransformPoints(TransformPoints::new(transform)?)))
    }

    pub fn add_points_noise_distance(
        &self,
        mean_m: f32,
        st_dev_base_m: f32,
        st_dev_rise_per_meter: f32,
    ) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::GaussianNoiseDistance(GaussianNoiseDistance::new(
            mean_m,
            st_dev_base_m,
            st_dev_rise_per_meter,
        )?)))
    }

    pub fn add_points_noise_angle(&self, mean_rad: f32, st_dev_rad: f32) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::GaussianNoiseAngle(GaussianNoiseAngle::new(
            mean_rad, st_dev_rad,
        )?)))
    }

    /// Keep only points whose `field` value is non-zero, preserving order.
    pub fn add_points_compact_by(&self, field: Field) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::CompactByField(CompactByField::new(field)?)))
    }

    /// Keep only points that hit geometry ([`Field::IsHit`]).
    pub fn add_points_compact(&self) -> Result<NodeId> {
        self.add_points_compact_by(Field::IsHit)
    }

    /// Pack the listed fields into one interleaved buffer, available on
    /// this node as [`Field::DynamicFormat`].
    pub fn add_points_format(&self, fields: &[Field]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::FormatPoints(FormatPoints::new(fields)?)))
    }

    /// Terminal readback node: prefetches the listed fields to pinned
    /// host memory when the run reaches it.
    pub fn add_points_yield(&self, fields: &[Field]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::YieldPoints(YieldPoints::new(fields)?)))
    }

    /// Entry node over caller-supplied SoA host data.
    pub fn add_points_from_array(&self, width: usize, fields: &[(Field, &[u8])]) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::FromArrayPoints(FromArrayPoints::new(
            width, fields,
        )?)))
    }

    /// Concatenate every input's point cloud, in connection order.
    pub fn add_points_spatial_merge(&self) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::SpatialMerge(SpatialMerge::new())))
    }

    /// Accumulate the input's points across consecutive runs.
    pub fn add_points_temporal_merge(&self) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::TemporalMerge(TemporalMerge::new())))
    }

    /// Radar-style cluster reduction; see the [`radar`](crate::radar)
    /// module for the algorithm.
    pub fn add_radar_postprocess(
        &self,
        distance_separation_m: f32,
        azimuth_separation_rad: f32,
    ) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::RadarPostprocess(RadarPostprocess::new(
            distance_separation_m,
            azimuth_separation_rad,
        )?)))
    }

    pub fn set_radar_postprocess(
        &self,
        node: NodeId,
        distance_separation_m: f32,
        azimuth_separation_rad: f32,
    ) -> Result<()> {
        self.with_kind(node, |kind| match kind {
            NodeKind::RadarPostprocess(s) => {
                s.set_separations(distance_separation_m, azimuth_separation_rad)
            }
            _ => Err(Error::InvalidArgument("node is not a radar node".into())),
        })
    }

    /// Classify ground-plane points into [`Field::IsGround`].
    pub fn add_filter_ground(
        &self,
        thickness_m: f32,
        sensor_height_m: Option<f32>,
    ) -> Result<NodeId> {
        Ok(self.add_node(NodeKind::FilterGround(FilterGround::new(
            thickness_m,
            sensor_height_m,
        )?)))
    }

    fn with_kind<R>(&self, node: NodeId, f: impl FnOnce(&mut NodeKind) -> Result<R>) -> Result<R> {
        let mut state = self.wait_idle();
        let n = state
            .nodes
            .get_mut(node.0 as usize)
            .ok_or_else(|| Error::InvalidArgument("unknown node handle".into()))?;
        f(&mut n.kind)
    }

    // ---- execution -------------------------------------------------------

    /// Compile and start one run of the graph.
    ///
    /// Discovery, ordering and validation happen synchronously; on
    /// success the node walk continues on a scheduler thread and this
    /// call returns. Any previous run is waited for first.
    pub fn run(&self) -> Result<()> {
        let mut state = self.wait_idle();
        if state.nodes.is_empty() {
            return Err(Error::InvalidPipeline("graph has no nodes".into()));
        }

        let order = topological_order(&state.nodes)?;
        validate_all(&mut state.nodes, &order)?;

        let needs_scene = state
            .nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Raytrace(_)));

        let dev = device::device()?;
        dev.make_current()?;

        // At most one run is active per graph: the host side of the
        // previous run is over (wait_idle), and its device work must
        // drain before this run's host-staged uploads may touch shared
        // arrays.
        if let Some(prev) = &state.run {
            if let Some(handle) = prev.thread.lock().unwrap().take() {
                let _ = handle.join();
            }
            prev.stream.lock().unwrap().0.synchronize()?;
        }

        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        // Chain on the previous run's completion event as well, so any
        // work recorded after the sync point stays ordered.
        let prev_event = state
            .run
            .as_ref()
            .and_then(|r| r.done_event.lock().unwrap().clone());
        if let Some(prev) = prev_event {
            stream.wait_event(&prev.0, cust::stream::StreamWaitEventFlags::DEFAULT)?;
        }

        if needs_scene {
            // Settle acceleration structures before the first node runs.
            for node in state.nodes.iter() {
                if let NodeKind::Raytrace(rt) = &node.kind {
                    rt.scene().commit(&stream)?;
                }
            }
        }

        self.inner.cancel.store(false, Ordering::SeqCst);
        let run = Arc::new(RunCtx {
            stream: Mutex::new(GpuStream(stream)),
            outcome: Mutex::new(RunOutcome::InFlight),
            done_event: Mutex::new(None),
            registry: Mutex::new(RunRegistry::default()),
            thread: Mutex::new(None),
        });
        state.run = Some(run.clone());
        state.running = true;

        // The walker blocks on the graph lock until this call releases it,
        // so the join handle can be stashed race-free through the run ctx.
        let shared = self.inner.clone();
        let walker_run = run.clone();
        let handle = std::thread::Builder::new()
            .name("lidarsim-graph".into())
            .spawn(move || scheduler_walk(&shared, &walker_run, &order))
            .map_err(|e| Error::Device(format!("cannot spawn scheduler thread: {}", e)))?;
        *run.thread.lock().unwrap() = Some(handle);
        drop(state);
        Ok(())
    }

    /// Block until the active run has fully completed on the device and
    /// report its outcome.
    pub fn synchronize(&self) -> Result<()> {
        let run = {
            let state = self.inner.state.lock().unwrap();
            match &state.run {
                Some(run) => run.clone(),
                None => return Ok(()),
            }
        };
        if let Some(handle) = run.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        device::device()?.make_current()?;
        run.stream.lock().unwrap().0.synchronize()?;

        let mut state = self.inner.state.lock().unwrap();
        for node in state.nodes.iter_mut() {
            if node.phase == NodePhase::Enqueued {
                node.phase = NodePhase::Completed;
            }
        }
        drop(state);

        let outcome = run.outcome.lock().unwrap().clone();
        match outcome {
            RunOutcome::InFlight | RunOutcome::Succeeded => Ok(()),
            RunOutcome::Failed(err) => Err(err),
            RunOutcome::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Request cooperative cancellation of the active run. Nodes not yet
    /// enqueued become [`NodePhase::Skipped`]; in-flight device work
    /// completes and its outputs are discarded. A no-op when no run is
    /// active.
    pub fn cancel(&self) {
        self.inner.cancel.store(true, Ordering::SeqCst);
    }

    // ---- readback --------------------------------------------------------

    /// Point count of `node`'s output for the current run. Blocks until
    /// the node's device work has drained.
    pub fn get_width(&self, node: NodeId) -> Result<usize> {
        let (event, width) = {
            let state = self.inner.state.lock().unwrap();
            let n = lookup(&state, node)?;
            ensure_readable(n)?;
            (n.event.clone(), n.width)
        };
        if let Some(event) = event {
            device::device()?.make_current()?;
            event.0.synchronize()?;
        }
        Ok(width)
    }

    /// Raw bytes of one output field of `node`. Blocks until the node's
    /// device work has drained. Thread-safe for concurrent readers.
    pub fn get_field_bytes(&self, node: NodeId, field: Field) -> Result<Vec<u8>> {
        let (event, array) = {
            let state = self.inner.state.lock().unwrap();
            let n = lookup(&state, node)?;
            ensure_readable(n)?;
            let array = n.outputs.get(&field).cloned().ok_or_else(|| {
                Error::InvalidPipeline(format!("{} does not produce field {}", n.name, field))
            })?;
            (n.event.clone(), array)
        };
        device::device()?.make_current()?;
        if let Some(event) = event {
            event.0.synchronize()?;
        }

        let mut state = self.inner.state.lock().unwrap();
        let n = lookup_mut(&mut state, node)?;
        if n.phase == NodePhase::Enqueued {
            n.phase = NodePhase::Completed;
        }
        // Yield nodes prefetched their fields to pinned host memory
        // during the run; serve those without touching the device.
        if let NodeKind::YieldPoints(y) = &n.kind {
            if let Some(bytes) = y.host_copy(field) {
                return Ok(bytes);
            }
        }
        drop(state);

        array.read_bytes()
    }

    /// Typed view of one output field of `node`.
    pub fn get_field_data<T: bytemuck::Pod>(&self, node: NodeId, field: Field) -> Result<Vec<T>> {
        let bytes = self.get_field_bytes(node, field)?;
        if bytes.len() % std::mem::size_of::<T>() != 0 {
            return Err(Error::InvalidArgument(format!(
                "field {} does not reinterpret as the requested element type",
                field
            )));
        }
        Ok(bytemuck::cast_slice(&bytes).to_vec())
    }

    /// Current phase of `node`, for tests and diagnostics.
    pub fn node_phase(&self, node: NodeId) -> Result<NodePhase> {
        let state = self.inner.state.lock().unwrap();
        Ok(lookup(&state, node)?.phase)
    }

    fn wait_idle(&self) -> std::sync::MutexGuard<'_, GraphState> {
        let state = self.inner.state.lock().unwrap();
        self.inner
            .idle
            .wait_while(state, |s| s.running)
            .expect("graph lock poisoned")
    }
}

fn lookup<'a>(state: &'a GraphState, node: NodeId) -> Result<&'a Node> {
    state
        .nodes
        .get(node.0 as usize)
        .ok_or_else(|| Error::InvalidArgument("unknown node handle".into()))
}

fn lookup_mut<'a>(state: &'a mut GraphState, node: NodeId) -> Result<&'a mut Node> {
    state
        .nodes
        .get_mut(node.0 as usize)
        .ok_or_else(|| Error::InvalidArgument("unknown node handle".into()))
}

fn ensure_readable(node: &Node) -> Result<()> {
    match node.phase {
        NodePhase::Enqueued | NodePhase::Completed => Ok(()),
        NodePhase::Skipped => Err(Error::InvalidPipeline(format!(
            "{} was skipped in the last run",
            node.name
        ))),
        NodePhase::Idle | NodePhase::Validated => Err(Error::InvalidPipeline(format!(
            "{} has not produced output in any run",
            node.name
        ))),
    }
}

/// Stable topological order: Kahn's algorithm, always popping the
/// lowest-id node from the ready set, so ties break by insertion order
/// regardless of the order connections were made in.
fn topological_order(nodes: &[Node]) -> Result<Vec<u32>> {
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.inputs.len()).collect();
    let mut successors: Vec<Vec<u32>> = vec![Vec::new(); nodes.len()];
    for (id, node) in nodes.iter().enumerate() {
        for input in &node.inputs {
            successors[input.0 as usize].push(id as u32);
        }
    }

    let mut ready: BTreeSet<u32> = indegree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| id as u32)
        .collect();

    let mut out = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_first() {
        out.push(id);
        for &succ in &successors[id as usize] {
            indegree[succ as usize] -= 1;
            if indegree[succ as usize] == 0 {
                ready.insert(succ);
            }
        }
    }

    if out.len() != nodes.len() {
        // Every unscheduled node sits on or behind a cycle; name the
        // first one for the error.
        let stuck = (0..nodes.len())
            .find(|id| indegree[*id] > 0)
            .expect("unscheduled node has pending inputs");
        return Err(Error::InvalidPipeline(format!(
            "cycle detected at {}",
            nodes[stuck].name
        )));
    }
    Ok(out)
}

/// Walk the order performing arity, capability, required-field and
/// kind-specific checks. Nodes left in `Validated` phase on success.
fn validate_all(nodes: &mut [Node], order: &[u32]) -> Result<()> {
    let mut advertised: HashMap<u32, FieldSet> = HashMap::new();

    for &id in order {
        let node = &nodes[id as usize];
        let caps = node.kind.as_impl().caps();

        match caps.accepts {
            Accepts::None => {
                if !node.inputs.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "{} is a source node and accepts no input",
                        node.name
                    )));
                }
            }
            Accepts::Rays | Accepts::Points => {
                if node.inputs.len() != 1 {
                    return Err(Error::InvalidPipeline(format!(
                        "{} requires exactly one input, has {}",
                        node.name,
                        node.inputs.len()
                    )));
                }
            }
            Accepts::PointsMany => {
                if node.inputs.is_empty() {
                    return Err(Error::InvalidPipeline(format!(
                        "{} requires at least one input",
                        node.name
                    )));
                }
            }
        }

        let mut metas = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let in_node = &nodes[input.0 as usize];
            let in_caps = in_node.kind.as_impl().caps();
            let ok = match caps.accepts {
                Accepts::Rays => in_caps.produces_rays,
                Accepts::Points | Accepts::PointsMany => in_caps.produces_points,
                Accepts::None => false,
            };
            if !ok {
                return Err(Error::InvalidPipeline(format!(
                    "{} cannot consume the output of {}",
                    node.name, in_node.name
                )));
            }
            metas.push(InputMeta {
                name: in_node.name.clone(),
                produces_rays: in_caps.produces_rays,
                produces_points: in_caps.produces_points,
                fields: advertised
                    .get(&input.0)
                    .cloned()
                    .unwrap_or_default(),
            });
        }

        if let Some(meta) = metas.first() {
            for required in node.kind.as_impl().required_fields() {
                if !meta.fields.contains(&required) {
                    return Err(Error::InvalidPipeline(format!(
                        "{} requires field {} which {} does not provide",
                        node.name, required, meta.name
                    )));
                }
            }
        }

        node.kind.as_impl().validate(&metas)?;

        let input_fields: Vec<FieldSet> = metas.into_iter().map(|m| m.fields).collect();
        let provided = node.kind.as_impl().provided_fields(&input_fields);
        advertised.insert(id, provided);
    }

    for node in nodes.iter_mut() {
        node.phase = NodePhase::Validated;
        node.event = None;
    }
    Ok(())
}

fn scheduler_walk(shared: &GraphShared, run: &RunCtx, order: &[u32]) {
    let outcome = (|| -> RunOutcome {
        if let Err(e) = device::device().and_then(|d| d.make_current()) {
            return RunOutcome::Failed(e);
        }
        let mut state = shared.state.lock().unwrap();

        for (walked, &id) in order.iter().enumerate() {
            if shared.cancel.load(Ordering::SeqCst) {
                for &rest in &order[walked..] {
                    state.nodes[rest as usize].phase = NodePhase::Skipped;
                }
                debug!("run cancelled between nodes");
                return RunOutcome::Cancelled;
            }

            // Consumers read their inputs through cheap Arc clones so the
            // node itself can be borrowed mutably below.
            let inputs: Vec<InputData> = state.nodes[id as usize]
                .inputs
                .clone()
                .iter()
                .map(|input| {
                    let n = &state.nodes[input.0 as usize];
                    InputData {
                        width: n.width,
                        fields: n.outputs.clone(),
                    }
                })
                .collect();

            let stream_guard = run.stream.lock().unwrap();
            let stream = &stream_guard.0;
            let mut registry = run.registry.lock().unwrap();
            let node = &mut state.nodes[id as usize];
            let result = {
                let mut ctx = ExecCtx {
                    stream,
                    scratch: &mut registry.scratch,
                };
                node.kind.as_impl_mut().execute(&inputs, &mut ctx)
            };

            match result {
                Ok(outputs) => {
                    registry.arrays.extend(outputs.fields.values().cloned());
                    node.width = outputs.width;
                    node.outputs = outputs.fields;
                    node.phase = NodePhase::Enqueued;
                    let event = Event::new(EventFlags::DEFAULT)
                        .and_then(|e| e.record(stream).map(|_| e));
                    match event {
                        Ok(e) => node.event = Some(Arc::new(GpuEvent(e))),
                        Err(e) => return RunOutcome::Failed(e.into()),
                    }
                }
                Err(err) => {
                    warn!(node = %state.nodes[id as usize].name, error = %err, "node failed; skipping the rest of the run");
                    for &rest in &order[walked..] {
                        state.nodes[rest as usize].phase = NodePhase::Skipped;
                    }
                    return RunOutcome::Failed(err);
                }
            }
        }
        RunOutcome::Succeeded
    })();

    // Mark the device-side end of the run so the next run's stream can
    // chain on it.
    {
        let stream_guard = run.stream.lock().unwrap();
        if let Ok(event) = Event::new(EventFlags::DEFAULT) {
            if event.record(&stream_guard.0).is_ok() {
                *run.done_event.lock().unwrap() = Some(Arc::new(GpuEvent(event)));
            }
        }
    }

    *run.outcome.lock().unwrap() = outcome;
    let mut state = shared.state.lock().unwrap();
    state.running = false;
    drop(state);
    shared.idle.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_node(graph: &Graph) -> NodeId {
        graph.add_rays_transform(Mat3x4f::IDENTITY).unwrap()
    }

    fn order_of(graph: &Graph) -> Result<Vec<u32>> {
        let state = graph.inner.state.lock().unwrap();
        topological_order(&state.nodes)
    }

    #[test]
    fn ties_break_by_insertion_order_not_connection_order() {
        let graph = Graph::new();
        let _a = chain_node(&graph); // id 0
        let b = chain_node(&graph); // id 1
        let _c = chain_node(&graph); // id 2
        let d = chain_node(&graph); // id 3
        // Wired after creation: the later-created d feeds the earlier b.
        graph.connect(d, b).unwrap();

        // c is ready from the start and precedes d/b despite the late edge.
        assert_eq!(order_of(&graph).unwrap(), vec![0, 2, 3, 1]);
    }

    #[test]
    fn inputs_always_precede_consumers() {
        let graph = Graph::new();
        let a = chain_node(&graph);
        let b = chain_node(&graph);
        let c = chain_node(&graph);
        graph.connect(c, a).unwrap();
        graph.connect(a, b).unwrap();

        let order = order_of(&graph).unwrap();
        let pos = |id: NodeId| order.iter().position(|&x| x == id.0).unwrap();
        assert!(pos(c) < pos(a), "order {:?}", order);
        assert!(pos(a) < pos(b), "order {:?}", order);
    }

    #[test]
    fn cycles_are_reported_with_a_node_name() {
        let graph = Graph::new();
        let a = chain_node(&graph);
        let b = chain_node(&graph);
        graph.connect(a, b).unwrap();
        graph.connect(b, a).unwrap();

        match order_of(&graph) {
            Err(Error::InvalidPipeline(msg)) => {
                assert!(msg.contains("cycle detected"), "unexpected: {}", msg)
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }
}
