//! The execution plan: owner of the actor set, the memory plan, and the
//! device binding for one compiled graph, plus the `prepare` / `run` /
//! `resize` driver API.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use graphrt_core::config::RuntimeConfig;
use graphrt_core::device::{DeviceBuffer, DeviceContext};
use graphrt_core::error::{GraphRtError, Result};
use graphrt_core::graph::{KernelGraph, NodeKind};
use graphrt_core::kernel::{KernelRegistry, ResizeStatus};
use graphrt_core::memplan::{ArenaPlanner, BufferKey, ContiguousGroup, MemoryPlan, TensorRequest};
use graphrt_core::tensor::{BufferRegion, DeviceTensor, HostTensor, TensorDesc};
use graphrt_core::types::{NodeId, Shape, TensorKey};

use crate::actor::{Actor, ActorId};
use crate::builder::{build_actor_graph, OutputCollector};
use crate::mailbox::{ActorMessage, TensorRef};
use crate::scheduler::{CompletionGate, SchedShared, Scheduler, SchedulerStats};

/// Opaque plan handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanId(Uuid);

impl PlanId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of plan metrics.
#[derive(Debug, Clone, Default)]
pub struct PlanMetrics {
    /// Completed `run` epochs.
    pub epochs: u64,
    /// Kernel launches issued.
    pub kernels_launched: u64,
    /// Messages delivered between actors.
    pub messages: u64,
    /// Current arena size in bytes.
    pub arena_bytes: usize,
}

struct MetricsInner {
    epochs: AtomicU64,
    kernels_launched: AtomicU64,
    messages: AtomicU64,
    arena_bytes: AtomicUsize,
}

/// Per-node shape resolution produced by the resize fixpoint.
struct Resolved {
    ready: bool,
    input_descs: Vec<TensorDesc>,
    node_inputs: Vec<Vec<TensorDesc>>,
    node_outputs: Vec<Vec<TensorDesc>>,
    node_workspaces: Vec<Vec<usize>>,
}

/// Arena, placements, and the device-tensor table for the current shapes.
struct MemoryState {
    arena: Option<Box<dyn DeviceBuffer>>,
    plan: MemoryPlan,
    tensors: Vec<DeviceTensor>,
    input_refs: Vec<TensorRef>,
}

/// Counters for the in-flight epoch.
struct EpochState {
    /// Actors queued or executing (including stream-side completion).
    pending: AtomicUsize,
    /// Actors that completed this epoch.
    completed: AtomicUsize,
    /// Actors dispatched (past the abort check) this epoch.
    dispatched: AtomicUsize,
    /// All graph outputs received.
    collector_done: AtomicBool,
    /// First failure of the epoch.
    error: Mutex<Option<GraphRtError>>,
}

pub(crate) struct PlanInner {
    id: PlanId,
    graph: KernelGraph,
    config: RuntimeConfig,
    device: Arc<dyn DeviceContext>,
    actors: Vec<Arc<Actor>>,
    sources: Vec<ActorId>,
    topo_pos: Vec<usize>,
    has_merge: bool,
    collector: OutputCollector,
    sched: Arc<SchedShared>,
    gate: CompletionGate,
    epoch: AtomicU64,
    in_flight: AtomicBool,
    resolved: RwLock<Resolved>,
    memory: RwLock<MemoryState>,
    epoch_state: EpochState,
    metrics: MetricsInner,
}

/// A prepared, executable plan for one compiled kernel graph.
///
/// Exactly one execution is in flight per plan at a time; a second concurrent
/// `run` fails with [`GraphRtError::PlanBusy`].
pub struct ExecutionPlan {
    inner: Arc<PlanInner>,
    scheduler: Scheduler,
}

impl ExecutionPlan {
    /// Build and bind the actor graph and memory plan for `graph`.
    ///
    /// Configuration errors (unsupported kernels, invalid graphs, infeasible
    /// memory budgets for statically shaped graphs) surface here, never at
    /// launch time.
    pub fn prepare(
        graph: KernelGraph,
        device: Arc<dyn DeviceContext>,
        registry: &KernelRegistry,
        config: RuntimeConfig,
    ) -> Result<Self> {
        config.validate()?;
        graph.validate()?;
        let topo = graph.topo_order()?;
        let mut topo_pos = vec![0usize; graph.nodes().len()];
        for (pos, id) in topo.iter().enumerate() {
            topo_pos[id.0] = pos;
        }

        let streams = (0..config.num_streams)
            .map(|_| device.create_stream())
            .collect::<Result<Vec<_>>>()?;
        let built = build_actor_graph(&graph, registry, &streams, config.mailbox_capacity)?;
        let has_merge = graph.nodes().iter().any(|n| n.kind == NodeKind::Merge);
        let node_count = graph.nodes().len();

        let inner = Arc::new(PlanInner {
            id: PlanId::generate(),
            collector: OutputCollector::new(graph.outputs().len()),
            sched: Arc::new(SchedShared::new()),
            gate: CompletionGate::new(),
            epoch: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
            resolved: RwLock::new(Resolved {
                ready: false,
                input_descs: graph.inputs().iter().map(|i| i.desc.clone()).collect(),
                node_inputs: vec![Vec::new(); node_count],
                node_outputs: vec![Vec::new(); node_count],
                node_workspaces: vec![Vec::new(); node_count],
            }),
            memory: RwLock::new(MemoryState {
                arena: None,
                plan: MemoryPlan::default(),
                tensors: Vec::new(),
                input_refs: Vec::new(),
            }),
            epoch_state: EpochState {
                pending: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                dispatched: AtomicUsize::new(0),
                collector_done: AtomicBool::new(false),
                error: Mutex::new(None),
            },
            metrics: MetricsInner {
                epochs: AtomicU64::new(0),
                kernels_launched: AtomicU64::new(0),
                messages: AtomicU64::new(0),
                arena_bytes: AtomicUsize::new(0),
            },
            actors: built.actors,
            sources: built.sources,
            topo_pos,
            has_merge,
            graph,
            config: config.clone(),
            device,
        });

        // Statically shaped graphs resolve and plan memory up front.
        if inner.graph.inputs().iter().all(|i| i.desc.shape.is_static()) {
            let shapes: Vec<Shape> = inner
                .graph
                .inputs()
                .iter()
                .map(|i| i.desc.shape.clone())
                .collect();
            inner.resolve(&shapes)?;
        }

        let weak = Arc::downgrade(&inner);
        let runner = Arc::new(move |id: ActorId| {
            if let Some(plan) = weak.upgrade() {
                PlanInner::run_actor(&plan, id);
            }
        });
        let scheduler = Scheduler::start(
            Arc::clone(&inner.sched),
            config.resolved_workers(),
            runner,
        );

        info!(
            plan = %inner.id,
            actors = inner.actors.len(),
            workers = config.resolved_workers(),
            streams = config.num_streams,
            "execution plan prepared"
        );

        Ok(Self { inner, scheduler })
    }

    /// Plan identity.
    pub fn id(&self) -> PlanId {
        self.inner.id
    }

    /// Re-resolve shapes for the next epoch. All per-kernel resizes complete
    /// here, before any launch of the new epoch is issued.
    pub fn resize(&self, shapes: &[Shape]) -> Result<()> {
        if self.inner.in_flight.load(Ordering::SeqCst) {
            return Err(GraphRtError::PlanBusy);
        }
        self.inner.resolve(shapes)
    }

    /// Execute one epoch: feed `inputs`, schedule, wait for the output
    /// collector or the first failure, and return the graph outputs.
    ///
    /// If the input shapes differ from the previously resolved shapes, the
    /// resize fixpoint runs first. Must not be called from a scheduler
    /// worker thread.
    pub fn run(&self, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        PlanInner::run(&self.inner, inputs)
    }

    /// Request a cooperative abort of the in-flight epoch: no new actor is
    /// dispatched, in-flight launches drain, and `run` returns an aborted
    /// status.
    pub fn abort(&self) {
        warn!(plan = %self.inner.id, "abort requested");
        self.inner.sched.set_abort();
        self.inner.maybe_finish();
    }

    /// Plan metrics snapshot.
    pub fn metrics(&self) -> PlanMetrics {
        PlanMetrics {
            epochs: self.inner.metrics.epochs.load(Ordering::Relaxed),
            kernels_launched: self.inner.metrics.kernels_launched.load(Ordering::Relaxed),
            messages: self.inner.metrics.messages.load(Ordering::Relaxed),
            arena_bytes: self.inner.metrics.arena_bytes.load(Ordering::Relaxed),
        }
    }

    /// Scheduler counters snapshot.
    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.inner.sched.stats()
    }

    /// Workspace sizes the given node resolved at the last resize.
    pub fn workspace_sizes(&self, node: NodeId) -> Vec<usize> {
        self.inner.resolved.read().node_workspaces[node.0].clone()
    }

    /// Current arena size in bytes.
    pub fn arena_size(&self) -> usize {
        self.inner.memory.read().plan.arena_size
    }

    /// Whether the calling thread belongs to this plan's worker pool.
    pub fn is_worker_thread(&self) -> bool {
        self.inner.sched.is_worker_thread()
    }

    /// Block until the in-flight epoch finishes. A no-op when called from a
    /// scheduler worker thread, so a worker can never deadlock on itself.
    pub fn wait(&self) -> Result<()> {
        self.inner.wait()
    }
}

impl Drop for ExecutionPlan {
    fn drop(&mut self) {
        self.inner.sched.set_abort();
        self.scheduler.shutdown();
    }
}

struct InFlightGuard<'a>(&'a PlanInner);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

impl PlanInner {
    // ------------------------------------------------------------------
    // Driver: run
    // ------------------------------------------------------------------

    fn run(this: &Arc<Self>, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
        if this.in_flight.swap(true, Ordering::SeqCst) {
            return Err(GraphRtError::PlanBusy);
        }
        let _guard = InFlightGuard(this.as_ref());

        if inputs.len() != this.graph.inputs().len() {
            return Err(GraphRtError::InvalidConfig(format!(
                "expected {} inputs, got {}",
                this.graph.inputs().len(),
                inputs.len()
            )));
        }
        for (i, (tensor, decl)) in inputs.iter().zip(this.graph.inputs()).enumerate() {
            if tensor.desc().dtype != decl.desc.dtype {
                return Err(GraphRtError::InvalidConfig(format!(
                    "input {} dtype {} does not match declared {}",
                    i,
                    tensor.desc().dtype,
                    decl.desc.dtype
                )));
            }
        }

        // Resize ahead of run whenever shapes changed.
        let shapes: Vec<Shape> = inputs.iter().map(|t| t.desc().shape.clone()).collect();
        let needs_resize = {
            let resolved = this.resolved.read();
            !resolved.ready
                || resolved
                    .input_descs
                    .iter()
                    .zip(&shapes)
                    .any(|(desc, shape)| &desc.shape != shape)
        };
        if needs_resize {
            this.resolve(&shapes)?;
        }

        let epoch = this.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        this.begin_epoch(epoch);
        debug!(plan = %this.id, epoch, "epoch started");

        // Feed graph inputs into their arena regions, then post them to every
        // bound consumer slot.
        {
            let memory = this.memory.read();
            let arena = memory.arena.as_ref().ok_or_else(|| {
                GraphRtError::InvalidConfig("plan has no materialized arena".to_string())
            })?;
            for (i, tensor) in inputs.iter().enumerate() {
                let tref = memory.input_refs[i];
                let offset = memory.tensors[tref.0].offset();
                arena.copy_from_host(offset, tensor.bytes())?;
            }
        }
        for (i, input) in this.graph.inputs().iter().enumerate() {
            let tref = this.memory.read().input_refs[i];
            for &(node, slot) in &input.bindings {
                Self::post(
                    this,
                    ActorId(node.0),
                    ActorMessage::Data {
                        slot,
                        tensor: tref,
                        epoch,
                    },
                );
            }
        }

        // Seed actors with no declared inputs.
        for &id in &this.sources {
            this.actors[id.0].arm_ready();
            this.epoch_state.pending.fetch_add(1, Ordering::SeqCst);
            this.sched.enqueue(id);
        }

        this.wait()?;

        // Collect outputs before re-arming anything.
        let outputs = this.collect_outputs();
        if let Ok(ref outs) = outputs {
            debug!(plan = %this.id, epoch, outputs = outs.len(), "epoch completed");
            this.metrics.epochs.fetch_add(1, Ordering::Relaxed);
            if !this.has_merge {
                this.check_refs_drained();
            }
        }
        outputs
    }

    fn begin_epoch(&self, epoch: u64) {
        let stale = self.sched.clear_queue();
        if stale > 0 {
            warn!(plan = %self.id, stale, "dropped stale queue entries from an abandoned epoch");
        }
        self.sched.clear_abort();
        self.gate.open();
        self.collector.reset();
        self.epoch_state.pending.store(0, Ordering::SeqCst);
        self.epoch_state.completed.store(0, Ordering::SeqCst);
        self.epoch_state.dispatched.store(0, Ordering::SeqCst);
        self.epoch_state.collector_done.store(false, Ordering::SeqCst);
        *self.epoch_state.error.lock() = None;
        for actor in &self.actors {
            actor.rearm(epoch);
        }
        let memory = self.memory.read();
        for tensor in &memory.tensors {
            tensor.rearm();
        }
    }

    fn wait(&self) -> Result<()> {
        // Re-entrancy rule: a wait from inside the pool must not block.
        if self.sched.is_worker_thread() {
            return Ok(());
        }
        match self.gate.wait(self.config.wait_timeout) {
            Err(GraphRtError::Timeout(t)) => {
                // A hung launch must not leave new dispatches running.
                self.sched.set_abort();
                Err(GraphRtError::Timeout(t))
            }
            other => other,
        }
    }

    fn collect_outputs(&self) -> Result<Vec<HostTensor>> {
        let memory = self.memory.read();
        let resolved = self.resolved.read();
        let arena = memory.arena.as_ref().expect("arena exists after run");

        let mut outputs = Vec::with_capacity(self.graph.outputs().len());
        for (position, key) in self.graph.outputs().iter().enumerate() {
            let tref = self.collector.received(position).ok_or_else(|| {
                GraphRtError::InvalidGraph(format!("graph output {key} was never produced"))
            })?;
            let desc = resolved.node_outputs[key.node.0][key.index].clone();
            let size = desc.size_bytes().ok_or_else(|| GraphRtError::ShapeUnresolved {
                node: self.graph.node(key.node).name.clone(),
            })?;
            let mut bytes = vec![0u8; size];
            arena.copy_to_host(memory.tensors[tref.0].offset(), &mut bytes)?;
            outputs.push(HostTensor::from_bytes(desc, bytes)?);
        }
        Ok(outputs)
    }

    fn check_refs_drained(&self) {
        let memory = self.memory.read();
        for (index, tensor) in memory.tensors.iter().enumerate() {
            if tensor.ref_count() != 0 {
                debug!(
                    tensor = index,
                    refs = tensor.ref_count(),
                    "tensor not fully released at epoch end"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduler callbacks
    // ------------------------------------------------------------------

    /// Dispatch path invoked by the worker pool for each ready actor.
    fn run_actor(this: &Arc<Self>, id: ActorId) {
        let actor = Arc::clone(&this.actors[id.0]);
        let epoch = this.epoch.load(Ordering::SeqCst);
        let Some(collected) = actor.try_begin_execute() else {
            // Stale entry from an abandoned epoch; its accounting was reset.
            return;
        };

        // Cooperative abort: checked before every dispatch.
        if this.sched.is_aborted() {
            this.sched.record_skip();
            this.finish_one();
            return;
        }
        this.epoch_state.dispatched.fetch_add(1, Ordering::SeqCst);

        match actor.kind {
            NodeKind::Merge => match collected.first().copied() {
                Some(taken) => Self::complete_actor(this, id, epoch, Some(taken)),
                None => Self::fail_actor(
                    this,
                    id,
                    epoch,
                    GraphRtError::InvalidGraph(format!(
                        "merge `{}` fired without a branch payload",
                        actor.name
                    )),
                ),
            },
            NodeKind::Kernel => {
                if let Err(error) = this.dispatch_kernel(&actor, &collected) {
                    Self::fail_actor(this, id, epoch, error);
                    return;
                }
                this.metrics.kernels_launched.fetch_add(1, Ordering::Relaxed);

                // Observe completion strictly after the launched work: the
                // stream is FIFO, so this task runs once the kernel finished.
                let weak = Arc::downgrade(this);
                let stream = Arc::clone(&actor.stream);
                let name = actor.name.clone();
                let enqueued = actor.stream.enqueue(Box::new(move || {
                    if let Some(plan) = weak.upgrade() {
                        match stream.take_fault() {
                            Some(fault) => PlanInner::fail_actor(
                                &plan,
                                id,
                                epoch,
                                GraphRtError::LaunchFailed {
                                    node: name,
                                    reason: fault.message,
                                },
                            ),
                            None => PlanInner::complete_actor(&plan, id, epoch, None),
                        }
                    }
                }));
                if let Err(error) = enqueued {
                    Self::fail_actor(this, id, epoch, error);
                }
            }
        }
    }

    /// Resize-then-launch on the actor's kernel. The driver already resolved
    /// every shape; the per-dispatch resize is the idempotent contract call.
    fn dispatch_kernel(&self, actor: &Actor, collected: &[TensorRef]) -> Result<()> {
        let node_index = actor.node.0;
        let (input_descs, mut output_descs) = {
            let resolved = self.resolved.read();
            (
                resolved.node_inputs[node_index].clone(),
                resolved.node_outputs[node_index].clone(),
            )
        };

        let (input_regions, workspace_regions, output_regions) = {
            let memory = self.memory.read();
            let arena = memory
                .arena
                .as_ref()
                .ok_or_else(|| GraphRtError::ShapeUnresolved {
                    node: actor.name.clone(),
                })?;
            let base = arena.as_ptr();
            let region = |tref: &TensorRef| {
                let tensor = &memory.tensors[tref.0];
                unsafe { BufferRegion::new(base.add(tensor.offset()), tensor.size()) }
            };
            let inputs: Vec<BufferRegion> = collected.iter().map(region).collect();
            let workspaces: Vec<BufferRegion> =
                actor.workspace_tensors.read().iter().map(region).collect();
            let outputs: Vec<BufferRegion> =
                actor.output_tensors.read().iter().map(region).collect();
            (inputs, workspaces, outputs)
        };

        if input_regions.len() != input_descs.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "actor `{}` collected {} inputs, expected {}",
                actor.name,
                input_regions.len(),
                input_descs.len()
            )));
        }

        let mut guard = actor.kernel.lock();
        let kernel = guard.as_mut().expect("kernel actor carries a kernel");
        match kernel
            .resize(&input_descs, &mut output_descs)
            .map_err(|e| GraphRtError::LaunchFailed {
                node: actor.name.clone(),
                reason: e.to_string(),
            })? {
            ResizeStatus::Ready => {}
            ResizeStatus::Deferred => {
                return Err(GraphRtError::ShapeUnresolved {
                    node: actor.name.clone(),
                })
            }
        }

        kernel
            .launch(&input_regions, &workspace_regions, &output_regions, &actor.stream)
            .map_err(|e| match e {
                GraphRtError::LaunchFailed { .. } => e,
                other => GraphRtError::LaunchFailed {
                    node: actor.name.clone(),
                    reason: other.to_string(),
                },
            })
    }

    /// Completion observed: release consumed inputs, post data before
    /// control, feed the collector, then drain accounting.
    fn complete_actor(this: &Arc<Self>, id: ActorId, epoch: u64, forward: Option<TensorRef>) {
        if epoch != this.epoch.load(Ordering::SeqCst) {
            return;
        }
        let actor = &this.actors[id.0];
        actor.complete();
        this.epoch_state.completed.fetch_add(1, Ordering::SeqCst);

        {
            let memory = this.memory.read();
            for tref in actor.collected_inputs() {
                memory.tensors[tref.0].release();
            }
        }

        let outputs = actor.output_tensors.read().clone();
        for sub in &actor.data_subs {
            let tensor = forward.unwrap_or_else(|| outputs[sub.output_index]);
            Self::post(
                this,
                sub.to,
                ActorMessage::Data {
                    slot: sub.slot,
                    tensor,
                    epoch,
                },
            );
        }
        for sub in &actor.collector_subs {
            let tensor = forward.unwrap_or_else(|| outputs[sub.output_index]);
            if this.collector.deliver(sub.position, tensor) {
                this.epoch_state.collector_done.store(true, Ordering::SeqCst);
            }
        }
        for &to in &actor.control_subs {
            Self::post(this, to, ActorMessage::Control { from: id, epoch });
        }

        this.finish_one();
    }

    fn fail_actor(this: &Arc<Self>, id: ActorId, epoch: u64, error: GraphRtError) {
        if epoch != this.epoch.load(Ordering::SeqCst) {
            return;
        }
        warn!(actor = %this.actors[id.0].name, %error, "actor failed");
        this.record_error(error);
        this.finish_one();
    }

    fn record_error(&self, error: GraphRtError) {
        {
            let mut slot = self.epoch_state.error.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        // Siblings drain, nothing new starts.
        self.sched.set_abort();
    }

    /// Deliver a message; a newly ready subscriber is queued for dispatch.
    fn post(this: &Arc<Self>, to: ActorId, message: ActorMessage) {
        this.metrics.messages.fetch_add(1, Ordering::Relaxed);
        match this.actors[to.0].deliver(message) {
            Ok(crate::actor::Delivery::BecameReady) => {
                this.epoch_state.pending.fetch_add(1, Ordering::SeqCst);
                this.sched.enqueue(to);
            }
            Ok(_) => {}
            Err(full) => {
                this.record_error(GraphRtError::MailboxFull {
                    actor: this.actors[to.0].name.clone(),
                    capacity: full.capacity,
                });
                this.maybe_finish();
            }
        }
    }

    fn finish_one(&self) {
        self.epoch_state.pending.fetch_sub(1, Ordering::SeqCst);
        self.maybe_finish();
    }

    /// Signal the gate once the epoch has drained: error first, then abort,
    /// then normal completion.
    fn maybe_finish(&self) {
        if self.epoch_state.pending.load(Ordering::SeqCst) != 0 {
            return;
        }
        if let Some(error) = self.epoch_state.error.lock().take() {
            self.gate.fail(error);
            return;
        }
        if self.sched.is_aborted() {
            self.gate.fail(GraphRtError::Aborted {
                completed: self.epoch_state.completed.load(Ordering::SeqCst),
                dispatched: self.epoch_state.dispatched.load(Ordering::SeqCst),
            });
            return;
        }
        if self.epoch_state.collector_done.load(Ordering::SeqCst) {
            self.gate.complete();
        }
    }

    // ------------------------------------------------------------------
    // Resize fixpoint and memory planning
    // ------------------------------------------------------------------

    /// Topo-order fixpoint over per-kernel `resize`: deferred kernels are
    /// retried as upstream shapes resolve; if a pass makes no progress the
    /// first unresolved node is reported. On success the memory plan and
    /// arena are rebuilt for the new shapes.
    fn resolve(&self, shapes: &[Shape]) -> Result<()> {
        if shapes.len() != self.graph.inputs().len() {
            return Err(GraphRtError::InvalidConfig(format!(
                "expected {} input shapes, got {}",
                self.graph.inputs().len(),
                shapes.len()
            )));
        }
        for (i, shape) in shapes.iter().enumerate() {
            if !shape.is_static() {
                return Err(GraphRtError::ShapeUnresolved {
                    node: format!("input {i}"),
                });
            }
        }

        let nodes = self.graph.nodes();
        let input_descs: Vec<TensorDesc> = self
            .graph
            .inputs()
            .iter()
            .zip(shapes)
            .map(|(decl, shape)| TensorDesc::new(decl.desc.dtype, shape.clone()))
            .collect();

        let mut node_inputs: Vec<Vec<TensorDesc>> =
            nodes.iter().map(|n| n.inputs.clone()).collect();
        let mut node_outputs: Vec<Vec<TensorDesc>> =
            nodes.iter().map(|n| n.outputs.clone()).collect();
        let mut node_workspaces: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, input) in self.graph.inputs().iter().enumerate() {
            for &(node, slot) in &input.bindings {
                node_inputs[node.0][slot] = input_descs[i].clone();
            }
        }

        let order = self.graph.topo_order()?;
        let mut done = vec![false; nodes.len()];
        loop {
            let mut progress = false;
            for &id in &order {
                if done[id.0] {
                    continue;
                }
                // Refresh slots fed by already-resolved producers.
                for edge in self.graph.data_edges().iter().filter(|e| e.to == id) {
                    if done[edge.from.node.0] {
                        node_inputs[id.0][edge.slot] =
                            node_outputs[edge.from.node.0][edge.from.index].clone();
                    }
                }
                if !node_inputs[id.0].iter().all(|d| d.shape.is_static()) {
                    continue;
                }

                match self.graph.node(id).kind {
                    NodeKind::Merge => {
                        let first = node_inputs[id.0][0].clone();
                        if node_inputs[id.0].iter().any(|d| *d != first) {
                            return Err(GraphRtError::InvalidGraph(format!(
                                "merge `{}` branches disagree on tensor descriptors",
                                self.graph.node(id).name
                            )));
                        }
                        node_outputs[id.0][0] = first;
                        done[id.0] = true;
                        progress = true;
                    }
                    NodeKind::Kernel => {
                        let actor = &self.actors[id.0];
                        let mut guard = actor.kernel.lock();
                        let kernel = guard.as_mut().expect("kernel actor carries a kernel");
                        let mut outputs = node_outputs[id.0].clone();
                        match kernel.resize(&node_inputs[id.0], &mut outputs)? {
                            ResizeStatus::Ready => {
                                node_workspaces[id.0] = kernel.workspace_sizes().to_vec();
                                node_outputs[id.0] = outputs;
                                done[id.0] = true;
                                progress = true;
                            }
                            ResizeStatus::Deferred => {}
                        }
                    }
                }
            }
            if done.iter().all(|&d| d) {
                break;
            }
            if !progress {
                let unresolved = order
                    .iter()
                    .find(|id| !done[id.0])
                    .map(|id| self.graph.node(*id).name.clone())
                    .unwrap_or_default();
                return Err(GraphRtError::ShapeUnresolved { node: unresolved });
            }
        }

        {
            let mut resolved = self.resolved.write();
            resolved.ready = true;
            resolved.input_descs = input_descs;
            resolved.node_inputs = node_inputs;
            resolved.node_outputs = node_outputs;
            resolved.node_workspaces = node_workspaces;
        }
        self.rebuild_memory()
    }

    /// Build the planner requests for the current shapes, place them, verify
    /// non-aliasing, allocate the arena, and refresh every tensor reference.
    fn rebuild_memory(&self) -> Result<()> {
        let resolved = self.resolved.read();
        let horizon = self.graph.nodes().len();
        let graph_outputs: Vec<TensorKey> = self.graph.outputs().to_vec();

        let mut requests: Vec<TensorRequest> = Vec::new();
        let mut consumer_counts: HashMap<BufferKey, u32> = HashMap::new();

        // Graph inputs live for the whole epoch: their content comes from the
        // caller and must never be overwritten by aliasing.
        for (i, input) in self.graph.inputs().iter().enumerate() {
            let size = resolved.input_descs[i]
                .size_bytes()
                .expect("resolve produced static input shapes");
            requests.push(TensorRequest {
                key: BufferKey::Input(i),
                size,
                first_use: 0,
                last_use: horizon,
                pinned: true,
            });
            consumer_counts.insert(BufferKey::Input(i), input.bindings.len() as u32);
        }

        for node in self.graph.nodes() {
            let pos = self.topo_pos[node.id.0];
            if node.kind == NodeKind::Kernel {
                for (index, desc) in resolved.node_outputs[node.id.0].iter().enumerate() {
                    let key = TensorKey::new(node.id, index);
                    let size = desc.size_bytes().ok_or_else(|| GraphRtError::ShapeUnresolved {
                        node: node.name.clone(),
                    })?;
                    let mut last_use = pos;
                    let mut pinned = node.pinned_io || graph_outputs.contains(&key);
                    let mut consumers = 0u32;
                    for (consumer, _slot) in self.graph.consumers_of(key) {
                        last_use = last_use.max(self.topo_pos[consumer.0]);
                        consumers += 1;
                        // A merge forwards this buffer: its subscribers read
                        // the branch tensor directly, extending the lifetime.
                        if self.graph.node(consumer).kind == NodeKind::Merge {
                            let merge_out = TensorKey::new(consumer, 0);
                            for (mc, _) in self.graph.consumers_of(merge_out) {
                                last_use = last_use.max(self.topo_pos[mc.0]);
                                consumers += 1;
                            }
                            if graph_outputs.contains(&merge_out) {
                                pinned = true;
                            }
                        }
                    }
                    requests.push(TensorRequest {
                        key: BufferKey::Output(key),
                        size,
                        first_use: pos,
                        last_use,
                        pinned,
                    });
                    consumer_counts.insert(BufferKey::Output(key), consumers);
                }
                for (index, &size) in resolved.node_workspaces[node.id.0].iter().enumerate() {
                    requests.push(TensorRequest {
                        key: BufferKey::Workspace(node.id, index),
                        size,
                        first_use: pos,
                        last_use: pos,
                        pinned: false,
                    });
                    consumer_counts.insert(BufferKey::Workspace(node.id, index), 0);
                }
            }
        }

        // Contiguous-input kernels get their ordered inputs adjacent.
        let mut groups: Vec<ContiguousGroup> = Vec::new();
        for node in self.graph.nodes() {
            if !node.contiguous_inputs {
                continue;
            }
            let mut members = Vec::with_capacity(node.inputs.len());
            for slot in 0..node.inputs.len() {
                members.push(self.buffer_feeding(node.id, slot)?);
            }
            groups.push(ContiguousGroup { members });
        }

        let planner = match self.config.memory_budget {
            Some(budget) => ArenaPlanner::with_budget(budget),
            None => ArenaPlanner::new(),
        };
        let plan = planner.plan(&requests, &groups)?;
        plan.verify()?;

        let mut memory = self.memory.write();
        let needs_alloc = match &memory.arena {
            Some(arena) => arena.size() < plan.arena_size,
            None => true,
        };
        if needs_alloc {
            // Free the previous arena before allocating the replacement so
            // the accounting limit sees the peak, not the sum.
            memory.arena = None;
            memory.arena = Some(self.device.allocate(plan.arena_size.max(1))?);
        }

        let mut index: HashMap<BufferKey, TensorRef> = HashMap::new();
        let mut tensors: Vec<DeviceTensor> = Vec::with_capacity(requests.len());
        for request in &requests {
            let placement = plan
                .placement(&request.key)
                .expect("planner placed every request");
            index.insert(request.key, TensorRef(tensors.len()));
            tensors.push(DeviceTensor::new(
                placement.offset,
                placement.size,
                consumer_counts.get(&request.key).copied().unwrap_or(0),
            ));
        }

        memory.input_refs = (0..self.graph.inputs().len())
            .map(|i| index[&BufferKey::Input(i)])
            .collect();
        for node in self.graph.nodes() {
            if node.kind != NodeKind::Kernel {
                continue;
            }
            let actor = &self.actors[node.id.0];
            *actor.output_tensors.write() = (0..resolved.node_outputs[node.id.0].len())
                .map(|oi| index[&BufferKey::Output(TensorKey::new(node.id, oi))])
                .collect();
            *actor.workspace_tensors.write() = (0..resolved.node_workspaces[node.id.0].len())
                .map(|wi| index[&BufferKey::Workspace(node.id, wi)])
                .collect();
        }

        self.metrics
            .arena_bytes
            .store(plan.arena_size, Ordering::Relaxed);
        debug!(
            plan = %self.id,
            arena = plan.arena_size,
            buffers = tensors.len(),
            "memory plan materialized"
        );
        memory.plan = plan;
        memory.tensors = tensors;
        Ok(())
    }

    /// The planned buffer feeding input `slot` of `node`.
    fn buffer_feeding(&self, node: NodeId, slot: usize) -> Result<BufferKey> {
        for edge in self.graph.data_edges() {
            if edge.to == node && edge.slot == slot {
                if self.graph.node(edge.from.node).kind == NodeKind::Merge {
                    return Err(GraphRtError::InvalidGraph(format!(
                        "contiguous input of `{}` is fed by a merge and cannot be planned",
                        self.graph.node(node).name
                    )));
                }
                return Ok(BufferKey::Output(edge.from));
            }
        }
        for (i, input) in self.graph.inputs().iter().enumerate() {
            if input.bindings.contains(&(node, slot)) {
                return Ok(BufferKey::Input(i));
            }
        }
        Err(GraphRtError::InvalidGraph(format!(
            "input slot {} of `{}` is unbound",
            slot,
            self.graph.node(node).name
        )))
    }
}
