//! Transformation of a kernel graph into an actor graph.
//!
//! Each kernel node maps to exactly one compute actor; merge nodes map to
//! control actors. Multi-output nodes fan out per output index; control-only
//! edges create subscriptions with no tensor payload; graph outputs
//! subscribe the plan's output collector. Kernel instantiation and `init`
//! happen here, so configuration errors surface at plan-prepare time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use graphrt_core::device::DeviceStream;
use graphrt_core::error::{GraphRtError, Result};
use graphrt_core::graph::{KernelGraph, NodeKind};
use graphrt_core::kernel::KernelRegistry;
use graphrt_core::types::DType;

use crate::actor::{Actor, ActorId, CollectorSub, DataSub};
use crate::mailbox::TensorRef;

/// The built actor set for one plan. Actor indices equal node indices.
pub struct ActorGraph {
    /// Actors, one per graph node, in node order.
    pub actors: Vec<Arc<Actor>>,
    /// Actors with no declared inputs, seeded by the driver at epoch start.
    pub sources: Vec<ActorId>,
}

impl ActorGraph {
    /// Transitive dependency sets over the actor subscriptions (data and
    /// control uniformly). Mirrors `KernelGraph::reachability` so the
    /// equivalence of the two relations is directly testable.
    pub fn reachability(&self) -> HashMap<ActorId, HashSet<ActorId>> {
        let n = self.actors.len();
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for actor in &self.actors {
            for sub in &actor.data_subs {
                preds[sub.to.0].push(actor.id.0);
                indegree[sub.to.0] += 1;
            }
            for sub in &actor.control_subs {
                preds[sub.0].push(actor.id.0);
                indegree[sub.0] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        let mut remaining = indegree.clone();
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (to, plist) in preds.iter().enumerate() {
            for &p in plist {
                succs[p].push(to);
            }
        }
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &s in &succs[i] {
                remaining[s] -= 1;
                if remaining[s] == 0 {
                    queue.push_back(s);
                }
            }
        }

        let mut deps: HashMap<ActorId, HashSet<ActorId>> = HashMap::new();
        for i in order {
            let mut set = HashSet::new();
            for &p in &preds[i] {
                set.insert(ActorId(p));
                if let Some(pdeps) = deps.get(&ActorId(p)) {
                    set.extend(pdeps.iter().copied());
                }
            }
            deps.insert(ActorId(i), set);
        }
        deps
    }
}

/// Build the actor graph for a validated kernel graph.
///
/// Streams are assigned round-robin over `streams`; actors on the same
/// stream serialize their launches through that stream's FIFO, actors on
/// different streams run fully concurrently.
pub fn build_actor_graph(
    graph: &KernelGraph,
    registry: &KernelRegistry,
    streams: &[Arc<dyn DeviceStream>],
    mailbox_capacity: usize,
) -> Result<ActorGraph> {
    let mut control_counts = vec![0usize; graph.nodes().len()];
    for edge in graph.control_edges() {
        control_counts[edge.to.0] += 1;
    }

    let mut actors = Vec::with_capacity(graph.nodes().len());
    for node in graph.nodes() {
        let kernel = match node.kind {
            NodeKind::Merge => None,
            NodeKind::Kernel => {
                let signature: Vec<DType> = node.inputs.iter().map(|d| d.dtype).collect();
                let mut kernel = registry.create(&node.op, &signature)?;
                let mut outputs = node.outputs.clone();
                kernel.init(&node.inputs, &mut outputs).map_err(|e| match e {
                    GraphRtError::KernelInitFailed { reason, .. } => {
                        GraphRtError::KernelInitFailed {
                            node: node.name.clone(),
                            reason,
                        }
                    }
                    other => other,
                })?;
                Some(kernel)
            }
        };

        let stream = Arc::clone(&streams[node.id.0 % streams.len()]);
        actors.push(Actor::new(
            ActorId(node.id.0),
            node.id,
            node.name.clone(),
            node.kind,
            kernel,
            stream,
            node.inputs.len(),
            control_counts[node.id.0],
            mailbox_capacity,
        ));
    }

    // Data fan-out: one subscription per edge, by producer output index.
    for edge in graph.data_edges() {
        actors[edge.from.node.0].data_subs.push(DataSub {
            output_index: edge.from.index,
            to: ActorId(edge.to.0),
            slot: edge.slot,
        });
    }

    // Control-only subscriptions.
    for edge in graph.control_edges() {
        actors[edge.from.0].control_subs.push(ActorId(edge.to.0));
    }

    // Graph outputs subscribe the collector.
    for (position, key) in graph.outputs().iter().enumerate() {
        actors[key.node.0].collector_subs.push(CollectorSub {
            output_index: key.index,
            position,
        });
    }

    let actors: Vec<Arc<Actor>> = actors.into_iter().map(Arc::new).collect();
    let sources: Vec<ActorId> = actors
        .iter()
        .filter(|a| a.is_source())
        .map(|a| a.id)
        .collect();

    debug!(
        actors = actors.len(),
        sources = sources.len(),
        streams = streams.len(),
        "actor graph built"
    );

    Ok(ActorGraph { actors, sources })
}

/// Collects graph outputs as their producers complete and reports when the
/// expected set is full.
pub struct OutputCollector {
    expected: usize,
    state: Mutex<CollectorState>,
}

struct CollectorState {
    received: Vec<Option<TensorRef>>,
    count: usize,
}

impl OutputCollector {
    /// Create a collector expecting `expected` outputs.
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            state: Mutex::new(CollectorState {
                received: vec![None; expected],
                count: 0,
            }),
        }
    }

    /// Reset for a new epoch.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.received = vec![None; self.expected];
        state.count = 0;
    }

    /// Record graph output `position`. Returns `true` when every expected
    /// output has been received.
    pub fn deliver(&self, position: usize, tensor: TensorRef) -> bool {
        let mut state = self.state.lock();
        if state.received[position].is_none() {
            state.count += 1;
        }
        state.received[position] = Some(tensor);
        state.count == self.expected
    }

    /// Tensor received for output `position`, if any.
    pub fn received(&self, position: usize) -> Option<TensorRef> {
        self.state.lock().received[position]
    }
}
