//! The compiled kernel graph consumed by the runtime.
//!
//! A [`KernelGraph`] is a finalized DAG of opaque kernel tasks: nodes carry
//! operator identity and tensor descriptors, data edges connect a producer
//! output index to a consumer input slot, and control edges order
//! side-effecting nodes without transferring data. No graph rewriting happens
//! inside the runtime; the graph arrives finished from the compiler.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{GraphRtError, Result};
use crate::tensor::TensorDesc;
use crate::types::{NodeId, TensorKey};

/// Attribute value attached to a node.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Integer attribute.
    Int(i64),
    /// Float attribute.
    Float(f64),
    /// String attribute.
    Str(String),
    /// Boolean attribute.
    Bool(bool),
}

/// What a node does when scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An opaque kernel task executed through the `KernelMod` contract.
    Kernel,
    /// A control-flow merge: fires on the first arriving branch of an epoch
    /// and forwards only that branch's payload.
    Merge,
}

/// One operator instance in the compiled graph.
#[derive(Debug, Clone)]
pub struct KernelNode {
    /// Node identifier.
    pub id: NodeId,
    /// Instance name, unique within the graph (e.g. `relu_1`).
    pub name: String,
    /// Operator identity used for kernel registry lookup.
    pub op: String,
    /// Node kind.
    pub kind: NodeKind,
    /// Input slot descriptors.
    pub inputs: Vec<TensorDesc>,
    /// Output descriptors.
    pub outputs: Vec<TensorDesc>,
    /// Attribute map.
    pub attrs: HashMap<String, AttrValue>,
    /// Outputs are communication-destined and must never be aliased by the
    /// memory planner.
    pub pinned_io: bool,
    /// The node requires its ordered inputs to be adjacent in the arena.
    pub contiguous_inputs: bool,
}

/// A data edge: producer output index to consumer input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataEdge {
    /// Produced tensor.
    pub from: TensorKey,
    /// Consuming node.
    pub to: NodeId,
    /// Input slot on the consumer.
    pub slot: usize,
}

/// A control (monad) edge: pure ordering, no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlEdge {
    /// Producer that must complete first.
    pub from: NodeId,
    /// Consumer that must wait.
    pub to: NodeId,
}

/// Identifier of a graph input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphInputId(pub usize);

/// A graph input: fed by the caller each execution, delivered to the bound
/// consumer slots.
#[derive(Debug, Clone)]
pub struct GraphInput {
    /// Input identifier.
    pub id: GraphInputId,
    /// Descriptor; shape may be dynamic until `resize`.
    pub desc: TensorDesc,
    /// Consumer slots this input feeds.
    pub bindings: Vec<(NodeId, usize)>,
}

/// A finalized kernel graph.
#[derive(Debug, Clone, Default)]
pub struct KernelGraph {
    nodes: Vec<KernelNode>,
    data_edges: Vec<DataEdge>,
    control_edges: Vec<ControlEdge>,
    inputs: Vec<GraphInput>,
    outputs: Vec<TensorKey>,
}

impl KernelGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel node.
    pub fn add_kernel(
        &mut self,
        name: impl Into<String>,
        op: impl Into<String>,
        inputs: Vec<TensorDesc>,
        outputs: Vec<TensorDesc>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(KernelNode {
            id,
            name: name.into(),
            op: op.into(),
            kind: NodeKind::Kernel,
            inputs,
            outputs,
            attrs: HashMap::new(),
            pinned_io: false,
            contiguous_inputs: false,
        });
        id
    }

    /// Add a merge node selecting among `branches` single-tensor inputs.
    pub fn add_merge(
        &mut self,
        name: impl Into<String>,
        branches: usize,
        output: TensorDesc,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(KernelNode {
            id,
            name: name.into(),
            op: "Merge".to_string(),
            kind: NodeKind::Merge,
            inputs: vec![output.clone(); branches],
            outputs: vec![output],
            attrs: HashMap::new(),
            pinned_io: false,
            contiguous_inputs: false,
        });
        id
    }

    /// Set an attribute on a node.
    pub fn set_attr(&mut self, node: NodeId, key: impl Into<String>, value: AttrValue) {
        self.nodes[node.0].attrs.insert(key.into(), value);
    }

    /// Mark a node's outputs as pinned (excluded from arena aliasing).
    pub fn set_pinned_io(&mut self, node: NodeId, pinned: bool) {
        self.nodes[node.0].pinned_io = pinned;
    }

    /// Mark a node as requiring adjacent input placement.
    pub fn set_contiguous_inputs(&mut self, node: NodeId, contiguous: bool) {
        self.nodes[node.0].contiguous_inputs = contiguous;
    }

    /// Connect producer output `from` to input `slot` of node `to`.
    pub fn connect(&mut self, from: TensorKey, to: NodeId, slot: usize) -> Result<()> {
        let producer = self
            .nodes
            .get(from.node.0)
            .ok_or_else(|| GraphRtError::InvalidGraph(format!("unknown producer {}", from.node)))?;
        if from.index >= producer.outputs.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "node `{}` has no output {}",
                producer.name, from.index
            )));
        }
        let consumer = self
            .nodes
            .get(to.0)
            .ok_or_else(|| GraphRtError::InvalidGraph(format!("unknown consumer {to}")))?;
        if slot >= consumer.inputs.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "node `{}` has no input slot {}",
                consumer.name, slot
            )));
        }
        self.data_edges.push(DataEdge { from, to, slot });
        Ok(())
    }

    /// Add a control-only ordering edge.
    pub fn connect_control(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        if from.0 >= self.nodes.len() || to.0 >= self.nodes.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "control edge references unknown node ({from} -> {to})"
            )));
        }
        self.control_edges.push(ControlEdge { from, to });
        Ok(())
    }

    /// Declare a graph input.
    pub fn add_input(&mut self, desc: TensorDesc) -> GraphInputId {
        let id = GraphInputId(self.inputs.len());
        self.inputs.push(GraphInput {
            id,
            desc,
            bindings: Vec::new(),
        });
        id
    }

    /// Bind a graph input to input `slot` of node `to`.
    pub fn bind_input(&mut self, input: GraphInputId, to: NodeId, slot: usize) -> Result<()> {
        let consumer = self
            .nodes
            .get(to.0)
            .ok_or_else(|| GraphRtError::InvalidGraph(format!("unknown consumer {to}")))?;
        if slot >= consumer.inputs.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "node `{}` has no input slot {}",
                consumer.name, slot
            )));
        }
        self.inputs[input.0].bindings.push((to, slot));
        Ok(())
    }

    /// Mark a produced tensor as a graph output.
    pub fn mark_output(&mut self, key: TensorKey) -> Result<()> {
        let producer = self
            .nodes
            .get(key.node.0)
            .ok_or_else(|| GraphRtError::InvalidGraph(format!("unknown producer {}", key.node)))?;
        if key.index >= producer.outputs.len() {
            return Err(GraphRtError::InvalidGraph(format!(
                "node `{}` has no output {}",
                producer.name, key.index
            )));
        }
        self.outputs.push(key);
        Ok(())
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> &[KernelNode] {
        &self.nodes
    }

    /// Look up a node.
    pub fn node(&self, id: NodeId) -> &KernelNode {
        &self.nodes[id.0]
    }

    /// All data edges.
    pub fn data_edges(&self) -> &[DataEdge] {
        &self.data_edges
    }

    /// All control edges.
    pub fn control_edges(&self) -> &[ControlEdge] {
        &self.control_edges
    }

    /// Graph inputs.
    pub fn inputs(&self) -> &[GraphInput] {
        &self.inputs
    }

    /// Graph outputs.
    pub fn outputs(&self) -> &[TensorKey] {
        &self.outputs
    }

    /// Consumers of a produced tensor, as (node, slot) pairs.
    pub fn consumers_of(&self, key: TensorKey) -> Vec<(NodeId, usize)> {
        self.data_edges
            .iter()
            .filter(|e| e.from == key)
            .map(|e| (e.to, e.slot))
            .collect()
    }

    /// Validate structural integrity: every input slot bound exactly once
    /// (merge slots may share a descriptor but each still gets one edge), at
    /// least one output, and no cycles.
    pub fn validate(&self) -> Result<()> {
        if self.outputs.is_empty() {
            return Err(GraphRtError::InvalidGraph(
                "graph declares no outputs".to_string(),
            ));
        }

        // Each (node, slot) must be fed by exactly one data edge or input
        // binding.
        let mut fed: HashMap<(NodeId, usize), usize> = HashMap::new();
        for e in &self.data_edges {
            *fed.entry((e.to, e.slot)).or_default() += 1;
        }
        for input in &self.inputs {
            for &(node, slot) in &input.bindings {
                *fed.entry((node, slot)).or_default() += 1;
            }
        }
        for node in &self.nodes {
            for slot in 0..node.inputs.len() {
                match fed.get(&(node.id, slot)).copied().unwrap_or(0) {
                    1 => {}
                    0 => {
                        return Err(GraphRtError::InvalidGraph(format!(
                            "input slot {} of node `{}` is unbound",
                            slot, node.name
                        )))
                    }
                    n => {
                        return Err(GraphRtError::InvalidGraph(format!(
                            "input slot {} of node `{}` is bound {} times",
                            slot, node.name, n
                        )))
                    }
                }
            }
        }

        self.topo_order().map(|_| ())
    }

    /// Topological order over data and control edges (Kahn). Rejects cyclic
    /// dependencies: bounded loops are expected to be unrolled before the
    /// graph reaches the runtime.
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

        for e in &self.data_edges {
            successors[e.from.node.0].push(e.to.0);
            indegree[e.to.0] += 1;
        }
        for e in &self.control_edges {
            successors[e.from.0].push(e.to.0);
            indegree[e.to.0] += 1;
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_front() {
            order.push(NodeId(i));
            for &s in &successors[i] {
                indegree[s] -= 1;
                if indegree[s] == 0 {
                    queue.push_back(s);
                }
            }
        }

        if order.len() != n {
            let on_cycle = (0..n)
                .find(|&i| indegree[i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            return Err(GraphRtError::CyclicGraph { node: on_cycle });
        }
        Ok(order)
    }

    /// Transitive dependency sets: for each node, every node it transitively
    /// depends on through data or control edges.
    pub fn reachability(&self) -> Result<HashMap<NodeId, HashSet<NodeId>>> {
        let order = self.topo_order()?;
        let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for e in &self.data_edges {
            predecessors.entry(e.to).or_default().push(e.from.node);
        }
        for e in &self.control_edges {
            predecessors.entry(e.to).or_default().push(e.from);
        }

        let mut deps: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        for id in order {
            let mut set = HashSet::new();
            if let Some(preds) = predecessors.get(&id) {
                for &p in preds {
                    set.insert(p);
                    if let Some(pdeps) = deps.get(&p) {
                        set.extend(pdeps.iter().copied());
                    }
                }
            }
            deps.insert(id, set);
        }
        Ok(deps)
    }
}
