//! End-to-end execution tests: numeric correctness, concurrency of
//! independent branches, epoch reuse, and control/merge semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use graphrt::prelude::*;
use graphrt::{KernelGraph, RuntimeConfigBuilder, TensorKey};

use common::{builtin_registry, f32_desc, ProbeKernel, SpanLog};

/// Add -> Relu -> Cast chain with fixed [2,3] f32 shapes computes
/// `cast(relu(a + b), i32)` for literal inputs.
#[test]
fn test_linear_chain_numeric() {
    let desc = f32_desc(&[2, 3]);
    let i32_desc = TensorDesc::new(DType::I32, Shape::new(vec![2, 3]));

    let mut graph = KernelGraph::new();
    let add = graph.add_kernel("add_0", "Add", vec![desc.clone(), desc.clone()], vec![desc.clone()]);
    let relu = graph.add_kernel("relu_1", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let cast = graph.add_kernel("cast_2", "Cast", vec![desc.clone()], vec![i32_desc]);
    let a = graph.add_input(desc.clone());
    let b = graph.add_input(desc.clone());
    graph.bind_input(a, add, 0).unwrap();
    graph.bind_input(b, add, 1).unwrap();
    graph.connect(TensorKey::new(add, 0), relu, 0).unwrap();
    graph.connect(TensorKey::new(relu, 0), cast, 0).unwrap();
    graph.mark_output(TensorKey::new(cast, 0)).unwrap();

    let registry = builtin_registry();
    let device = Arc::new(CpuDevice::new());
    let plan =
        ExecutionPlan::prepare(graph, device, &registry, RuntimeConfig::default()).unwrap();

    let lhs = HostTensor::from_f32(vec![2, 3], &[1.0, -2.0, 3.0, 4.0, 5.0, -6.0]).unwrap();
    let rhs = HostTensor::from_f32(vec![2, 3], &[0.0; 6]).unwrap();
    let outputs = plan.run(&[lhs, rhs]).unwrap();

    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].to_i32().unwrap(), vec![1, 0, 3, 4, 5, 0]);
}

/// Repeated runs with identical inputs are idempotent: same outputs, same
/// arena, same workspace sizes.
#[test]
fn test_repeat_run_idempotent() {
    let desc = f32_desc(&[4, 4]);
    let mut graph = KernelGraph::new();
    let cast = graph.add_kernel("cast_0", "Cast", vec![desc.clone()], vec![desc.clone()]);
    let input = graph.add_input(desc.clone());
    graph.bind_input(input, cast, 0).unwrap();
    graph.mark_output(TensorKey::new(cast, 0)).unwrap();

    let registry = builtin_registry();
    let plan = ExecutionPlan::prepare(
        graph,
        Arc::new(CpuDevice::new()),
        &registry,
        RuntimeConfig::default(),
    )
    .unwrap();

    let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
    let input = HostTensor::from_f32(vec![4, 4], &data).unwrap();

    let first = plan.run(std::slice::from_ref(&input)).unwrap();
    let arena_after_first = plan.arena_size();
    let workspace_after_first = plan.workspace_sizes(cast);

    let second = plan.run(std::slice::from_ref(&input)).unwrap();
    assert_eq!(first[0].to_f32().unwrap(), second[0].to_f32().unwrap());
    assert_eq!(plan.arena_size(), arena_after_first);
    assert_eq!(plan.workspace_sizes(cast), workspace_after_first);
    assert_eq!(plan.metrics().epochs, 2);
}

/// Each epoch re-arms the actor set: new input values flow through the same
/// plan.
#[test]
fn test_epoch_rearm_with_new_values() {
    let desc = f32_desc(&[3]);
    let mut graph = KernelGraph::new();
    let relu = graph.add_kernel("relu_0", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let input = graph.add_input(desc.clone());
    graph.bind_input(input, relu, 0).unwrap();
    graph.mark_output(TensorKey::new(relu, 0)).unwrap();

    let registry = builtin_registry();
    let plan = ExecutionPlan::prepare(
        graph,
        Arc::new(CpuDevice::new()),
        &registry,
        RuntimeConfig::minimal(),
    )
    .unwrap();

    let first = plan
        .run(&[HostTensor::from_f32(vec![3], &[-1.0, 2.0, -3.0]).unwrap()])
        .unwrap();
    assert_eq!(first[0].to_f32().unwrap(), vec![0.0, 2.0, 0.0]);

    let second = plan
        .run(&[HostTensor::from_f32(vec![3], &[5.0, -6.0, 7.0]).unwrap()])
        .unwrap();
    assert_eq!(second[0].to_f32().unwrap(), vec![5.0, 0.0, 7.0]);
}

/// Diamond graph: X feeds Y and Z, both feed W. Y and Z execute with
/// overlapping windows (true concurrency), while W starts only after both.
#[test]
fn test_diamond_branches_overlap() {
    let desc = f32_desc(&[8]);
    let log: SpanLog = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let registry = builtin_registry();
    let hold = Duration::from_millis(40);
    ProbeKernel::register(&registry, "ProbeX", 1, 0, Duration::ZERO, Duration::ZERO, &log);
    ProbeKernel::register(&registry, "ProbeY", 1, 1, hold, hold, &log);
    ProbeKernel::register(&registry, "ProbeZ", 1, 2, hold, hold, &log);
    ProbeKernel::register(&registry, "ProbeW", 2, 3, Duration::ZERO, Duration::ZERO, &log);

    let mut graph = KernelGraph::new();
    let x = graph.add_kernel("x", "ProbeX", vec![desc.clone()], vec![desc.clone()]);
    let y = graph.add_kernel("y", "ProbeY", vec![desc.clone()], vec![desc.clone()]);
    let z = graph.add_kernel("z", "ProbeZ", vec![desc.clone()], vec![desc.clone()]);
    let w = graph.add_kernel("w", "ProbeW", vec![desc.clone(), desc.clone()], vec![desc.clone()]);
    let input = graph.add_input(desc.clone());
    graph.bind_input(input, x, 0).unwrap();
    graph.connect(TensorKey::new(x, 0), y, 0).unwrap();
    graph.connect(TensorKey::new(x, 0), z, 0).unwrap();
    graph.connect(TensorKey::new(y, 0), w, 0).unwrap();
    graph.connect(TensorKey::new(z, 0), w, 1).unwrap();
    graph.mark_output(TensorKey::new(w, 0)).unwrap();

    let config = RuntimeConfigBuilder::new()
        .worker_threads(4)
        .num_streams(4)
        .build()
        .unwrap();
    let plan =
        ExecutionPlan::prepare(graph, Arc::new(CpuDevice::new()), &registry, config).unwrap();

    let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
    let outputs = plan
        .run(&[HostTensor::from_f32(vec![8], &data).unwrap()])
        .unwrap();
    // W sums Y and Z, each of which forwarded X's copy of the input.
    let expected: Vec<f32> = data.iter().map(|v| v * 2.0).collect();
    assert_eq!(outputs[0].to_f32().unwrap(), expected);

    let spans = log.lock().clone();
    let span_of = |tag: usize| *spans.iter().find(|s| s.tag == tag).unwrap();
    let (sy, sz, sw) = (span_of(1), span_of(2), span_of(3));

    // Overlapping execution windows for the independent branches.
    assert!(
        sy.start < sz.end && sz.start < sy.end,
        "branches did not overlap: y={:?}..{:?} z={:?}..{:?}",
        sy.start,
        sy.end,
        sz.start,
        sz.end
    );
    // The join starts only after both branches completed.
    assert!(sw.start >= sy.end && sw.start >= sz.end);
}

/// A control-only edge delays the consumer exactly like a data edge.
#[test]
fn test_control_edge_orders_execution() {
    let desc = f32_desc(&[4]);
    let log: SpanLog = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let registry = builtin_registry();
    let hold = Duration::from_millis(20);
    ProbeKernel::register(&registry, "ProbeA", 1, 0, hold, hold, &log);
    ProbeKernel::register(&registry, "ProbeB", 1, 1, Duration::ZERO, Duration::ZERO, &log);

    let mut graph = KernelGraph::new();
    let a = graph.add_kernel("side_effect", "ProbeA", vec![desc.clone()], vec![desc.clone()]);
    let b = graph.add_kernel("reader", "ProbeB", vec![desc.clone()], vec![desc.clone()]);
    let i0 = graph.add_input(desc.clone());
    let i1 = graph.add_input(desc.clone());
    graph.bind_input(i0, a, 0).unwrap();
    graph.bind_input(i1, b, 0).unwrap();
    // No tensor flows from a to b; ordering only.
    graph.connect_control(a, b).unwrap();
    graph.mark_output(TensorKey::new(b, 0)).unwrap();

    let config = RuntimeConfigBuilder::new()
        .worker_threads(4)
        .num_streams(4)
        .build()
        .unwrap();
    let plan =
        ExecutionPlan::prepare(graph, Arc::new(CpuDevice::new()), &registry, config).unwrap();

    let t = HostTensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
    plan.run(&[t.clone(), t]).unwrap();

    let spans = log.lock().clone();
    let a_span = *spans.iter().find(|s| s.tag == 0).unwrap();
    let b_span = *spans.iter().find(|s| s.tag == 1).unwrap();
    assert!(
        b_span.start >= a_span.end,
        "consumer started before control producer completed"
    );
}

/// A merge node forwards the first arriving branch.
#[test]
fn test_merge_forwards_taken_branch() {
    let desc = f32_desc(&[2]);
    let mut graph = KernelGraph::new();
    let then_branch = graph.add_kernel("then", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let else_branch = graph.add_kernel("else", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let merge = graph.add_merge("merge", 2, desc.clone());
    let i0 = graph.add_input(desc.clone());
    let i1 = graph.add_input(desc.clone());
    graph.bind_input(i0, then_branch, 0).unwrap();
    graph.bind_input(i1, else_branch, 0).unwrap();
    graph.connect(TensorKey::new(then_branch, 0), merge, 0).unwrap();
    graph.connect(TensorKey::new(else_branch, 0), merge, 1).unwrap();
    graph.mark_output(TensorKey::new(merge, 0)).unwrap();

    let registry = builtin_registry();
    let plan = ExecutionPlan::prepare(
        graph,
        Arc::new(CpuDevice::new()),
        &registry,
        RuntimeConfig::default(),
    )
    .unwrap();

    let outputs = plan
        .run(&[
            HostTensor::from_f32(vec![2], &[1.0, 2.0]).unwrap(),
            HostTensor::from_f32(vec![2], &[3.0, 4.0]).unwrap(),
        ])
        .unwrap();

    let result = outputs[0].to_f32().unwrap();
    assert!(
        result == vec![1.0, 2.0] || result == vec![3.0, 4.0],
        "merge forwarded neither branch: {result:?}"
    );
}

/// Tuple fan-out: both consumers of a producer receive their own copy of the
/// same output index and the subscribers see identical content.
#[test]
fn test_fanout_same_output_index() {
    let desc = f32_desc(&[4]);
    let mut graph = KernelGraph::new();
    let producer = graph.add_kernel("producer", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let left = graph.add_kernel("left", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let right = graph.add_kernel("right", "Relu", vec![desc.clone()], vec![desc.clone()]);
    let input = graph.add_input(desc.clone());
    graph.bind_input(input, producer, 0).unwrap();
    graph.connect(TensorKey::new(producer, 0), left, 0).unwrap();
    graph.connect(TensorKey::new(producer, 0), right, 0).unwrap();
    graph.mark_output(TensorKey::new(left, 0)).unwrap();
    graph.mark_output(TensorKey::new(right, 0)).unwrap();

    let registry = builtin_registry();
    let plan = ExecutionPlan::prepare(
        graph,
        Arc::new(CpuDevice::new()),
        &registry,
        RuntimeConfig::default(),
    )
    .unwrap();

    let outputs = plan
        .run(&[HostTensor::from_f32(vec![4], &[1.0, -2.0, 3.0, -4.0]).unwrap()])
        .unwrap();
    assert_eq!(outputs[0].to_f32().unwrap(), vec![1.0, 0.0, 3.0, 0.0]);
    assert_eq!(outputs[0].to_f32(), outputs[1].to_f32());
}
