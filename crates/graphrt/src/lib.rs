//! # graphrt
//!
//! An asynchronous graph-execution runtime: the actor-based scheduler that
//! turns a compiled kernel graph into a pipeline of concurrent,
//! dependency-ordered kernel launches.
//!
//! The runtime consumes two external contracts: a kernel library producing
//! [`KernelMod`] implementations per graph node, and a device backend
//! implementing [`DeviceContext`] / [`DeviceStream`]. Everything in between
//! — arena memory planning, actor wiring, the worker pool, and the
//! `prepare` / `run` / `resize` driver — lives here.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use graphrt::prelude::*;
//!
//! fn main() -> graphrt::Result<()> {
//!     // A two-node graph: relu(a + b).
//!     let desc = TensorDesc::new(DType::F32, Shape::new(vec![2, 3]));
//!     let mut graph = KernelGraph::new();
//!     let add = graph.add_kernel(
//!         "add_0", "Add",
//!         vec![desc.clone(), desc.clone()],
//!         vec![desc.clone()],
//!     );
//!     let relu = graph.add_kernel("relu_1", "Relu", vec![desc.clone()], vec![desc.clone()]);
//!     let a = graph.add_input(desc.clone());
//!     let b = graph.add_input(desc.clone());
//!     graph.bind_input(a, add, 0)?;
//!     graph.bind_input(b, add, 1)?;
//!     graph.connect(TensorKey::new(add, 0), relu, 0)?;
//!     graph.mark_output(TensorKey::new(relu, 0))?;
//!
//!     // Explicit registry and device, passed by reference.
//!     let registry = KernelRegistry::new();
//!     graphrt::register_builtins(&registry);
//!     let device = Arc::new(CpuDevice::new());
//!
//!     let plan = ExecutionPlan::prepare(graph, device, &registry, RuntimeConfig::default())?;
//!     let lhs = HostTensor::from_f32(vec![2, 3], &[1.0, -2.0, 3.0, 4.0, 5.0, -6.0])?;
//!     let rhs = HostTensor::from_f32(vec![2, 3], &[0.0; 6])?;
//!     let outputs = plan.run(&[lhs, rhs])?;
//!     println!("{:?}", outputs[0].to_f32());
//!     Ok(())
//! }
//! ```
//!
//! ## Execution model
//!
//! One actor wraps each graph node. An actor becomes ready only when every
//! declared input slot — data and control, counted uniformly — is filled for
//! the current epoch; a fixed pool of workers then performs resize-then-launch
//! on the actor's assigned device stream and returns to the pool without
//! blocking. Completion is observed on the stream and posted to subscriber
//! mailboxes, which may re-trigger scheduling on any thread. Independent
//! branches run fully concurrently; there is no global barrier.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod builder;
pub mod mailbox;
pub mod plan;
pub mod scheduler;

pub use actor::{Actor, ActorId, ActorState, Delivery};
pub use builder::{build_actor_graph, ActorGraph, OutputCollector};
pub use mailbox::{ActorMessage, Mailbox, MailboxStats, TensorRef};
pub use plan::{ExecutionPlan, PlanId, PlanMetrics};
pub use scheduler::{CompletionGate, SchedShared, Scheduler, SchedulerStats};

// Re-export the contract crates so downstream users need a single import.
pub use graphrt_core::config::{RuntimeConfig, RuntimeConfigBuilder};
pub use graphrt_core::device::{DeviceBuffer, DeviceContext, DeviceStream, StreamFault};
pub use graphrt_core::error::{GraphRtError, Result};
pub use graphrt_core::graph::{AttrValue, KernelGraph, KernelNode, NodeKind};
pub use graphrt_core::kernel::{KernelFactory, KernelMod, KernelRegistry, ResizeStatus};
pub use graphrt_core::memplan::{ArenaPlanner, BufferKey, MemoryPlan};
pub use graphrt_core::tensor::{BufferRegion, HostTensor, TensorDesc};
pub use graphrt_core::types::{ControlToken, DType, NodeId, Shape, TensorKey, DYNAMIC_DIM};
pub use graphrt_cpu::{register_builtins, CpuDevice, CpuStream};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::actor::{ActorId, ActorState};
    pub use crate::plan::{ExecutionPlan, PlanId, PlanMetrics};
    pub use graphrt_core::prelude::*;
    pub use graphrt_cpu::{register_builtins, CpuDevice};
}
