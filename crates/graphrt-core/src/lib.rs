//! # graphrt-core
//!
//! Core contracts and data model for the graphrt execution runtime.
//!
//! This crate defines the boundaries the runtime schedules across without
//! containing any execution logic itself:
//!
//! - [`KernelMod`] — the executable unit bound to one graph node, exposing
//!   the `init` / `resize` / `launch` contract
//! - [`DeviceContext`] / [`DeviceStream`] — the vendor-runtime boundary:
//!   allocation, FIFO streams, synchronization
//! - [`KernelGraph`] — the finalized node/edge DAG handed over by the graph
//!   compiler
//! - [`ArenaPlanner`] — the static arena planner assigning non-aliasing byte
//!   ranges to tensor lifetimes
//!
//! The scheduler, actor graph, and plan driver live in the `graphrt` crate;
//! host-device and built-in kernel implementations live in `graphrt-cpu`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod device;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod memplan;
pub mod tensor;
pub mod types;

pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use device::{DeviceBuffer, DeviceContext, DeviceStream, StreamFault};
pub use error::{GraphRtError, Result};
pub use graph::{AttrValue, ControlEdge, DataEdge, GraphInput, GraphInputId, KernelGraph, KernelNode, NodeKind};
pub use kernel::{KernelFactory, KernelMod, KernelRegistry, ResizeStatus};
pub use memplan::{ArenaPlanner, BufferKey, ContiguousGroup, MemoryPlan, Placement, TensorRequest};
pub use tensor::{BufferRegion, DeviceTensor, HostTensor, TensorDesc};
pub use types::{ControlToken, DType, NodeId, Shape, TensorKey, DYNAMIC_DIM};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::device::{DeviceBuffer, DeviceContext, DeviceStream, StreamFault};
    pub use crate::error::{GraphRtError, Result};
    pub use crate::graph::{AttrValue, KernelGraph, KernelNode, NodeKind};
    pub use crate::kernel::{KernelMod, KernelRegistry, ResizeStatus};
    pub use crate::memplan::{ArenaPlanner, MemoryPlan};
    pub use crate::tensor::{BufferRegion, HostTensor, TensorDesc};
    pub use crate::types::{DType, NodeId, Shape, TensorKey};
}
