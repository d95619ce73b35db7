//! # graphrt-cpu
//!
//! Host implementation of the graphrt device boundary, plus the built-in
//! element-wise kernels the runtime's tests execute against.
//!
//! [`CpuDevice`] provides aligned host allocations with an accounting limit,
//! and [`CpuStream`] provides FIFO asynchronous execution on a dedicated
//! worker thread, with per-stream fault capture. Together they simulate the
//! behavior of an asynchronous accelerator queue closely enough to exercise
//! every scheduler code path.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod kernels;

pub use device::{CpuDevice, CpuStream};
pub use kernels::register_builtins;
