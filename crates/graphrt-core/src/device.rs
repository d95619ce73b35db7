//! Device context and stream abstractions.
//!
//! These traits hide vendor runtimes behind a small surface: thread-safe
//! allocation, FIFO asynchronous streams, and blocking synchronization.
//! Backend crates implement them; the scheduler consumes them.

use std::sync::Arc;

use crate::error::Result;

/// A single device-side allocation.
///
/// Dropping the buffer frees the allocation (RAII; there is no separate
/// `free` entry point).
pub trait DeviceBuffer: Send + Sync {
    /// Size of the allocation in bytes.
    fn size(&self) -> usize;

    /// Base pointer of the allocation.
    fn as_ptr(&self) -> *mut u8;

    /// Copy host bytes into the buffer at `offset`.
    fn copy_from_host(&self, offset: usize, data: &[u8]) -> Result<()>;

    /// Copy bytes out of the buffer at `offset` into `out`.
    fn copy_to_host(&self, offset: usize, out: &mut [u8]) -> Result<()>;
}

/// A fault captured on a device stream.
#[derive(Debug, Clone)]
pub struct StreamFault {
    /// Description of the fault.
    pub message: String,
}

/// An asynchronous FIFO execution queue on a device.
///
/// `enqueue` never blocks on device work; tasks on one stream execute in
/// enqueue order. Faults raised by enqueued work are captured per stream and
/// must be drained via [`DeviceStream::take_fault`] before the stream is
/// reused.
pub trait DeviceStream: Send + Sync {
    /// Queue a task for asynchronous execution. Returns once the task is
    /// enqueued, not once it has run.
    fn enqueue(&self, task: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Block the calling thread until all previously enqueued work completes.
    /// Returns the first captured fault, if any.
    fn synchronize(&self) -> Result<()>;

    /// Drain the captured fault, clearing it for stream reuse.
    fn take_fault(&self) -> Option<StreamFault>;
}

/// Owner of device memory and streams for one device.
pub trait DeviceContext: Send + Sync {
    /// Human-readable device name, e.g. `cpu:0`.
    fn name(&self) -> &str;

    /// Allocate `size` bytes of device memory. Allocation failure surfaces
    /// as [`crate::GraphRtError::DeviceOom`], never as a driver crash.
    fn allocate(&self, size: usize) -> Result<Box<dyn DeviceBuffer>>;

    /// Create a new stream on this device.
    fn create_stream(&self) -> Result<Arc<dyn DeviceStream>>;

    /// Total device memory in bytes.
    fn total_memory(&self) -> usize;

    /// Currently free device memory in bytes.
    fn free_memory(&self) -> usize;
}
