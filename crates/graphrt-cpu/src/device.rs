//! Host device context and FIFO streams.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use graphrt_core::device::{DeviceBuffer, DeviceContext, DeviceStream, StreamFault};
use graphrt_core::error::{GraphRtError, Result};

/// Allocation alignment for host arenas; matches the planner's alignment so
/// every planned offset stays element-aligned.
const HOST_ALIGN: usize = 64;

/// Default accounting limit for a host device (8 GiB).
const DEFAULT_MEMORY_LIMIT: usize = 8 << 30;

/// One aligned host allocation.
pub struct CpuBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    allocated: Arc<AtomicUsize>,
}

impl CpuBuffer {
    fn new(size: usize, allocated: Arc<AtomicUsize>) -> Result<Self> {
        let layout = Layout::from_size_align(size.max(1), HOST_ALIGN)
            .map_err(|_| GraphRtError::InvalidConfig(format!("bad allocation size {size}")))?;
        // Zeroed so freshly planned arenas have deterministic content.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(GraphRtError::DeviceOom {
            requested: size,
            available: 0,
        })?;
        allocated.fetch_add(layout.size(), Ordering::Relaxed);
        Ok(Self {
            ptr,
            layout,
            allocated,
        })
    }
}

impl DeviceBuffer for CpuBuffer {
    fn size(&self) -> usize {
        self.layout.size()
    }

    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn copy_from_host(&self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > self.layout.size() {
            return Err(GraphRtError::InvalidConfig(format!(
                "copy_from_host out of bounds: offset {} + len {} > size {}",
                offset,
                data.len(),
                self.layout.size()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    fn copy_to_host(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        if offset + out.len() > self.layout.size() {
            return Err(GraphRtError::InvalidConfig(format!(
                "copy_to_host out of bounds: offset {} + len {} > size {}",
                offset,
                out.len(),
                self.layout.size()
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        self.allocated.fetch_sub(self.layout.size(), Ordering::Relaxed);
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// SAFETY: the allocation is plain host memory; range disjointness of
// concurrent writers is the memory planner's invariant.
unsafe impl Send for CpuBuffer {}
unsafe impl Sync for CpuBuffer {}

type Task = Box<dyn FnOnce() + Send>;

struct StreamState {
    queue: VecDeque<Task>,
    busy: bool,
    shutdown: bool,
    fault: Option<StreamFault>,
}

struct StreamShared {
    state: Mutex<StreamState>,
    /// Signals the worker that work arrived or shutdown was requested.
    work: Condvar,
    /// Signals waiters that the queue drained.
    idle: Condvar,
}

/// A FIFO asynchronous execution queue backed by one dedicated worker thread.
///
/// `enqueue` never blocks on the enqueued work; tasks run strictly in
/// enqueue order. A panicking task is captured as a stream fault and leaves
/// the stream usable once the fault is drained.
pub struct CpuStream {
    shared: Arc<StreamShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpuStream {
    /// Create a stream and spawn its worker thread.
    pub fn new(index: usize) -> Self {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState {
                queue: VecDeque::new(),
                busy: false,
                shutdown: false,
                fault: None,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("graphrt-stream-{index}"))
            .spawn(move || stream_worker(worker_shared))
            .expect("failed to spawn stream worker");

        debug!(index, "created cpu stream");
        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }
}

fn stream_worker(shared: Arc<StreamShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if let Some(task) = state.queue.pop_front() {
                    state.busy = true;
                    break task;
                }
                if state.shutdown {
                    return;
                }
                shared.work.wait(&mut state);
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(task));

        let mut state = shared.state.lock();
        state.busy = false;
        if let Err(payload) = outcome {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "stream task panicked".to_string());
            warn!(message = %message, "captured stream fault");
            if state.fault.is_none() {
                state.fault = Some(StreamFault { message });
            }
        }
        if state.queue.is_empty() {
            shared.idle.notify_all();
        }
    }
}

impl DeviceStream for CpuStream {
    fn enqueue(&self, task: Task) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(GraphRtError::StreamFault("stream is shut down".to_string()));
        }
        state.queue.push_back(task);
        self.shared.work.notify_one();
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.busy {
            self.shared.idle.wait(&mut state);
        }
        match &state.fault {
            Some(fault) => Err(GraphRtError::StreamFault(fault.message.clone())),
            None => Ok(()),
        }
    }

    fn take_fault(&self) -> Option<StreamFault> {
        self.shared.state.lock().fault.take()
    }
}

impl Drop for CpuStream {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

/// Host device: aligned allocations with an accounting limit, plus stream
/// creation.
pub struct CpuDevice {
    name: String,
    limit: usize,
    allocated: Arc<AtomicUsize>,
    streams_created: AtomicUsize,
}

impl CpuDevice {
    /// Create a host device with the default memory limit.
    pub fn new() -> Self {
        Self::with_memory_limit(DEFAULT_MEMORY_LIMIT)
    }

    /// Create a host device with an explicit accounting limit in bytes.
    pub fn with_memory_limit(limit: usize) -> Self {
        info!(limit, "initializing cpu device");
        Self {
            name: "cpu:0".to_string(),
            limit,
            allocated: Arc::new(AtomicUsize::new(0)),
            streams_created: AtomicUsize::new(0),
        }
    }

    /// Bytes currently allocated.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContext for CpuDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn allocate(&self, size: usize) -> Result<Box<dyn DeviceBuffer>> {
        let used = self.allocated.load(Ordering::Relaxed);
        if used + size > self.limit {
            return Err(GraphRtError::DeviceOom {
                requested: size,
                available: self.limit.saturating_sub(used),
            });
        }
        let buffer = CpuBuffer::new(size, Arc::clone(&self.allocated))?;
        debug!(size, used = self.allocated(), "allocated device buffer");
        Ok(Box::new(buffer))
    }

    fn create_stream(&self) -> Result<Arc<dyn DeviceStream>> {
        let index = self.streams_created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(CpuStream::new(index)))
    }

    fn total_memory(&self) -> usize {
        self.limit
    }

    fn free_memory(&self) -> usize {
        self.limit.saturating_sub(self.allocated())
    }
}
