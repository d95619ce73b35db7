//! Tensor descriptors, host-side values, and arena buffer views.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{GraphRtError, Result};
use crate::types::{DType, Shape};

/// Static description of a tensor: element type and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Element type.
    pub dtype: DType,
    /// Shape, possibly dynamic until resize propagation.
    pub shape: Shape,
}

impl TensorDesc {
    /// Create a descriptor.
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    /// Byte size, or `None` while the shape is dynamic.
    pub fn size_bytes(&self) -> Option<usize> {
        self.shape.numel().map(|n| n * self.dtype.size_of())
    }
}

/// A tensor value held in host memory, used for feeding graph inputs and
/// collecting graph outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    desc: TensorDesc,
    bytes: Vec<u8>,
}

impl HostTensor {
    /// Create a host tensor from raw bytes. The byte length must match the
    /// descriptor's static size.
    pub fn from_bytes(desc: TensorDesc, bytes: Vec<u8>) -> Result<Self> {
        let expected = desc.size_bytes().ok_or_else(|| {
            GraphRtError::InvalidConfig("host tensor requires a static shape".to_string())
        })?;
        if bytes.len() != expected {
            return Err(GraphRtError::InvalidConfig(format!(
                "host tensor byte length {} does not match {} ({} bytes)",
                bytes.len(),
                desc.shape,
                expected
            )));
        }
        Ok(Self { desc, bytes })
    }

    /// Create an f32 host tensor.
    pub fn from_f32(shape: impl Into<Shape>, data: &[f32]) -> Result<Self> {
        let desc = TensorDesc::new(DType::F32, shape);
        Self::from_bytes(desc, bytemuck::cast_slice(data).to_vec())
    }

    /// Create an i32 host tensor.
    pub fn from_i32(shape: impl Into<Shape>, data: &[i32]) -> Result<Self> {
        let desc = TensorDesc::new(DType::I32, shape);
        Self::from_bytes(desc, bytemuck::cast_slice(data).to_vec())
    }

    /// Create an i64 host tensor.
    pub fn from_i64(shape: impl Into<Shape>, data: &[i64]) -> Result<Self> {
        let desc = TensorDesc::new(DType::I64, shape);
        Self::from_bytes(desc, bytemuck::cast_slice(data).to_vec())
    }

    /// An all-zero host tensor of the given descriptor.
    pub fn zeros(desc: TensorDesc) -> Result<Self> {
        let size = desc.size_bytes().ok_or_else(|| {
            GraphRtError::InvalidConfig("host tensor requires a static shape".to_string())
        })?;
        Ok(Self {
            desc,
            bytes: vec![0u8; size],
        })
    }

    /// Descriptor of this tensor.
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    /// Raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn to_typed<T: bytemuck::Pod>(&self, dtype: DType) -> Option<Vec<T>> {
        if self.desc.dtype != dtype {
            return None;
        }
        // Copies into a typed allocation: the byte backing carries no
        // alignment guarantee for T.
        let count = self.bytes.len() / std::mem::size_of::<T>();
        let mut out = vec![T::zeroed(); count];
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&self.bytes);
        Some(out)
    }

    /// Elements as f32, if that is the dtype.
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        self.to_typed(DType::F32)
    }

    /// Elements as i32, if that is the dtype.
    pub fn to_i32(&self) -> Option<Vec<i32>> {
        self.to_typed(DType::I32)
    }

    /// Elements as i64, if that is the dtype.
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        self.to_typed(DType::I64)
    }
}

/// A raw view into a planned byte range of the device arena, handed to
/// kernels at launch time.
///
/// Concurrent kernels receive regions whose ranges only overlap when the
/// memory planner proved the owning tensors' lifetimes disjoint, so no two
/// live regions alias. That invariant, not a lock, is what makes the data
/// path safe.
#[derive(Debug, Clone, Copy)]
pub struct BufferRegion {
    ptr: *mut u8,
    len: usize,
}

impl BufferRegion {
    /// Create a region over `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid for the lifetime of the execution epoch
    /// and must not be handed to two simultaneously live kernels unless their
    /// lifetimes are disjoint.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Immutable byte view.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// Mutable byte view.
    ///
    /// Takes `&self` because regions are `Copy` views; exclusivity is
    /// guaranteed by the planner's non-aliasing invariant.
    #[allow(clippy::mut_from_ref)]
    pub fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Typed immutable view.
    pub fn as_typed<T: bytemuck::Pod>(&self) -> &[T] {
        bytemuck::cast_slice(self.as_slice())
    }

    /// Typed mutable view.
    #[allow(clippy::mut_from_ref)]
    pub fn as_typed_mut<T: bytemuck::Pod>(&self) -> &mut [T] {
        bytemuck::cast_slice_mut(self.as_mut_slice())
    }
}

// SAFETY: regions are moved into stream closures; disjointness of live
// regions is enforced by the memory planner.
unsafe impl Send for BufferRegion {}
unsafe impl Sync for BufferRegion {}

/// Runtime state of one planned buffer: its arena placement plus the per-epoch
/// consumer reference count.
#[derive(Debug)]
pub struct DeviceTensor {
    /// Byte offset within the arena.
    offset: usize,
    /// Byte size for the current epoch.
    size: usize,
    /// Consumers that still hold this buffer in the current epoch.
    refs: AtomicU32,
    /// Consumer count the tensor re-arms to each epoch.
    original_refs: u32,
}

impl DeviceTensor {
    /// Create a device tensor record.
    pub fn new(offset: usize, size: usize, consumers: u32) -> Self {
        Self {
            offset,
            size,
            refs: AtomicU32::new(consumers),
            original_refs: consumers,
        }
    }

    /// Arena byte offset.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Byte size for the current epoch.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Update placement after a re-plan (dynamic shape change).
    pub fn relocate(&mut self, offset: usize, size: usize) {
        self.offset = offset;
        self.size = size;
    }

    /// Remaining consumers this epoch.
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Record one consumer completing. Returns the remaining count.
    pub fn release(&self) -> u32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "device tensor over-released");
        prev - 1
    }

    /// Reset the consumer count for the next epoch.
    pub fn rearm(&self) {
        self.refs.store(self.original_refs, Ordering::Release);
    }
}
