//! Built-in element-wise kernels.
//!
//! These exercise the full `KernelMod` contract (dtype-checked `init`,
//! shape-dependent `resize`, asynchronous `launch`) and back the runtime's
//! integration tests. The production kernel library is an external
//! collaborator; nothing here is required by the scheduler itself.

use std::sync::Arc;

use graphrt_core::device::DeviceStream;
use graphrt_core::error::{GraphRtError, Result};
use graphrt_core::kernel::{KernelMod, KernelRegistry, ResizeStatus};
use graphrt_core::tensor::{BufferRegion, TensorDesc};
use graphrt_core::types::DType;

fn check_arity(op: &str, inputs: &[TensorDesc], want_in: usize, outputs: &[TensorDesc]) -> Result<()> {
    if inputs.len() != want_in || outputs.len() != 1 {
        return Err(GraphRtError::KernelInitFailed {
            node: op.to_string(),
            reason: format!(
                "expected {} inputs and 1 output, got {} and {}",
                want_in,
                inputs.len(),
                outputs.len()
            ),
        });
    }
    Ok(())
}

/// Binary element-wise arithmetic over two same-shape inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Mul,
}

/// `Add` / `Mul` kernel for f32 and i32.
pub struct BinaryKernel {
    op: BinOp,
    dtype: DType,
    numel: usize,
}

impl BinaryKernel {
    fn new(op: BinOp) -> Self {
        Self {
            op,
            dtype: DType::F32,
            numel: 0,
        }
    }

    /// Factory for the `Add` kernel.
    pub fn add() -> Box<dyn KernelMod> {
        Box::new(Self::new(BinOp::Add))
    }

    /// Factory for the `Mul` kernel.
    pub fn mul() -> Box<dyn KernelMod> {
        Box::new(Self::new(BinOp::Mul))
    }
}

impl KernelMod for BinaryKernel {
    fn init(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<()> {
        let name = match self.op {
            BinOp::Add => "Add",
            BinOp::Mul => "Mul",
        };
        check_arity(name, inputs, 2, outputs)?;
        let dtype = inputs[0].dtype;
        if inputs[1].dtype != dtype || outputs[0].dtype != dtype {
            return Err(GraphRtError::KernelInitFailed {
                node: name.to_string(),
                reason: format!(
                    "mixed dtypes: {} x {} -> {}",
                    inputs[0].dtype, inputs[1].dtype, outputs[0].dtype
                ),
            });
        }
        if !matches!(dtype, DType::F32 | DType::I32) {
            return Err(GraphRtError::KernelInitFailed {
                node: name.to_string(),
                reason: format!("unsupported dtype {dtype}"),
            });
        }
        self.dtype = dtype;
        Ok(())
    }

    fn resize(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<ResizeStatus> {
        if !inputs[0].shape.is_static() || !inputs[1].shape.is_static() {
            return Ok(ResizeStatus::Deferred);
        }
        if inputs[0].shape != inputs[1].shape {
            return Err(GraphRtError::InvalidGraph(format!(
                "binary op input shapes differ: {} vs {}",
                inputs[0].shape, inputs[1].shape
            )));
        }
        outputs[0].shape = inputs[0].shape.clone();
        self.numel = inputs[0].shape.numel().unwrap_or(0);
        Ok(ResizeStatus::Ready)
    }

    fn launch(
        &mut self,
        inputs: &[BufferRegion],
        _workspace: &[BufferRegion],
        outputs: &[BufferRegion],
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        let (a, b, out) = (inputs[0], inputs[1], outputs[0]);
        let (op, dtype, numel) = (self.op, self.dtype, self.numel);
        stream.enqueue(Box::new(move || match dtype {
            DType::F32 => {
                let a = &a.as_typed::<f32>()[..numel];
                let b = &b.as_typed::<f32>()[..numel];
                let out = &mut out.as_typed_mut::<f32>()[..numel];
                for i in 0..numel {
                    out[i] = match op {
                        BinOp::Add => a[i] + b[i],
                        BinOp::Mul => a[i] * b[i],
                    };
                }
            }
            DType::I32 => {
                let a = &a.as_typed::<i32>()[..numel];
                let b = &b.as_typed::<i32>()[..numel];
                let out = &mut out.as_typed_mut::<i32>()[..numel];
                for i in 0..numel {
                    out[i] = match op {
                        BinOp::Add => a[i].wrapping_add(b[i]),
                        BinOp::Mul => a[i].wrapping_mul(b[i]),
                    };
                }
            }
            _ => unreachable!("init validated the dtype"),
        }))
    }
}

/// `Relu` kernel for f32.
#[derive(Default)]
pub struct ReluKernel {
    numel: usize,
}

impl ReluKernel {
    /// Factory for the `Relu` kernel.
    pub fn create() -> Box<dyn KernelMod> {
        Box::new(Self::default())
    }
}

impl KernelMod for ReluKernel {
    fn init(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<()> {
        check_arity("Relu", inputs, 1, outputs)?;
        if inputs[0].dtype != DType::F32 || outputs[0].dtype != DType::F32 {
            return Err(GraphRtError::KernelInitFailed {
                node: "Relu".to_string(),
                reason: format!("unsupported dtype {}", inputs[0].dtype),
            });
        }
        Ok(())
    }

    fn resize(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<ResizeStatus> {
        if !inputs[0].shape.is_static() {
            return Ok(ResizeStatus::Deferred);
        }
        outputs[0].shape = inputs[0].shape.clone();
        self.numel = inputs[0].shape.numel().unwrap_or(0);
        Ok(ResizeStatus::Ready)
    }

    fn launch(
        &mut self,
        inputs: &[BufferRegion],
        _workspace: &[BufferRegion],
        outputs: &[BufferRegion],
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        let (input, out, numel) = (inputs[0], outputs[0], self.numel);
        stream.enqueue(Box::new(move || {
            let input = &input.as_typed::<f32>()[..numel];
            let out = &mut out.as_typed_mut::<f32>()[..numel];
            for i in 0..numel {
                out[i] = input[i].max(0.0);
            }
        }))
    }
}

/// `Cast` kernel converting between f32/f64/i32.
///
/// Staged through a scratch workspace so the resize -> workspace -> launch
/// path is exercised: resize sizes the scratch to the input, launch copies
/// the input into scratch and converts scratch into the output.
pub struct CastKernel {
    from: DType,
    to: DType,
    numel: usize,
    workspace: Vec<usize>,
}

impl CastKernel {
    /// Factory for the `Cast` kernel.
    pub fn create() -> Box<dyn KernelMod> {
        Box::new(Self {
            from: DType::F32,
            to: DType::F32,
            numel: 0,
            workspace: Vec::new(),
        })
    }

    fn supported(from: DType, to: DType) -> bool {
        matches!(
            (from, to),
            (DType::F32, DType::I32)
                | (DType::I32, DType::F32)
                | (DType::F32, DType::F64)
                | (DType::F64, DType::F32)
                | (DType::F32, DType::F32)
        )
    }
}

impl KernelMod for CastKernel {
    fn init(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<()> {
        check_arity("Cast", inputs, 1, outputs)?;
        let (from, to) = (inputs[0].dtype, outputs[0].dtype);
        if !Self::supported(from, to) {
            return Err(GraphRtError::KernelInitFailed {
                node: "Cast".to_string(),
                reason: format!("unsupported conversion {from} -> {to}"),
            });
        }
        self.from = from;
        self.to = to;
        Ok(())
    }

    fn resize(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<ResizeStatus> {
        self.workspace.clear();
        if !inputs[0].shape.is_static() {
            return Ok(ResizeStatus::Deferred);
        }
        outputs[0].shape = inputs[0].shape.clone();
        self.numel = inputs[0].shape.numel().unwrap_or(0);
        self.workspace.push(self.numel * self.from.size_of());
        Ok(ResizeStatus::Ready)
    }

    fn workspace_sizes(&self) -> &[usize] {
        &self.workspace
    }

    fn launch(
        &mut self,
        inputs: &[BufferRegion],
        workspace: &[BufferRegion],
        outputs: &[BufferRegion],
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()> {
        let (input, scratch, out) = (inputs[0], workspace[0], outputs[0]);
        let (from, to, numel) = (self.from, self.to, self.numel);
        stream.enqueue(Box::new(move || {
            let bytes = numel * from.size_of();
            scratch.as_mut_slice()[..bytes].copy_from_slice(&input.as_slice()[..bytes]);
            match (from, to) {
                (DType::F32, DType::I32) => {
                    let src = &scratch.as_typed::<f32>()[..numel];
                    let dst = &mut out.as_typed_mut::<i32>()[..numel];
                    for i in 0..numel {
                        dst[i] = src[i] as i32;
                    }
                }
                (DType::I32, DType::F32) => {
                    let src = &scratch.as_typed::<i32>()[..numel];
                    let dst = &mut out.as_typed_mut::<f32>()[..numel];
                    for i in 0..numel {
                        dst[i] = src[i] as f32;
                    }
                }
                (DType::F32, DType::F64) => {
                    let src = &scratch.as_typed::<f32>()[..numel];
                    let dst = &mut out.as_typed_mut::<f64>()[..numel];
                    for i in 0..numel {
                        dst[i] = f64::from(src[i]);
                    }
                }
                (DType::F64, DType::F32) => {
                    let src = &scratch.as_typed::<f64>()[..numel];
                    let dst = &mut out.as_typed_mut::<f32>()[..numel];
                    for i in 0..numel {
                        dst[i] = src[i] as f32;
                    }
                }
                (DType::F32, DType::F32) => {
                    out.as_mut_slice()[..bytes].copy_from_slice(&scratch.as_slice()[..bytes]);
                }
                _ => unreachable!("init validated the conversion"),
            }
        }))
    }
}

/// Register every built-in kernel variant into `registry`.
pub fn register_builtins(registry: &KernelRegistry) {
    for dtype in [DType::F32, DType::I32] {
        registry.register("Add", vec![dtype, dtype], Arc::new(BinaryKernel::add));
        registry.register("Mul", vec![dtype, dtype], Arc::new(BinaryKernel::mul));
    }
    registry.register("Relu", vec![DType::F32], Arc::new(ReluKernel::create));
    for from in [DType::F32, DType::I32, DType::F64] {
        registry.register("Cast", vec![from], Arc::new(CastKernel::create));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuStream;
    use graphrt_core::types::Shape;

    fn desc(dtype: DType, dims: &[i64]) -> TensorDesc {
        TensorDesc::new(dtype, Shape::new(dims.to_vec()))
    }

    fn region_of<T: bytemuck::Pod>(backing: &mut [T]) -> BufferRegion {
        unsafe {
            BufferRegion::new(
                backing.as_mut_ptr() as *mut u8,
                std::mem::size_of_val(backing),
            )
        }
    }

    #[test]
    fn test_add_f32() {
        let mut kernel = BinaryKernel::add();
        let inputs = vec![desc(DType::F32, &[4]), desc(DType::F32, &[4])];
        let mut outputs = vec![desc(DType::F32, &[4])];
        kernel.init(&inputs, &mut outputs).unwrap();
        assert_eq!(kernel.resize(&inputs, &mut outputs).unwrap(), ResizeStatus::Ready);

        let mut a = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut b = vec![10.0f32, 20.0, 30.0, 40.0];
        let mut out = vec![0.0f32; 4];
        let stream: Arc<dyn DeviceStream> = Arc::new(CpuStream::new(0));
        kernel
            .launch(
                &[region_of(&mut a), region_of(&mut b)],
                &[],
                &[region_of(&mut out)],
                &stream,
            )
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out, &[11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_mixed_dtype_rejected_at_init() {
        let mut kernel = BinaryKernel::add();
        let inputs = vec![desc(DType::F32, &[4]), desc(DType::I32, &[4])];
        let mut outputs = vec![desc(DType::F32, &[4])];
        let err = kernel.init(&inputs, &mut outputs).unwrap_err();
        assert!(err.is_build_error());
    }

    #[test]
    fn test_resize_defers_on_dynamic_shape() {
        let mut kernel = ReluKernel::default();
        let inputs = vec![desc(DType::F32, &[-1, 4])];
        let mut outputs = vec![desc(DType::F32, &[-1, 4])];
        kernel.init(&inputs, &mut outputs).unwrap();
        assert_eq!(
            kernel.resize(&inputs, &mut outputs).unwrap(),
            ResizeStatus::Deferred
        );
    }

    #[test]
    fn test_cast_workspace_tracks_input_size() {
        let mut kernel = CastKernel::create();
        let inputs = vec![desc(DType::F32, &[4, 4])];
        let mut outputs = vec![desc(DType::I32, &[4, 4])];
        kernel.init(&inputs, &mut outputs).unwrap();

        kernel.resize(&inputs, &mut outputs).unwrap();
        assert_eq!(kernel.workspace_sizes(), &[64]);

        // Resize with a larger shape must not reuse the stale size.
        let inputs = vec![desc(DType::F32, &[8, 8])];
        kernel.resize(&inputs, &mut outputs).unwrap();
        assert_eq!(kernel.workspace_sizes(), &[256]);
    }

    #[test]
    fn test_cast_f32_to_i32() {
        let mut kernel = CastKernel::create();
        let inputs = vec![desc(DType::F32, &[3])];
        let mut outputs = vec![desc(DType::I32, &[3])];
        kernel.init(&inputs, &mut outputs).unwrap();
        kernel.resize(&inputs, &mut outputs).unwrap();

        let mut input = vec![1.7f32, -2.3, 0.0];
        let mut scratch = vec![0.0f32; 3];
        let mut out = vec![0i32; 3];
        let stream: Arc<dyn DeviceStream> = Arc::new(CpuStream::new(0));
        kernel
            .launch(
                &[region_of(&mut input)],
                &[region_of(&mut scratch)],
                &[region_of(&mut out)],
                &stream,
            )
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(out, &[1, -2, 0]);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = KernelRegistry::new();
        register_builtins(&registry);
        assert!(registry.contains("Add", &[DType::F32, DType::F32]));
        assert!(registry.contains("Relu", &[DType::F32]));
        assert!(registry.contains("Cast", &[DType::I32]));
        assert!(!registry.contains("Relu", &[DType::I64]));
    }
}
