//! Shared fixtures for the integration tests: probe kernels that record
//! execution spans, fault-injection kernels, and graph builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use graphrt::prelude::*;
use graphrt::{BufferRegion, DeviceStream, GraphRtError, KernelMod, KernelRegistry};

/// An observed kernel execution window.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    /// Probe tag identifying the node.
    pub tag: usize,
    /// Device-side start of the work.
    pub start: Instant,
    /// Device-side end of the work.
    pub end: Instant,
}

/// Shared span log filled from stream threads.
pub type SpanLog = Arc<Mutex<Vec<Span>>>;

/// f32 descriptor helper.
pub fn f32_desc(dims: &[i64]) -> TensorDesc {
    TensorDesc::new(DType::F32, Shape::new(dims.to_vec()))
}

/// Registry with the built-in kernels.
pub fn builtin_registry() -> KernelRegistry {
    let registry = KernelRegistry::new();
    register_builtins(&registry);
    registry
}

/// A kernel that sums its f32 inputs into its output, sleeps up to
/// `max_sleep` on the stream, and records its execution span.
pub struct ProbeKernel {
    tag: usize,
    min_sleep: Duration,
    max_sleep: Duration,
    log: SpanLog,
    numel: usize,
}

impl ProbeKernel {
    /// Register a probe variant as op `name` with `arity` f32 inputs,
    /// sleeping a random duration in `[min_sleep, max_sleep]` per launch.
    pub fn register(
        registry: &KernelRegistry,
        name: &str,
        arity: usize,
        tag: usize,
        min_sleep: Duration,
        max_sleep: Duration,
        log: &SpanLog,
    ) {
        let log = Arc::clone(log);
        registry.register(
            name,
            vec![DType::F32; arity],
            Arc::new(move || {
                Box::new(ProbeKernel {
                    tag,
                    min_sleep,
                    max_sleep,
                    log: Arc::clone(&log),
                    numel: 0,
                })
            }),
        );
    }
}

impl KernelMod for ProbeKernel {
    fn init(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> graphrt::Result<()> {
        if inputs.iter().any(|d| d.dtype != DType::F32) || outputs.len() != 1 {
            return Err(GraphRtError::KernelInitFailed {
                node: "Probe".to_string(),
                reason: "probe kernels are f32 with one output".to_string(),
            });
        }
        Ok(())
    }

    fn resize(
        &mut self,
        inputs: &[TensorDesc],
        outputs: &mut [TensorDesc],
    ) -> graphrt::Result<ResizeStatus> {
        if !inputs.iter().all(|d| d.shape.is_static()) {
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
    ) -> graphrt::Result<()> {
        let inputs = inputs.to_vec();
        let out = outputs[0];
        let (tag, numel) = (self.tag, self.numel);
        let (min_us, max_us) = (
            self.min_sleep.as_micros() as u64,
            self.max_sleep.as_micros() as u64,
        );
        let log = Arc::clone(&self.log);
        stream.enqueue(Box::new(move || {
            let start = Instant::now();
            if max_us > 0 {
                let span = max_us.saturating_sub(min_us);
                let jitter = if span > 0 {
                    rand::random::<u64>() % (span + 1)
                } else {
                    0
                };
                std::thread::sleep(Duration::from_micros(min_us + jitter));
            }
            let dst = &mut out.as_typed_mut::<f32>()[..numel];
            dst.fill(0.0);
            for input in &inputs {
                let src = &input.as_typed::<f32>()[..numel];
                for i in 0..numel {
                    dst[i] += src[i];
                }
            }
            log.lock().push(Span {
                tag,
                start,
                end: Instant::now(),
            });
        }))
    }
}

/// A kernel whose launch fails; optionally only on the first attempt.
pub struct FaultyKernel {
    armed: Arc<AtomicBool>,
    numel: usize,
}

impl FaultyKernel {
    /// Register op `name`: launch fails while `armed` is true.
    pub fn register(registry: &KernelRegistry, name: &str, armed: &Arc<AtomicBool>) {
        let armed = Arc::clone(armed);
        registry.register(
            name,
            vec![DType::F32],
            Arc::new(move || {
                Box::new(FaultyKernel {
                    armed: Arc::clone(&armed),
                    numel: 0,
                })
            }),
        );
    }
}

impl KernelMod for FaultyKernel {
    fn init(&mut self, _inputs: &[TensorDesc], _outputs: &mut [TensorDesc]) -> graphrt::Result<()> {
        Ok(())
    }

    fn resize(
        &mut self,
        inputs: &[TensorDesc],
        outputs: &mut [TensorDesc],
    ) -> graphrt::Result<ResizeStatus> {
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
    ) -> graphrt::Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(GraphRtError::StreamFault(
                "injected launch failure".to_string(),
            ));
        }
        let (input, out, numel) = (inputs[0], outputs[0], self.numel);
        stream.enqueue(Box::new(move || {
            let src = &input.as_typed::<f32>()[..numel];
            let dst = &mut out.as_typed_mut::<f32>()[..numel];
            dst.copy_from_slice(src);
        }))
    }
}

/// A kernel that panics on the stream, simulating a driver fault.
pub struct PanicKernel;

impl PanicKernel {
    /// Register op `name`.
    pub fn register(registry: &KernelRegistry, name: &str) {
        registry.register(name, vec![DType::F32], Arc::new(|| Box::new(PanicKernel)));
    }
}

impl KernelMod for PanicKernel {
    fn init(&mut self, _inputs: &[TensorDesc], _outputs: &mut [TensorDesc]) -> graphrt::Result<()> {
        Ok(())
    }

    fn resize(
        &mut self,
        inputs: &[TensorDesc],
        outputs: &mut [TensorDesc],
    ) -> graphrt::Result<ResizeStatus> {
        outputs[0].shape = inputs[0].shape.clone();
        Ok(ResizeStatus::Ready)
    }

    fn launch(
        &mut self,
        _inputs: &[BufferRegion],
        _workspace: &[BufferRegion],
        _outputs: &[BufferRegion],
        stream: &Arc<dyn DeviceStream>,
    ) -> graphrt::Result<()> {
        stream.enqueue(Box::new(|| panic!("simulated driver fault")))
    }
}

/// A kernel that never resolves its shapes.
pub struct StubbornKernel;

impl StubbornKernel {
    /// Register op `name`.
    pub fn register(registry: &KernelRegistry, name: &str) {
        registry.register(name, vec![DType::F32], Arc::new(|| Box::new(StubbornKernel)));
    }
}

impl KernelMod for StubbornKernel {
    fn init(&mut self, _inputs: &[TensorDesc], _outputs: &mut [TensorDesc]) -> graphrt::Result<()> {
        Ok(())
    }

    fn resize(
        &mut self,
        _inputs: &[TensorDesc],
        _outputs: &mut [TensorDesc],
    ) -> graphrt::Result<ResizeStatus> {
        Ok(ResizeStatus::Deferred)
    }

    fn launch(
        &mut self,
        _inputs: &[BufferRegion],
        _workspace: &[BufferRegion],
        _outputs: &[BufferRegion],
        _stream: &Arc<dyn DeviceStream>,
    ) -> graphrt::Result<()> {
        unreachable!("stubborn kernels never become launchable")
    }
}
