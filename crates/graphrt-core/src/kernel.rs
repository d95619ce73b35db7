//! The kernel contract consumed by the scheduler, and the registry that
//! produces kernel instances.
//!
//! Every executable unit implements [`KernelMod`]. The runtime calls the
//! contract strictly as `init` once, then zero or more (`resize`, `launch`)
//! pairs, in that order, per execution epoch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::device::DeviceStream;
use crate::error::{GraphRtError, Result};
use crate::tensor::{BufferRegion, TensorDesc};
use crate::types::DType;

/// Outcome of a `resize` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStatus {
    /// All shape-dependent sizes are concrete; the kernel may launch.
    Ready,
    /// An input shape is still unknown; retry after upstream shapes resolve.
    Deferred,
}

/// An executable kernel bound to one graph node.
///
/// Implementations must keep `resize` idempotent and free of buffer-content
/// side effects, and must not block in `launch`: the computation is issued on
/// the given stream and completion is observed by the scheduler, not awaited
/// by the kernel.
pub trait KernelMod: Send {
    /// One-time setup. Validates that the dtype/shape family of the given
    /// inputs and outputs is supported; failure is a configuration error
    /// reported at plan-prepare time.
    fn init(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc]) -> Result<()>;

    /// Recompute shape-dependent sizes (output shapes, workspace sizes) from
    /// the current input shapes. Writes inferred shapes into `outputs`.
    fn resize(&mut self, inputs: &[TensorDesc], outputs: &mut [TensorDesc])
        -> Result<ResizeStatus>;

    /// Workspace byte sizes required by the most recent successful `resize`.
    fn workspace_sizes(&self) -> &[usize] {
        &[]
    }

    /// Issue the computation on `stream`. Input/workspace/output regions are
    /// resolved arena views sized by the most recent `resize`.
    fn launch(
        &mut self,
        inputs: &[BufferRegion],
        workspace: &[BufferRegion],
        outputs: &[BufferRegion],
        stream: &Arc<dyn DeviceStream>,
    ) -> Result<()>;
}

/// Factory producing a fresh kernel instance for one node.
pub type KernelFactory = Arc<dyn Fn() -> Box<dyn KernelMod> + Send + Sync>;

/// Lookup key: operator name plus input dtype signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct KernelKey {
    op: String,
    signature: Vec<DType>,
}

/// Registry mapping (operator, input dtype signature) to kernel factories.
///
/// The registry is an explicit object constructed at startup and passed by
/// reference to plan preparation; there is no process-global instance.
#[derive(Default)]
pub struct KernelRegistry {
    factories: RwLock<HashMap<KernelKey, KernelFactory>>,
}

impl KernelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `op` with the given input dtype signature.
    /// A later registration for the same key replaces the earlier one.
    pub fn register(
        &self,
        op: impl Into<String>,
        signature: impl Into<Vec<DType>>,
        factory: KernelFactory,
    ) {
        let key = KernelKey {
            op: op.into(),
            signature: signature.into(),
        };
        debug!(op = %key.op, signature = ?key.signature, "registering kernel");
        self.factories.write().insert(key, factory);
    }

    /// Instantiate a kernel for `op` with the given input dtype signature.
    pub fn create(&self, op: &str, signature: &[DType]) -> Result<Box<dyn KernelMod>> {
        let key = KernelKey {
            op: op.to_string(),
            signature: signature.to_vec(),
        };
        let factories = self.factories.read();
        match factories.get(&key) {
            Some(factory) => Ok(factory()),
            None => Err(GraphRtError::UnsupportedKernel {
                op: op.to_string(),
                signature: signature.to_vec(),
            }),
        }
    }

    /// Whether a variant is registered for the key.
    pub fn contains(&self, op: &str, signature: &[DType]) -> bool {
        let key = KernelKey {
            op: op.to_string(),
            signature: signature.to_vec(),
        };
        self.factories.read().contains_key(&key)
    }

    /// Number of registered variants.
    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("variants", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Shape;

    struct NoopKernel;

    impl KernelMod for NoopKernel {
        fn init(&mut self, _inputs: &[TensorDesc], _outputs: &mut [TensorDesc]) -> Result<()> {
            Ok(())
        }

        fn resize(
            &mut self,
            _inputs: &[TensorDesc],
            _outputs: &mut [TensorDesc],
        ) -> Result<ResizeStatus> {
            Ok(ResizeStatus::Ready)
        }

        fn launch(
            &mut self,
            _inputs: &[BufferRegion],
            _workspace: &[BufferRegion],
            _outputs: &[BufferRegion],
            _stream: &Arc<dyn DeviceStream>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = KernelRegistry::new();
        registry.register("Noop", vec![DType::F32], Arc::new(|| Box::new(NoopKernel)));

        assert!(registry.contains("Noop", &[DType::F32]));
        assert!(!registry.contains("Noop", &[DType::I32]));
        assert!(registry.create("Noop", &[DType::F32]).is_ok());
    }

    #[test]
    fn test_registry_unsupported_is_config_error() {
        let registry = KernelRegistry::new();
        let err = match registry.create("Gelu", &[DType::F32]) {
            Ok(_) => panic!("expected create to fail"),
            Err(e) => e,
        };
        assert!(err.is_build_error());
        assert!(matches!(err, GraphRtError::UnsupportedKernel { .. }));
    }

    #[test]
    fn test_kernel_default_workspace_is_empty() {
        let mut kernel = NoopKernel;
        let mut outputs = vec![TensorDesc::new(DType::F32, Shape::new(vec![1]))];
        kernel.init(&[], &mut outputs).unwrap();
        assert!(kernel.workspace_sizes().is_empty());
    }
}
