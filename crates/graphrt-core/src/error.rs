//! Error taxonomy for the execution runtime.
//!
//! Errors fall into two propagation classes: plan-build errors (configuration,
//! graph shape, allocation feasibility) are synchronous and fatal to plan
//! construction; run-time errors (launch faults, aborts, timeouts) are raised
//! asynchronously but always surfaced to the `run` caller before it returns.

use std::time::Duration;

use crate::types::DType;

/// Result type used throughout the runtime.
pub type Result<T> = std::result::Result<T, GraphRtError>;

/// Errors produced by plan construction and execution.
#[derive(Debug, thiserror::Error)]
pub enum GraphRtError {
    /// No kernel variant matches the operator and dtype signature.
    #[error("no kernel registered for op `{op}` with input signature {signature:?}")]
    UnsupportedKernel {
        /// Operator name.
        op: String,
        /// Input dtype signature that failed to match.
        signature: Vec<DType>,
    },

    /// A kernel rejected its configuration during `init`.
    #[error("kernel `{node}` rejected its configuration: {reason}")]
    KernelInitFailed {
        /// Node instance name.
        node: String,
        /// Reason reported by the kernel.
        reason: String,
    },

    /// A shape could not be resolved to a concrete size before launch.
    #[error("shape for `{node}` is still unresolved after resize propagation")]
    ShapeUnresolved {
        /// Node instance name.
        node: String,
    },

    /// A kernel launch failed on its device stream.
    #[error("launch failed on `{node}`: {reason}")]
    LaunchFailed {
        /// Node instance name of the first failing kernel.
        node: String,
        /// Device-side failure description.
        reason: String,
    },

    /// The device allocator could not satisfy a request.
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    DeviceOom {
        /// Requested allocation size in bytes.
        requested: usize,
        /// Bytes the device reported as available.
        available: usize,
    },

    /// The memory planner cannot fit the graph within the configured budget.
    #[error("memory plan infeasible: peak {peak_bytes} bytes exceeds budget {budget_bytes}")]
    AllocationInfeasible {
        /// Peak arena size the graph requires.
        peak_bytes: usize,
        /// Configured budget in bytes.
        budget_bytes: usize,
    },

    /// The graph contains a cyclic dependency outside recognized patterns.
    #[error("graph contains a cycle through `{node}`")]
    CyclicGraph {
        /// A node on the detected cycle.
        node: String,
    },

    /// The graph is structurally invalid.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// Execution was aborted before all actors completed.
    #[error("execution aborted: {completed} of {dispatched} dispatched actors completed")]
    Aborted {
        /// Actors that finished before the abort drained.
        completed: usize,
        /// Actors dispatched in the aborted epoch.
        dispatched: usize,
    },

    /// A device stream captured a fault.
    #[error("stream fault: {0}")]
    StreamFault(String),

    /// A previous execution on this plan has not finished.
    #[error("a previous execution is still in flight")]
    PlanBusy,

    /// The wait deadline elapsed before completion.
    #[error("execution did not complete within {0:?}")]
    Timeout(Duration),

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An actor mailbox overflowed.
    #[error("mailbox for actor `{actor}` is full (capacity {capacity})")]
    MailboxFull {
        /// Receiving actor name.
        actor: String,
        /// Configured mailbox capacity.
        capacity: usize,
    },
}

impl GraphRtError {
    /// Whether this error is fatal at plan-build time (as opposed to a
    /// per-execution failure that leaves the plan reusable).
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            GraphRtError::UnsupportedKernel { .. }
                | GraphRtError::KernelInitFailed { .. }
                | GraphRtError::AllocationInfeasible { .. }
                | GraphRtError::CyclicGraph { .. }
                | GraphRtError::InvalidGraph(_)
                | GraphRtError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_classification() {
        let err = GraphRtError::InvalidGraph("dangling edge".to_string());
        assert!(err.is_build_error());

        let err = GraphRtError::LaunchFailed {
            node: "relu_1".to_string(),
            reason: "bad address".to_string(),
        };
        assert!(!err.is_build_error());
    }

    #[test]
    fn test_display_names_first_failing_node() {
        let err = GraphRtError::LaunchFailed {
            node: "matmul_3".to_string(),
            reason: "illegal instruction".to_string(),
        };
        assert!(err.to_string().contains("matmul_3"));
    }
}
