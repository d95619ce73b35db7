//! Runtime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraphRtError, Result};

/// Configuration for plan preparation and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads in the scheduler pool. `0` selects the available
    /// hardware concurrency.
    pub worker_threads: usize,
    /// Device streams created per plan; actors are assigned round-robin.
    pub num_streams: usize,
    /// Soft capacity of each actor mailbox.
    pub mailbox_capacity: usize,
    /// Peak device-memory budget for the arena planner, in bytes.
    pub memory_budget: Option<usize>,
    /// Deadline for `run` to complete; `None` waits indefinitely. A timeout
    /// hardens the driver against device launches hanging on driver faults.
    pub wait_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            num_streams: 2,
            mailbox_capacity: 1024,
            memory_budget: None,
            wait_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl RuntimeConfig {
    /// Minimal configuration: one worker, one stream. Useful for
    /// deterministic debugging.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            worker_threads: 1,
            num_streams: 1,
            ..Self::default()
        }
    }

    /// Performance configuration: hardware concurrency, four streams.
    #[must_use]
    pub fn performance() -> Self {
        Self {
            worker_threads: 0,
            num_streams: 4,
            ..Self::default()
        }
    }

    /// Worker threads after resolving the `0` = hardware-concurrency default.
    pub fn resolved_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if self.num_streams == 0 {
            return Err(GraphRtError::InvalidConfig(
                "num_streams must be at least 1".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(GraphRtError::InvalidConfig(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker-thread count (`0` = hardware concurrency).
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Set the number of device streams per plan.
    #[must_use]
    pub fn num_streams(mut self, count: usize) -> Self {
        self.config.num_streams = count;
        self
    }

    /// Set the mailbox capacity.
    #[must_use]
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mailbox_capacity = capacity;
        self
    }

    /// Set the arena memory budget in bytes.
    #[must_use]
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.config.memory_budget = Some(bytes);
        self
    }

    /// Set the `run` wait deadline.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.wait_timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
