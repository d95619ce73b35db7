//! Scheduling actors wrapping kernel graph nodes.
//!
//! An actor collects its declared inputs (data and control, counted
//! uniformly) for the current epoch, becomes ready exactly once all slots are
//! filled, executes, posts its outputs, and is re-armed for the next epoch.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use graphrt_core::device::DeviceStream;
use graphrt_core::graph::NodeKind;
use graphrt_core::kernel::KernelMod;
use graphrt_core::types::NodeId;

use crate::mailbox::{ActorMessage, Mailbox, MailboxFull, TensorRef};

/// Identifier of an actor within one execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(pub usize);

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "a{}", self.0)
    }
}

/// Lifecycle state of an actor within one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    /// Armed, no inputs received yet.
    Idle,
    /// Some, but not all, input slots filled.
    Collecting,
    /// All inputs filled; queued for dispatch.
    Ready,
    /// Resize + launch issued on the assigned stream.
    Executing,
    /// Completion observed and outputs posted.
    Completed,
}

/// A data subscription: output `output_index` feeds `slot` of actor `to`.
#[derive(Debug, Clone, Copy)]
pub struct DataSub {
    /// Producer output index.
    pub output_index: usize,
    /// Subscribing actor.
    pub to: ActorId,
    /// Input slot on the subscriber.
    pub slot: usize,
}

/// A graph-output subscription: output `output_index` is graph output
/// `position`.
#[derive(Debug, Clone, Copy)]
pub struct CollectorSub {
    /// Producer output index.
    pub output_index: usize,
    /// Position in the graph's declared output list.
    pub position: usize,
}

/// Outcome of delivering a message to an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The actor is still collecting inputs.
    Pending,
    /// This message filled the last input slot; the actor must be queued.
    BecameReady,
    /// The message was ignored (stale epoch, or a merge branch losing the
    /// first-arrival race).
    Ignored,
}

struct ActorCore {
    state: ActorState,
    epoch: u64,
    filled_data: usize,
    filled_controls: usize,
    /// Input tensor refs collected for the in-flight dispatch, by slot.
    collected: Vec<Option<TensorRef>>,
}

/// One schedulable unit: a kernel node plus its wiring and mailbox.
pub struct Actor {
    /// Actor identifier (index into the plan's actor table).
    pub id: ActorId,
    /// Wrapped graph node.
    pub node: NodeId,
    /// Node instance name.
    pub name: String,
    /// Compute or merge.
    pub kind: NodeKind,
    /// Bound kernel; `None` for merge actors.
    pub kernel: Mutex<Option<Box<dyn KernelMod>>>,
    /// Assigned device stream.
    pub stream: Arc<dyn DeviceStream>,
    /// Data subscribers.
    pub data_subs: Vec<DataSub>,
    /// Control subscribers.
    pub control_subs: Vec<ActorId>,
    /// Graph-output subscriptions.
    pub collector_subs: Vec<CollectorSub>,
    /// Arena tensors backing this actor's outputs (re-planned per resize).
    pub output_tensors: RwLock<Vec<TensorRef>>,
    /// Arena tensors backing this actor's workspaces (re-planned per resize).
    pub workspace_tensors: RwLock<Vec<TensorRef>>,
    /// Declared data input slots for readiness accounting.
    expected_data: usize,
    /// Declared control inputs for readiness accounting.
    expected_controls: usize,
    mailbox: Mailbox,
    core: Mutex<ActorCore>,
}

impl Actor {
    /// Create an actor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ActorId,
        node: NodeId,
        name: String,
        kind: NodeKind,
        kernel: Option<Box<dyn KernelMod>>,
        stream: Arc<dyn DeviceStream>,
        expected_data: usize,
        expected_controls: usize,
        mailbox_capacity: usize,
    ) -> Self {
        let slots = expected_data;
        Self {
            id,
            node,
            name,
            kind,
            kernel: Mutex::new(kernel),
            stream,
            data_subs: Vec::new(),
            control_subs: Vec::new(),
            collector_subs: Vec::new(),
            output_tensors: RwLock::new(Vec::new()),
            workspace_tensors: RwLock::new(Vec::new()),
            expected_data,
            expected_controls,
            mailbox: Mailbox::new(mailbox_capacity),
            core: Mutex::new(ActorCore {
                state: ActorState::Idle,
                epoch: 0,
                filled_data: 0,
                filled_controls: 0,
                collected: vec![None; slots],
            }),
        }
    }

    /// Number of declared data input slots.
    pub fn expected_data(&self) -> usize {
        self.expected_data
    }

    /// Number of declared control inputs.
    pub fn expected_controls(&self) -> usize {
        self.expected_controls
    }

    /// Whether the actor has no declared inputs at all and must be seeded by
    /// the driver at epoch start.
    pub fn is_source(&self) -> bool {
        self.expected_data == 0 && self.expected_controls == 0
    }

    /// Current state.
    pub fn state(&self) -> ActorState {
        self.core.lock().state
    }

    /// Mailbox statistics.
    pub fn mailbox_stats(&self) -> crate::mailbox::MailboxStats {
        self.mailbox.stats()
    }

    /// Deliver a message, updating readiness accounting.
    ///
    /// A merge actor needs only its first data message; later branches of the
    /// same epoch are ignored. All actors ignore messages from stale epochs.
    pub fn deliver(&self, message: ActorMessage) -> Result<Delivery, MailboxFull> {
        let mut core = self.core.lock();
        if message.epoch() != core.epoch {
            warn!(
                actor = %self.name,
                message_epoch = message.epoch(),
                current_epoch = core.epoch,
                "ignoring stale message"
            );
            return Ok(Delivery::Ignored);
        }

        match message {
            ActorMessage::Data { .. } => {
                if self.kind == NodeKind::Merge && core.filled_data > 0 {
                    // First arrival already took the branch.
                    debug!(actor = %self.name, "merge ignoring losing branch");
                    return Ok(Delivery::Ignored);
                }
                self.mailbox.post(message)?;
                core.filled_data += 1;
            }
            ActorMessage::Control { .. } => {
                self.mailbox.post(message)?;
                core.filled_controls += 1;
            }
        }

        if core.state == ActorState::Idle {
            core.state = ActorState::Collecting;
        }

        let data_needed = if self.kind == NodeKind::Merge {
            1
        } else {
            self.expected_data
        };
        let ready = core.filled_data >= data_needed && core.filled_controls >= self.expected_controls;
        if ready && core.state == ActorState::Collecting {
            core.state = ActorState::Ready;
            Ok(Delivery::BecameReady)
        } else {
            Ok(Delivery::Pending)
        }
    }

    /// Transition to `Executing` and collect the epoch's input tensors by
    /// slot. Returns `None` when the actor is not `Ready` — a stale queue
    /// entry from an abandoned epoch must not dispatch.
    pub fn try_begin_execute(&self) -> Option<Vec<TensorRef>> {
        let mut core = self.core.lock();
        if core.state != ActorState::Ready {
            debug!(actor = %self.name, state = ?core.state, "refusing stale dispatch");
            return None;
        }
        core.state = ActorState::Executing;

        for message in self.mailbox.drain() {
            if let ActorMessage::Data { slot, tensor, .. } = message {
                if self.kind == NodeKind::Merge {
                    // Taken branch lands in the single forwarding slot.
                    if core.collected.is_empty() {
                        core.collected.push(Some(tensor));
                    } else {
                        core.collected[0] = Some(tensor);
                    }
                } else {
                    core.collected[slot] = Some(tensor);
                }
            }
        }

        let collected = if self.kind == NodeKind::Merge {
            core.collected.iter().take(1).flatten().copied().collect()
        } else {
            core.collected.iter().flatten().copied().collect()
        };
        Some(collected)
    }

    /// Tensors collected for the in-flight dispatch.
    pub fn collected_inputs(&self) -> Vec<TensorRef> {
        self.core.lock().collected.iter().flatten().copied().collect()
    }

    /// Transition to `Completed`.
    pub fn complete(&self) {
        let mut core = self.core.lock();
        debug_assert_eq!(core.state, ActorState::Executing);
        core.state = ActorState::Completed;
    }

    /// Force the actor straight to `Ready` (driver seeding of source actors).
    pub fn arm_ready(&self) {
        let mut core = self.core.lock();
        debug_assert!(self.is_source());
        core.state = ActorState::Ready;
    }

    /// Re-arm for the next epoch: clear the mailbox and reset accounting.
    pub fn rearm(&self, epoch: u64) {
        self.mailbox.clear();
        let mut core = self.core.lock();
        core.state = ActorState::Idle;
        core.epoch = epoch;
        core.filled_data = 0;
        core.filled_controls = 0;
        let slots = if self.kind == NodeKind::Merge {
            1
        } else {
            self.expected_data
        };
        core.collected = vec![None; slots];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrt_cpu::CpuStream;

    fn actor(expected_data: usize, expected_controls: usize, kind: NodeKind) -> Actor {
        Actor::new(
            ActorId(0),
            NodeId(0),
            "test".to_string(),
            kind,
            None,
            Arc::new(CpuStream::new(0)),
            expected_data,
            expected_controls,
            64,
        )
    }

    fn data(slot: usize, tensor: usize, epoch: u64) -> ActorMessage {
        ActorMessage::Data {
            slot,
            tensor: TensorRef(tensor),
            epoch,
        }
    }

    #[test]
    fn test_ready_needs_all_slots() {
        let a = actor(2, 1, NodeKind::Kernel);
        a.rearm(1);
        assert_eq!(a.deliver(data(0, 10, 1)).unwrap(), Delivery::Pending);
        assert_eq!(a.state(), ActorState::Collecting);
        assert_eq!(a.deliver(data(1, 11, 1)).unwrap(), Delivery::Pending);
        assert_eq!(
            a.deliver(ActorMessage::Control {
                from: ActorId(9),
                epoch: 1
            })
            .unwrap(),
            Delivery::BecameReady
        );
        assert_eq!(a.state(), ActorState::Ready);

        let inputs = a.try_begin_execute().unwrap();
        assert_eq!(inputs, vec![TensorRef(10), TensorRef(11)]);
        assert_eq!(a.state(), ActorState::Executing);
    }

    #[test]
    fn test_stale_epoch_ignored() {
        let a = actor(1, 0, NodeKind::Kernel);
        a.rearm(2);
        assert_eq!(a.deliver(data(0, 10, 1)).unwrap(), Delivery::Ignored);
        assert_eq!(a.state(), ActorState::Idle);
    }

    #[test]
    fn test_merge_takes_first_branch() {
        let a = actor(2, 0, NodeKind::Merge);
        a.rearm(1);
        assert_eq!(a.deliver(data(1, 20, 1)).unwrap(), Delivery::BecameReady);
        // Losing branch is ignored, not queued.
        assert_eq!(a.deliver(data(0, 21, 1)).unwrap(), Delivery::Ignored);
        assert_eq!(a.try_begin_execute().unwrap(), vec![TensorRef(20)]);
    }

    #[test]
    fn test_rearm_cycles_epochs() {
        let a = actor(1, 0, NodeKind::Kernel);
        a.rearm(1);
        assert_eq!(a.deliver(data(0, 5, 1)).unwrap(), Delivery::BecameReady);
        a.try_begin_execute().unwrap();
        a.complete();
        assert_eq!(a.state(), ActorState::Completed);

        a.rearm(2);
        assert_eq!(a.state(), ActorState::Idle);
        assert_eq!(a.deliver(data(0, 6, 2)).unwrap(), Delivery::BecameReady);
        assert_eq!(a.try_begin_execute().unwrap(), vec![TensorRef(6)]);
    }

    #[test]
    fn test_source_actor_armed_directly() {
        let a = actor(0, 0, NodeKind::Kernel);
        a.rearm(1);
        assert!(a.is_source());
        a.arm_ready();
        assert_eq!(a.state(), ActorState::Ready);
        assert!(a.try_begin_execute().unwrap().is_empty());
    }
}
