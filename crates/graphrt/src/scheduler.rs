//! The worker pool and completion gate at the heart of the mailbox runtime.
//!
//! A fixed-size pool of worker threads pulls ready actors from a shared
//! queue. Workers never block waiting on another actor: completion is
//! delivered by message from the stream side, which may re-trigger
//! scheduling on any thread. The only blocking operations are stream
//! synchronization and the top-level wait on the completion gate.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use graphrt_core::error::{GraphRtError, Result};

use crate::actor::ActorId;

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Actors handed to the dispatch path.
    pub dispatched: u64,
    /// Actors discarded because abort was observed first.
    pub skipped: u64,
    /// Current ready-queue depth.
    pub queue_depth: usize,
}

/// State shared between the worker pool, the plan driver, and stream-side
/// completion callbacks.
pub struct SchedShared {
    queue: Mutex<VecDeque<ActorId>>,
    work: Condvar,
    shutdown: AtomicBool,
    abort: AtomicBool,
    worker_ids: RwLock<HashSet<ThreadId>>,
    dispatched: AtomicU64,
    skipped: AtomicU64,
}

impl SchedShared {
    /// Create shared scheduler state.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            work: Condvar::new(),
            shutdown: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            worker_ids: RwLock::new(HashSet::new()),
            dispatched: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Queue a ready actor for dispatch.
    pub fn enqueue(&self, id: ActorId) {
        let mut queue = self.queue.lock();
        queue.push_back(id);
        self.work.notify_one();
    }

    /// Discard queued entries (epoch re-arm after a timeout or abort).
    /// Returns how many entries were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Set the cooperative abort flag: no new actor is dispatched once a
    /// worker observes it; in-flight launches are allowed to finish.
    pub fn set_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Clear the abort flag for the next epoch.
    pub fn clear_abort(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Whether abort has been requested.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Record one actor skipped after abort.
    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the calling thread belongs to the worker pool. Used to make
    /// `wait` a no-op on pool threads, so a worker can never deadlock on
    /// itself.
    pub fn is_worker_thread(&self) -> bool {
        self.worker_ids.read().contains(&std::thread::current().id())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            queue_depth: self.queue.lock().len(),
        }
    }
}

impl Default for SchedShared {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed-size worker pool.
pub struct Scheduler {
    shared: Arc<SchedShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn `worker_count` workers running `runner` for each ready actor.
    ///
    /// The runner owns the cooperative abort check: it is invoked for every
    /// popped actor and decides whether to dispatch or drain it.
    pub fn start(
        shared: Arc<SchedShared>,
        worker_count: usize,
        runner: Arc<dyn Fn(ActorId) + Send + Sync>,
    ) -> Self {
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            let handle = std::thread::Builder::new()
                .name(format!("graphrt-worker-{index}"))
                .spawn(move || {
                    shared.worker_ids.write().insert(std::thread::current().id());
                    loop {
                        let id = {
                            let mut queue = shared.queue.lock();
                            loop {
                                if shared.shutdown.load(Ordering::SeqCst) {
                                    return;
                                }
                                if let Some(id) = queue.pop_front() {
                                    break id;
                                }
                                shared.work.wait(&mut queue);
                            }
                        };
                        shared.dispatched.fetch_add(1, Ordering::Relaxed);
                        runner(id);
                    }
                })
                .expect("failed to spawn scheduler worker");
            workers.push(handle);
        }
        debug!(worker_count, "scheduler pool started");
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Shared scheduler state.
    pub fn shared(&self) -> &Arc<SchedShared> {
        &self.shared
    }

    /// Stop the pool and join every worker.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.work.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct GateState {
    finished: bool,
    error: Option<GraphRtError>,
}

/// One-epoch completion gate the driver waits on.
pub struct CompletionGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl CompletionGate {
    /// Create a gate in the unfinished state.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                finished: false,
                error: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Reset for a new epoch.
    pub fn open(&self) {
        let mut state = self.state.lock();
        state.finished = false;
        state.error = None;
    }

    /// Signal successful completion.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if !state.finished {
            state.finished = true;
            self.cv.notify_all();
        }
    }

    /// Signal failure. The first error wins; later signals are dropped.
    pub fn fail(&self, error: GraphRtError) {
        let mut state = self.state.lock();
        if !state.finished {
            state.finished = true;
            state.error = Some(error);
            self.cv.notify_all();
        }
    }

    /// Whether the epoch has finished (successfully or not).
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Block until the epoch finishes or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !state.finished {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return Err(GraphRtError::Timeout(timeout));
                    }
                }
            }
            None => {
                while !state.finished {
                    self.cv.wait(&mut state);
                }
            }
        }
        match state.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}
