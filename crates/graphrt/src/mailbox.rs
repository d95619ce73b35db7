//! Per-actor mailboxes.
//!
//! Each actor owns one multi-producer mailbox; producers are completed
//! upstream actors (posting from stream threads) and the plan driver
//! (feeding graph inputs). Delivery is the only mutex-protected step on the
//! data path: tensor payloads are arena references, never copies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::actor::ActorId;

/// Index into the plan's device-tensor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorRef(pub usize);

/// A message delivered to an actor's mailbox.
#[derive(Debug, Clone, Copy)]
pub enum ActorMessage {
    /// A produced tensor for one input slot.
    Data {
        /// Destination input slot.
        slot: usize,
        /// Arena tensor carrying the payload.
        tensor: TensorRef,
        /// Execution epoch the payload belongs to.
        epoch: u64,
    },
    /// A zero-size control token: ordering only, no data.
    Control {
        /// Completed upstream actor.
        from: ActorId,
        /// Execution epoch the token belongs to.
        epoch: u64,
    },
}

impl ActorMessage {
    /// Epoch the message belongs to.
    pub fn epoch(&self) -> u64 {
        match self {
            ActorMessage::Data { epoch, .. } | ActorMessage::Control { epoch, .. } => *epoch,
        }
    }
}

/// Statistics for a mailbox.
#[derive(Debug, Clone, Default)]
pub struct MailboxStats {
    /// Total messages posted.
    pub posted: u64,
    /// Total messages drained.
    pub drained: u64,
    /// Maximum depth observed.
    pub max_depth: u64,
}

struct MailboxStatsInner {
    posted: AtomicU64,
    drained: AtomicU64,
    max_depth: AtomicU64,
}

/// Multi-producer mailbox with a soft capacity bound.
pub struct Mailbox {
    queue: Mutex<VecDeque<ActorMessage>>,
    capacity: usize,
    stats: MailboxStatsInner,
}

/// Error raised when a mailbox rejects a post.
#[derive(Debug, Clone, Copy)]
pub struct MailboxFull {
    /// Configured capacity.
    pub capacity: usize,
}

impl Mailbox {
    /// Create a mailbox with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            stats: MailboxStatsInner {
                posted: AtomicU64::new(0),
                drained: AtomicU64::new(0),
                max_depth: AtomicU64::new(0),
            },
        }
    }

    /// Post a message. Fails if the mailbox is at capacity.
    pub fn post(&self, message: ActorMessage) -> Result<(), MailboxFull> {
        let depth = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(MailboxFull {
                    capacity: self.capacity,
                });
            }
            queue.push_back(message);
            queue.len() as u64
        };
        self.stats.posted.fetch_add(1, Ordering::Relaxed);
        let mut max = self.stats.max_depth.load(Ordering::Relaxed);
        while depth > max {
            match self.stats.max_depth.compare_exchange_weak(
                max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
        Ok(())
    }

    /// Drain every queued message.
    pub fn drain(&self) -> Vec<ActorMessage> {
        let drained: Vec<ActorMessage> = self.queue.lock().drain(..).collect();
        self.stats
            .drained
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Discard every queued message (epoch re-arm).
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Whether the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of mailbox statistics.
    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            posted: self.stats.posted.load(Ordering::Relaxed),
            drained: self.stats.drained.load(Ordering::Relaxed),
            max_depth: self.stats.max_depth.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(slot: usize) -> ActorMessage {
        ActorMessage::Data {
            slot,
            tensor: TensorRef(0),
            epoch: 1,
        }
    }

    #[test]
    fn test_post_and_drain() {
        let mailbox = Mailbox::new(16);
        mailbox.post(data(0)).unwrap();
        mailbox
            .post(ActorMessage::Control {
                from: ActorId(3),
                epoch: 1,
            })
            .unwrap();

        assert_eq!(mailbox.len(), 2);
        let drained = mailbox.drain();
        assert_eq!(drained.len(), 2);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let mailbox = Mailbox::new(2);
        mailbox.post(data(0)).unwrap();
        mailbox.post(data(1)).unwrap();
        assert!(mailbox.post(data(2)).is_err());
    }

    #[test]
    fn test_stats_track_depth() {
        let mailbox = Mailbox::new(16);
        for i in 0..5 {
            mailbox.post(data(i)).unwrap();
        }
        let _ = mailbox.drain();
        let stats = mailbox.stats();
        assert_eq!(stats.posted, 5);
        assert_eq!(stats.drained, 5);
        assert_eq!(stats.max_depth, 5);
    }

    #[test]
    fn test_concurrent_posters() {
        use std::sync::Arc;

        let mailbox = Arc::new(Mailbox::new(1024));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let mb = Arc::clone(&mailbox);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    mb.post(data(i)).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mailbox.stats().posted, 400);
        assert_eq!(mailbox.len(), 400);
    }
}
