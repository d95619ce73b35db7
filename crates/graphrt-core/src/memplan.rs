//! Static whole-graph arena planning.
//!
//! The planner assigns byte ranges within one pre-allocated arena to every
//! tensor and workspace, reusing ranges across tensors whose lifetimes
//! (first producer to last consumer) are provably disjoint. Offsets are
//! integers into the arena, never raw pointers, so the non-aliasing invariant
//! is mechanically checkable with [`MemoryPlan::verify`].

use std::collections::HashMap;

use tracing::debug;

use crate::error::{GraphRtError, Result};
use crate::types::{NodeId, TensorKey};

/// Arena alignment applied to every placement.
pub const ARENA_ALIGN: usize = 64;

const fn align_up(value: usize, alignment: usize) -> usize {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Identity of a planned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferKey {
    /// A graph input (parameter) buffer.
    Input(usize),
    /// A node output tensor.
    Output(TensorKey),
    /// Workspace `index` of a node.
    Workspace(NodeId, usize),
}

/// A buffer the planner must place.
#[derive(Debug, Clone)]
pub struct TensorRequest {
    /// Buffer identity.
    pub key: BufferKey,
    /// Required byte size (unaligned).
    pub size: usize,
    /// Topological position where the buffer becomes live.
    pub first_use: usize,
    /// Topological position of the last consumer.
    pub last_use: usize,
    /// Excluded from aliasing: the buffer's lifetime is not bounded by the
    /// local graph (communication tensors, graph inputs/outputs).
    pub pinned: bool,
}

impl TensorRequest {
    fn overlaps_lifetime(&self, other: &TensorRequest) -> bool {
        if self.pinned || other.pinned {
            return true;
        }
        self.first_use <= other.last_use && other.first_use <= self.last_use
    }
}

/// An ordered run of buffers that must be adjacent in the arena.
#[derive(Debug, Clone)]
pub struct ContiguousGroup {
    /// Members in required order.
    pub members: Vec<BufferKey>,
}

/// Final placement of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Byte offset within the arena.
    pub offset: usize,
    /// Aligned byte size reserved for the buffer.
    pub size: usize,
}

/// The finished memory plan for one execution plan.
#[derive(Debug, Clone, Default)]
pub struct MemoryPlan {
    /// Total arena size in bytes.
    pub arena_size: usize,
    /// Placement per buffer.
    placements: HashMap<BufferKey, Placement>,
    /// Lifetime book-keeping kept for verification.
    requests: HashMap<BufferKey, TensorRequest>,
}

impl MemoryPlan {
    /// Placement of a buffer.
    pub fn placement(&self, key: &BufferKey) -> Option<Placement> {
        self.placements.get(key).copied()
    }

    /// Offset of a buffer, panicking on unknown keys (plan construction
    /// guarantees every requested buffer is placed).
    pub fn offset_of(&self, key: &BufferKey) -> usize {
        self.placements[key].offset
    }

    /// Number of placed buffers.
    pub fn len(&self) -> usize {
        self.placements.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Mechanically check the non-aliasing invariant: any two placements with
    /// overlapping byte ranges must have disjoint lifetimes.
    pub fn verify(&self) -> Result<()> {
        let entries: Vec<(&BufferKey, &Placement)> = self.placements.iter().collect();
        for (i, (key_a, pa)) in entries.iter().enumerate() {
            for (key_b, pb) in entries.iter().skip(i + 1) {
                let bytes_overlap = pa.offset < pb.offset + pb.size && pb.offset < pa.offset + pa.size;
                if !bytes_overlap {
                    continue;
                }
                let ra = &self.requests[*key_a];
                let rb = &self.requests[*key_b];
                if ra.overlaps_lifetime(rb) {
                    return Err(GraphRtError::InvalidGraph(format!(
                        "memory plan aliases live buffers {key_a:?} and {key_b:?}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Static interval-based arena planner.
#[derive(Debug, Clone, Default)]
pub struct ArenaPlanner {
    /// Optional peak-memory budget in bytes.
    pub budget: Option<usize>,
}

impl ArenaPlanner {
    /// Create a planner with no budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a planner with a peak-memory budget.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
        }
    }

    /// Plan placements for the given requests and contiguous groups.
    ///
    /// Contiguous groups are placed first as single blocks; the rest follow
    /// best-fit ordered by size descending, tie-broken by earliest lifetime
    /// start then lowest key, so plans are deterministic. Fails up front with
    /// [`GraphRtError::AllocationInfeasible`] if the arena would exceed the
    /// budget; nothing is reported lazily at launch time.
    pub fn plan(
        &self,
        requests: &[TensorRequest],
        groups: &[ContiguousGroup],
    ) -> Result<MemoryPlan> {
        let by_key: HashMap<BufferKey, &TensorRequest> =
            requests.iter().map(|r| (r.key, r)).collect();
        if by_key.len() != requests.len() {
            return Err(GraphRtError::InvalidGraph(
                "duplicate buffer key in memory plan request".to_string(),
            ));
        }

        // A buffer may belong to at most one contiguous group.
        let mut grouped: HashMap<BufferKey, usize> = HashMap::new();
        for (gi, group) in groups.iter().enumerate() {
            for key in &group.members {
                if !by_key.contains_key(key) {
                    return Err(GraphRtError::InvalidGraph(format!(
                        "contiguous group references unplanned buffer {key:?}"
                    )));
                }
                if grouped.insert(*key, gi).is_some() {
                    return Err(GraphRtError::InvalidGraph(format!(
                        "buffer {key:?} appears in two contiguous groups"
                    )));
                }
            }
        }

        // Placed blocks: (offset, size, lifetime, pinned).
        struct Block {
            offset: usize,
            size: usize,
            first_use: usize,
            last_use: usize,
            pinned: bool,
        }
        let mut blocks: Vec<Block> = Vec::new();
        let mut placements: HashMap<BufferKey, Placement> = HashMap::new();

        let conflicts = |blocks: &[Block], first: usize, last: usize, pinned: bool| {
            let mut ranges: Vec<(usize, usize)> = blocks
                .iter()
                .filter(|b| pinned || b.pinned || (b.first_use <= last && first <= b.last_use))
                .map(|b| (b.offset, b.offset + b.size))
                .collect();
            ranges.sort_unstable();
            ranges
        };

        let find_offset = |ranges: &[(usize, usize)], size: usize| {
            let mut cursor = 0usize;
            for &(start, end) in ranges {
                if start >= cursor + size {
                    break;
                }
                if end > cursor {
                    cursor = end;
                }
            }
            cursor
        };

        // Contiguous groups first: each group is one block sized as the sum
        // of its aligned members, live over the union of member lifetimes.
        for group in groups {
            let mut size = 0usize;
            let mut first = usize::MAX;
            let mut last = 0usize;
            let mut pinned = false;
            for key in &group.members {
                let r = by_key[key];
                size += align_up(r.size.max(1), ARENA_ALIGN);
                first = first.min(r.first_use);
                last = last.max(r.last_use);
                pinned |= r.pinned;
            }
            let ranges = conflicts(&blocks, first, last, pinned);
            let offset = find_offset(&ranges, size);

            let mut member_offset = offset;
            for key in &group.members {
                let r = by_key[key];
                let aligned = align_up(r.size.max(1), ARENA_ALIGN);
                placements.insert(
                    *key,
                    Placement {
                        offset: member_offset,
                        size: aligned,
                    },
                );
                member_offset += aligned;
            }
            blocks.push(Block {
                offset,
                size,
                first_use: first,
                last_use: last,
                pinned,
            });
        }

        // General pass: size descending, earliest start, lowest key.
        let mut rest: Vec<&TensorRequest> = requests
            .iter()
            .filter(|r| !grouped.contains_key(&r.key))
            .collect();
        rest.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then(a.first_use.cmp(&b.first_use))
                .then(a.key.cmp(&b.key))
        });

        for r in rest {
            let size = align_up(r.size.max(1), ARENA_ALIGN);
            let ranges = conflicts(&blocks, r.first_use, r.last_use, r.pinned);
            let offset = find_offset(&ranges, size);
            placements.insert(r.key, Placement { offset, size });
            blocks.push(Block {
                offset,
                size,
                first_use: r.first_use,
                last_use: r.last_use,
                pinned: r.pinned,
            });
        }

        let arena_size = placements
            .values()
            .map(|p| p.offset + p.size)
            .max()
            .unwrap_or(0);

        if let Some(budget) = self.budget {
            if arena_size > budget {
                return Err(GraphRtError::AllocationInfeasible {
                    peak_bytes: arena_size,
                    budget_bytes: budget,
                });
            }
        }

        debug!(
            buffers = placements.len(),
            groups = groups.len(),
            arena_size,
            "memory plan built"
        );

        Ok(MemoryPlan {
            arena_size,
            placements,
            requests: requests.iter().map(|r| (r.key, r.clone())).collect(),
        })
    }
}
