//! Deferred continuations: staggered lookups fired from `tick`, cancellable by epoch.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::identity::NodeId;
use crate::protocol::PeerRecord;

/// Work to run later on the dispatch thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deferred {
    /// Send `query_closest` for `target` to `peer`.
    QueryClosest {
        peer: PeerRecord,
        target: NodeId,
        budget: u8,
        /// Skip if `peer` no longer improves the slot for `target` when fired.
        require_improvement: bool,
    },
}

#[derive(Debug)]
struct Slot {
    epoch: u64,
    task: Deferred,
}

/// Min-heap of continuations ordered by due time, then insertion order.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BinaryHeap<Reverse<(u64, u64)>>,
    tasks: HashMap<u64, Slot>,
    next_seq: u64,
    epoch: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to fire at `due` (milliseconds, host clock).
    pub fn schedule(&mut self, due: u64, task: Deferred) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Reverse((due, seq)));
        self.tasks.insert(
            seq,
            Slot {
                epoch: self.epoch,
                task,
            },
        );
    }

    /// Remove and return every task due at or before `now`, in order.
    /// Tasks from an older epoch are discarded.
    pub fn pop_due(&mut self, now: u64) -> Vec<Deferred> {
        let mut out = Vec::new();
        while let Some(Reverse((due, seq))) = self.queue.peek().copied() {
            if due > now {
                break;
            }
            self.queue.pop();
            if let Some(slot) = self.tasks.remove(&seq) {
                if slot.epoch == self.epoch {
                    out.push(slot.task);
                }
            }
        }
        out
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse((due, _))| *due)
    }

    /// Drop everything pending and start a new epoch. Returns how many were dropped.
    pub fn cancel_all(&mut self) -> usize {
        let dropped = self.tasks.len();
        self.queue.clear();
        self.tasks.clear();
        self.epoch += 1;
        dropped
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
