//! Deadline queue driven by the connection event loop.
//!
//! Timers carry a plain value instead of a callback: the loop pops the
//! values that are due and dispatches them itself. Cancelling is O(1);
//! cancelled entries are skipped lazily when they reach the top.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Handle returned by [`TimerQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Fire `value` at `at`.
    pub fn schedule_at(&mut self, at: Instant, value: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        self.pending.insert(id, value);
        TimerId(id)
    }

    /// Fire `value` after `delay`.
    pub fn schedule(&mut self, now: Instant, delay: Duration, value: T) -> TimerId {
        self.schedule_at(now + delay, value)
    }

    /// Returns the value if the timer had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        self.pending.remove(&id.0)
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains_key(&id.0)
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if self.pending.contains_key(&id) {
                return Some(at);
            }
            self.heap.pop();
        }
        None
    }

    /// Remove and return the next value due at `now`, earliest first.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T)> {
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if at > now {
                return None;
            }
            self.heap.pop();
            if let Some(value) = self.pending.remove(&id) {
                return Some((TimerId(id), value));
            }
        }
        None
    }

    /// Live timers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ── Tests ────────────────────────────────────────────────────────
