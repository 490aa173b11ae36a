//! Time-ordered timer queue of the reactor loop.
//!
//! Events are kept in a min-heap keyed by `(due, seq)` where `seq` is the
//! insertion sequence, so two events due at the same instant fire in the
//! order they were scheduled. Cancellation is lazy: cancelled ids are
//! remembered and skipped when popped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fmt;
use std::time::Instant;

use super::Loop;
use crate::AppResult;

/// What a timer callback wants done with its event once it has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reschedule {
    /// Re-insert the same callback at this instant.
    At(Instant),
    /// Drop the event for good.
    Never,
}

/// Handle of a scheduled event, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

pub type TimerCallback = Box<dyn FnMut(&mut Loop, Instant) -> AppResult<Reschedule>>;

pub struct TimerEvent {
    pub(crate) id: TimerId,
    pub(crate) due: Instant,
    seq: u64,
    pub(crate) callback: TimerCallback,
}

impl fmt::Debug for TimerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEvent")
            .field("id", &self.id)
            .field("due", &self.due)
            .field("seq", &self.seq)
            .finish()
    }
}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEvent {}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed for a min-heap: earliest due first, then first inserted
        match other.due.cmp(&self.due) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<TimerEvent>,
    cancelled: HashSet<TimerId>,
    next_id: u64,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, due: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.reinsert(id, due, callback);
        id
    }

    /// Puts a fired event back under its original id.
    pub(crate) fn reinsert(&mut self, id: TimerId, due: Instant, callback: TimerCallback) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEvent {
            id,
            due,
            seq,
            callback,
        });
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.heap.iter().any(|event| event.id == id) {
            self.cancelled.insert(id)
        } else {
            false
        }
    }

    /// Removes and returns every live event due at or before `now`, in firing order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut due = Vec::new();
        while let Some(event) = self.heap.peek() {
            if event.due > now {
                break;
            }
            if let Some(event) = self.heap.pop() {
                if self.cancelled.remove(&event.id) {
                    continue;
                }
                due.push(event);
            }
        }
        if self.heap.is_empty() {
            self.cancelled.clear();
        }
        due
    }

    /// Due time of the earliest live event.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(event) = self.heap.peek() {
            if self.cancelled.contains(&event.id) {
                let id = event.id;
                self.heap.pop();
                self.cancelled.remove(&id);
                continue;
            }
            return Some(event.due);
        }
        None
    }

    pub fn len(&self) -> usize {
        self.heap.len() - self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
