//! In-process priority queue of task ids.
//!
//! Entries are keyed by the inverted score `100 - priority`, so the lowest
//! score dequeues first. Equal scores dequeue in enqueue order.
//!
//! # Duplicates
//!
//! Each id is live at most once. Enqueueing a live id with the same score is
//! a no-op; with a different score the id is re-keyed. Superseded heap
//! entries stay in the heap and are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use ordered_float::OrderedFloat;
use tracing::debug;

use crate::task::clamp_priority;

/// Stale entries tolerated before the heap is compacted.
const COMPACTION_SLACK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    score: OrderedFloat<f64>,
    sequence: u64,
    task_id: String,
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: invert so the lowest score, then the
    // earliest sequence, sits on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .cmp(&self.score)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    /// Live key per queued id: (score, sequence).
    live: HashMap<String, (OrderedFloat<f64>, u64)>,
    next_sequence: u64,
}

impl QueueState {
    fn is_live(&self, entry: &QueueEntry) -> bool {
        self.live.get(&entry.task_id) == Some(&(entry.score, entry.sequence))
    }

    /// Make `(score, next sequence)` the live key of `task_id`.
    fn push(&mut self, task_id: &str, score: OrderedFloat<f64>) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.live.insert(task_id.to_string(), (score, sequence));
        self.heap.push(QueueEntry {
            score,
            sequence,
            task_id: task_id.to_string(),
        });
        self.compact_if_needed();
    }

    fn compact_if_needed(&mut self) {
        if self.heap.len() > self.live.len() * 2 + COMPACTION_SLACK {
            let live = &self.live;
            self.heap
                .retain(|e| live.get(&e.task_id) == Some(&(e.score, e.sequence)));
        }
    }
}

fn score_of(priority: f64) -> OrderedFloat<f64> {
    OrderedFloat(100.0 - clamp_priority(priority))
}

/// Thread-safe priority queue; higher priority dequeues first.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task_id` at `priority` (clamped to `[0, 100]`).
    ///
    /// Returns false when the id was already queued at the same score.
    pub fn enqueue(&self, task_id: &str, priority: f64) -> bool {
        let score = score_of(priority);
        let mut state = self.state.lock().expect("queue lock poisoned");

        if let Some((live_score, _)) = state.live.get(task_id) {
            if *live_score == score {
                return false;
            }
            debug!(task_id, priority, "Re-keying queued task");
        }
        state.push(task_id, score);
        true
    }

    /// Queue `task_id` only if it is not queued already; a queued id keeps
    /// its current key. Returns whether it was added.
    pub fn enqueue_if_absent(&self, task_id: &str, priority: f64) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.live.contains_key(task_id) {
            return false;
        }
        state.push(task_id, score_of(priority));
        true
    }

    /// Re-key `task_id` at `priority` only if it is queued. Returns whether
    /// its key changed.
    pub fn rekey(&self, task_id: &str, priority: f64) -> bool {
        let score = score_of(priority);
        let mut state = self.state.lock().expect("queue lock poisoned");
        match state.live.get(task_id) {
            Some((live_score, _)) if *live_score != score => {
                state.push(task_id, score);
                true
            }
            _ => false,
        }
    }

    /// Pop the highest-priority live id.
    pub fn dequeue(&self) -> Option<String> {
        let mut state = self.state.lock().expect("queue lock poisoned");
        while let Some(entry) = state.heap.pop() {
            if state.is_live(&entry) {
                state.live.remove(&entry.task_id);
                return Some(entry.task_id);
            }
        }
        None
    }

    /// Drop `task_id` from the queue. Returns whether it was queued.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let removed = state.live.remove(task_id).is_some();
        if removed {
            state.compact_if_needed();
        }
        removed
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .live
            .contains_key(task_id)
    }

    /// Priority `task_id` is queued at, if queued.
    pub fn queued_priority(&self, task_id: &str) -> Option<f64> {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .live
            .get(task_id)
            .map(|(score, _)| 100.0 - score.into_inner())
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.heap.clear();
        state.live.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.dequeue()).collect()
    }

    #[test]
    fn test_equal_priorities_dequeue_in_enqueue_order() {
        let queue = TaskQueue::new();
        queue.enqueue("A", 90.0);
        queue.enqueue("B", 50.0);
        queue.enqueue("C", 90.0);
        assert_eq!(drain(&queue), vec!["A", "C", "B"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_enqueue_same_priority_is_noop() {
        let queue = TaskQueue::new();
        assert!(queue.enqueue("A", 40.0));
        assert!(queue.enqueue("B", 40.0));
        assert!(!queue.enqueue("A", 40.0));
        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&queue), vec!["A", "B"]);
    }

    #[test]
    fn test_re_key_moves_entry() {
        let queue = TaskQueue::new();
        queue.enqueue("A", 10.0);
        queue.enqueue("B", 50.0);
        assert!(queue.enqueue("A", 80.0));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_priority("A"), Some(80.0));
        assert_eq!(drain(&queue), vec!["A", "B"]);
    }

    #[test]
    fn test_priority_is_clamped() {
        let queue = TaskQueue::new();
        queue.enqueue("low", -20.0);
        queue.enqueue("high", 250.0);
        assert_eq!(queue.queued_priority("high"), Some(100.0));
        assert_eq!(queue.queued_priority("low"), Some(0.0));
        assert_eq!(queue.dequeue().as_deref(), Some("high"));
    }

    #[test]
    fn test_remove_skips_stale_entry() {
        let queue = TaskQueue::new();
        queue.enqueue("A", 90.0);
        queue.enqueue("B", 10.0);
        assert!(queue.remove("A"));
        assert!(!queue.remove("A"));
        assert!(!queue.contains("A"));
        assert_eq!(drain(&queue), vec!["B"]);
    }

    #[test]
    fn test_conditional_inserts_respect_membership() {
        let queue = TaskQueue::new();
        assert!(!queue.rekey("A", 70.0));
        assert!(!queue.contains("A"));

        assert!(queue.enqueue_if_absent("A", 10.0));
        assert!(!queue.enqueue_if_absent("A", 90.0));
        assert_eq!(queue.queued_priority("A"), Some(10.0));

        assert!(queue.rekey("A", 70.0));
        assert!(!queue.rekey("A", 70.0));
        assert_eq!(queue.queued_priority("A"), Some(70.0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_compaction_keeps_live_entries() {
        let queue = TaskQueue::new();
        for i in 0..500 {
            queue.enqueue("churn", (i % 100) as f64);
        }
        queue.enqueue("steady", 1.0);
        assert_eq!(queue.len(), 2);
        assert_eq!(drain(&queue).len(), 2);
    }
}
