// Copyright 2018 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A bounded-wake priority queue backing asynchronous load requests.
//! Workers wait on a condition variable with a periodic wake rather than
//! blocking indefinitely, so a worker pool shrink or shutdown request is
//! noticed promptly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::key::Priority;

/// A single pending asynchronous load, ordered by priority and then by
/// arrival order among equal priorities (FIFO tiebreak).
pub struct LoadRequest<K> {
    pub key: K,
    pub priority: Priority,
    seq: u64,
}

impl<K> LoadRequest<K> {
    pub fn new(key: K, priority: Priority, seq: u64) -> Self {
        LoadRequest { key, priority, seq }
    }
}

impl<K> PartialEq for LoadRequest<K> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl<K> Eq for LoadRequest<K> {}

impl<K> PartialOrd for LoadRequest<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for LoadRequest<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: higher priority must compare greater,
        // and among ties the earlier (lower) sequence number must compare
        // greater so it is popped first (FIFO).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A monotonically increasing sequence-number source for [`LoadRequest`]
/// tiebreaks, kept separate from [`crate::graph::CoordinatedGraph::tick`]
/// since it has nothing to do with last-access ordering.
#[derive(Default)]
pub struct SequenceSource(AtomicU64);

impl SequenceSource {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, AtomicOrdering::Relaxed)
    }
}

struct Inner<T: Ord> {
    heap: BinaryHeap<T>,
    closed: bool,
}

/// A thread-safe max-priority queue. `pop` blocks using a condition
/// variable woken on push/close, plus a bounded periodic wake so that a
/// pool shrink (worker exits between polls rather than being interrupted
/// mid-wait) is observed within one `poll_interval`.
pub struct PriorityQueue<T: Ord> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord> PriorityQueue<T> {
    pub fn new() -> Self {
        PriorityQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.heap.push(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available, the queue is closed and drained,
    /// waking at least every `poll_interval` to re-check both conditions.
    /// Returns `None` only once closed with nothing left to pop.
    pub fn pop(&self, poll_interval: Duration) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.heap.pop() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let _ = self.not_empty.wait_for(&mut inner, poll_interval);
        }
    }

    /// Non-blocking pop, used by callers (e.g. tests) that don't want to
    /// wait on an empty queue.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().heap.pop()
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_pops_first() {
        let q: PriorityQueue<LoadRequest<&str>> = PriorityQueue::new();
        let seq = SequenceSource::default();
        q.push(LoadRequest::new("low", Priority::Low, seq.next()));
        q.push(LoadRequest::new("high", Priority::High, seq.next()));
        q.push(LoadRequest::new("normal", Priority::Normal, seq.next()));
        assert_eq!(q.try_pop().unwrap().key, "high");
        assert_eq!(q.try_pop().unwrap().key, "normal");
        assert_eq!(q.try_pop().unwrap().key, "low");
    }

    #[test]
    fn equal_priority_is_fifo() {
        let q: PriorityQueue<LoadRequest<&str>> = PriorityQueue::new();
        let seq = SequenceSource::default();
        q.push(LoadRequest::new("first", Priority::Normal, seq.next()));
        q.push(LoadRequest::new("second", Priority::Normal, seq.next()));
        q.push(LoadRequest::new("third", Priority::Normal, seq.next()));
        assert_eq!(q.try_pop().unwrap().key, "first");
        assert_eq!(q.try_pop().unwrap().key, "second");
        assert_eq!(q.try_pop().unwrap().key, "third");
    }

    #[test]
    fn pop_blocks_then_wakes_on_push() {
        use std::sync::Arc;
        let q: Arc<PriorityQueue<LoadRequest<&str>>> = Arc::new(PriorityQueue::new());
        let q2 = q.clone();
        let worker = std::thread::spawn(move || q2.pop(Duration::from_millis(20)));
        std::thread::sleep(Duration::from_millis(10));
        q.push(LoadRequest::new("late", Priority::Normal, 0));
        let got = worker.join().unwrap();
        assert_eq!(got.unwrap().key, "late");
    }

    #[test]
    fn closed_empty_queue_returns_none() {
        let q: PriorityQueue<LoadRequest<&str>> = PriorityQueue::new();
        q.close();
        assert_eq!(q.pop(Duration::from_millis(10)).map(|r| r.key), None);
    }
}
