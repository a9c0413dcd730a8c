//! Bounded per-sink batch queue with a configurable overflow policy.
//!
//! Grounded on the teacher's `TaskScheduler::handle_task_result` in
//! `agent/src/scheduler.rs`, which on buffer overflow trims a shared results
//! buffer down to its newest half rather than blocking the producer. Here
//! that behavior becomes one named policy (`EvictOldest`) alongside the
//! simpler `DropNewest`, chosen per sink at `register` time.

use shared::metrics::Metric;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the incoming batch, keep what's queued.
    DropNewest,
    /// Make room by discarding the oldest queued batches first.
    EvictOldest,
}

pub struct SinkQueue {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    batches: VecDeque<Vec<Metric>>,
    closed: bool,
}

impl SinkQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            inner: Mutex::new(Inner {
                batches: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue a batch. Returns `false` if the batch was dropped under
    /// `DropNewest` because the queue was full; `EvictOldest` always accepts
    /// the new batch (by discarding old ones) and returns `true`.
    pub fn push(&self, batch: Vec<Metric>) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                false
            } else if inner.batches.len() < self.capacity {
                inner.batches.push_back(batch);
                true
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => false,
                    OverflowPolicy::EvictOldest => {
                        // Trim to roughly half capacity before admitting the
                        // new batch, same "keep the newest half" shape as
                        // the teacher's emergency trim.
                        let keep = (self.capacity / 2).max(1);
                        while inner.batches.len() >= keep {
                            inner.batches.pop_front();
                        }
                        inner.batches.push_back(batch);
                        true
                    }
                }
            }
        };
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    /// Waits for a batch to become available, or returns `None` once the
    /// queue has been closed and drained.
    pub async fn pop(&self) -> Option<Vec<Metric>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(batch) = inner.batches.pop_front() {
                    return Some(batch);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().batches.len()
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<Metric> {
        vec![Metric::gauge("x", 1.0, 0)]
    }

    #[test]
    fn drop_newest_rejects_when_full() {
        let q = SinkQueue::new(2, OverflowPolicy::DropNewest);
        assert!(q.push(batch()));
        assert!(q.push(batch()));
        assert!(!q.push(batch()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn evict_oldest_trims_to_half_before_admitting() {
        let q = SinkQueue::new(4, OverflowPolicy::EvictOldest);
        for _ in 0..4 {
            assert!(q.push(batch()));
        }
        assert_eq!(q.len(), 4);
        assert!(q.push(batch()));
        assert!(q.len() < 4);
    }

    #[tokio::test]
    async fn pop_returns_none_after_close_and_drain() {
        let q = SinkQueue::new(4, OverflowPolicy::DropNewest);
        q.push(batch());
        q.close();
        assert!(q.pop().await.is_some());
        assert!(q.pop().await.is_none());
    }
}
