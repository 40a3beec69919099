//! Bounded fair work queue of reactor groups
//!
//! FIFO with per-reactor deduplication: a group already resident
//! `max_per_reactor` times is not pushed again, which keeps one busy
//! reactor from starving the rest while still letting several idle workers
//! pick it up. Publishers never block; pops block until an item or a
//! shutdown sentinel arrives.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct QueueInner {
    /// `None` is the shutdown sentinel
    items: VecDeque<Option<String>>,
    counts: HashMap<String, usize>,
    closed: bool,
}

/// Work queue shared by the queuer, the poller, and the workers
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    max_per_reactor: usize,
    /// Fallback wakeup period; covers a permit lost to a racing pop
    poll_interval: Duration,
}

impl WorkQueue {
    pub fn new(capacity: usize, max_per_reactor: usize, poll_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                counts: HashMap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            max_per_reactor: max_per_reactor.max(1),
            poll_interval,
        }
    }

    /// Push a group; returns false when deduplicated, full, or closed.
    /// Never blocks.
    pub fn push(&self, group_id: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let count = inner.counts.get(group_id).copied().unwrap_or(0);
            if count >= self.max_per_reactor {
                return false;
            }
            if inner.items.len() >= self.capacity {
                tracing::warn!(group = group_id, "work queue full, dropping push");
                return false;
            }
            inner.items.push_back(Some(group_id.to_string()));
            *inner.counts.entry(group_id.to_string()).or_insert(0) += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Pop the next group; `None` means shutdown
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    match item {
                        Some(group_id) => {
                            if let Some(count) = inner.counts.get_mut(&group_id) {
                                *count -= 1;
                                if *count == 0 {
                                    inner.counts.remove(&group_id);
                                }
                            }
                            return Some(group_id);
                        }
                        None => return None,
                    }
                }
                if inner.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Close the queue and enqueue one sentinel per worker
    pub fn close(&self, sentinels: usize) {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
            for _ in 0..sentinels {
                inner.items.push_back(None);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
