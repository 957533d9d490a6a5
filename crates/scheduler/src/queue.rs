//! In-memory admission queue.
//!
//! Mirrors the persisted `task_queue` relation in dispatch order: priority
//! descending, then enqueue time ascending, then arrival sequence. The
//! sequence counter breaks ties between tasks enqueued within the same
//! timestamp tick, so ordering is total and FIFO within a priority level.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Sort key: `Reverse(priority)` first so the BTreeMap's ascending order
/// yields highest priority at the front.
type QueueKey = (std::cmp::Reverse<i64>, DateTime<Utc>, u64);

#[derive(Debug, thiserror::Error)]
#[error("admission queue at capacity ({0})")]
pub struct QueueFull(pub usize);

#[derive(Default)]
struct Inner {
    ordered: BTreeMap<QueueKey, String>,
    by_task: HashMap<String, QueueKey>,
    seq: u64,
}

pub struct AdmissionQueue {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a pending task. Rejects once the queue is at capacity; the
    /// caller turns that into a backpressure response, never an error page.
    pub fn enqueue(
        &self,
        task_id: &str,
        priority: i64,
        enqueued_at: DateTime<Utc>,
    ) -> Result<(), QueueFull> {
        let mut inner = self.lock();
        if inner.by_task.len() >= self.capacity {
            return Err(QueueFull(self.capacity));
        }
        inner.insert(task_id, priority, enqueued_at);
        Ok(())
    }

    /// Re-add a task during crash recovery. Capacity is not checked: rows
    /// already persisted before a restart keep their place in line.
    pub fn restore(&self, task_id: &str, priority: i64, enqueued_at: DateTime<Utc>) {
        self.lock().insert(task_id, priority, enqueued_at);
    }

    /// The task next in line, without removing it.
    pub fn peek(&self) -> Option<String> {
        self.lock().ordered.values().next().cloned()
    }

    /// Remove a task wherever it sits in the queue. Returns whether it was
    /// present.
    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.by_task.remove(task_id) {
            Some(key) => {
                inner.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ordered.clear();
        inner.by_task.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn insert(&mut self, task_id: &str, priority: i64, enqueued_at: DateTime<Utc>) {
        if self.by_task.contains_key(task_id) {
            return;
        }
        self.seq += 1;
        let key = (std::cmp::Reverse(priority), enqueued_at, self.seq);
        self.ordered.insert(key, task_id.to_string());
        self.by_task.insert(task_id.to_string(), key);
    }
}
