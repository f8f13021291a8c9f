use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::sync::Notify;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// Overflow is logged once per this many evictions.
const DROP_LOG_INTERVAL: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCmd<T> {
    Data(T),
    /// Producer is done; the consumer should stop after this.
    Eof,
}

/// Fixed-capacity hand-off between two pipeline stages.
///
/// `put` never blocks: when the queue is full the oldest element is evicted, which keeps
/// end-to-end latency bounded under overload. `get` waits up to a timeout so the consumer
/// can check its stop flag between waits. `put` may be called from a blocking thread while
/// `get` runs on the async runtime.
pub struct BoundedFrameQueue<T> {
    items: Mutex<VecDeque<QueueCmd<T>>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

impl<T> BoundedFrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `item`, returning the element evicted to make room, if any.
    pub fn put(&self, item: T) -> Option<T> {
        match self.push(QueueCmd::Data(item)) {
            Some(QueueCmd::Data(evicted)) => Some(evicted),
            _ => None,
        }
    }

    /// Enqueues the end-of-stream marker. A full queue evicts its oldest frame for it.
    pub fn put_eof(&self) {
        self.push(QueueCmd::Eof);
    }

    fn push(&self, cmd: QueueCmd<T>) -> Option<QueueCmd<T>> {
        let evicted = {
            let mut items = self.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(cmd);
            evicted
        };
        if evicted.is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % DROP_LOG_INTERVAL == 1 {
                log::debug!(
                    "frame queue full (capacity {}), dropped {} items so far",
                    self.capacity,
                    dropped
                );
            }
        }
        self.ready.notify_one();
        evicted
    }

    /// Waits up to `timeout` for an element. `None` means the wait timed out.
    pub async fn get(&self, timeout: Duration) -> Option<QueueCmd<T>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if let Some(cmd) = self.try_get() {
                return Some(cmd);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_get();
            }
        }
    }

    pub fn try_get(&self) -> Option<QueueCmd<T>> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total evictions since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueCmd<T>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
