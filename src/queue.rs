use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// FIFO queue shared between threads.
///
/// Every operation runs under one mutex; a condition variable signals
/// mutations so blocked poppers wake up. Emptiness is never an error:
/// callers either block, time out, or get `None` from `try_pop`.
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    changed: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            changed: Condvar::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            changed: Condvar::new(),
        }
    }

    /// Append an item and wake one waiter. Never blocks on emptiness.
    pub fn push(&self, item: T) {
        lock(&self.items).push_back(item);
        self.changed.notify_one();
    }

    /// Block until an item is available and remove it.
    pub fn pop_blocking(&self) -> T {
        let mut items = lock(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                if !items.is_empty() {
                    // Hand the wake-up on to the next waiter.
                    self.changed.notify_one();
                }
                return item;
            }
            items = self
                .changed
                .wait(items)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`pop_blocking`](Self::pop_blocking), but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = lock(&self.items);
        loop {
            if let Some(item) = items.pop_front() {
                if !items.is_empty() {
                    self.changed.notify_one();
                }
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            items = self
                .changed
                .wait_timeout(items, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        lock(&self.items).pop_front()
    }

    /// Snapshot; may be stale as soon as it returns.
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    /// Drop every queued item. Teardown only.
    pub fn clear(&self) {
        lock(&self.items).clear();
    }

    /// Remove and return every queued item in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        lock(&self.items).drain(..).collect()
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
