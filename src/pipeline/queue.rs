//! Thread-safe FIFO queue linking two pipeline stages.
//!
//! A queue can be *stopped*: pushes fail fast, blocked consumers wake up, and
//! once the remaining items have been drained every pop reports closure.
//! [`ThreadsafeQueue::resume`] reopens it.
//!
//! The queue length is exposed for diagnostics only. Callers must not poll
//! `len()` and act on the result; use the pop calls' return values instead.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Returned by [`ThreadsafeQueue::push`] when the queue has been stopped.
/// Carries the rejected item back to the caller.
pub struct QueueClosed<T>(pub T);

impl<T> QueueClosed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed(..)")
    }
}

/// Why a non-blocking or timed pop returned without an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryPopError {
    /// Nothing queued right now.
    Empty,
    /// Stopped and drained.
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
}

/// Blocking multi-producer queue with a stop signal.
pub struct ThreadsafeQueue<T> {
    name: String,
    capacity: Option<usize>,
    inner: Mutex<Inner<T>>,
    /// Signalled when an item is pushed or the queue is stopped.
    not_empty: Condvar,
    /// Signalled when an item is popped or the queue is stopped.
    not_full: Condvar,
}

impl<T> ThreadsafeQueue<T> {
    /// Create an unbounded queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, None)
    }

    /// Create a queue holding at most `capacity` items; pushes wait for space.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_capacity(name, Some(capacity.max(1)))
    }

    pub fn with_capacity(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stopped: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Insert an item and wake one waiting consumer.
    ///
    /// On a bounded queue this waits for space. Once the queue is stopped the
    /// call returns immediately with the item handed back.
    pub fn push(&self, item: T) -> Result<(), QueueClosed<T>> {
        let mut inner = self.inner.lock();
        if let Some(capacity) = self.capacity {
            while !inner.stopped && inner.items.len() >= capacity {
                self.not_full.wait(&mut inner);
            }
        }
        if inner.stopped {
            return Err(QueueClosed(item));
        }
        inner.items.push_back(item);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, waiting until one is available.
    ///
    /// Returns `None` only when the queue is stopped and empty.
    pub fn pop_blocking(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.stopped {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Like [`pop_blocking`](Self::pop_blocking) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, TryPopError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(item);
            }
            if inner.stopped {
                return Err(TryPopError::Closed);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                return match inner.items.pop_front() {
                    Some(item) => {
                        drop(inner);
                        self.not_full.notify_one();
                        Ok(item)
                    }
                    None if inner.stopped => Err(TryPopError::Closed),
                    None => Err(TryPopError::Empty),
                };
            }
        }
    }

    /// Remove the oldest item if there is one.
    pub fn pop_non_blocking(&self) -> Result<T, TryPopError> {
        let mut inner = self.inner.lock();
        match inner.items.pop_front() {
            Some(item) => {
                drop(inner);
                self.not_full.notify_one();
                Ok(item)
            }
            None if inner.stopped => Err(TryPopError::Closed),
            None => Err(TryPopError::Empty),
        }
    }

    /// Mark the queue closed and wake every waiter.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if !inner.stopped {
            inner.stopped = true;
            tracing::debug!("Queue '{}' stopped with {} items", self.name, inner.items.len());
        }
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Clear the closed flag so the queue can be used again.
    pub fn resume(&self) {
        self.inner.lock().stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Drop every queued item, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.items.len();
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        removed
    }

    /// Number of queued items. Diagnostic only.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

impl<T> fmt::Debug for ThreadsafeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadsafeQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Type-erased stop/resume handle so the orchestrator can close every queue
/// regardless of item type.
pub trait StopHandle: Send + Sync {
    fn queue_name(&self) -> &str;
    fn stop(&self);
    fn resume(&self);
    fn is_empty(&self) -> bool;
}

impl<T: Send> StopHandle for ThreadsafeQueue<T> {
    fn queue_name(&self) -> &str {
        self.name()
    }

    fn stop(&self) {
        ThreadsafeQueue::stop(self)
    }

    fn resume(&self) {
        ThreadsafeQueue::resume(self)
    }

    fn is_empty(&self) -> bool {
        ThreadsafeQueue::is_empty(self)
    }
}
