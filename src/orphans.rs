//! Orphan collectors for background tasks.
//!
//! An orphan collector lets a task run children in the background and
//! retrieve them non-blockingly as they settle, without weakening the
//! no-orphans rule: every promise attached to a collector still counts as
//! a child of its spawner, and a spawner terminating with unretrieved
//! entries raises the still-has-children fatal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::record::Promise;

/// Result of a [`care`](crate::Ctx::care) probe.
pub enum Care<T> {
    /// A background task settled; the promise must now be awaited.
    Task(Promise<T>),
    /// Tasks are still running but none has settled yet.
    NotYet,
    /// No settled entry and no running task remain.
    Empty,
}

impl<T> core::fmt::Debug for Care<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Task(promise) => f.debug_tuple("Task").field(&promise.uid()).finish(),
            Self::NotYet => f.write_str("NotYet"),
            Self::Empty => f.write_str("Empty"),
        }
    }
}

struct OrphansInner<T> {
    settled: Mutex<VecDeque<Promise<T>>>,
    active: AtomicUsize,
}

/// A FIFO of settled-but-unretrieved background promises.
pub struct Orphans<T> {
    inner: Arc<OrphansInner<T>>,
}

impl<T> Clone for Orphans<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Orphans<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Orphans<T> {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OrphansInner {
                settled: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
            }),
        }
    }
}

impl<T: Send + 'static> Orphans<T> {
    /// Attaches a freshly spawned promise. When it turns terminal it
    /// enqueues itself for retrieval.
    pub(crate) fn attach(&self, promise: Promise<T>) {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.inner);
        let enqueued = promise.clone();
        let core = Arc::clone(promise.core());
        core.set_collector(Box::new(move || {
            inner.settled.lock().push_back(enqueued);
            inner.active.fetch_sub(1, Ordering::AcqRel);
        }));
        // A parallel task may have settled before the hook was installed;
        // run it here in that case. The hook is taken under the collector
        // lock, so it still runs exactly once.
        if core.is_terminal() {
            if let Some(hook) = core.take_collector() {
                hook();
            }
        }
    }

    pub(crate) fn pop(&self) -> Care<T> {
        if let Some(promise) = self.inner.settled.lock().pop_front() {
            return Care::Task(promise);
        }
        if self.inner.active.load(Ordering::Acquire) > 0 {
            Care::NotYet
        } else {
            Care::Empty
        }
    }
}

impl<T> core::fmt::Debug for Orphans<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Orphans")
            .field("settled", &self.inner.settled.lock().len())
            .field("active", &self.inner.active.load(Ordering::Acquire))
            .finish()
    }
}
