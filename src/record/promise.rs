//! Promise records and the parent/child graph.
//!
//! A promise is split in two:
//!
//! - [`PromiseCore`]: the untyped, shareable part. It carries the phase
//!   cell, the parent link, the child set and the waiter list, and is the
//!   only promise state other domains ever touch (always through atomics or
//!   short critical sections).
//! - [`PromiseInner`]: the typed result slot, written by the owning domain
//!   and read by the parent when it consumes the result.
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> Settling -> Terminal             (normal / failed)
//! Pending -> CancelRequested -> Settling -> Terminal
//! ```
//!
//! Settling is the join point: a promise stays there until every child is
//! terminal. Cancellation wins retroactively; processing a cancel replaces
//! an unconsumed resolved or failed result with *cancelled*.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

use parking_lot::Mutex;

use crate::error::Failure;
use crate::runtime::shared::DomainShared;
use crate::types::{DomainUid, Outcome, TaskUid};

/// Coarse promise lifecycle phase, readable from any domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Phase {
    Pending = 0,
    CancelRequested = 1,
    Settling = 2,
    Terminal = 3,
}

struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(Phase::Pending as u8))
    }

    fn load(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            0 => Phase::Pending,
            1 => Phase::CancelRequested,
            2 => Phase::Settling,
            _ => Phase::Terminal,
        }
    }

    fn store(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    fn compare_exchange(&self, from: Phase, to: Phase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Which kind of result the slot holds, readable without the typed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ResultKind {
    Unset = 0,
    Resolved = 1,
    Failed = 2,
    Cancelled = 3,
}

/// The untyped, cross-domain half of a promise.
pub(crate) struct PromiseCore {
    uid: TaskUid,
    domain: DomainUid,
    parent: Option<Weak<PromiseCore>>,
    phase: PhaseCell,
    kind: AtomicU8,
    consumed: AtomicBool,
    children: Mutex<Vec<Arc<PromiseCore>>>,
    waiters: Mutex<Vec<Waker>>,
    collector: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    home: Arc<DomainShared>,
}

impl PromiseCore {
    /// Creates the root promise of a run. The root has no parent.
    pub(crate) fn root(uid: TaskUid, domain: DomainUid, home: Arc<DomainShared>) -> Arc<Self> {
        Arc::new(Self {
            uid,
            domain,
            parent: None,
            phase: PhaseCell::new(),
            kind: AtomicU8::new(ResultKind::Unset as u8),
            consumed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            collector: Mutex::new(None),
            home,
        })
    }

    /// Creates a child promise under `parent`.
    pub(crate) fn child(
        uid: TaskUid,
        domain: DomainUid,
        parent: &Arc<PromiseCore>,
        home: Arc<DomainShared>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            domain,
            parent: Some(Arc::downgrade(parent)),
            phase: PhaseCell::new(),
            kind: AtomicU8::new(ResultKind::Unset as u8),
            consumed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
            waiters: Mutex::new(Vec::new()),
            collector: Mutex::new(None),
            home,
        })
    }

    pub(crate) fn uid(&self) -> TaskUid {
        self.uid
    }

    pub(crate) fn domain(&self) -> DomainUid {
        self.domain
    }

    pub(crate) fn home(&self) -> &Arc<DomainShared> {
        &self.home
    }

    pub(crate) fn parent(&self) -> Option<Arc<PromiseCore>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase.load()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.phase.load() == Phase::Terminal
    }

    pub(crate) fn kind(&self) -> ResultKind {
        match self.kind.load(Ordering::Acquire) {
            0 => ResultKind::Unset,
            1 => ResultKind::Resolved,
            2 => ResultKind::Failed,
            _ => ResultKind::Cancelled,
        }
    }

    pub(crate) fn set_kind(&self, kind: ResultKind) {
        self.kind.store(kind as u8, Ordering::Release);
    }

    pub(crate) fn mark_consumed(&self) {
        self.consumed.store(true, Ordering::Release);
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    pub(crate) fn add_child(&self, child: Arc<PromiseCore>) {
        self.children.lock().push(child);
    }

    /// Removes a consumed child from the child set.
    pub(crate) fn remove_child(&self, child: &Arc<PromiseCore>) {
        self.children.lock().retain(|c| !Arc::ptr_eq(c, child));
    }

    pub(crate) fn children_empty(&self) -> bool {
        self.children.lock().is_empty()
    }

    pub(crate) fn children_snapshot(&self) -> Vec<Arc<PromiseCore>> {
        self.children.lock().clone()
    }

    /// Installs the orphan-collector hook, run once when the promise turns
    /// terminal.
    pub(crate) fn set_collector(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.collector.lock() = Some(hook);
    }

    /// Removes the collector hook, if still installed.
    pub(crate) fn take_collector(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.collector.lock().take()
    }

    /// Registers a waker to be notified when the promise turns terminal.
    ///
    /// Callers must re-check the phase after registering; a concurrent
    /// settlement may already have drained the waiter list.
    pub(crate) fn push_waiter(&self, waker: Waker) {
        self.waiters.lock().push(waker);
    }

    fn wake_waiters(&self) {
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for waker in waiters {
            waker.wake();
        }
    }

    /// Marks the promise cancel-requested. Returns true if the mark was
    /// newly set; a promise already settling or terminal is left alone.
    pub(crate) fn request_cancel(&self) -> bool {
        self.phase.compare_exchange(Phase::Pending, Phase::CancelRequested)
    }

    /// Claims the settlement epilogue for the task shell. Fails when a
    /// cancel request arrived first; the cancel engine then owns teardown.
    pub(crate) fn try_begin_settle(&self) -> bool {
        self.phase.compare_exchange(Phase::Pending, Phase::Settling)
    }

    /// Forces the promise into settling from the cancel path. A promise
    /// that already turned terminal keeps its phase.
    pub(crate) fn begin_settle(&self) {
        if self.phase.load() != Phase::Terminal {
            self.phase.store(Phase::Settling);
        }
    }

    /// Completes settlement once every child is terminal.
    ///
    /// Safe to call from any domain and at any time; only the caller that
    /// wins the settling-to-terminal transition runs the side effects
    /// (waiter wakeup, collector hook, parent notification).
    pub(crate) fn settle_if_drained(self: &Arc<Self>) {
        if self.phase.load() != Phase::Settling {
            return;
        }
        {
            let children = self.children.lock();
            if !children.iter().all(|c| c.is_terminal()) {
                return;
            }
        }
        if !self.phase.compare_exchange(Phase::Settling, Phase::Terminal) {
            return;
        }
        self.children.lock().clear();
        self.wake_waiters();
        if let Some(hook) = self.collector.lock().take() {
            hook();
        }
        if let Some(parent) = self.parent() {
            parent.settle_if_drained();
        }
        self.home.wake_owner();
    }
}

impl core::fmt::Debug for PromiseCore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PromiseCore")
            .field("uid", &self.uid)
            .field("domain", &self.domain)
            .field("phase", &self.phase.load())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Typed result slot contents.
pub(crate) enum Slot<T> {
    Pending,
    Resolved(T),
    Failed(Failure),
    Cancelled,
    Consumed,
}

/// Outcome of a retroactive cancel applied to a result slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotCancel {
    /// The slot now reads cancelled (it was pending, resolved or failed).
    Overridden,
    /// The slot was already cancelled.
    AlreadyCancelled,
    /// The result had been consumed by the parent before the cancel was
    /// processed; nothing to override.
    Consumed,
}

/// The typed half of a promise, shared between the handle and the shell.
pub(crate) struct PromiseInner<T> {
    pub(crate) core: Arc<PromiseCore>,
    slot: Mutex<Slot<T>>,
}

impl<T> PromiseInner<T> {
    pub(crate) fn new(core: Arc<PromiseCore>) -> Self {
        Self {
            core,
            slot: Mutex::new(Slot::Pending),
        }
    }

    pub(crate) fn resolve(&self, value: T) {
        *self.slot.lock() = Slot::Resolved(value);
        self.core.set_kind(ResultKind::Resolved);
    }

    pub(crate) fn fail(&self, failure: Failure) {
        *self.slot.lock() = Slot::Failed(failure);
        self.core.set_kind(ResultKind::Failed);
    }

    /// Takes the terminal outcome out of the slot, leaving it consumed.
    /// Returns `None` while the slot is pending, and also when the result
    /// was consumed before (the caller treats that as a structure
    /// violation).
    pub(crate) fn take(&self) -> Option<Outcome<T>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Consumed) {
            Slot::Pending => {
                *slot = Slot::Pending;
                None
            }
            Slot::Consumed => None,
            Slot::Resolved(v) => Some(Outcome::Resolved(v)),
            Slot::Failed(e) => Some(Outcome::Failed(e)),
            Slot::Cancelled => Some(Outcome::Cancelled),
        }
    }

    /// Applies a retroactive cancel to the slot.
    pub(crate) fn cancel_override(&self) -> SlotCancel {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Consumed => SlotCancel::Consumed,
            Slot::Cancelled => SlotCancel::AlreadyCancelled,
            Slot::Pending | Slot::Resolved(_) | Slot::Failed(_) => {
                *slot = Slot::Cancelled;
                self.core.set_kind(ResultKind::Cancelled);
                SlotCancel::Overridden
            }
        }
    }
}

/// Builds the type-erased retroactive-cancel hook kept in the task record.
pub(crate) fn make_cancel_slot<T: 'static>(
    inner: &Arc<PromiseInner<T>>,
) -> Box<dyn Fn() -> SlotCancel> {
    let inner = Arc::clone(inner);
    Box::new(move || inner.cancel_override())
}

/// Same as [`make_cancel_slot`] but shippable to another domain.
pub(crate) fn make_cancel_slot_send<T: Send + 'static>(
    inner: &Arc<PromiseInner<T>>,
) -> Box<dyn Fn() -> SlotCancel + Send> {
    let inner = Arc::clone(inner);
    Box::new(move || inner.cancel_override())
}

/// The public handle of a task's lifecycle and result.
///
/// A promise is owned by the task that created it: only the creator may
/// await or cancel it. Handles are cheap to clone and may cross domain
/// boundaries (the typed result requires `T: Send` for that).
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Promise<T> {
    pub(crate) fn from_inner(inner: Arc<PromiseInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<PromiseInner<T>> {
        &self.inner
    }

    pub(crate) fn core(&self) -> &Arc<PromiseCore> {
        &self.inner.core
    }

    /// Returns the task identifier, unique within its hosting domain.
    #[must_use]
    pub fn uid(&self) -> TaskUid {
        self.inner.core.uid()
    }

    /// Returns the domain hosting the task.
    #[must_use]
    pub fn domain(&self) -> DomainUid {
        self.inner.core.domain()
    }
}

impl<T> core::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Promise")
            .field("uid", &self.uid())
            .field("domain", &self.domain())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> Arc<PromiseCore> {
        let home = DomainShared::new(DomainUid::MAIN);
        PromiseCore::root(home.alloc_task_uid(), DomainUid::MAIN, home)
    }

    #[test]
    fn cancel_overrides_an_unconsumed_result() {
        let inner = PromiseInner::new(core());
        inner.resolve(5);
        assert_eq!(inner.cancel_override(), SlotCancel::Overridden);
        assert!(matches!(inner.take(), Some(Outcome::Cancelled)));
        assert_eq!(inner.core.kind(), ResultKind::Cancelled);
    }

    #[test]
    fn cancel_after_consumption_reports_consumed() {
        let inner = PromiseInner::new(core());
        inner.resolve(5);
        assert!(matches!(inner.take(), Some(Outcome::Resolved(5))));
        assert_eq!(inner.cancel_override(), SlotCancel::Consumed);
        assert!(inner.take().is_none());
    }

    #[test]
    fn settlement_waits_for_children() {
        let parent = core();
        let child = PromiseCore::child(
            TaskUid::new(2),
            DomainUid::MAIN,
            &parent,
            Arc::clone(parent.home()),
        );
        parent.add_child(Arc::clone(&child));
        assert!(parent.try_begin_settle());
        parent.settle_if_drained();
        assert!(!parent.is_terminal());

        child.begin_settle();
        child.settle_if_drained();
        // The child's settlement notifies the parent.
        assert!(child.is_terminal());
        assert!(parent.is_terminal());
    }

    #[test]
    fn cancel_request_marks_only_pending_promises() {
        let promise = core();
        assert!(promise.request_cancel());
        assert!(!promise.request_cancel());
        assert_eq!(promise.phase(), Phase::CancelRequested);
    }
}
