//! The per-domain quantum executor.
//!
//! Each domain runs an independent loop over its local ready queue and
//! suspension table:
//!
//! ```text
//! drain inbox -> process cancels -> drain wakes -> pop one task ->
//!   poll a quantum -> drain events -> repeat
//! ```
//!
//! The executor drains the event bridge after every poll return, so an
//! external event is never starved by computation. When the ready queue is
//! empty the domain sleeps: in the provider's blocking select if any
//! suspension is outstanding, on its parker otherwise. Peer domains break
//! either sleep through [`DomainShared::wake_owner`].
//!
//! Cancellation processing follows a fixed order on the owning domain:
//! drop the pending suspension, drop the stored future, run held
//! finalisers in reverse acquisition order, settle until the children
//! drain, and write *cancelled* over whatever result was there.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::ctx::Ctx;
use crate::error::Failure;
use crate::events::{Events, Pending};
use crate::record::promise::{Phase, PromiseCore, SlotCancel};
use crate::record::task::{TaskRecord, WakeState};
use crate::resource::Ledger;
use crate::runtime::pool::Pool;
use crate::runtime::shared::{DomainShared, Inbound, SpawnMsg, TaskWaker};
use crate::types::{DomainUid, SyscallUid, TaskUid};
use crate::util::catch_failure;

/// Wrapper invoked around every task poll.
///
/// The wrapper must call the thunk it is given exactly once; it exists so
/// embedders can install ambient state (effect handlers, allocator scopes)
/// around task execution.
pub type PollWrapper = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Resumption state shared between a suspended task and the suspension
/// table.
pub(crate) enum SuspendState {
    Parked,
    Released,
    Discontinued(Failure),
}

/// One outstanding suspension.
pub(crate) struct SuspendEntry {
    pub(crate) owner: Arc<PromiseCore>,
    pub(crate) waker: Waker,
    pub(crate) state: Rc<RefCell<SuspendState>>,
    pub(crate) release: Rc<RefCell<Box<dyn FnMut()>>>,
}

/// Domain-local scheduler state. Reached from task code through [`Ctx`].
pub(crate) struct DomainInner {
    pub(crate) uid: DomainUid,
    pub(crate) shared: Arc<DomainShared>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) quanta: u32,
    pub(crate) ready: RefCell<VecDeque<TaskUid>>,
    pub(crate) tasks: RefCell<HashMap<TaskUid, TaskRecord>>,
    pub(crate) suspensions: RefCell<BTreeMap<SyscallUid, SuspendEntry>>,
    cancel_lane: RefCell<VecDeque<Arc<PromiseCore>>>,
    events: RefCell<Box<dyn Events>>,
    pub(crate) next_syscall: Cell<u64>,
    pub(crate) next_resource: Cell<u64>,
    /// Task currently being polled, if any.
    pub(crate) current: Cell<Option<TaskUid>>,
    pub(crate) spawned: Cell<u64>,
    pub(crate) completed: Cell<u64>,
    pub(crate) cancelled: Cell<u64>,
    hook: Option<PollWrapper>,
}

impl DomainInner {
    /// Routes a cancel request to the domain hosting the promise. The
    /// cancel-requested mark is set immediately so event bridges on every
    /// domain stop reporting the task's suspensions.
    pub(crate) fn dispatch_cancel(&self, core: Arc<PromiseCore>) {
        core.request_cancel();
        if Arc::ptr_eq(core.home(), &self.shared) {
            self.cancel_lane.borrow_mut().push_back(core);
        } else {
            let home = Arc::clone(core.home());
            home.send(Inbound::Cancel(core));
        }
    }
}

/// A domain executor bound to its thread.
pub(crate) struct Domain {
    inner: Rc<DomainInner>,
}

impl Domain {
    pub(crate) fn new(
        shared: Arc<DomainShared>,
        pool: Arc<Pool>,
        quanta: u32,
        events: Box<dyn Events>,
        hook: Option<PollWrapper>,
    ) -> Self {
        shared.set_interrupter(events.interrupter());
        let uid = shared.uid;
        Self {
            inner: Rc::new(DomainInner {
                uid,
                shared,
                pool,
                quanta: quanta.max(1),
                ready: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(HashMap::new()),
                suspensions: RefCell::new(BTreeMap::new()),
                cancel_lane: RefCell::new(VecDeque::new()),
                events: RefCell::new(events),
                next_syscall: Cell::new(0),
                next_resource: Cell::new(0),
                current: Cell::new(None),
                spawned: Cell::new(0),
                completed: Cell::new(0),
                cancelled: Cell::new(0),
                hook,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<DomainInner> {
        &self.inner
    }

    /// Worker loop: serve the queues until the driver winds the pool down.
    pub(crate) fn run_worker(&self) {
        while !self.inner.pool.is_shutdown() {
            if self.step() {
                continue;
            }
            if self.inner.pool.is_shutdown() {
                break;
            }
            self.idle_wait();
        }
    }

    /// Domain-0 loop: serve the queues until the root promise settles or a
    /// fatal surfaces elsewhere.
    pub(crate) fn run_root(&self, root: &Arc<PromiseCore>) {
        loop {
            if root.is_terminal() || self.inner.pool.has_fatal() {
                return;
            }
            if self.step() {
                continue;
            }
            if root.is_terminal() || self.inner.pool.has_fatal() {
                return;
            }
            self.idle_wait();
        }
    }

    /// One scheduling iteration. Returns true if any work was done.
    fn step(&self) -> bool {
        let mut busy = self.drain_inbox();
        busy |= self.process_cancel_lane();
        busy |= self.drain_retired();
        busy |= self.drain_wakes();
        let next = self.inner.ready.borrow_mut().pop_front();
        if let Some(uid) = next {
            self.run_task(uid);
            return true;
        }
        busy
    }

    /// Sleeps until something arrives: inside the provider when at least
    /// one suspension is outstanding, on the parker otherwise.
    fn idle_wait(&self) {
        if self.inner.suspensions.borrow().is_empty() {
            self.inner.shared.park();
        } else {
            self.drain_events(true);
        }
    }

    fn drain_inbox(&self) -> bool {
        let mut busy = false;
        while let Some(message) = self.inner.shared.pop_inbox() {
            busy = true;
            match message {
                Inbound::Spawn(msg) => self.install_remote(msg),
                Inbound::Cancel(core) => self.inner.cancel_lane.borrow_mut().push_back(core),
                Inbound::Transfer { parent, entry } => {
                    let leftover = {
                        let mut tasks = self.inner.tasks.borrow_mut();
                        match tasks.get_mut(&parent.uid()) {
                            Some(record) if Arc::ptr_eq(&record.core, &parent) => {
                                record.ledger.push(entry);
                                None
                            }
                            _ => Some(entry),
                        }
                    };
                    if let Some(entry) = leftover {
                        // The parent is already gone and cannot adopt the
                        // resource; reap it on the spot.
                        trace!(domain = %self.inner.uid, resource = %entry.uid, "reaping transfer to a finished parent");
                        entry.reap.reap();
                    }
                }
            }
        }
        busy
    }

    /// Installs a parallel task shipped from another domain.
    fn install_remote(&self, msg: SpawnMsg) {
        let uid = msg.core.uid();
        let core = Arc::clone(&msg.core);
        let ctx = Ctx::new(Rc::clone(&self.inner), uid, Arc::clone(&core));
        let stored = (msg.make_shell)(ctx);
        let waker = Waker::from(Arc::new(TaskWaker {
            uid,
            shared: Arc::clone(&self.inner.shared),
        }));
        let mut ledger = Ledger::new();
        ledger.adopt_all(msg.gifts);
        let record = TaskRecord::new(core.clone(), stored, waker, ledger, msg.cancel_slot);
        self.inner.tasks.borrow_mut().insert(uid, record);
        self.inner.ready.borrow_mut().push_back(uid);
        self.inner.spawned.set(self.inner.spawned.get() + 1);
        trace!(domain = %self.inner.uid, task = %uid, "installed parallel task");
        // The parent may have been cancelled while the spawn was in
        // flight; the mark then arrived before the task record existed.
        if core.phase() != Phase::Pending {
            self.inner.cancel_lane.borrow_mut().push_back(core);
        }
    }

    fn process_cancel_lane(&self) -> bool {
        let mut busy = false;
        loop {
            let next = self.inner.cancel_lane.borrow_mut().pop_front();
            let Some(core) = next else { break };
            busy = true;
            self.process_cancel(&core);
        }
        busy
    }

    fn process_cancel(&self, core: &Arc<PromiseCore>) {
        let uid = core.uid();
        // 1. Discard any pending suspension; its continuation never runs.
        self.inner
            .suspensions
            .borrow_mut()
            .retain(|_, entry| !Arc::ptr_eq(&entry.owner, core));
        // 2. Pull the record and drop the stored continuation.
        let record = {
            let mut tasks = self.inner.tasks.borrow_mut();
            match tasks.get(&uid) {
                Some(record) if Arc::ptr_eq(&record.core, core) => tasks.remove(&uid),
                _ => None,
            }
        };
        let Some(mut record) = record else {
            // Already handled, or consumed before the cancel arrived.
            return;
        };
        drop(record.stored.take());
        self.inner.ready.borrow_mut().retain(|queued| *queued != uid);
        // 3. Held finalisers run now, in reverse acquisition order.
        let due = record.ledger.drain_held();
        for reap in due {
            reap.reap();
        }
        // 4. Cancellation wins retroactively over any prior result.
        match (record.cancel_slot)() {
            SlotCancel::Consumed => {
                // A legitimate consumption raced the cancel delivery; the
                // structure check happened at the cancel call site.
                trace!(domain = %self.inner.uid, task = %uid, "cancel arrived after consumption");
                return;
            }
            SlotCancel::Overridden | SlotCancel::AlreadyCancelled => {}
        }
        core.begin_settle();
        for child in core.children_snapshot() {
            self.inner.dispatch_cancel(child);
        }
        core.settle_if_drained();
        self.inner.cancelled.set(self.inner.cancelled.get() + 1);
        trace!(domain = %self.inner.uid, task = %uid, "cancelled task");
    }

    fn drain_retired(&self) -> bool {
        let mut busy = false;
        while let Some(uid) = self.inner.shared.pop_retired() {
            busy = true;
            self.inner.tasks.borrow_mut().remove(&uid);
        }
        busy
    }

    fn drain_wakes(&self) -> bool {
        let mut busy = false;
        while let Some(uid) = self.inner.shared.pop_wake() {
            busy = true;
            self.notify(uid);
        }
        busy
    }

    fn notify(&self, uid: TaskUid) {
        let enqueue = {
            let tasks = self.inner.tasks.borrow();
            let Some(record) = tasks.get(&uid) else {
                return;
            };
            match record.wake.get() {
                WakeState::Parked if record.stored.is_some() => {
                    record.wake.set(WakeState::Queued);
                    true
                }
                WakeState::Polling => {
                    record.wake.set(WakeState::PollingNotified);
                    false
                }
                _ => false,
            }
        };
        if enqueue {
            self.inner.ready.borrow_mut().push_back(uid);
        }
    }

    /// Runs one activation of a task: up to `quanta` scheduling slices,
    /// draining the event bridge after every poll return.
    fn run_task(&self, uid: TaskUid) {
        let taken = {
            let mut tasks = self.inner.tasks.borrow_mut();
            match tasks.get_mut(&uid) {
                Some(record) => match record.stored.take() {
                    Some(future) => {
                        record.wake.set(WakeState::Polling);
                        record.budget.set(self.inner.quanta);
                        Some((future, record.waker.clone()))
                    }
                    None => {
                        record.wake.set(WakeState::Parked);
                        None
                    }
                },
                None => None,
            }
        };
        let Some((mut future, waker)) = taken else {
            return;
        };
        let mut cx = Context::from_waker(&waker);
        self.inner.current.set(Some(uid));
        loop {
            let poll = match &self.inner.hook {
                Some(hook) => {
                    let mut outcome = None;
                    hook(&mut || outcome = Some(future.as_mut().poll(&mut cx)));
                    match outcome {
                        Some(poll) => poll,
                        None => panic!("poll wrapper did not invoke the task"),
                    }
                }
                None => future.as_mut().poll(&mut cx),
            };
            match poll {
                Poll::Ready(()) => {
                    // The shell has written the result and settled.
                    if let Some(record) = self.inner.tasks.borrow_mut().get_mut(&uid) {
                        record.wake.set(WakeState::Parked);
                    }
                    self.inner.completed.set(self.inner.completed.get() + 1);
                    break;
                }
                Poll::Pending => {
                    // Pick up wakes produced during the poll, including the
                    // task's own.
                    self.drain_wakes();
                    let verdict = {
                        let tasks = self.inner.tasks.borrow();
                        let Some(record) = tasks.get(&uid) else {
                            // Cancelled out from under us; drop the future.
                            break;
                        };
                        match record.wake.get() {
                            WakeState::PollingNotified if record.budget.get() > 0 => {
                                record.wake.set(WakeState::Polling);
                                Verdict::Continue
                            }
                            WakeState::PollingNotified => {
                                record.wake.set(WakeState::Queued);
                                Verdict::Requeue
                            }
                            _ => {
                                record.wake.set(WakeState::Parked);
                                Verdict::Park
                            }
                        }
                    };
                    match verdict {
                        Verdict::Continue => {
                            self.drain_events(false);
                            continue;
                        }
                        Verdict::Requeue => {
                            self.restore(uid, future);
                            self.inner.ready.borrow_mut().push_back(uid);
                            break;
                        }
                        Verdict::Park => {
                            self.restore(uid, future);
                            break;
                        }
                    }
                }
            }
        }
        self.inner.current.set(None);
        self.drain_events(false);
    }

    fn restore(&self, uid: TaskUid, future: crate::record::task::StoredFuture) {
        if let Some(record) = self.inner.tasks.borrow_mut().get_mut(&uid) {
            record.stored = Some(future);
        }
    }

    /// The event bridge: prune dead suspensions, hand the live set to the
    /// provider, and apply the continue records it returns.
    pub(crate) fn drain_events(&self, blocking: bool) {
        self.inner
            .suspensions
            .borrow_mut()
            .retain(|_, entry| entry.owner.phase() == Phase::Pending);
        let ids: Vec<SyscallUid> = self.inner.suspensions.borrow().keys().copied().collect();
        let records = {
            let pending = Pending::new(blocking, &ids);
            self.inner.events.borrow_mut().select(&pending)
        };
        for record in records {
            let (uid, pre) = record.into_parts();
            let entry = self.inner.suspensions.borrow_mut().remove(&uid);
            let Some(entry) = entry else {
                trace!(domain = %self.inner.uid, syscall = %uid, "stale continue record");
                continue;
            };
            let mut failure = None;
            if let Some(pre) = pre {
                if let Err(e) = catch_failure(pre) {
                    failure = Some(e);
                }
            }
            if failure.is_none() {
                let release = Rc::clone(&entry.release);
                if let Err(e) = catch_failure(|| (release.borrow_mut())()) {
                    failure = Some(e);
                }
            }
            *entry.state.borrow_mut() = match failure {
                None => SuspendState::Released,
                Some(e) => SuspendState::Discontinued(e),
            };
            entry.waker.wake_by_ref();
        }
    }
}

enum Verdict {
    Continue,
    Requeue,
    Park,
}
