//! The capability handle passed to every task.
//!
//! All effectful operations flow through an explicit [`Ctx`]: spawning,
//! awaiting, cancelling, yielding, suspending and resource ownership. A
//! `Ctx` is bound to one task on one domain and must not be smuggled into
//! finalisers or event pre-functions; operations performed outside the
//! owning task's polls are refused.
//!
//! Every operation here is a cooperation point. Spawns and cancels consume
//! a scheduling slice and let the task keep running until its next
//! suspension; awaits, yields and suspends hand control back to the
//! executor, which drains the event bridge before anything else runs.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::trace;

use crate::error::{raise, Failure, Fatal};
use crate::orphans::{Care, Orphans};
use crate::record::promise::{
    make_cancel_slot, make_cancel_slot_send, Phase, Promise, PromiseCore, PromiseInner, ResultKind,
};
use crate::record::task::{StoredFuture, TaskRecord};
use crate::resource::{Entry, EntryState, Ledger, Reap, ReapCell, Resource};
use crate::runtime::domain::{DomainInner, SuspendEntry, SuspendState};
use crate::runtime::shared::{DomainShared, Inbound, SpawnMsg, TaskWaker};
use crate::types::{DomainUid, Outcome, ResourceUid, SyscallUid, TaskUid};
use crate::util::CatchUnwind;

/// A user-declared suspension point.
///
/// Created with [`Ctx::make`]; parked on with [`Ctx::suspend`]; released
/// when the domain's events provider returns a matching
/// [`ContinueRecord`](crate::ContinueRecord). The release callback given to
/// `make` runs each time the point is released.
///
/// A syscall is bound to its creating domain and cannot be parked on from
/// anywhere else. At most one suspension per syscall may be outstanding at
/// a time.
#[derive(Clone)]
pub struct Syscall {
    uid: SyscallUid,
    domain: DomainUid,
    release: Rc<RefCell<Box<dyn FnMut()>>>,
}

impl Syscall {
    /// Returns the syscall identifier, unique within its creating domain.
    #[must_use]
    pub fn uid(&self) -> SyscallUid {
        self.uid
    }
}

impl core::fmt::Debug for Syscall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Syscall")
            .field("uid", &self.uid)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Options for spawning a task: gifted resources and an orphan collector.
#[derive(Default)]
pub struct SpawnOpts<'a, T> {
    gifts: Vec<ResourceUid>,
    orphans: Option<&'a Orphans<T>>,
}

impl<'a, T> SpawnOpts<'a, T> {
    /// No gifts, no collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gifts: Vec::new(),
            orphans: None,
        }
    }

    /// Gifts a resource to the spawned task. The entry is duplicated: the
    /// giver keeps its own copy, and both sides must disown independently.
    #[must_use]
    pub fn give<V>(mut self, resource: &Resource<V>) -> Self {
        self.gifts.push(resource.uid());
        self
    }

    /// Attaches the spawned promise to an orphan collector, so its result
    /// can be retrieved through [`Ctx::care`].
    #[must_use]
    pub fn collector(mut self, orphans: &'a Orphans<T>) -> Self {
        self.orphans = Some(orphans);
        self
    }
}

/// A point-in-time snapshot of the calling domain's scheduler counters.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// The domain observed.
    pub domain: DomainUid,
    /// Tasks waiting in the ready queue.
    pub ready: usize,
    /// Outstanding suspension points.
    pub suspended: usize,
    /// Live task records on the domain.
    pub live_tasks: usize,
    /// Ledger entries of the calling task.
    pub resources: usize,
    /// Tasks ever hosted by the domain.
    pub spawned: u64,
    /// Tasks that ran to completion.
    pub completed: u64,
    /// Tasks torn down by cancellation.
    pub cancelled: u64,
}

/// The capability context of a running task.
///
/// Cloning is cheap; clones refer to the same task. The context is bound
/// to the domain hosting the task and does not cross domain boundaries
/// (each parallel task receives its own, built on its hosting domain).
pub struct Ctx {
    domain: Rc<DomainInner>,
    task: TaskUid,
    core: Arc<PromiseCore>,
}

impl Clone for Ctx {
    fn clone(&self) -> Self {
        Self {
            domain: Rc::clone(&self.domain),
            task: self.task,
            core: Arc::clone(&self.core),
        }
    }
}

impl core::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ctx")
            .field("task", &self.task)
            .field("domain", &self.domain.uid)
            .finish()
    }
}

impl Ctx {
    pub(crate) fn new(domain: Rc<DomainInner>, task: TaskUid, core: Arc<PromiseCore>) -> Self {
        Self { domain, task, core }
    }

    /// Returns the calling task's identifier.
    #[must_use]
    pub fn uid(&self) -> TaskUid {
        self.task
    }

    /// Returns the identifier of the domain hosting the calling task.
    #[must_use]
    pub fn domain_uid(&self) -> DomainUid {
        self.domain.uid
    }

    /// Snapshots the calling domain's scheduler counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        self.assert_in_task();
        Stats {
            domain: self.domain.uid,
            ready: self.domain.ready.borrow().len(),
            suspended: self.domain.suspensions.borrow().len(),
            live_tasks: self.domain.tasks.borrow().len(),
            resources: self.with_ledger(|ledger| ledger.len()),
            spawned: self.domain.spawned.get(),
            completed: self.domain.completed.get(),
            cancelled: self.domain.cancelled.get(),
        }
    }

    // === Spawning ===

    /// Spawns a child task on the calling domain.
    ///
    /// The child is enqueued at the tail of the ready queue; the parent
    /// keeps running until its next suspension point. The returned promise
    /// must be awaited or cancelled before the parent terminates.
    pub fn call_cc<T, F, Fut>(&self, f: F) -> Promise<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.assert_in_task();
        self.consume_slice();
        self.spawn_local(Vec::new(), f)
    }

    /// [`call_cc`](Self::call_cc) with gifts and/or an orphan collector.
    pub fn call_cc_with<T, F, Fut>(&self, opts: SpawnOpts<'_, T>, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.assert_in_task();
        self.consume_slice();
        let gifts = self.dup_gifts(&opts.gifts);
        let promise = self.spawn_local(gifts, f);
        if let Some(orphans) = opts.orphans {
            orphans.attach(promise.clone());
        }
        promise
    }

    /// Spawns a task on a worker domain chosen round-robin.
    ///
    /// Domain 0 never hosts parallel tasks, and neither does the calling
    /// domain. Raises the no-domain-available fatal when no other worker
    /// exists.
    pub fn call<T, F, Fut>(&self, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.call_with(SpawnOpts::new(), f)
    }

    /// [`call`](Self::call) with gifts and/or an orphan collector.
    pub fn call_with<T, F, Fut>(&self, opts: SpawnOpts<'_, T>, f: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.assert_in_task();
        self.consume_slice();
        let target = match self.domain.pool.dispatch(self.domain.uid) {
            Ok(target) => target,
            Err(fatal) => raise(fatal),
        };
        let gifts = self.dup_gifts(&opts.gifts);
        let promise = self.spawn_to(target, gifts, f);
        if let Some(orphans) = opts.orphans {
            orphans.attach(promise.clone());
        }
        promise
    }

    /// Explicit fork-join: applies `f` to every item on the worker
    /// domains, distributing the items round-robin, and awaits all of
    /// them. Results are positional.
    pub async fn parallel<I, T, F, Fut>(&self, f: F, items: Vec<I>) -> Vec<Outcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Ctx, I) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        self.assert_in_task();
        self.consume_slice();
        let workers: Vec<Arc<DomainShared>> = self.domain.pool.workers().to_vec();
        if workers.is_empty() {
            raise(Fatal::NoDomainAvailable);
        }
        let mut promises = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let target = Arc::clone(&workers[index % workers.len()]);
            let f = f.clone();
            promises.push(self.spawn_to(target, Vec::new(), move |ctx| f(ctx, item)));
        }
        self.wait_all(promises).await
    }

    fn spawn_local<T, F, Fut>(&self, gifts: Vec<Entry>, f: F) -> Promise<T>
    where
        T: 'static,
        F: FnOnce(Ctx) -> Fut + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let shared = Arc::clone(&self.domain.shared);
        let uid = shared.alloc_task_uid();
        let core = PromiseCore::child(uid, self.domain.uid, &self.core, Arc::clone(&shared));
        self.core.add_child(Arc::clone(&core));
        let inner = Arc::new(PromiseInner::new(Arc::clone(&core)));
        let promise = Promise::from_inner(Arc::clone(&inner));
        let child = Ctx::new(Rc::clone(&self.domain), uid, Arc::clone(&core));
        let stored: StoredFuture = Box::pin(shell(child, Arc::clone(&inner), f));
        let waker = Waker::from(Arc::new(TaskWaker { uid, shared }));
        let mut ledger = Ledger::new();
        ledger.adopt_all(gifts);
        let record = TaskRecord::new(
            Arc::clone(&core),
            stored,
            waker,
            ledger,
            make_cancel_slot(&inner),
        );
        self.domain.tasks.borrow_mut().insert(uid, record);
        self.domain.ready.borrow_mut().push_back(uid);
        self.domain.spawned.set(self.domain.spawned.get() + 1);
        if self.core.phase() != Phase::Pending {
            // The parent is already being torn down; the child is born
            // doomed and goes straight to the cancel engine.
            self.domain.dispatch_cancel(Arc::clone(&core));
        }
        trace!(domain = %self.domain.uid, parent = %self.task, child = %uid, "spawned task");
        promise
    }

    fn spawn_to<T, F, Fut>(
        &self,
        target: Arc<DomainShared>,
        gifts: Vec<Entry>,
        f: F,
    ) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let uid = target.alloc_task_uid();
        let core = PromiseCore::child(uid, target.uid, &self.core, Arc::clone(&target));
        self.core.add_child(Arc::clone(&core));
        let inner = Arc::new(PromiseInner::new(Arc::clone(&core)));
        let promise = Promise::from_inner(Arc::clone(&inner));
        let make_shell: Box<dyn FnOnce(Ctx) -> StoredFuture + Send> = {
            let inner = Arc::clone(&inner);
            Box::new(move |ctx| Box::pin(shell(ctx, inner, f)) as StoredFuture)
        };
        let msg = SpawnMsg {
            core: Arc::clone(&core),
            gifts,
            make_shell,
            cancel_slot: make_cancel_slot_send(&inner),
        };
        target.send(Inbound::Spawn(msg));
        if self.core.phase() != Phase::Pending {
            self.domain.dispatch_cancel(Arc::clone(&core));
        }
        trace!(domain = %self.domain.uid, parent = %self.task, child = %uid, target = %core.domain(), "dispatched parallel task");
        promise
    }

    // === Awaiting ===

    /// Blocks the calling task until the promise is terminal and consumes
    /// its result.
    ///
    /// Only the task that created the promise may await it; anything else
    /// raises the not-a-child fatal.
    pub async fn wait<T: 'static>(&self, promise: &Promise<T>) -> Outcome<T> {
        self.assert_in_task();
        self.assert_child(promise.core());
        TerminalFuture::new(
            Rc::clone(&self.domain),
            self.task,
            Arc::clone(promise.core()),
        )
        .await;
        self.consume(promise)
    }

    /// Like [`wait`](Self::wait), but resumes the failure in the calling
    /// task instead of returning it.
    pub async fn wait_exn<T: 'static>(&self, promise: &Promise<T>) -> T {
        match self.wait(promise).await {
            Outcome::Resolved(value) => value,
            Outcome::Failed(failure) => std::panic::panic_any(failure.into_message()),
            Outcome::Cancelled => panic!("awaited promise was cancelled"),
        }
    }

    /// Awaits every promise, in list order. Failures and cancellations are
    /// delivered positionally; only fatals cut the collection short.
    pub async fn wait_all<T: 'static>(&self, promises: Vec<Promise<T>>) -> Vec<Outcome<T>> {
        let mut outcomes = Vec::with_capacity(promises.len());
        for promise in &promises {
            outcomes.push(self.wait(promise).await);
        }
        outcomes
    }

    /// Awaits the first terminal promise, cancels the rest and drains
    /// them before returning.
    ///
    /// When several promises settle in the same tick the earliest resolved
    /// entry in list order is preferred over failures, making the choice
    /// reproducible.
    pub async fn wait_first<T: 'static>(&self, promises: Vec<Promise<T>>) -> Outcome<T> {
        self.assert_in_task();
        assert!(!promises.is_empty(), "wait_first needs at least one promise");
        for promise in &promises {
            self.assert_child(promise.core());
        }
        let cores: Vec<Arc<PromiseCore>> =
            promises.iter().map(|p| Arc::clone(p.core())).collect();
        AnyTerminal::new(Rc::clone(&self.domain), self.task, cores).await;
        let mut chosen = None;
        for (index, promise) in promises.iter().enumerate() {
            if promise.core().is_terminal() {
                if promise.core().kind() == ResultKind::Resolved {
                    chosen = Some(index);
                    break;
                }
                if chosen.is_none() {
                    chosen = Some(index);
                }
            }
        }
        let Some(chosen) = chosen else {
            panic!("no terminal promise after wakeup");
        };
        let mut drained = vec![false; promises.len()];
        for (index, promise) in promises.iter().enumerate() {
            if index == chosen {
                continue;
            }
            if promise.core().is_terminal() {
                // Settled in the same tick; retrieval is the drain.
                let _ = self.consume(promise);
                drained[index] = true;
            } else {
                self.domain.dispatch_cancel(Arc::clone(promise.core()));
            }
        }
        for (index, promise) in promises.iter().enumerate() {
            if index == chosen || drained[index] {
                continue;
            }
            TerminalFuture::new(
                Rc::clone(&self.domain),
                self.task,
                Arc::clone(promise.core()),
            )
            .await;
            let _ = self.consume(promise);
        }
        self.consume(&promises[chosen])
    }

    /// Awaits the first terminal promise and removes it from the list.
    /// The remaining promises are untouched; the caller stays responsible
    /// for them.
    pub async fn wait_one<T: 'static>(&self, promises: &mut Vec<Promise<T>>) -> Outcome<T> {
        self.assert_in_task();
        assert!(!promises.is_empty(), "wait_one needs at least one promise");
        for promise in promises.iter() {
            self.assert_child(promise.core());
        }
        let cores: Vec<Arc<PromiseCore>> =
            promises.iter().map(|p| Arc::clone(p.core())).collect();
        let index = AnyTerminal::new(Rc::clone(&self.domain), self.task, cores).await;
        let promise = promises.remove(index);
        self.consume(&promise)
    }

    /// Awaits two promises as a pair.
    pub async fn both<A: 'static, B: 'static>(
        &self,
        left: &Promise<A>,
        right: &Promise<B>,
    ) -> (Outcome<A>, Outcome<B>) {
        let a = self.wait(left).await;
        let b = self.wait(right).await;
        (a, b)
    }

    // === Cancellation ===

    /// Requests cancellation of a child promise.
    ///
    /// Asynchronous: the mark is set immediately and propagated to every
    /// transitive child, but the target may still be winding down when
    /// this returns. Completion is observable by awaiting the promise.
    pub fn cancel<T>(&self, promise: &Promise<T>) {
        self.assert_in_task();
        if promise.core().is_consumed() {
            raise(Fatal::Cancelled);
        }
        self.assert_child(promise.core());
        self.consume_slice();
        self.domain.dispatch_cancel(Arc::clone(promise.core()));
    }

    // === Yielding and suspension ===

    /// Gives every other ready task on the domain a chance to run.
    pub fn yield_now(&self) -> impl Future<Output = ()> {
        self.assert_in_task();
        YieldNow {
            domain: Rc::clone(&self.domain),
            task: self.task,
            fired: false,
        }
    }

    /// Declares a suspension point. `release` runs each time the point is
    /// released by the events provider.
    pub fn make(&self, release: impl FnMut() + 'static) -> Syscall {
        self.assert_in_task();
        let value = self.domain.next_syscall.get() + 1;
        self.domain.next_syscall.set(value);
        Syscall {
            uid: SyscallUid::new(value),
            domain: self.domain.uid,
            release: Rc::new(RefCell::new(Box::new(release))),
        }
    }

    /// Parks the calling task on a suspension point until the events
    /// provider releases it.
    ///
    /// Returns an error when the release was discontinued by a failing
    /// pre-function or release callback.
    pub fn suspend(&self, syscall: &Syscall) -> impl Future<Output = Result<(), Failure>> {
        self.assert_in_task();
        SuspendFuture {
            domain: Rc::clone(&self.domain),
            task: self.task,
            core: Arc::clone(&self.core),
            syscall: syscall.clone(),
            state: None,
        }
    }

    // === Resources ===

    /// Registers a resource with a finaliser in the calling task's ledger.
    ///
    /// The finaliser runs if the task terminates abnormally. It also runs
    /// when the task terminates normally with the resource still held,
    /// which additionally raises the resource-leak fatal.
    pub fn own<T: Send + 'static>(
        &self,
        value: T,
        finally: impl FnOnce(T) + Send + 'static,
    ) -> Resource<T> {
        self.assert_in_task();
        let next = self.domain.next_resource.get() + 1;
        self.domain.next_resource.set(next);
        let uid = ResourceUid::new(next);
        let cell = Arc::new(ReapCell::new(value, finally));
        let entry = Entry {
            uid,
            state: EntryState::Held,
            reap: Arc::clone(&cell) as Arc<dyn Reap>,
        };
        self.with_ledger(|ledger| ledger.push(entry));
        trace!(domain = %self.domain.uid, task = %self.task, resource = %uid, "owned resource");
        Resource::new(uid, cell)
    }

    /// Releases a resource without running its finaliser.
    pub fn disown<T>(&self, resource: &Resource<T>) {
        self.assert_in_task();
        if let Err(fatal) = self.with_ledger(|ledger| ledger.disown(resource.uid())) {
            raise(fatal);
        }
    }

    /// Moves responsibility for a resource to the parent task. A
    /// transferred stub stays behind, so a later ownership probe on this
    /// task answers not-owner.
    pub fn transfer<T>(&self, resource: &Resource<T>) {
        self.assert_in_task();
        let entry = match self.with_ledger(|ledger| ledger.transfer(resource.uid())) {
            Ok(entry) => entry,
            Err(fatal) => raise(fatal),
        };
        match self.core.parent() {
            None => {
                // The root has no parent to adopt the resource.
                entry.reap.reap();
            }
            Some(parent) => {
                if Arc::ptr_eq(parent.home(), &self.domain.shared) {
                    let leftover = {
                        let mut tasks = self.domain.tasks.borrow_mut();
                        match tasks.get_mut(&parent.uid()) {
                            Some(record) if Arc::ptr_eq(&record.core, &parent) => {
                                record.ledger.push(entry);
                                None
                            }
                            _ => Some(entry),
                        }
                    };
                    if let Some(entry) = leftover {
                        entry.reap.reap();
                    }
                } else {
                    let home = Arc::clone(parent.home());
                    home.send(Inbound::Transfer { parent, entry });
                }
            }
        }
    }

    /// Verifies that the calling task holds the resource; raises the
    /// not-owner fatal otherwise.
    pub fn check<T>(&self, resource: &Resource<T>) {
        self.assert_in_task();
        if let Err(fatal) = self.with_ledger(|ledger| ledger.check(resource.uid())) {
            raise(fatal);
        }
    }

    // === Orphan collectors ===

    /// Creates an orphan collector for background tasks.
    #[must_use]
    pub fn orphans<T: Send + 'static>(&self) -> Orphans<T> {
        Orphans::new()
    }

    /// Non-blocking retrieval of a settled background task.
    pub fn care<T: Send + 'static>(&self, orphans: &Orphans<T>) -> Care<T> {
        orphans.pop()
    }

    // === Internals ===

    fn consume_slice(&self) {
        let tasks = self.domain.tasks.borrow();
        if let Some(record) = tasks.get(&self.task) {
            record.budget.set(record.budget.get().saturating_sub(1));
        }
    }

    fn assert_in_task(&self) {
        if self.domain.current.get() != Some(self.task) {
            panic!(
                "scheduler operation outside its task; finalisers and \
                 pre-functions must not reenter the scheduler"
            );
        }
    }

    fn assert_child(&self, core: &Arc<PromiseCore>) {
        match core.parent() {
            Some(parent) if Arc::ptr_eq(&parent, &self.core) => {}
            _ => raise(Fatal::NotAChild),
        }
    }

    /// Takes the terminal outcome, detaches the child and retires its
    /// record on the hosting domain.
    fn consume<T>(&self, promise: &Promise<T>) -> Outcome<T> {
        let outcome = match promise.inner().take() {
            Some(outcome) => outcome,
            // The result was consumed before; the structure is broken.
            None => raise(Fatal::Cancelled),
        };
        if outcome.is_resolved() {
            promise.core().mark_consumed();
        }
        self.core.remove_child(promise.core());
        promise.core().home().push_retired(promise.core().uid());
        outcome
    }

    fn dup_gifts(&self, uids: &[ResourceUid]) -> Vec<Entry> {
        uids.iter()
            .map(|uid| match self.with_ledger(|ledger| ledger.gift(*uid)) {
                Ok(entry) => entry,
                Err(fatal) => raise(fatal),
            })
            .collect()
    }

    fn with_ledger<R>(&self, f: impl FnOnce(&mut Ledger) -> R) -> R {
        let mut tasks = self.domain.tasks.borrow_mut();
        let record = tasks
            .get_mut(&self.task)
            .expect("current task has a record");
        f(&mut record.ledger)
    }

    fn reap_ledger(&self) -> usize {
        let due = {
            let mut tasks = self.domain.tasks.borrow_mut();
            match tasks.get_mut(&self.task) {
                Some(record) => record.ledger.drain_held(),
                None => Vec::new(),
            }
        };
        let count = due.len();
        for reap in due {
            reap.reap();
        }
        count
    }
}

/// The wrapper future every task runs inside.
///
/// Catches panics at the task boundary, enforces the no-orphans and
/// no-leaked-resources rules on a normal exit, and performs settlement.
/// When a cancel request won the race, the cancel engine owns the
/// epilogue and the shell only records the produced result.
pub(crate) async fn shell<T, F, Fut>(ctx: Ctx, inner: Arc<PromiseInner<T>>, f: F)
where
    T: 'static,
    F: FnOnce(Ctx) -> Fut,
    Fut: Future<Output = T> + 'static,
{
    let result = CatchUnwind::new(Box::pin(f(ctx.clone()))).await;
    let core = Arc::clone(&inner.core);
    match result {
        Ok(value) => {
            if !core.try_begin_settle() {
                inner.resolve(value);
                return;
            }
            if !core.children_empty() {
                raise(Fatal::StillHasChildren);
            }
            let leaked = ctx.reap_ledger();
            if leaked > 0 {
                inner.resolve(value);
                raise(Fatal::ResourceLeak);
            }
            inner.resolve(value);
            core.settle_if_drained();
        }
        Err(failure) => {
            if !core.try_begin_settle() {
                inner.fail(failure);
                return;
            }
            let _ = ctx.reap_ledger();
            inner.fail(failure);
            for child in core.children_snapshot() {
                ctx.domain.dispatch_cancel(child);
            }
            core.settle_if_drained();
        }
    }
    trace!(task = %core.uid(), domain = %core.domain(), "task settled");
}

// === Operation futures ===

struct YieldNow {
    domain: Rc<DomainInner>,
    task: TaskUid,
    fired: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.fired {
            return Poll::Ready(());
        }
        this.fired = true;
        // A yield surrenders the whole remaining budget, forcing the
        // executor to re-enqueue at the tail.
        let tasks = this.domain.tasks.borrow();
        if let Some(record) = tasks.get(&this.task) {
            record.budget.set(0);
        }
        drop(tasks);
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

fn charge(domain: &DomainInner, task: TaskUid) {
    let tasks = domain.tasks.borrow();
    if let Some(record) = tasks.get(&task) {
        record.budget.set(record.budget.get().saturating_sub(1));
    }
}

/// Waits until a promise core turns terminal. Consumes one scheduling
/// slice and always bounces through the executor at least once, so the
/// event bridge is drained even for an already-settled promise.
struct TerminalFuture {
    domain: Rc<DomainInner>,
    task: TaskUid,
    core: Arc<PromiseCore>,
    charged: bool,
}

impl TerminalFuture {
    fn new(domain: Rc<DomainInner>, task: TaskUid, core: Arc<PromiseCore>) -> Self {
        Self {
            domain,
            task,
            core,
            charged: false,
        }
    }
}

impl Future for TerminalFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if !this.charged {
            this.charged = true;
            charge(&this.domain, this.task);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        if this.core.is_terminal() {
            return Poll::Ready(());
        }
        this.core.push_waiter(cx.waker().clone());
        // Re-check: the settlement may have raced the registration.
        if this.core.is_terminal() {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

/// Waits until at least one of several cores is terminal; resolves to the
/// first terminal index in list order.
struct AnyTerminal {
    domain: Rc<DomainInner>,
    task: TaskUid,
    cores: Vec<Arc<PromiseCore>>,
    charged: bool,
}

impl AnyTerminal {
    fn new(domain: Rc<DomainInner>, task: TaskUid, cores: Vec<Arc<PromiseCore>>) -> Self {
        Self {
            domain,
            task,
            cores,
            charged: false,
        }
    }

    fn first_terminal(&self) -> Option<usize> {
        self.cores.iter().position(|core| core.is_terminal())
    }
}

impl Future for AnyTerminal {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<usize> {
        let this = self.get_mut();
        if !this.charged {
            this.charged = true;
            charge(&this.domain, this.task);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        if let Some(index) = this.first_terminal() {
            return Poll::Ready(index);
        }
        for core in &this.cores {
            core.push_waiter(cx.waker().clone());
        }
        match this.first_terminal() {
            Some(index) => Poll::Ready(index),
            None => Poll::Pending,
        }
    }
}

struct SuspendFuture {
    domain: Rc<DomainInner>,
    task: TaskUid,
    core: Arc<PromiseCore>,
    syscall: Syscall,
    state: Option<Rc<RefCell<SuspendState>>>,
}

impl Future for SuspendFuture {
    type Output = Result<(), Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let uid = this.syscall.uid;
        match &this.state {
            None => {
                assert!(
                    this.syscall.domain == this.domain.uid,
                    "syscall {uid} used outside its creating domain"
                );
                charge(&this.domain, this.task);
                let mut table = this.domain.suspensions.borrow_mut();
                assert!(
                    !table.contains_key(&uid),
                    "syscall {uid} already has an outstanding suspension"
                );
                let state = Rc::new(RefCell::new(SuspendState::Parked));
                table.insert(
                    uid,
                    SuspendEntry {
                        owner: Arc::clone(&this.core),
                        waker: cx.waker().clone(),
                        state: Rc::clone(&state),
                        release: Rc::clone(&this.syscall.release),
                    },
                );
                drop(table);
                this.state = Some(state);
                trace!(domain = %this.domain.uid, task = %this.task, syscall = %uid, "suspended");
                Poll::Pending
            }
            Some(state) => {
                let outcome = match &*state.borrow() {
                    SuspendState::Parked => None,
                    SuspendState::Released => Some(Ok(())),
                    SuspendState::Discontinued(failure) => Some(Err(failure.clone())),
                };
                match outcome {
                    Some(result) => Poll::Ready(result),
                    None => {
                        // Spurious poll while still parked; refresh the
                        // waker held by the table.
                        if let Some(entry) =
                            this.domain.suspensions.borrow_mut().get_mut(&uid)
                        {
                            entry.waker = cx.waker().clone();
                        }
                        Poll::Pending
                    }
                }
            }
        }
    }
}
