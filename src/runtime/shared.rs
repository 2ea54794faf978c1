//! Cross-domain communication primitives.
//!
//! Each domain owns a [`DomainShared`] handle that every other domain may
//! hold. All cross-domain traffic flows through it:
//!
//! - the inbox carries parallel spawns, cancel requests and ledger
//!   transfers;
//! - the wake queue carries task wakeups (a promise settling on one domain
//!   waking an awaiting task on another);
//! - the retired queue carries record-cleanup notices after a parent
//!   consumed a result.
//!
//! Queue producers call [`wake_owner`](DomainShared::wake_owner), which
//! both unparks an idle domain and interrupts a blocking select, so a
//! message is noticed regardless of how the domain is sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::Wake;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use crate::ctx::Ctx;
use crate::events::Interrupter;
use crate::record::promise::{PromiseCore, SlotCancel};
use crate::record::task::StoredFuture;
use crate::resource::Entry;
use crate::types::{DomainUid, TaskUid};

/// A parallel spawn shipped to a worker domain.
///
/// The future itself is built on the receiving domain; only the closure
/// that builds it crosses threads.
pub(crate) struct SpawnMsg {
    pub(crate) core: Arc<PromiseCore>,
    pub(crate) gifts: Vec<Entry>,
    pub(crate) make_shell: Box<dyn FnOnce(Ctx) -> StoredFuture + Send>,
    pub(crate) cancel_slot: Box<dyn Fn() -> SlotCancel + Send>,
}

/// Cross-domain messages consumed by the owning domain's executor.
pub(crate) enum Inbound {
    Spawn(SpawnMsg),
    Cancel(Arc<PromiseCore>),
    Transfer {
        parent: Arc<PromiseCore>,
        entry: Entry,
    },
}

/// The shareable half of a domain.
pub(crate) struct DomainShared {
    pub(crate) uid: DomainUid,
    inbox: SegQueue<Inbound>,
    wakes: SegQueue<TaskUid>,
    retired: SegQueue<TaskUid>,
    next_task: AtomicU64,
    sleeper: Mutex<bool>,
    wakeup: Condvar,
    interrupter: OnceLock<Interrupter>,
}

impl DomainShared {
    pub(crate) fn new(uid: DomainUid) -> Arc<Self> {
        Arc::new(Self {
            uid,
            inbox: SegQueue::new(),
            wakes: SegQueue::new(),
            retired: SegQueue::new(),
            next_task: AtomicU64::new(1),
            sleeper: Mutex::new(false),
            wakeup: Condvar::new(),
            interrupter: OnceLock::new(),
        })
    }

    /// Allocates the next task uid hosted by this domain.
    pub(crate) fn alloc_task_uid(&self) -> TaskUid {
        TaskUid::new(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn send(&self, message: Inbound) {
        self.inbox.push(message);
        self.wake_owner();
    }

    pub(crate) fn pop_inbox(&self) -> Option<Inbound> {
        self.inbox.pop()
    }

    pub(crate) fn push_wake(&self, task: TaskUid) {
        self.wakes.push(task);
        self.wake_owner();
    }

    pub(crate) fn pop_wake(&self) -> Option<TaskUid> {
        self.wakes.pop()
    }

    pub(crate) fn push_retired(&self, task: TaskUid) {
        self.retired.push(task);
        self.wake_owner();
    }

    pub(crate) fn pop_retired(&self) -> Option<TaskUid> {
        self.retired.pop()
    }

    /// Installs the interrupter once the domain's events provider exists.
    pub(crate) fn set_interrupter(&self, interrupter: Interrupter) {
        let _ = self.interrupter.set(interrupter);
    }

    /// Wakes the owning domain out of either sleep mode: the condvar park
    /// and the blocking select.
    pub(crate) fn wake_owner(&self) {
        *self.sleeper.lock() = true;
        self.wakeup.notify_one();
        if let Some(interrupter) = self.interrupter.get() {
            interrupter.interrupt();
        }
    }

    /// Parks the owning domain until a wake arrives. Consumes a pending
    /// wake immediately, so a wake that raced the park is not lost.
    pub(crate) fn park(&self) {
        let mut woken = self.sleeper.lock();
        while !*woken {
            self.wakeup.wait(&mut woken);
        }
        *woken = false;
    }
}

impl core::fmt::Debug for DomainShared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainShared").field("uid", &self.uid).finish()
    }
}

/// Waker for a task record: pushes the task uid onto its home domain's
/// wake queue and rouses the domain.
pub(crate) struct TaskWaker {
    pub(crate) uid: TaskUid,
    pub(crate) shared: Arc<DomainShared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.push_wake(self.uid);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.push_wake(self.uid);
    }
}
