//! Domain-local task records.
//!
//! A task record is the runnable incarnation of a promise on its owning
//! domain: the stored future, the wake state, the quantum budget and the
//! resource ledger. Records never leave their domain.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Waker;

use crate::record::promise::{PromiseCore, SlotCancel};
use crate::resource::Ledger;

/// The stored continuation of a task.
pub(crate) type StoredFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Wake protocol state.
///
/// A wake arriving while the task is being polled must not be lost; the
/// executor checks for `PollingNotified` after every poll and either keeps
/// polling (budget permitting) or re-enqueues at the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeState {
    /// Not queued; waiting for a wake.
    Parked,
    /// Sitting in the ready queue.
    Queued,
    /// Currently being polled.
    Polling,
    /// Woken while being polled.
    PollingNotified,
}

pub(crate) struct TaskRecord {
    pub(crate) core: Arc<PromiseCore>,
    pub(crate) stored: Option<StoredFuture>,
    pub(crate) waker: Waker,
    pub(crate) wake: Cell<WakeState>,
    /// Remaining scheduling slices in the current activation.
    pub(crate) budget: Cell<u32>,
    pub(crate) ledger: Ledger,
    /// Retroactive cancel hook for the typed result slot.
    pub(crate) cancel_slot: Box<dyn Fn() -> SlotCancel>,
}

impl TaskRecord {
    pub(crate) fn new(
        core: Arc<PromiseCore>,
        stored: StoredFuture,
        waker: Waker,
        ledger: Ledger,
        cancel_slot: Box<dyn Fn() -> SlotCancel>,
    ) -> Self {
        Self {
            core,
            stored: Some(stored),
            waker,
            wake: Cell::new(WakeState::Queued),
            budget: Cell::new(0),
            ledger,
            cancel_slot,
        }
    }
}
