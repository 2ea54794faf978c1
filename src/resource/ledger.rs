//! Per-task resource ledger.
//!
//! Every task carries a ledger of the resources it owns. An entry pairs a
//! resource with a finaliser and a state:
//!
//! - *held*: the task is responsible; the finaliser runs if the task
//!   terminates abnormally, and also on a normal exit (which additionally
//!   raises the resource-leak fatal).
//! - *disowned*: released without running the finaliser.
//! - *transferred*: moved to the parent task; a stub remains so that
//!   ownership probes answer "not owner" instead of "unknown handle".
//!
//! # Invariants
//!
//! 1. A finaliser runs at most once, even when the entry was duplicated by
//!    a gift at spawn time (the value cell is drained on first reap).
//! 2. Reaping runs in reverse acquisition order.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Fatal;
use crate::types::ResourceUid;

/// Type-erased reaping behaviour shared by every duplicate of an entry.
pub(crate) trait Reap: Send + Sync {
    /// Runs the finaliser if the value is still present. Draining the value
    /// cell makes a second call a no-op.
    fn reap(&self);
}

/// Shared cell holding a resource value and its finaliser.
pub(crate) struct ReapCell<T> {
    value: Mutex<Option<T>>,
    finally: Mutex<Option<Box<dyn FnOnce(T) + Send>>>,
}

impl<T> ReapCell<T> {
    pub(crate) fn new(value: T, finally: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            value: Mutex::new(Some(value)),
            finally: Mutex::new(Some(Box::new(finally))),
        }
    }

    pub(crate) fn take_value(&self) -> Option<T> {
        self.value.lock().take()
    }

    pub(crate) fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.value.lock().as_ref().map(f)
    }
}

impl<T: Send> Reap for ReapCell<T> {
    fn reap(&self) {
        let value = self.value.lock().take();
        let finally = self.finally.lock().take();
        if let (Some(value), Some(finally)) = (value, finally) {
            finally(value);
        }
    }
}

/// A resource handle returned by [`Ctx::own`](crate::Ctx::own).
///
/// The handle is a cheap reference; the value itself lives in a shared cell
/// so that the ledger can reap it without consulting the handle.
pub struct Resource<T> {
    uid: ResourceUid,
    cell: Arc<ReapCell<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            uid: self.uid,
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> Resource<T> {
    pub(crate) fn new(uid: ResourceUid, cell: Arc<ReapCell<T>>) -> Self {
        Self { uid, cell }
    }

    /// Returns the resource identifier.
    #[must_use]
    pub fn uid(&self) -> ResourceUid {
        self.uid
    }

    /// Borrows the value, if it has not been reaped or taken.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.cell.with_value(f)
    }

    /// Removes the value from the cell, preventing any later finalisation.
    ///
    /// Useful after a disown, when the caller wants the value back.
    pub fn take(&self) -> Option<T> {
        self.cell.take_value()
    }
}

impl<T> core::fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Resource").field("uid", &self.uid).finish()
    }
}

/// Ledger entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryState {
    Held,
    Disowned,
    Transferred,
    Reaped,
}

/// One ledger entry. Duplicates created by gifts and transfers share the
/// reap cell, never the state.
pub(crate) struct Entry {
    pub(crate) uid: ResourceUid,
    pub(crate) state: EntryState,
    pub(crate) reap: Arc<dyn Reap>,
}

impl Entry {
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            uid: self.uid,
            state: EntryState::Held,
            reap: Arc::clone(&self.reap),
        }
    }
}

/// The per-task resource ledger.
#[derive(Default)]
pub(crate) struct Ledger {
    entries: Vec<Entry>,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub(crate) fn adopt_all(&mut self, entries: Vec<Entry>) {
        self.entries.extend(entries);
    }

    fn find_mut(&mut self, uid: ResourceUid) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.uid == uid)
    }

    /// Marks an entry disowned without running its finaliser.
    pub(crate) fn disown(&mut self, uid: ResourceUid) -> Result<(), Fatal> {
        match self.find_mut(uid) {
            Some(entry) if entry.state == EntryState::Held => {
                entry.state = EntryState::Disowned;
                Ok(())
            }
            _ => Err(Fatal::NotOwner),
        }
    }

    /// Marks an entry transferred and returns a held duplicate destined for
    /// the parent's ledger.
    pub(crate) fn transfer(&mut self, uid: ResourceUid) -> Result<Entry, Fatal> {
        match self.find_mut(uid) {
            Some(entry) if entry.state == EntryState::Held => {
                entry.state = EntryState::Transferred;
                Ok(Entry {
                    uid: entry.uid,
                    state: EntryState::Held,
                    reap: Arc::clone(&entry.reap),
                })
            }
            _ => Err(Fatal::NotOwner),
        }
    }

    /// Verifies that the task holds the resource.
    pub(crate) fn check(&self, uid: ResourceUid) -> Result<(), Fatal> {
        match self.entries.iter().find(|e| e.uid == uid) {
            Some(entry) if entry.state == EntryState::Held => Ok(()),
            _ => Err(Fatal::NotOwner),
        }
    }

    /// Returns a held duplicate of an entry for gifting at spawn time.
    /// The giver's own entry stays held.
    pub(crate) fn gift(&mut self, uid: ResourceUid) -> Result<Entry, Fatal> {
        match self.find_mut(uid) {
            Some(entry) if entry.state == EntryState::Held => Ok(entry.duplicate()),
            _ => Err(Fatal::NotOwner),
        }
    }

    /// Takes every held entry out of the ledger, in reverse acquisition
    /// order, marking them reaped. The caller runs the finalisers after
    /// releasing any scheduler borrows.
    pub(crate) fn drain_held(&mut self) -> Vec<Arc<dyn Reap>> {
        let mut due = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            if entry.state == EntryState::Held {
                entry.state = EntryState::Reaped;
                due.push(Arc::clone(&entry.reap));
            }
        }
        due
    }

    /// Number of entries currently held.
    pub(crate) fn held_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == EntryState::Held)
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(uid: u64, runs: &Arc<AtomicUsize>) -> Entry {
        let runs = Arc::clone(runs);
        Entry {
            uid: ResourceUid::new(uid),
            state: EntryState::Held,
            reap: Arc::new(ReapCell::new((), move |()| {
                runs.fetch_add(1, Ordering::SeqCst);
            })),
        }
    }

    #[test]
    fn disown_skips_finaliser() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut ledger = Ledger::new();
        ledger.push(entry(1, &runs));
        ledger.disown(ResourceUid::new(1)).unwrap();
        for reap in ledger.drain_held() {
            reap.reap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drain_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut ledger = Ledger::new();
        for n in 1..=3_u64 {
            let order = Arc::clone(&order);
            ledger.push(Entry {
                uid: ResourceUid::new(n),
                state: EntryState::Held,
                reap: Arc::new(ReapCell::new(n, move |v| order.lock().push(v))),
            });
        }
        for reap in ledger.drain_held() {
            reap.reap();
        }
        assert_eq!(*order.lock(), vec![3, 2, 1]);
    }

    #[test]
    fn duplicate_reaps_at_most_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut ledger = Ledger::new();
        ledger.push(entry(1, &runs));
        let dup = ledger.gift(ResourceUid::new(1)).unwrap();
        dup.reap.reap();
        for reap in ledger.drain_held() {
            reap.reap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transfer_leaves_a_stub() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut ledger = Ledger::new();
        ledger.push(entry(1, &runs));
        let moved = ledger.transfer(ResourceUid::new(1)).unwrap();
        assert_eq!(moved.state, EntryState::Held);
        assert_eq!(ledger.check(ResourceUid::new(1)), Err(Fatal::NotOwner));
        assert_eq!(ledger.disown(ResourceUid::new(1)), Err(Fatal::NotOwner));
    }

    #[test]
    fn unknown_handle_is_not_owner() {
        let ledger = Ledger::new();
        assert_eq!(ledger.check(ResourceUid::new(7)), Err(Fatal::NotOwner));
    }
}
