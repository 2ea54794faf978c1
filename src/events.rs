//! The events-provider seam.
//!
//! The scheduler never performs I/O itself. Each domain owns one
//! [`Events`] provider, created by the embedder's factory, and consults it
//! at every cooperation point: after each task poll the domain calls
//! [`select`](Events::select) non-blockingly, and when it runs out of ready
//! tasks while suspensions are outstanding it calls `select` in blocking
//! mode. The provider answers with [`ContinueRecord`]s naming the
//! suspensions to release.
//!
//! A provider is created and driven entirely on its own domain; only the
//! [`Interrupter`] handle it hands out is shared, so that peer domains can
//! break an in-progress blocking select.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::types::{DomainUid, SyscallUid};

/// View of the domain's outstanding suspensions, passed to
/// [`Events::select`].
///
/// Probing individual suspensions through [`is_pending`](Pending::is_pending)
/// is only possible while a select call is in progress, since this guard
/// cannot be constructed or kept elsewhere.
pub struct Pending<'a> {
    blocking: bool,
    ids: &'a [SyscallUid],
}

impl<'a> Pending<'a> {
    pub(crate) fn new(blocking: bool, ids: &'a [SyscallUid]) -> Self {
        Self { blocking, ids }
    }

    /// True when the provider may block indefinitely. When false the call
    /// must return promptly.
    #[must_use]
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// The suspension points currently awaiting release on this domain.
    #[must_use]
    pub fn ids(&self) -> &[SyscallUid] {
        self.ids
    }

    /// Probes whether one suspension is still outstanding.
    #[must_use]
    pub fn is_pending(&self, uid: SyscallUid) -> bool {
        self.ids.contains(&uid)
    }

    /// True when no suspension is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// An instruction to release one suspension point.
///
/// Produced by the provider inside [`Events::select`]. The optional
/// pre-function runs before the suspended task is re-enqueued; if it (or
/// the syscall's own release callback) panics, the suspension is
/// discontinued and the owning task observes the failure on resumption.
pub struct ContinueRecord {
    uid: SyscallUid,
    pre: Option<Box<dyn FnOnce()>>,
}

impl ContinueRecord {
    /// Releases the suspension with no pre-function.
    #[must_use]
    pub fn new(uid: SyscallUid) -> Self {
        Self { uid, pre: None }
    }

    /// Releases the suspension, running `pre` first.
    #[must_use]
    pub fn with(uid: SyscallUid, pre: impl FnOnce() + 'static) -> Self {
        Self {
            uid,
            pre: Some(Box::new(pre)),
        }
    }

    pub(crate) fn into_parts(self) -> (SyscallUid, Option<Box<dyn FnOnce()>>) {
        (self.uid, self.pre)
    }
}

impl core::fmt::Debug for ContinueRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContinueRecord")
            .field("uid", &self.uid)
            .field("pre", &self.pre.is_some())
            .finish()
    }
}

/// Cross-domain handle that breaks an in-progress blocking select.
///
/// Must be safe to invoke concurrently with `select` and at any other
/// time; a spurious interrupt is harmless.
#[derive(Clone)]
pub struct Interrupter {
    hook: Arc<dyn Fn() + Send + Sync>,
}

impl Interrupter {
    /// Wraps an interrupt callback.
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            hook: Arc::new(hook),
        }
    }

    /// Causes any in-progress blocking select on the owning domain to
    /// return promptly.
    pub fn interrupt(&self) {
        (self.hook)();
    }
}

impl core::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Interrupter")
    }
}

/// A per-domain events provider.
///
/// Implementations integrate the scheduler with the outside world: timers,
/// sockets, whatever the embedder needs. The provider is created once per
/// domain by the factory given to the [`Builder`](crate::Builder) and never
/// leaves that domain.
pub trait Events: 'static {
    /// Reports or waits for external events.
    ///
    /// Returns continue records for the suspensions to release. When
    /// `pending.blocking()` is false the call must not block.
    fn select(&mut self, pending: &Pending<'_>) -> Vec<ContinueRecord>;

    /// Returns the handle peers use to break a blocking select.
    fn interrupter(&self) -> Interrupter;
}

/// Fallback provider used when the embedder supplies no factory.
///
/// It never produces events: a non-blocking select returns nothing and a
/// blocking select sleeps until interrupted. Programs that suspend under
/// this provider only resume through cancellation.
pub struct DefaultEvents {
    signal: Arc<DefaultSignal>,
}

struct DefaultSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl DefaultEvents {
    /// Creates the provider for one domain. The domain id is accepted for
    /// symmetry with real factories.
    #[must_use]
    pub fn new(_domain: DomainUid) -> Self {
        Self {
            signal: Arc::new(DefaultSignal {
                flag: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }
}

impl Events for DefaultEvents {
    fn select(&mut self, pending: &Pending<'_>) -> Vec<ContinueRecord> {
        if pending.blocking() {
            let mut interrupted = self.signal.flag.lock();
            while !*interrupted {
                self.signal.cond.wait(&mut interrupted);
            }
            *interrupted = false;
        }
        Vec::new()
    }

    fn interrupter(&self) -> Interrupter {
        let signal = Arc::clone(&self.signal);
        Interrupter::new(move || {
            *signal.flag.lock() = true;
            signal.cond.notify_all();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pending_probe() {
        let ids = [SyscallUid::new(1), SyscallUid::new(3)];
        let pending = Pending::new(false, &ids);
        assert!(pending.is_pending(SyscallUid::new(1)));
        assert!(!pending.is_pending(SyscallUid::new(2)));
        assert!(!pending.is_empty());
    }

    #[test]
    fn default_events_nonblocking_is_empty() {
        let mut events = DefaultEvents::new(DomainUid::MAIN);
        let out = events.select(&Pending::new(false, &[]));
        assert!(out.is_empty());
    }

    #[test]
    fn interrupter_breaks_blocking_select() {
        let mut events = DefaultEvents::new(DomainUid::MAIN);
        let interrupter = events.interrupter();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });
        let ids = [SyscallUid::new(1)];
        let out = events.select(&Pending::new(true, &ids));
        assert!(out.is_empty());
        handle.join().expect("interrupter thread");
    }
}
