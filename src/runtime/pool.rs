//! The domain pool.
//!
//! Holds one [`DomainShared`] handle per domain (index 0 is the domain
//! that called [`run`](crate::run)), the round-robin dispatch cursor for
//! parallel spawns, the shutdown flag and the fatal funnel through which
//! worker domains report structural violations back to the driver.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Fatal;
use crate::runtime::shared::DomainShared;
use crate::types::DomainUid;
use crate::util::DetRng;

pub(crate) struct Pool {
    domains: Vec<Arc<DomainShared>>,
    cursor: AtomicUsize,
    shutdown: AtomicBool,
    fatal: Mutex<Option<Fatal>>,
}

impl Pool {
    /// Builds the pool. The dispatch cursor starts at a seed-derived
    /// offset so that placement choices replay under a fixed seed.
    pub(crate) fn new(domains: Vec<Arc<DomainShared>>, seed: u64) -> Arc<Self> {
        let workers = domains.len().saturating_sub(1);
        let start = DetRng::new(seed).next_usize(workers.max(1));
        Arc::new(Self {
            domains,
            cursor: AtomicUsize::new(start),
            shutdown: AtomicBool::new(false),
            fatal: Mutex::new(None),
        })
    }

    /// The worker domains, excluding domain 0.
    pub(crate) fn workers(&self) -> &[Arc<DomainShared>] {
        &self.domains[1..]
    }

    /// Chooses a hosting domain for a parallel task.
    ///
    /// Eligible domains are the workers other than the caller; domain 0
    /// never hosts parallel tasks.
    pub(crate) fn dispatch(&self, caller: DomainUid) -> Result<Arc<DomainShared>, Fatal> {
        let eligible: Vec<&Arc<DomainShared>> = self
            .domains
            .iter()
            .skip(1)
            .filter(|d| d.uid != caller)
            .collect();
        if eligible.is_empty() {
            return Err(Fatal::NoDomainAvailable);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Ok(Arc::clone(eligible[index]))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Signals every domain to wind down and wakes them all.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for domain in &self.domains {
            domain.wake_owner();
        }
    }

    /// Records the first fatal and initiates shutdown.
    pub(crate) fn report_fatal(&self, fatal: Fatal) {
        self.fatal.lock().get_or_insert(fatal);
        self.begin_shutdown();
    }

    pub(crate) fn has_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    pub(crate) fn take_fatal(&self) -> Option<Fatal> {
        self.fatal.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(workers: u32) -> Arc<Pool> {
        let domains = (0..=workers)
            .map(|i| DomainShared::new(DomainUid::new(i)))
            .collect();
        Pool::new(domains, 0)
    }

    #[test]
    fn dispatch_never_picks_main_or_caller() {
        let pool = pool(3);
        for _ in 0..32 {
            let chosen = pool.dispatch(DomainUid::new(2)).unwrap();
            assert!(!chosen.uid.is_main());
            assert_ne!(chosen.uid, DomainUid::new(2));
        }
    }

    #[test]
    fn dispatch_rotates_over_workers() {
        let pool = pool(2);
        let first = pool.dispatch(DomainUid::MAIN).unwrap().uid;
        let second = pool.dispatch(DomainUid::MAIN).unwrap().uid;
        assert_ne!(first, second);
    }

    #[test]
    fn no_worker_means_no_domain() {
        let pool = pool(0);
        assert_eq!(
            pool.dispatch(DomainUid::MAIN).unwrap_err(),
            Fatal::NoDomainAvailable
        );
    }

    #[test]
    fn lone_worker_cannot_host_its_own_calls() {
        let pool = pool(1);
        assert_eq!(
            pool.dispatch(DomainUid::new(1)).unwrap_err(),
            Fatal::NoDomainAvailable
        );
        assert!(pool.dispatch(DomainUid::MAIN).is_ok());
    }

    #[test]
    fn fatal_report_keeps_the_first() {
        let pool = pool(1);
        pool.report_fatal(Fatal::NotAChild);
        pool.report_fatal(Fatal::ResourceLeak);
        assert_eq!(pool.take_fatal(), Some(Fatal::NotAChild));
    }
}
