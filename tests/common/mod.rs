//! Shared test harness: log capture and a timer-backed events provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use vigil::{ContinueRecord, Ctx, Events, Failure, Interrupter, Pending, SyscallUid};

/// Initialises test logging once per process.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Per-domain timer state shared with the tasks that register sleeps.
pub struct TimerShared {
    inner: Mutex<TimerInner>,
    cond: Condvar,
}

struct TimerInner {
    deadlines: Vec<(SyscallUid, Instant)>,
    interrupted: bool,
}

impl TimerShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TimerInner {
                deadlines: Vec::new(),
                interrupted: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn register(&self, uid: SyscallUid, due: Instant) {
        self.inner.lock().deadlines.push((uid, due));
        self.cond.notify_all();
    }
}

/// Registry mapping domain ids to their timer state, shared between the
/// factory and the tasks calling [`sleep`].
pub type TimerRegistry = Arc<Mutex<HashMap<u32, Arc<TimerShared>>>>;

/// A timer-wheel events provider: releases suspensions when their
/// deadline passes, blocking until the nearest deadline when allowed.
pub struct TimerEvents {
    shared: Arc<TimerShared>,
}

impl Events for TimerEvents {
    fn select(&mut self, pending: &Pending<'_>) -> Vec<ContinueRecord> {
        let mut inner = self.shared.inner.lock();
        loop {
            inner.deadlines.retain(|(uid, _)| pending.is_pending(*uid));
            let now = Instant::now();
            let mut due = Vec::new();
            inner.deadlines.retain(|(uid, when)| {
                if *when <= now {
                    due.push(ContinueRecord::new(*uid));
                    false
                } else {
                    true
                }
            });
            if !due.is_empty() || !pending.blocking() {
                return due;
            }
            if inner.interrupted {
                inner.interrupted = false;
                return Vec::new();
            }
            let nearest = inner.deadlines.iter().map(|(_, when)| *when).min();
            match nearest {
                Some(when) => {
                    let timeout = when.saturating_duration_since(now);
                    let _ = self.shared.cond.wait_for(&mut inner, timeout);
                }
                None => self.shared.cond.wait(&mut inner),
            }
            if inner.interrupted {
                inner.interrupted = false;
                return Vec::new();
            }
        }
    }

    fn interrupter(&self) -> Interrupter {
        let shared = Arc::clone(&self.shared);
        Interrupter::new(move || {
            shared.inner.lock().interrupted = true;
            shared.cond.notify_all();
        })
    }
}

/// Builds a timer factory plus the registry tasks use to reach their
/// domain's timer state.
pub fn timer_events() -> (
    impl Fn(vigil::DomainUid) -> TimerEvents + Send + Sync + 'static,
    TimerRegistry,
) {
    let registry: TimerRegistry = Arc::new(Mutex::new(HashMap::new()));
    let handle = Arc::clone(&registry);
    let factory = move |uid: vigil::DomainUid| {
        let shared = TimerShared::new();
        handle.lock().insert(uid.as_u32(), Arc::clone(&shared));
        TimerEvents { shared }
    };
    (factory, registry)
}

/// Parks the calling task until `duration` has elapsed.
pub async fn sleep(ctx: Ctx, registry: TimerRegistry, duration: Duration) -> Result<(), Failure> {
    let syscall = ctx.make(|| ());
    let shared = {
        let map = registry.lock();
        Arc::clone(
            map.get(&ctx.domain_uid().as_u32())
                .expect("timer state registered for this domain"),
        )
    };
    shared.register(syscall.uid(), Instant::now() + duration);
    ctx.suspend(&syscall).await
}

/// An events provider that releases every pending suspension as soon as
/// it is asked, recording what it saw.
pub struct EchoEvents {
    pub seen: Arc<Mutex<Vec<SyscallUid>>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
}

impl EchoEvents {
    pub fn new(seen: Arc<Mutex<Vec<SyscallUid>>>) -> Self {
        Self {
            seen,
            signal: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }
}

impl Events for EchoEvents {
    fn select(&mut self, pending: &Pending<'_>) -> Vec<ContinueRecord> {
        let mut records = Vec::new();
        for &uid in pending.ids() {
            assert!(pending.is_pending(uid));
            self.seen.lock().push(uid);
            records.push(ContinueRecord::new(uid));
        }
        if records.is_empty() && pending.blocking() {
            let (flag, cond) = &*self.signal;
            let mut woken = flag.lock();
            while !*woken {
                cond.wait(&mut woken);
            }
            *woken = false;
        }
        records
    }

    fn interrupter(&self) -> Interrupter {
        let signal = Arc::clone(&self.signal);
        Interrupter::new(move || {
            let (flag, cond) = &*signal;
            *flag.lock() = true;
            cond.notify_all();
        })
    }
}
