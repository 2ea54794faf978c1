//! Suspension-point conformance: make/suspend/continue, pre-functions,
//! discontinuation and per-domain uid allocation.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{init_test_logging, EchoEvents};
use parking_lot::Mutex;
use vigil::{Builder, ContinueRecord, Events, Interrupter, Outcome, Pending};

#[test]
fn released_suspension_resumes_with_its_callbacks() {
    init_test_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let result = Builder::new()
        .domains(0)
        .events(move |_uid| EchoEvents::new(Arc::clone(&seen_in)))
        .run(|ctx| async move {
            let released = Arc::new(AtomicBool::new(false));
            let syscall = ctx.make({
                let released = Arc::clone(&released);
                move || released.store(true, Ordering::SeqCst)
            });
            let uid = syscall.uid();
            let outcome = ctx.suspend(&syscall).await;
            (uid, outcome.is_ok(), released.load(Ordering::SeqCst))
        });
    let (uid, resumed, released) = result.unwrap();
    assert!(resumed);
    assert!(released);
    assert!(seen.lock().contains(&uid));
}

/// A provider whose pre-function fails, discontinuing the suspension.
struct FailingPre;

impl Events for FailingPre {
    fn select(&mut self, pending: &Pending<'_>) -> Vec<ContinueRecord> {
        pending
            .ids()
            .iter()
            .map(|&uid| ContinueRecord::with(uid, || panic!("pre-function refused")))
            .collect()
    }

    fn interrupter(&self) -> Interrupter {
        Interrupter::new(|| {})
    }
}

#[test]
fn failing_pre_function_discontinues_the_suspension() {
    init_test_logging();
    let result = Builder::new()
        .domains(0)
        .events(|_uid| FailingPre)
        .run(|ctx| async move {
            let syscall = ctx.make(|| ());
            ctx.suspend(&syscall).await
        });
    let err = result.unwrap().unwrap_err();
    assert_eq!(err.message(), "pre-function refused");
}

#[test]
fn syscall_uids_are_per_domain() {
    init_test_logging();
    let result = Builder::new().domains(2).run(|ctx| async move {
        let worker_uids = |tctx: vigil::Ctx| async move {
            let first = tctx.make(|| ());
            let second = tctx.make(|| ());
            (
                tctx.domain_uid(),
                first.uid().as_u64(),
                second.uid().as_u64(),
            )
        };
        let a = ctx.call(worker_uids);
        let b = ctx.call(worker_uids);
        let root_first = ctx.make(|| ()).uid().as_u64();
        let (da, a1, a2) = ctx.wait_exn(&a).await;
        let (db, b1, b2) = ctx.wait_exn(&b).await;
        assert_ne!(da, db, "round-robin must use two distinct workers");
        (root_first, a1, a2, b1, b2)
    });
    let (root_first, a1, a2, b1, b2) = result.unwrap();
    // Unique within a domain, but numbering restarts on each domain.
    assert_ne!(a1, a2);
    assert_ne!(b1, b2);
    assert_eq!(a1, b1);
    assert_eq!(root_first, a1);
}

#[test]
fn suspension_survives_unrelated_selects() {
    init_test_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = Arc::clone(&seen);
    let result = Builder::new()
        .domains(0)
        .events(move |_uid| EchoEvents::new(Arc::clone(&seen_in)))
        .run(|ctx| async move {
            // A few busy children force non-blocking selects while the
            // suspension is outstanding.
            let busy: Vec<_> = (0..3)
                .map(|n| {
                    ctx.call_cc(move |bctx| async move {
                        bctx.yield_now().await;
                        n
                    })
                })
                .collect();
            let syscall = ctx.make(|| ());
            let suspended = ctx.suspend(&syscall);
            let outcome = suspended.await;
            let outcomes = ctx.wait_all(busy).await;
            (outcome.is_ok(), outcomes.iter().all(Outcome::is_resolved))
        });
    let (resumed, all_resolved) = result.unwrap();
    assert!(resumed);
    assert!(all_resolved);
}
