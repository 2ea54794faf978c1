//! Resource-ledger conformance: ownership round-trips, leak detection,
//! transfer and gifting.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::init_test_logging;
use vigil::{Builder, Fatal, Outcome, SpawnOpts};

fn counter() -> (Arc<AtomicUsize>, impl FnOnce(()) + Send + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let finaliser = {
        let count = Arc::clone(&count);
        move |()| {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, finaliser)
}

#[test]
fn own_then_disown_round_trips() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let resource = ctx.own((), finaliser);
        ctx.check(&resource);
        ctx.disown(&resource);
    });
    assert!(result.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn holding_a_resource_across_a_normal_exit_leaks() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let _resource = ctx.own((), finaliser);
    });
    assert_eq!(result.unwrap_err(), Fatal::ResourceLeak);
    // The finaliser still ran, exactly once.
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn failing_child_runs_its_finaliser_once() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc(move |cctx| async move {
            let _resource = cctx.own((), finaliser);
            panic!("child blew up");
        });
        ctx.wait(&child).await
    });
    match result.unwrap() {
        Outcome::Failed(failure) => assert_eq!(failure.message(), "child blew up"),
        other => panic!("expected a failure, got {other:?}"),
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn transfer_makes_the_parent_responsible() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc(move |cctx| async move {
            let resource = cctx.own((), finaliser);
            cctx.transfer(&resource);
            resource
        });
        let resource = ctx.wait_exn(&child).await;
        ctx.check(&resource);
        ctx.disown(&resource);
    });
    assert!(result.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn ownership_probe_fails_after_transfer() {
    init_test_logging();
    let (_count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc(move |cctx| async move {
            let resource = cctx.own((), finaliser);
            cctx.transfer(&resource);
            // The transferred stub answers not-owner.
            cctx.check(&resource);
        });
        ctx.wait(&child).await
    });
    assert_eq!(result.unwrap_err(), Fatal::NotOwner);
}

#[test]
fn gifted_entry_must_be_disowned_by_both_sides() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let resource = ctx.own((), finaliser);
        let child = ctx.call_cc_with(SpawnOpts::new().give(&resource), {
            let resource = resource.clone();
            move |cctx| async move { cctx.disown(&resource) }
        });
        ctx.wait(&child).await.unwrap();
        ctx.disown(&resource);
    });
    assert!(result.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn gift_leaks_when_the_giver_forgets_to_disown() {
    init_test_logging();
    let (count, finaliser) = counter();
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let resource = ctx.own((), finaliser);
        let child = ctx.call_cc_with(SpawnOpts::new().give(&resource), {
            let resource = resource.clone();
            move |cctx| async move { cctx.disown(&resource) }
        });
        ctx.wait(&child).await.unwrap();
        // The giver's own entry is still held at exit.
    });
    assert_eq!(result.unwrap_err(), Fatal::ResourceLeak);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
