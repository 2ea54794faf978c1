//! Cancellation conformance: propagation, retroactive override, finaliser
//! runs and cross-domain interrupts.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use common::{init_test_logging, ms, sleep, timer_events};
use vigil::{Builder, Fatal, Outcome};

#[test]
fn cancel_before_first_poll_discards_the_task() {
    init_test_logging();
    let ran = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));
    let ran_in = Arc::clone(&ran);
    let observed_in = Arc::clone(&observed);
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc({
            let ran = Arc::clone(&ran_in);
            move |_ctx| async move { ran.store(true, Ordering::SeqCst) }
        });
        ctx.cancel(&child);
        observed_in.store(
            matches!(ctx.wait(&child).await, Outcome::Cancelled),
            Ordering::SeqCst,
        );
    });
    assert!(result.is_ok());
    assert!(observed.load(Ordering::SeqCst));
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn cancellation_wins_over_an_unconsumed_result() {
    init_test_logging();
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in = Arc::clone(&ran);
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc({
            let ran = Arc::clone(&ran_in);
            move |_ctx| async move {
                ran.store(true, Ordering::SeqCst);
                7_u32
            }
        });
        ctx.yield_now().await;
        ctx.yield_now().await;
        ctx.cancel(&child);
        ctx.wait(&child).await
    });
    // The closure ran to completion, yet awaiting observes cancellation.
    assert!(matches!(result.unwrap(), Outcome::Cancelled));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn cancellation_reaches_grandchildren_and_their_finalisers() {
    init_test_logging();
    let finalised = Arc::new(AtomicUsize::new(0));
    let finalised_in = Arc::clone(&finalised);
    let result = Builder::new().domains(0).run(move |ctx| async move {
        let child = ctx.call_cc({
            let finalised = Arc::clone(&finalised_in);
            move |cctx| async move {
                let grandchild = cctx.call_cc({
                    let finalised = Arc::clone(&finalised);
                    move |gctx| async move {
                        let _held = gctx.own((), {
                            let finalised = Arc::clone(&finalised);
                            move |()| {
                                finalised.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                        // Park forever; only cancellation gets us out.
                        let forever = gctx.make(|| ());
                        let _ = gctx.suspend(&forever).await;
                    }
                });
                cctx.wait(&grandchild).await
            }
        });
        ctx.yield_now().await;
        ctx.yield_now().await;
        ctx.yield_now().await;
        ctx.cancel(&child);
        ctx.wait(&child).await
    });
    assert!(matches!(result.unwrap(), Outcome::Cancelled));
    assert_eq!(finalised.load(Ordering::SeqCst), 1);
}

#[test]
fn cancel_after_consumption_is_a_structure_violation() {
    init_test_logging();
    let result = Builder::new().domains(0).run(|ctx| async move {
        let child = ctx.call_cc(|_ctx| async move { 5_u32 });
        let value = ctx.wait(&child).await.unwrap();
        ctx.cancel(&child);
        value
    });
    assert_eq!(result.unwrap_err(), Fatal::Cancelled);
}

#[test]
fn wait_first_prefers_a_resolved_tie() {
    init_test_logging();
    let result = Builder::new().domains(0).run(|ctx| async move {
        let failing = ctx.call_cc(|_ctx| async move { panic!("tie loser") });
        let resolving = ctx.call_cc(|_ctx| async move { 11_u32 });
        ctx.yield_now().await;
        ctx.yield_now().await;
        // Both are terminal by now; the earliest resolved entry wins even
        // though the failure sits first in the list.
        ctx.wait_first(vec![failing, resolving]).await
    });
    assert_eq!(result.unwrap().unwrap(), 11);
}

#[test]
fn wait_first_cancels_and_drains_the_sleeper() {
    init_test_logging();
    let (factory, registry) = timer_events();
    let started = Instant::now();
    let result = Builder::new()
        .domains(2)
        .events(factory)
        .run(move |ctx| async move {
            let quick = ctx.call({
                let registry = registry.clone();
                move |tctx| async move {
                    let _ = sleep(tctx, registry, ms(50)).await;
                    1_u32
                }
            });
            let slow = ctx.call({
                let registry = registry.clone();
                move |tctx| async move {
                    let _ = sleep(tctx, registry, ms(5000)).await;
                    2_u32
                }
            });
            ctx.wait_first(vec![quick, slow]).await
        });
    assert_eq!(result.unwrap().unwrap(), 1);
    // The sleeper was cancelled and drained, not waited out.
    assert!(started.elapsed() < ms(2500));
}

#[test]
fn cancel_interrupts_a_sleeping_peer_domain() {
    init_test_logging();
    let (factory, registry) = timer_events();
    let started = Instant::now();
    let result = Builder::new()
        .domains(1)
        .events(factory)
        .run(move |ctx| async move {
            let sleeper = ctx.call({
                let registry = registry.clone();
                move |tctx| async move {
                    let _ = sleep(tctx, registry, ms(10_000)).await;
                }
            });
            ctx.yield_now().await;
            ctx.cancel(&sleeper);
            ctx.wait(&sleeper).await
        });
    assert!(matches!(result.unwrap(), Outcome::Cancelled));
    assert!(started.elapsed() < ms(5000));
}
