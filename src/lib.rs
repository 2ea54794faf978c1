//! Vigil: an availability-first cooperative task scheduler.
//!
//! # Overview
//!
//! Vigil schedules concurrent and parallel computations across worker
//! domains while keeping the program responsive to external events. Its
//! guiding principle is *availability over throughput*: at every
//! cooperation point the scheduler consults the embedder's events
//! provider, so the program never sits on computation while an event could
//! be serviced.
//!
//! # Core guarantees
//!
//! - **No orphan tasks**: every promise is owned by the task that created
//!   it and must be awaited or cancelled before the creator terminates.
//! - **Cancellation is a protocol**: a cancel request propagates to every
//!   transitive child, reaches suspended tasks on other domains, runs
//!   finalisers, and wins retroactively over an already-produced result.
//! - **Every effect yields**: spawning, awaiting, yielding, suspending and
//!   cancelling are all cooperation points; the event bridge is drained
//!   after each one.
//! - **Resources settle**: a task terminating abnormally has its held
//!   resources finalised; leaking one across a normal exit is a structural
//!   violation.
//!
//! # A tiny program
//!
//! ```
//! let total = vigil::Builder::new()
//!     .domains(2)
//!     .run(|ctx| async move {
//!         let doubled = ctx
//!             .parallel(|_ctx, n: u32| async move { n * 2 }, vec![1, 2, 3])
//!             .await;
//!         doubled.into_iter().map(|o| o.unwrap()).sum::<u32>()
//!     })
//!     .expect("scheduler run");
//! assert_eq!(total, 12);
//! ```
//!
//! # Module structure
//!
//! - [`types`]: identifiers and task outcomes
//! - [`error`]: task failures and uncatchable fatals
//! - [`events`]: the events-provider seam
//! - [`resource`]: resource ownership and finalisation
//! - [`record`]: promise records
//! - [`runtime`]: configuration, domain pool, executors, driver
//! - [`orphans`]: background-task collectors

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]

mod ctx;
pub mod error;
pub mod events;
pub mod orphans;
pub mod record;
pub mod resource;
pub mod runtime;
pub mod types;
pub(crate) mod util;

pub use ctx::{Ctx, SpawnOpts, Stats, Syscall};
pub use error::{Failure, Fatal};
pub use events::{ContinueRecord, DefaultEvents, Events, Interrupter, Pending};
pub use orphans::{Care, Orphans};
pub use record::Promise;
pub use resource::Resource;
pub use runtime::{Builder, Config, PollWrapper, DEFAULT_QUANTA, ENV_DOMAINS, ENV_QUANTA};
pub use types::{DomainUid, Outcome, ResourceUid, SyscallUid, TaskUid};

use std::future::Future;

/// Runs `f` as the root task with the environment-resolved configuration.
///
/// Convenience for `Builder::new().run(f)`; see [`Builder::run`] for the
/// full contract.
pub fn run<T, F, Fut>(f: F) -> Result<T, Fatal>
where
    T: 'static,
    F: FnOnce(Ctx) -> Fut + 'static,
    Fut: Future<Output = T> + 'static,
{
    Builder::new().run(f)
}
