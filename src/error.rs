//! Error types and the two error channels of the runtime.
//!
//! The runtime distinguishes two kinds of trouble:
//!
//! - **Task-local failures** ([`Failure`]): a panic inside a task closure is
//!   caught at the task boundary and stored in the promise's result slot.
//!   Nobody observes it until the promise is awaited.
//! - **Uncatchable fatals** ([`Fatal`]): structural violations of the
//!   ownership discipline. These unwind through the scheduler, are never
//!   convertible into an ordinary failed result, and are reported to the
//!   caller of [`run`](crate::run). After a fatal the scheduler state is
//!   invalid and must be torn down.

use core::fmt;
use std::any::Any;

/// A captured task failure.
///
/// Wraps the panic payload of a task closure for transport across task and
/// domain boundaries. Only the rendered message survives; arbitrary payloads
/// are replaced by a placeholder.
#[derive(Debug, Clone)]
pub struct Failure {
    message: String,
}

impl Failure {
    /// Creates a failure with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Consumes the failure, returning the message.
    #[must_use]
    pub fn into_message(self) -> String {
        self.message
    }

    /// Extracts a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "opaque panic payload".to_owned()
        };
        Self { message }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task failed: {}", self.message)
    }
}

impl std::error::Error for Failure {}

/// Uncatchable structural violations.
///
/// A fatal is raised by the scheduler when user code breaks the ownership
/// rules that the structured-concurrency model depends on. Fatals unwind
/// through every task and are returned as the `Err` arm of
/// [`run`](crate::run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    /// A task terminated normally while its child set was non-empty.
    ///
    /// Every spawned promise must be awaited or cancelled by its creator;
    /// this includes promises attached to an orphan collector that were
    /// never retrieved.
    #[error("task terminated while it still has children")]
    StillHasChildren,

    /// `wait` or `cancel` was applied to a promise whose parent is not the
    /// calling task.
    #[error("promise is not a child of the calling task")]
    NotAChild,

    /// A resource operation named a handle the calling task does not hold.
    #[error("resource is not owned by the calling task")]
    NotOwner,

    /// A task terminated normally while a resource was still held.
    ///
    /// The finaliser is run before this fatal is raised.
    #[error("resource was still held when its owning task terminated")]
    ResourceLeak,

    /// No worker domain was eligible to host a parallel task.
    #[error("no worker domain is available")]
    NoDomainAvailable,

    /// A promise was cancelled after its result had already been consumed.
    #[error("promise was cancelled after its result was consumed")]
    Cancelled,
}

/// Panic payload used to carry a [`Fatal`] through the unwinder.
///
/// Task shells refuse to capture this payload, so it always escapes to the
/// top of the domain it was raised on.
pub(crate) struct FatalUnwind(pub(crate) Fatal);

/// Raises a fatal condition, unwinding through the scheduler.
pub(crate) fn raise(fatal: Fatal) -> ! {
    std::panic::panic_any(FatalUnwind(fatal))
}

/// Returns the fatal carried by a panic payload, if any.
pub(crate) fn fatal_of_panic(payload: &(dyn Any + Send)) -> Option<Fatal> {
    payload.downcast_ref::<FatalUnwind>().map(|f| f.0)
}
