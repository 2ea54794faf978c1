//! The observable result of a task.
//!
//! An [`Outcome`] is what awaiting a promise yields once the task is
//! terminal. Severity increases from resolved to cancelled: when a task is
//! both resolved and cancelled, cancellation wins and the resolved value is
//! discarded.

use crate::error::Failure;

/// The terminal result of a task.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// The task returned a value.
    Resolved(T),
    /// The task closure panicked; the payload is captured in the failure.
    Failed(Failure),
    /// The task was cancelled before or after producing a result.
    Cancelled,
}

impl<T> Outcome<T> {
    /// Returns true if the task returned a value.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Returns true if the task failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if the task was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the resolved value, if any.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Resolved(v) => Some(v),
            Self::Failed(_) | Self::Cancelled => None,
        }
    }

    /// Maps the resolved value with `f`, leaving the other arms untouched.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Resolved(v) => Outcome::Resolved(f(v)),
            Self::Failed(e) => Outcome::Failed(e),
            Self::Cancelled => Outcome::Cancelled,
        }
    }

    /// Converts the outcome into a `Result`, rendering cancellation as a
    /// failure.
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Self::Resolved(v) => Ok(v),
            Self::Failed(e) => Err(e),
            Self::Cancelled => Err(Failure::new("task was cancelled")),
        }
    }

    /// Returns the resolved value.
    ///
    /// # Panics
    ///
    /// Panics if the outcome is failed or cancelled.
    pub fn unwrap(self) -> T {
        match self {
            Self::Resolved(v) => v,
            Self::Failed(e) => panic!("called unwrap on a failed outcome: {e}"),
            Self::Cancelled => panic!("called unwrap on a cancelled outcome"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Outcome::Resolved(1).is_resolved());
        assert!(Outcome::<()>::Failed(Failure::new("x")).is_failed());
        assert!(Outcome::<()>::Cancelled.is_cancelled());
    }

    #[test]
    fn map_and_ok() {
        assert_eq!(Outcome::Resolved(2).map(|v| v * 2).ok(), Some(4));
        assert_eq!(Outcome::<i32>::Cancelled.map(|v| v * 2).ok(), None);
    }

    #[test]
    fn into_result_renders_cancellation() {
        let err = Outcome::<()>::Cancelled.into_result().unwrap_err();
        assert_eq!(err.message(), "task was cancelled");
    }
}
