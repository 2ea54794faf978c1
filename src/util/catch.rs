//! Panic isolation for task futures.
//!
//! Every task body is polled through [`CatchUnwind`], which converts an
//! escaping panic into a [`Failure`] at the poll boundary. Fatal payloads
//! are exempt: they are resumed immediately so that structural violations
//! unwind through the scheduler instead of becoming a task result.

use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::{Failure, FatalUnwind};

pub(crate) struct CatchUnwind<T> {
    fut: Pin<Box<dyn Future<Output = T>>>,
}

impl<T> CatchUnwind<T> {
    pub(crate) fn new(fut: Pin<Box<dyn Future<Output = T>>>) -> Self {
        Self { fut }
    }
}

impl<T> Future for CatchUnwind<T> {
    type Output = Result<T, Failure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match catch_unwind(AssertUnwindSafe(|| this.fut.as_mut().poll(cx))) {
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => {
                if payload.is::<FatalUnwind>() {
                    resume_unwind(payload);
                }
                Poll::Ready(Err(Failure::from_panic(payload)))
            }
        }
    }
}

/// Runs a callback, converting an escaping panic into a [`Failure`].
///
/// Fatal payloads are resumed, not captured.
pub(crate) fn catch_failure(f: impl FnOnce()) -> Result<(), Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => Ok(()),
        Err(payload) => {
            if payload.is::<FatalUnwind>() {
                resume_unwind(payload);
            }
            Err(Failure::from_panic(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_failure_captures_message() {
        let err = catch_failure(|| panic!("pop")).unwrap_err();
        assert_eq!(err.message(), "pop");
    }

    #[test]
    fn catch_failure_passes_success() {
        assert!(catch_failure(|| ()).is_ok());
    }
}
