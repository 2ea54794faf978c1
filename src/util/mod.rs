//! Internal utilities.

mod catch;
mod det_rng;

pub(crate) use catch::{catch_failure, CatchUnwind};
pub(crate) use det_rng::DetRng;
