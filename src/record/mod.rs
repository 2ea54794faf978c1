//! Internal records for promises and tasks.

pub(crate) mod promise;
pub(crate) mod task;

pub use promise::Promise;
