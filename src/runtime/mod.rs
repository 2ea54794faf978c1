//! Scheduler internals: configuration, the domain pool, per-domain
//! executors and the driver.

pub(crate) mod builder;
pub(crate) mod config;
pub(crate) mod domain;
pub(crate) mod pool;
pub(crate) mod shared;

pub use builder::Builder;
pub use config::{Config, DEFAULT_QUANTA, ENV_DOMAINS, ENV_QUANTA};
pub use domain::PollWrapper;
