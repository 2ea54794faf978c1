//! Core types: identifiers and task outcomes.

mod outcome;
mod uid;

pub use outcome::Outcome;
pub use uid::{DomainUid, ResourceUid, SyscallUid, TaskUid};
