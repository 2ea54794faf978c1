//! Resource ownership and finalisation.

mod ledger;

pub use ledger::Resource;

pub(crate) use ledger::{Entry, EntryState, Ledger, Reap, ReapCell};
