//! Identifier types for runtime entities.
//!
//! All identifiers are allocated monotonically per domain: a `TaskUid` is
//! unique among the tasks hosted by one domain, but the same numeric value
//! may legally occur on another domain. Equality across domains therefore
//! requires pairing a uid with its [`DomainUid`].

use core::fmt;

/// Identifier of an execution domain.
///
/// Domain 0 is always the domain that called [`run`](crate::run); worker
/// domains are numbered from 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainUid(u32);

impl DomainUid {
    /// The domain that called [`run`](crate::run).
    pub const MAIN: Self = Self(0);

    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the numeric domain index.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true for the domain that called [`run`](crate::run).
    #[must_use]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for DomainUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainUid({})", self.0)
    }
}

impl fmt::Display for DomainUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "D{}", self.0)
    }
}

macro_rules! domain_local_uid {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub(crate) const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the numeric value, unique within the allocating domain.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

domain_local_uid!(
    /// Identifier of a task (and of the promise observing it).
    TaskUid,
    "T"
);

domain_local_uid!(
    /// Identifier of a user-declared suspension point.
    SyscallUid,
    "S"
);

domain_local_uid!(
    /// Identifier of an owned resource.
    ResourceUid,
    "R"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        assert_eq!(DomainUid::new(0).to_string(), "D0");
        assert_eq!(TaskUid::new(3).to_string(), "T3");
        assert_eq!(SyscallUid::new(1).to_string(), "S1");
        assert_eq!(ResourceUid::new(9).to_string(), "R9");
    }

    #[test]
    fn main_domain() {
        assert!(DomainUid::MAIN.is_main());
        assert!(!DomainUid::new(1).is_main());
    }
}
