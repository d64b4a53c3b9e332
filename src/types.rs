//! Typed identifiers and sequence numbers shared by every component.
//!
//! Sequence numbers are 1-based; zero is reserved as the invalid value so that
//! a freshly defaulted struct never aliases a real position.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

macro_rules! sequence_number {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const INVALID: $name = $name(0);
            pub const MIN: $name = $name(1);
            pub const MAX: $name = $name(u64::MAX);

            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }

            pub const fn is_invalid(self) -> bool {
                self.0 == 0
            }

            /// Distance from `earlier` to `self`; saturates at zero.
            pub const fn distance_from(self, earlier: $name) -> u64 {
                self.0.saturating_sub(earlier.0)
            }

            pub const fn prev(self) -> Self {
                Self(self.0.saturating_sub(1))
            }

            pub const fn next(self) -> Self {
                Self(self.0.saturating_add(1))
            }
        }

        impl Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> Self::Output {
                $name(self.0.saturating_add(rhs))
            }
        }

        impl AddAssign<u64> for $name {
            fn add_assign(&mut self, rhs: u64) {
                self.0 = self.0.saturating_add(rhs);
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                $name(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

sequence_number!(
    /// Local log sequence number, assigned per replica at append time.
    Llsn
);
sequence_number!(
    /// Global log sequence number, minted only by the metadata repository.
    Glsn
);
sequence_number!(
    /// Counter of global commit rounds.
    Version
);

identifier!(ClusterId, u32);
identifier!(TopicId, i32);
identifier!(LogStreamId, i32);
identifier!(StorageNodeId, i32);
identifier!(
    /// Raft member identifier inside the metadata repository.
    NodeId,
    u64
);

/// Highest GLSN known to be committed cluster-wide.
pub type HighWatermark = Glsn;
