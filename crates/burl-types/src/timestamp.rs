//! Logical timestamps ("recency") attached to every entry and subtree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A monotone logical timestamp.
///
/// Timestamps order replication events; they carry no wall-clock meaning.
/// [`Timestamp::DISTANT_PAST`] is the distinguished least element, older
/// than any timestamp a live write can carry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The least timestamp; predates every write.
    pub const DISTANT_PAST: Self = Self(0);

    /// Create a timestamp from its raw counter value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw counter value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::DISTANT_PAST {
            f.write_str("distant-past")
        } else {
            write!(f, "t{}", self.0)
        }
    }
}
