pub mod cx;
pub mod range;
pub mod record;
pub mod timestamp;

pub use cx::{Cx, Signal};
pub use range::{key_successor, Key, KeyRange, RightBound};
pub use record::{BlockRef, Pair, PairValue, PreRecord, Record};
pub use timestamp::Timestamp;

use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};

/// Cooperative continuation code returned by stream consumers and traversal
/// callbacks.
///
/// `Abort` is a normal early-termination request, not an error; failures
/// travel through `Result` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum Flow {
    /// Keep going.
    Continue,
    /// Stop producing; unwind cooperatively.
    Abort,
}

impl Flow {
    /// Whether this is an abort request.
    #[must_use]
    pub const fn is_abort(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// Identifier of a tree page held by the cache.
///
/// Page ids are 1-based; 0 is reserved so `Option<PageId>` stays
/// pointer-sized.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PageId(NonZeroU32);

impl PageId {
    /// Create a new page id from a raw u32. Returns `None` for 0.
    #[inline]
    pub const fn new(n: u32) -> Option<Self> {
        match NonZeroU32::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an out-of-line value block held by the cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct BlockId(NonZeroU64);

impl BlockId {
    /// Create a new block id from a raw u64. Returns `None` for 0.
    #[inline]
    pub const fn new(n: u64) -> Option<Self> {
        match NonZeroU64::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
