//! Backfill stream value types.
//!
//! A backfill run is a key-ordered stream of [`PreRecord`]s (recipient to
//! sender: "retransmit these ranges") and [`Record`]s (sender to recipient:
//! authoritative contents plus deletion evidence), punctuated by empty-range
//! milestones carrying a [`RightBound`] watermark.

use serde::de::Deserializer;
use serde::ser::{Error as _, Serializer};
use serde::{Deserialize, Serialize};

use crate::range::{Key, KeyRange};
use crate::timestamp::Timestamp;
use crate::BlockId;

/// Location of an out-of-line value: which cache block holds it and how
/// long it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Cache block holding the value bytes.
    pub block: BlockId,
    /// Value length in bytes.
    pub len: u32,
}

/// The value side of a [`Pair`].
///
/// `Missing` exists only on the preparer-to-loader pipeline: it names the
/// block a value still has to be read from while the owning leaf is pinned.
/// The loader rewrites every `Missing` to `Resolved` before a record is
/// emitted, so only `Resolved` and `Tombstone` ever cross the external
/// boundary. Serialization enforces this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairValue {
    /// Value not yet loaded; resolves through the cache.
    Missing(BlockRef),
    /// Live value bytes.
    Resolved(Vec<u8>),
    /// Explicit deletion marker observed in the leaf.
    Tombstone,
}

impl PairValue {
    /// Whether this is a loaded live value.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Whether this is a deletion marker.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }

    /// Whether this value still needs loading.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

impl Serialize for PairValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Resolved(bytes) => serializer.serialize_some(bytes),
            Self::Tombstone => serializer.serialize_none(),
            Self::Missing(_) => Err(S::Error::custom(
                "unresolved value slot must not cross the record boundary",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for PairValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<Vec<u8>>::deserialize(deserializer)? {
            Some(bytes) => Self::Resolved(bytes),
            None => Self::Tombstone,
        })
    }
}

/// One key's contribution to a [`Record`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub key: Key,
    pub recency: Timestamp,
    pub value: PairValue,
}

/// Recipient-produced hint range: "I may be stale somewhere in here".
///
/// Pre-records are emitted in strictly ascending `range.left` order and
/// never overlap. A singleton range names one suspect key; a wider range
/// asks for wholesale retransmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreRecord {
    pub range: KeyRange,
}

/// Sender-produced authoritative content for one range.
///
/// Every key in `range` that is absent from `pairs` and whose recency at
/// the recipient is older than `min_deletion_timestamp` must be deleted by
/// the recipient; tombstones that old may have been pruned on the sender
/// and are not guaranteed to be listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub range: KeyRange,
    pub pairs: Vec<Pair>,
    pub min_deletion_timestamp: Timestamp,
}

impl Record {
    /// An empty record covering `range`: pure deletion evidence.
    #[must_use]
    pub const fn whole_range(range: KeyRange, min_deletion_timestamp: Timestamp) -> Self {
        Self {
            range,
            pairs: Vec::new(),
            min_deletion_timestamp,
        }
    }

    /// Clamp the record to `mask`, dropping pairs that fall outside.
    pub fn mask_in_place(&mut self, mask: &KeyRange) {
        self.range = self.range.intersection(mask);
        self.pairs.retain(|pair| mask.contains_key(&pair.key));
    }

    /// Whether every live value has been loaded.
    #[must_use]
    pub fn is_fully_resolved(&self) -> bool {
        self.pairs.iter().all(|pair| !pair.value.is_missing())
    }
}
