//! In-memory tree fixtures.
//!
//! [`TreeBuilder`] assembles a tree from a flat entry list: entries are
//! grouped into leaves, leaves under internal nodes level by level, and
//! every edge caches its subtree's maximum recency. This is how tests and
//! examples get realistic trees without a write path; it is exported as a
//! first-class API for exactly that reason.

use std::collections::BTreeMap;
use std::sync::Arc;

use burl_cache::Cache;
use burl_types::{Key, Timestamp};

use crate::leaf::{LeafEntry, LeafNode, StoredValue};
use crate::node::{ChildRef, InternalNode, Node};
use crate::tree::Tree;

/// One entry to place in a fixture tree.
#[derive(Debug, Clone)]
pub struct FixtureEntry {
    pub key: Key,
    pub recency: Timestamp,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
}

impl FixtureEntry {
    /// A live entry.
    #[must_use]
    pub fn live(key: &[u8], recency: Timestamp, value: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            recency,
            value: Some(value.to_vec()),
        }
    }

    /// A deletion marker.
    #[must_use]
    pub fn tombstone(key: &[u8], recency: Timestamp) -> Self {
        Self {
            key: key.to_vec(),
            recency,
            value: None,
        }
    }
}

/// Builder for in-memory trees.
///
/// Defaults: four entries per leaf, fanout four, values longer than 16
/// bytes go to out-of-line blocks, full deletion history retained.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    leaf_capacity: usize,
    fanout: usize,
    max_inline_value: usize,
    timestamp_floor: Timestamp,
    deletion_cutoff: Timestamp,
    entries: BTreeMap<Key, (Timestamp, Option<Vec<u8>>)>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self {
            leaf_capacity: 4,
            fanout: 4,
            max_inline_value: 16,
            timestamp_floor: Timestamp::DISTANT_PAST,
            deletion_cutoff: Timestamp::DISTANT_PAST,
            entries: BTreeMap::new(),
        }
    }
}

impl TreeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries per leaf (at least 1).
    #[must_use]
    pub fn leaf_capacity(mut self, capacity: usize) -> Self {
        self.leaf_capacity = capacity.max(1);
        self
    }

    /// Children per internal node (at least 2).
    #[must_use]
    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(2);
        self
    }

    /// Largest value stored inline in a leaf; longer values go to blocks.
    #[must_use]
    pub fn max_inline_value(mut self, bytes: usize) -> Self {
        self.max_inline_value = bytes;
        self
    }

    /// Tombstone floor applied to every leaf: exact recencies below it
    /// are not tracked and tombstones below it are not guaranteed.
    #[must_use]
    pub fn timestamp_floor(mut self, floor: Timestamp) -> Self {
        self.timestamp_floor = floor;
        self
    }

    /// Deletion cutoff applied to every leaf: below it, leaves make no
    /// promises about deletions at all.
    #[must_use]
    pub fn deletion_cutoff(mut self, cutoff: Timestamp) -> Self {
        self.deletion_cutoff = cutoff;
        self
    }

    /// Add one entry. Later entries win on key collisions.
    #[must_use]
    pub fn entry(mut self, entry: FixtureEntry) -> Self {
        self.entries
            .insert(entry.key, (entry.recency, entry.value));
        self
    }

    /// Add many entries.
    #[must_use]
    pub fn entries(mut self, entries: impl IntoIterator<Item = FixtureEntry>) -> Self {
        for entry in entries {
            self.entries
                .insert(entry.key, (entry.recency, entry.value));
        }
        self
    }

    /// Materialize the tree into a fresh cache.
    #[must_use]
    pub fn build(self) -> Tree {
        let cache = Arc::new(Cache::new());
        if self.entries.is_empty() {
            return Tree::new(cache, None);
        }

        let all: Vec<(Key, (Timestamp, Option<Vec<u8>>))> = self.entries.into_iter().collect();
        let mut level: Vec<ChildRef> = Vec::new();
        for chunk in all.chunks(self.leaf_capacity) {
            let entries: Vec<LeafEntry> = chunk
                .iter()
                .map(|(key, (recency, value))| {
                    let value = value.as_ref().map(|bytes| {
                        if bytes.len() <= self.max_inline_value {
                            StoredValue::Inline(bytes.clone())
                        } else {
                            StoredValue::Block(cache.insert_block(bytes.clone()))
                        }
                    });
                    LeafEntry {
                        key: key.clone(),
                        recency: *recency,
                        value,
                    }
                })
                .collect();
            let leaf =
                LeafNode::with_watermarks(entries, self.timestamp_floor, self.deletion_cutoff);
            let max_recency = leaf.max_recency();
            let Some((last_key, _)) = chunk.last() else {
                continue;
            };
            let last_key = last_key.clone();
            let page = cache.insert_page(Node::Leaf(leaf), max_recency);
            level.push(ChildRef {
                page,
                last_key,
                max_recency,
            });
        }

        while level.len() > 1 {
            let mut parents: Vec<ChildRef> = Vec::new();
            for chunk in level.chunks(self.fanout) {
                let node = InternalNode::new(chunk.to_vec());
                let max_recency = node.max_recency();
                let Some(last_key) = node.last_key() else {
                    continue;
                };
                let last_key = last_key.to_vec();
                let page = cache.insert_page(Node::Internal(node), max_recency);
                parents.push(ChildRef {
                    page,
                    last_key,
                    max_recency,
                });
            }
            level = parents;
        }

        let root = level.first().map(|child| child.page);
        Tree::new(cache, root)
    }
}
