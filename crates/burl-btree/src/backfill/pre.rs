//! Recipient-side pre phase.
//!
//! The pre-record visitor walks the recipient's tree and names the keys
//! the recipient may be stale on: everything that changed locally after
//! `since_when`, plus whole leaves whose tombstone history no longer
//! reaches back that far (a pruned tombstone cannot be named key by key).

use async_trait::async_trait;
use burl_cache::PageGuard;
use burl_error::{BurlError, Result};
use burl_types::{Flow, Key, KeyRange, PreRecord, Timestamp};

use super::{clamped_after, PreRecordConsumer};
use crate::leaf::{self, StoredValue};
use crate::node::Node;
use crate::traversal::{DepthFirstVisitor, LeafStep, SubtreeStep};

pub(crate) struct PreRecordVisitor<'a> {
    range: &'a KeyRange,
    since_when: Timestamp,
    consumer: &'a mut (dyn PreRecordConsumer + 'a),
}

impl<'a> PreRecordVisitor<'a> {
    pub(crate) fn new(
        range: &'a KeyRange,
        since_when: Timestamp,
        consumer: &'a mut (dyn PreRecordConsumer + 'a),
    ) -> Self {
        Self {
            range,
            since_when,
            consumer,
        }
    }
}

#[async_trait]
impl DepthFirstVisitor for PreRecordVisitor<'_> {
    async fn filter_range_ts(
        &mut self,
        _left_excl: Option<&[u8]>,
        right_incl: &[u8],
        subtree_max_timestamp: Timestamp,
    ) -> Result<SubtreeStep> {
        if subtree_max_timestamp > self.since_when {
            return Ok(SubtreeStep::Descend);
        }
        let flow = self
            .consumer
            .on_empty_range(clamped_after(self.range, right_incl))
            .await?;
        Ok(if flow.is_abort() {
            SubtreeStep::Abort
        } else {
            SubtreeStep::Skip
        })
    }

    async fn handle_pre_leaf(
        &mut self,
        page: &PageGuard<Node>,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
    ) -> Result<LeafStep> {
        let Some(node) = page.payload().as_leaf() else {
            return Err(BurlError::internal("pre phase visited a non-leaf page"));
        };
        let window = KeyRange::leaf_range(left_excl, right_incl).intersection(self.range);

        if leaf::min_deletion_timestamp(node, page.recency()) > self.since_when {
            // Tombstones newer than since_when may already be pruned here,
            // so individual stale keys cannot be named. Ask the sender for
            // the whole leaf.
            if window.is_empty() {
                return Ok(LeafStep::Consumed);
            }
            let flow = self.consumer.on_pre_record(PreRecord { range: window }).await?;
            return Ok(if flow.is_abort() {
                LeafStep::Abort
            } else {
                LeafStep::Consumed
            });
        }

        let since_when = self.since_when;
        let mut stale_keys: Vec<Key> = Vec::new();
        leaf::visit_entries(node, page.recency(), |key, recency, _: Option<&StoredValue>| {
            if !window.contains_key(key) {
                return Flow::Continue;
            }
            if recency <= since_when {
                // Entries arrive in descending recency order; the rest of
                // the leaf is at least as old.
                return Flow::Abort;
            }
            stale_keys.push(key.to_vec());
            Flow::Continue
        });
        stale_keys.sort();

        for key in stale_keys {
            let flow = self
                .consumer
                .on_pre_record(PreRecord {
                    range: KeyRange::singleton(&key),
                })
                .await?;
            if flow.is_abort() {
                return Ok(LeafStep::Abort);
            }
        }
        let flow = self
            .consumer
            .on_empty_range(clamped_after(self.range, right_incl))
            .await?;
        Ok(if flow.is_abort() {
            LeafStep::Abort
        } else {
            LeafStep::Consumed
        })
    }

    async fn handle_pair(
        &mut self,
        _key: &[u8],
        _recency: Timestamp,
        _value: Option<&StoredValue>,
    ) -> Result<Flow> {
        unreachable!("pre phase consumes whole leaves")
    }
}
