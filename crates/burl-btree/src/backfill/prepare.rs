//! Sender-side record preparer.
//!
//! The preparer visits leaves on the sender, merges the recipient's
//! pre-record stream with leaf contents, and forwards records to the
//! loader with their values still unresolved. Every forward can suspend
//! on the loader's semaphore, which is what keeps the traversal from
//! racing ahead of value I/O.

use async_trait::async_trait;
use burl_cache::PageGuard;
use burl_error::{BurlError, Result};
use burl_types::{Flow, KeyRange, Pair, PairValue, Record, Signal, Timestamp};

use super::load::RecordLoader;
use super::{clamped_after, PreRecordProducer};
use crate::leaf::{self, StoredValue};
use crate::node::Node;
use crate::traversal::{DepthFirstVisitor, LeafStep, SubtreeStep};

pub(crate) struct RecordPreparer<'a> {
    range: &'a KeyRange,
    since_when: Timestamp,
    producer: &'a mut (dyn PreRecordProducer + 'a),
    abort: Signal,
    loader: &'a mut RecordLoader,
}

impl<'a> RecordPreparer<'a> {
    pub(crate) fn new(
        range: &'a KeyRange,
        since_when: Timestamp,
        producer: &'a mut (dyn PreRecordProducer + 'a),
        abort: Signal,
        loader: &'a mut RecordLoader,
    ) -> Self {
        Self {
            range,
            since_when,
            producer,
            abort,
            loader,
        }
    }

    /// Continue unless a loader worker pulsed the abort signal.
    fn get_continue(&self) -> Flow {
        if self.abort.is_pulsed() {
            Flow::Abort
        } else {
            Flow::Continue
        }
    }
}

#[async_trait]
impl DepthFirstVisitor for RecordPreparer<'_> {
    async fn filter_range_ts(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
        subtree_max_timestamp: Timestamp,
    ) -> Result<SubtreeStep> {
        let (has_pre_records, flow) = self.producer.peek_range(left_excl, right_incl).await?;
        if flow.is_abort() {
            return Ok(SubtreeStep::Abort);
        }
        if subtree_max_timestamp > self.since_when || has_pre_records {
            return Ok(match self.get_continue() {
                Flow::Continue => SubtreeStep::Descend,
                Flow::Abort => SubtreeStep::Abort,
            });
        }

        self.loader
            .on_empty_range(clamped_after(self.range, right_incl))
            .await?;
        // No pre-records in the range, but the producer cursor has to be
        // advanced anyway so consume calls stay consecutive.
        let flow = self
            .producer
            .consume_range(left_excl, right_incl, &mut |_pre| {
                unreachable!("range peeked empty but produced a pre-record")
            })
            .await?;
        if flow.is_abort() {
            return Ok(SubtreeStep::Abort);
        }
        Ok(match self.get_continue() {
            Flow::Continue => SubtreeStep::Skip,
            Flow::Abort => SubtreeStep::Abort,
        })
    }

    async fn handle_pre_leaf(
        &mut self,
        page: &PageGuard<Node>,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
    ) -> Result<LeafStep> {
        let Some(node) = page.payload().as_leaf() else {
            return Err(BurlError::internal("main phase visited a non-leaf page"));
        };
        let leaf_window = KeyRange::leaf_range(left_excl, right_incl).intersection(self.range);

        let cutoff = leaf::deletion_cutoff_timestamp(node, page.recency());
        if cutoff > self.since_when {
            // Deletion history behind since_when is gone from this leaf;
            // retransmit it wholesale as pure deletion evidence. A leaf
            // that only straddles the request contributes nothing.
            if !leaf_window.is_empty() {
                let record = Record::whole_range(leaf_window, cutoff);
                self.loader.on_record(record, Some(page.clone())).await?;
            }

            // The pre-records for this range are subsumed by the
            // whole-leaf record; drain them to stay consecutive.
            let flow = self
                .producer
                .consume_range(left_excl, right_incl, &mut |_pre| {})
                .await?;
            if flow.is_abort() {
                return Ok(LeafStep::Abort);
            }
            return Ok(match self.get_continue() {
                Flow::Continue => LeafStep::Consumed,
                Flow::Abort => LeafStep::Abort,
            });
        }

        let floor = leaf::min_deletion_timestamp(node, page.recency());

        // One empty record per pre-record intersecting the leaf.
        let mut from_pre: Vec<Record> = Vec::new();
        let flow = self
            .producer
            .consume_range(left_excl, right_incl, &mut |pre| {
                let range = pre.range.intersection(&leaf_window);
                if !range.is_empty() {
                    from_pre.push(Record::whole_range(range, floor));
                }
            })
            .await?;
        if flow.is_abort() {
            return Ok(LeafStep::Abort);
        }

        // Walk entries newest-first. An entry lands in the pre-aligned
        // record containing its key; failing that, a recent entry gets a
        // fresh singleton record and an old one is dropped.
        let since_when = self.since_when;
        let mut from_time: Vec<Record> = Vec::new();
        leaf::visit_entries(node, page.recency(), |key, recency, value| {
            if !leaf_window.contains_key(key) {
                return Flow::Continue;
            }
            if recency <= since_when && from_pre.is_empty() {
                // Recency-descending order: every remaining entry is at
                // least as old, and nothing is asking for old keys.
                return Flow::Abort;
            }
            let value = match value {
                None => PairValue::Tombstone,
                Some(StoredValue::Inline(bytes)) => PairValue::Resolved(bytes.clone()),
                Some(StoredValue::Block(slot)) => PairValue::Missing(*slot),
            };
            let pair = Pair {
                key: key.to_vec(),
                recency,
                value,
            };
            if let Some(record) = from_pre.iter_mut().find(|r| r.range.contains_key(key)) {
                debug_assert!(recency >= record.min_deletion_timestamp);
                record.pairs.push(pair);
            } else if recency > since_when {
                from_time.push(Record {
                    range: KeyRange::singleton(key),
                    pairs: vec![pair],
                    min_deletion_timestamp: Timestamp::DISTANT_PAST,
                });
            }
            Flow::Continue
        });

        // Entry visit order is recency, not key: sort the time-aligned
        // records and every record's pairs before forwarding.
        from_time.sort_by(|a, b| a.range.left.cmp(&b.range.left));
        let mut records = merge_by_left(from_pre, from_time);
        for record in &mut records {
            record.pairs.sort_by(|a, b| a.key.cmp(&b.key));
        }

        for record in records {
            self.loader.on_record(record, Some(page.clone())).await?;
        }
        self.loader
            .on_empty_range(clamped_after(self.range, right_incl))
            .await?;

        Ok(match self.get_continue() {
            Flow::Continue => LeafStep::Consumed,
            Flow::Abort => LeafStep::Abort,
        })
    }

    async fn handle_pair(
        &mut self,
        _key: &[u8],
        _recency: Timestamp,
        _value: Option<&StoredValue>,
    ) -> Result<Flow> {
        unreachable!("main phase consumes whole leaves")
    }
}

/// Merge two `range.left`-sorted, mutually disjoint record lists.
fn merge_by_left(pre: Vec<Record>, time: Vec<Record>) -> Vec<Record> {
    if pre.is_empty() {
        return time;
    }
    if time.is_empty() {
        return pre;
    }
    let mut merged = Vec::with_capacity(pre.len() + time.len());
    let mut pre = pre.into_iter();
    let mut time = time.into_iter();
    let mut next_pre = pre.next();
    let mut next_time = time.next();
    loop {
        match (next_pre.take(), next_time.take()) {
            (Some(a), Some(b)) => {
                debug_assert!(!a.range.overlaps(&b.range), "backfill records must be disjoint");
                if a.range.left <= b.range.left {
                    merged.push(a);
                    next_pre = pre.next();
                    next_time = Some(b);
                } else {
                    merged.push(b);
                    next_time = time.next();
                    next_pre = Some(a);
                }
            }
            (Some(a), None) => {
                merged.push(a);
                merged.extend(pre);
                break;
            }
            (None, Some(b)) => {
                merged.push(b);
                merged.extend(time);
                break;
            }
            (None, None) => break,
        }
    }
    merged
}
