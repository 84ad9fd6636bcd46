//! Buffered pre-record stream.
//!
//! The sender receives the recipient's pre-records over the wire ahead of
//! (or interleaved with) its own traversal. [`PreRecordQueue`] buffers
//! them and implements [`PreRecordProducer`] against the traversal's
//! consecutive-range consumption discipline. The recipient's leaf
//! boundaries are not the sender's: a buffered pre-record that straddles
//! the end of a consumed range is split, and the remainder stays queued
//! for the next range.

use std::collections::VecDeque;

use async_trait::async_trait;
use burl_error::Result;
use burl_types::{key_successor, Flow, KeyRange, PreRecord};

use super::PreRecordProducer;

/// In-memory, key-ordered pre-record buffer.
#[derive(Debug, Default)]
pub struct PreRecordQueue {
    queue: VecDeque<PreRecord>,
}

impl PreRecordQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pre-record. Pre-records must arrive in ascending,
    /// non-overlapping key order.
    pub fn push(&mut self, pre: PreRecord) {
        debug_assert!(
            self.queue.back().map_or(true, |back| {
                !back.range.overlaps(&pre.range) && back.range.left <= pre.range.left
            }),
            "pre-records must be pushed in ascending disjoint order"
        );
        self.queue.push_back(pre);
    }

    /// Number of buffered pre-records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl FromIterator<PreRecord> for PreRecordQueue {
    fn from_iter<I: IntoIterator<Item = PreRecord>>(iter: I) -> Self {
        let mut queue = Self::new();
        for pre in iter {
            queue.push(pre);
        }
        queue
    }
}

#[async_trait]
impl PreRecordProducer for PreRecordQueue {
    async fn peek_range(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
    ) -> Result<(bool, Flow)> {
        let window = KeyRange::leaf_range(left_excl, right_incl);
        let has = self
            .queue
            .front()
            .is_some_and(|front| front.range.overlaps(&window));
        Ok((has, Flow::Continue))
    }

    async fn consume_range(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
        sink: &mut (dyn FnMut(PreRecord) + Send),
    ) -> Result<Flow> {
        let window = KeyRange::leaf_range(left_excl, right_incl);
        loop {
            let Some(front) = self.queue.front() else { break };
            if !front.range.overlaps(&window) {
                break;
            }
            debug_assert!(
                front.range.left >= window.left,
                "pre-record stream fell behind the consumed ranges"
            );
            if front.range.right <= window.right {
                if let Some(pre) = self.queue.pop_front() {
                    sink(pre);
                }
            } else {
                // Straddles the range boundary: hand over the part inside
                // the window, keep the remainder queued.
                let clipped = front.range.intersection(&window);
                if let Some(front) = self.queue.front_mut() {
                    front.range.left = key_successor(right_incl);
                }
                if !clipped.is_empty() {
                    sink(PreRecord { range: clipped });
                }
                break;
            }
        }
        Ok(Flow::Continue)
    }
}
