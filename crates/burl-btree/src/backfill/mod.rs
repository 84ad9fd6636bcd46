//! Replication backfill.
//!
//! Backfill brings a recovering replica (the recipient) up to a peer's
//! state (the sender) without re-reading the whole key space. It runs in
//! two key-ordered streaming phases over the source trees:
//!
//! 1. **Pre phase**, on the recipient ([`pre_records`]): walk the
//!    recipient's tree and emit [`PreRecord`] ranges naming keys that may
//!    have changed locally since `since_when`, so the sender knows what to
//!    retransmit even where its own tree looks quiet.
//! 2. **Main phase**, on the sender ([`records`]): walk the sender's tree,
//!    merge it with the recipient's pre-record stream, and emit
//!    authoritative [`Record`]s plus empty-range milestones. Value bytes
//!    are loaded asynchronously under bounded concurrency while emission
//!    stays in strict key order.
//!
//! Both phases are cooperative: every consumer callback returns [`Flow`],
//! and `Flow::Abort` unwinds the phase without error. Interruption rides
//! the [`Cx`] passed in and surfaces as `BurlError::Interrupted`.

mod load;
mod pre;
mod prepare;
mod queue;

pub use queue::PreRecordQueue;

use std::sync::Arc;

use async_trait::async_trait;
use burl_cache::PageGuard;
use burl_error::Result;
use burl_types::{BlockRef, Cx, Flow, KeyRange, PreRecord, Record, RightBound, Signal, Timestamp};
use tracing::debug;

use crate::node::Node;
use crate::traversal::{concurrent_traversal, depth_first_traversal, Direction};
use crate::tree::{ReleasePolicy, Superblock};

/// Default bound on outstanding value loads in the main phase.
pub const LOAD_CONCURRENCY: usize = 32;

/// Recipient-side consumer of the pre phase's output.
#[async_trait]
pub trait PreRecordConsumer: Send {
    /// One pre-record, in ascending `range.left` order.
    async fn on_pre_record(&mut self, pre: PreRecord) -> Result<Flow>;

    /// Nothing more will be produced at or below `threshold`. Thresholds
    /// are monotone non-decreasing.
    async fn on_empty_range(&mut self, threshold: RightBound) -> Result<Flow>;
}

/// Sender-side consumer of the main phase's output.
///
/// `on_record` and `on_empty_range` are strictly serialized and arrive in
/// submission (key) order. `copy_value` is called concurrently while a
/// record's values load; implementations must be `Sync`.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// One fully value-resolved record.
    async fn on_record(&self, record: Record) -> Result<Flow>;

    /// Nothing more will be emitted at or below `threshold`.
    async fn on_empty_range(&self, threshold: RightBound) -> Result<Flow>;

    /// Load one out-of-line value. `page` pins the leaf the slot was read
    /// from for as long as the load needs it.
    async fn copy_value(
        &self,
        page: &PageGuard<Node>,
        slot: BlockRef,
        cx: &Cx,
    ) -> Result<Vec<u8>>;
}

/// The recipient's pre-record stream, viewed from the sender.
///
/// The traversal calls `consume_range` exactly once for every leaf-sized
/// or skipped range, in visit order; ranges are consecutive and
/// non-overlapping. `peek_range` may be called any number of times for
/// the range about to be consumed.
#[async_trait]
pub trait PreRecordProducer: Send {
    /// Whether any pre-record intersects `(left_excl, right_incl]`.
    async fn peek_range(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
    ) -> Result<(bool, Flow)>;

    /// Hand every pre-record intersecting `(left_excl, right_incl]` to
    /// `sink`, in key order, advancing the stream cursor past the range.
    async fn consume_range(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
        sink: &mut (dyn FnMut(PreRecord) + Send),
    ) -> Result<Flow>;
}

/// The milestone threshold for a subtree ending at `right_incl`, clamped
/// so watermarks never leave the requested window.
pub(crate) fn clamped_after(range: &KeyRange, right_incl: &[u8]) -> RightBound {
    RightBound::after(right_incl).min(range.right.clone())
}

/// Run the recipient-side pre phase over `range`.
///
/// Returns `Flow::Abort` iff a consumer call aborted; interruption
/// surfaces as `BurlError::Interrupted`.
pub async fn pre_records(
    superblock: &mut Superblock,
    release: ReleasePolicy,
    range: &KeyRange,
    since_when: Timestamp,
    pre_consumer: &mut (dyn PreRecordConsumer + '_),
    cx: &Cx,
) -> Result<Flow> {
    debug!(%since_when, %range, "backfill pre phase starting");
    let mut visitor = pre::PreRecordVisitor::new(range, since_when, pre_consumer);
    depth_first_traversal(
        superblock,
        range,
        &mut visitor,
        Direction::Forward,
        release,
        cx,
    )
    .await
}

/// Run the sender-side main phase over `range`.
///
/// The traversal prepares records whose values are unresolved block refs;
/// the loader resolves them through `record_consumer::copy_value` with at
/// most `load_concurrency` outstanding pair loads, then emits records and
/// milestones in key order. The loader is always drained before this
/// returns, so no page lock outlives the call.
///
/// Returns `Flow::Abort` iff the traversal aborted; a consumer abort that
/// lands after the traversal finished still drains cleanly and returns
/// `Flow::Continue` (the consumer saw its own verdict).
#[allow(clippy::too_many_arguments)]
pub async fn records(
    superblock: &mut Superblock,
    release: ReleasePolicy,
    range: &KeyRange,
    since_when: Timestamp,
    pre_producer: &mut (dyn PreRecordProducer + '_),
    record_consumer: Arc<dyn RecordConsumer>,
    load_concurrency: usize,
    cx: &Cx,
) -> Result<Flow> {
    debug!(%since_when, %range, load_concurrency, "backfill main phase starting");
    let abort = Signal::new();
    let mut loader =
        load::RecordLoader::new(record_consumer, load_concurrency, abort.clone(), cx.clone());

    let traversed = {
        let mut preparer =
            prepare::RecordPreparer::new(range, since_when, pre_producer, abort.clone(), &mut loader);
        concurrent_traversal(
            superblock,
            range,
            &mut preparer,
            Direction::Forward,
            release,
            cx,
        )
        .await
    };

    match traversed {
        Ok(Flow::Continue) => {
            loader.finish().await?;
            Ok(Flow::Continue)
        }
        Ok(Flow::Abort) => {
            abort.pulse();
            loader.finish().await?;
            Ok(Flow::Abort)
        }
        Err(err) => {
            // Tear the pipeline down but keep the traversal's error.
            abort.pulse();
            let _ = loader.finish().await;
            Err(err)
        }
    }
}
