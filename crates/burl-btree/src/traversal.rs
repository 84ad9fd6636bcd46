//! Depth-first traversal under page read-locks.
//!
//! The traverser walks a tree in key order, handing each child edge to the
//! visitor's `filter_range_ts` **before** the child page is fetched, so a
//! visitor can skip a whole subtree using only the edge's cached recency.
//! Leaves go to `handle_pre_leaf`; a visitor that does not consume a leaf
//! wholesale gets its entries one at a time through `handle_pair`.
//!
//! Two variants share the contract: [`depth_first_traversal`] fetches
//! pages serially; [`concurrent_traversal`] issues sibling page fetches in
//! parallel for I/O pipelining but still delivers callbacks to the single
//! visitor in strict key order. Filter decisions themselves cannot be
//! reordered or batched: a backfill visitor's answer for one edge depends
//! on everything it consumed before it.

use std::sync::Arc;

use async_trait::async_trait;
use burl_cache::{Cache, PageGuard};
use burl_error::{BurlError, Result};
use burl_types::{Cx, Flow, Key, KeyRange, Timestamp};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::leaf::StoredValue;
use crate::node::Node;
use crate::tree::{ReleasePolicy, Superblock};

/// Traversal direction. Bounds reported to the visitor are unaffected;
/// only delivery order flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Visitor verdict for a child edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SubtreeStep {
    /// Fetch and descend into the subtree.
    Descend,
    /// Skip the subtree; the cursor advances past its last key.
    Skip,
    /// Terminate the traversal.
    Abort,
}

/// Visitor verdict for a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum LeafStep {
    /// The visitor handled the whole leaf; do not descend into entries.
    Consumed,
    /// Deliver the leaf's entries through `handle_pair`.
    VisitPairs,
    /// Terminate the traversal.
    Abort,
}

/// Depth-first traversal callbacks.
///
/// For every edge, `left_excl` is `None` on the leftmost edge and equals
/// the previous edge's `right_incl` otherwise; `right_incl` is the
/// greatest key in the edge's subtree. Callbacks for the same subtree
/// arrive in key order.
#[async_trait]
pub trait DepthFirstVisitor: Send {
    /// Decide whether a subtree with the given cached recency needs
    /// visiting. Called before the subtree's page is fetched.
    async fn filter_range_ts(
        &mut self,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
        subtree_max_timestamp: Timestamp,
    ) -> Result<SubtreeStep>;

    /// Visit a leaf under its page read-lock. The guard may be cloned to
    /// extend the lock past this call.
    async fn handle_pre_leaf(
        &mut self,
        leaf: &PageGuard<Node>,
        left_excl: Option<&[u8]>,
        right_incl: &[u8],
    ) -> Result<LeafStep>;

    /// Visit one leaf entry. Only reached when `handle_pre_leaf` returned
    /// [`LeafStep::VisitPairs`].
    async fn handle_pair(
        &mut self,
        key: &[u8],
        recency: Timestamp,
        value: Option<&StoredValue>,
    ) -> Result<Flow>;
}

/// Serial depth-first traversal of `range`.
pub async fn depth_first_traversal(
    superblock: &mut Superblock,
    range: &KeyRange,
    visitor: &mut (dyn DepthFirstVisitor + '_),
    direction: Direction,
    release: ReleasePolicy,
    cx: &Cx,
) -> Result<Flow> {
    traverse(superblock, range, visitor, direction, release, false, cx).await
}

/// Depth-first traversal with pipelined sibling page fetches.
pub async fn concurrent_traversal(
    superblock: &mut Superblock,
    range: &KeyRange,
    visitor: &mut (dyn DepthFirstVisitor + '_),
    direction: Direction,
    release: ReleasePolicy,
    cx: &Cx,
) -> Result<Flow> {
    traverse(superblock, range, visitor, direction, release, true, cx).await
}

async fn traverse(
    superblock: &mut Superblock,
    range: &KeyRange,
    visitor: &mut (dyn DepthFirstVisitor + '_),
    direction: Direction,
    release: ReleasePolicy,
    pipelined: bool,
    cx: &Cx,
) -> Result<Flow> {
    let Some(root) = superblock.root() else {
        if release == ReleasePolicy::Release {
            superblock.release();
        }
        return Ok(Flow::Continue);
    };
    let cache = Arc::clone(superblock.cache());
    let root_guard = cache.read(cx, root).await?;
    if release == ReleasePolicy::Release {
        superblock.release();
    }
    let mut walker = Walker {
        cache,
        range,
        visitor,
        direction,
        pipelined,
        cx,
    };
    walker.walk(root_guard, None).await
}

struct Walker<'a> {
    cache: Arc<Cache<Node>>,
    range: &'a KeyRange,
    visitor: &'a mut (dyn DepthFirstVisitor + 'a),
    direction: Direction,
    pipelined: bool,
    cx: &'a Cx,
}

/// Join handles for speculative child fetches. Unused fetches are aborted
/// on drop so a skip or an early abort does not leave readers running.
struct Prefetched {
    handles: Vec<Option<JoinHandle<Result<PageGuard<Node>>>>>,
}

impl Prefetched {
    fn empty(len: usize) -> Self {
        Self {
            handles: std::iter::repeat_with(|| None).take(len).collect(),
        }
    }

    fn set(&mut self, idx: usize, handle: JoinHandle<Result<PageGuard<Node>>>) {
        self.handles[idx] = Some(handle);
    }

    fn take(&mut self, idx: usize) -> Option<JoinHandle<Result<PageGuard<Node>>>> {
        self.handles[idx].take()
    }

    fn discard(&mut self, idx: usize) {
        if let Some(handle) = self.handles[idx].take() {
            handle.abort();
        }
    }
}

impl Drop for Prefetched {
    fn drop(&mut self) {
        for handle in self.handles.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

impl<'a> Walker<'a> {
    fn walk<'s>(
        &'s mut self,
        guard: PageGuard<Node>,
        left_excl: Option<Key>,
    ) -> BoxFuture<'s, Result<Flow>> {
        async move {
            if guard.payload().is_leaf() {
                self.visit_leaf(guard, left_excl).await
            } else {
                self.visit_internal(guard, left_excl).await
            }
        }
        .boxed()
    }

    async fn visit_leaf(&mut self, guard: PageGuard<Node>, left_excl: Option<Key>) -> Result<Flow> {
        let last_key = {
            let Some(leaf) = guard.payload().as_leaf() else {
                return Err(BurlError::internal("leaf visit reached an internal page"));
            };
            let Some(last_key) = leaf.last_key() else {
                return Ok(Flow::Continue);
            };
            last_key.to_vec()
        };

        let step = self
            .visitor
            .handle_pre_leaf(&guard, left_excl.as_deref(), &last_key)
            .await?;
        match step {
            LeafStep::Abort => Ok(Flow::Abort),
            LeafStep::Consumed => Ok(Flow::Continue),
            LeafStep::VisitPairs => {
                let Some(leaf) = guard.payload().as_leaf() else {
                    return Err(BurlError::internal("leaf visit reached an internal page"));
                };
                let entries = leaf.entries();
                let order: Vec<usize> = match self.direction {
                    Direction::Forward => (0..entries.len()).collect(),
                    Direction::Backward => (0..entries.len()).rev().collect(),
                };
                for idx in order {
                    let entry = &entries[idx];
                    if !self.range.contains_key(&entry.key) {
                        continue;
                    }
                    let recency = leaf.reported_recency(entry);
                    let flow = self
                        .visitor
                        .handle_pair(&entry.key, recency, entry.value.as_ref())
                        .await?;
                    if flow.is_abort() {
                        return Ok(Flow::Abort);
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    async fn visit_internal(
        &mut self,
        guard: PageGuard<Node>,
        left_excl: Option<Key>,
    ) -> Result<Flow> {
        let children = {
            let Node::Internal(node) = guard.payload() else {
                return Err(BurlError::internal("internal visit reached a leaf page"));
            };
            node.children().to_vec()
        };
        // Lock coupling: the parent's lock is not needed once the child
        // edges are copied out.
        drop(guard);

        let order: Vec<usize> = match self.direction {
            Direction::Forward => (0..children.len()).collect(),
            Direction::Backward => (0..children.len()).rev().collect(),
        };

        let edge_left_excl = |idx: usize| -> Option<&[u8]> {
            if idx == 0 {
                left_excl.as_deref()
            } else {
                Some(children[idx - 1].last_key.as_slice())
            }
        };

        let mut prefetched = Prefetched::empty(children.len());
        if self.pipelined {
            for &idx in &order {
                let child = &children[idx];
                let child_range = KeyRange::leaf_range(edge_left_excl(idx), &child.last_key);
                if !self.range.overlaps(&child_range) {
                    continue;
                }
                let cache = Arc::clone(&self.cache);
                let cx = self.cx.clone();
                let page = child.page;
                prefetched.set(idx, tokio::spawn(async move { cache.read(&cx, page).await }));
            }
        }

        for &idx in &order {
            let child = &children[idx];
            let lx = edge_left_excl(idx);
            let child_range = KeyRange::leaf_range(lx, &child.last_key);
            if !self.range.overlaps(&child_range) {
                continue;
            }

            let step = self
                .visitor
                .filter_range_ts(lx, &child.last_key, child.max_recency)
                .await?;
            match step {
                SubtreeStep::Abort => return Ok(Flow::Abort),
                SubtreeStep::Skip => {
                    trace!(page = %child.page, "subtree skipped");
                    prefetched.discard(idx);
                }
                SubtreeStep::Descend => {
                    let child_guard = match prefetched.take(idx) {
                        Some(handle) => handle
                            .await
                            .map_err(|err| {
                                BurlError::internal(format!("page prefetch task failed: {err}"))
                            })??,
                        None => self.cache.read(self.cx, child.page).await?,
                    };
                    let flow = self
                        .walk(child_guard, lx.map(<[u8]>::to_vec))
                        .await?;
                    if flow.is_abort() {
                        return Ok(Flow::Abort);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }
}
