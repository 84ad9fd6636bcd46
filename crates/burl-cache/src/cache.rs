use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use burl_error::{BurlError, Result};
use burl_types::{BlockId, BlockRef, Cx, PageId, Timestamp};
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tracing::warn;

#[derive(Debug)]
struct PageSlot<P> {
    payload: P,
    recency: Timestamp,
}

/// A reference-counted read-lock on one page.
///
/// Cloning the guard extends the lock's lifetime; the page stays pinned
/// until the last clone drops. The backfill preparer relies on this to
/// attach the leaf to every in-flight record so value blocks stay
/// dereferenceable long after the traversal has moved on.
#[derive(Debug)]
pub struct PageGuard<P> {
    guard: Arc<OwnedRwLockReadGuard<PageSlot<P>>>,
}

impl<P> Clone for PageGuard<P> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<P> PageGuard<P> {
    /// The page contents.
    #[must_use]
    pub fn payload(&self) -> &P {
        &self.guard.payload
    }

    /// The page's cached recency: an upper bound on the recency of
    /// anything stored in the page's subtree.
    #[must_use]
    pub fn recency(&self) -> Timestamp {
        self.guard.recency
    }
}

/// In-memory page and value-block cache.
///
/// Pages live behind async read-write locks so readers suspend instead of
/// blocking a thread; value blocks are immutable once inserted.
#[derive(Debug)]
pub struct Cache<P> {
    pages: SyncRwLock<HashMap<PageId, Arc<RwLock<PageSlot<P>>>>>,
    blocks: SyncRwLock<HashMap<BlockId, Arc<[u8]>>>,
    next_page: AtomicU32,
    next_block: AtomicU64,
}

impl<P> Default for Cache<P> {
    fn default() -> Self {
        Self {
            pages: SyncRwLock::new(HashMap::new()),
            blocks: SyncRwLock::new(HashMap::new()),
            next_page: AtomicU32::new(1),
            next_block: AtomicU64::new(1),
        }
    }
}

impl<P> Cache<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a page, allocating its id.
    pub fn insert_page(&self, payload: P, recency: Timestamp) -> PageId {
        let raw = self.next_page.fetch_add(1, Ordering::Relaxed);
        let id = PageId::new(raw).unwrap_or_else(|| unreachable!("page counter starts at 1"));
        let slot = Arc::new(RwLock::new(PageSlot { payload, recency }));
        self.pages.write().insert(id, slot);
        id
    }

    /// Insert a value block, allocating its id.
    pub fn insert_block(&self, bytes: Vec<u8>) -> BlockRef {
        let raw = self.next_block.fetch_add(1, Ordering::Relaxed);
        let block = BlockId::new(raw).unwrap_or_else(|| unreachable!("block counter starts at 1"));
        // Lengths above 4 GiB saturate; the length is advisory.
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        self.blocks.write().insert(block, Arc::from(bytes));
        BlockRef { block, len }
    }

    /// Acquire a read-lock on a page, suspending while a writer holds it.
    pub async fn read(&self, cx: &Cx, page: PageId) -> Result<PageGuard<P>> {
        cx.checkpoint()?;
        let slot = self
            .pages
            .read()
            .get(&page)
            .cloned()
            .ok_or(BurlError::PageMissing { page: page.get() })?;
        let guard = tokio::select! {
            guard = slot.read_owned() => guard,
            () = cx.cancelled() => return Err(BurlError::Interrupted),
        };
        Ok(PageGuard {
            guard: Arc::new(guard),
        })
    }

    /// Fetch the bytes of a value block.
    pub async fn read_block(&self, cx: &Cx, block: BlockId) -> Result<Vec<u8>> {
        cx.checkpoint()?;
        let bytes = self.blocks.read().get(&block).cloned();
        match bytes {
            Some(bytes) => Ok(bytes.to_vec()),
            None => {
                warn!(%block, "value block missing from cache");
                Err(BurlError::BlockMissing { block: block.get() })
            }
        }
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Number of value blocks currently held.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}
