//! Tree handle and superblock.
//!
//! The tree metadata (currently just the root pointer) sits behind its own
//! read-write lock. A [`Superblock`] is a read-guard on that metadata: as
//! long as it is held, the root cannot be swapped underneath a traversal.
//! [`ReleasePolicy`] lets a caller choose whether a traversal drops the
//! superblock as soon as it has the root page (letting writers in early)
//! or holds it until the traversal finishes.

use std::sync::Arc;

use burl_cache::Cache;
use burl_error::{BurlError, Result};
use burl_types::{Cx, PageId};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::node::Node;

#[derive(Debug, Clone, Copy)]
struct TreeMeta {
    root: Option<PageId>,
}

/// Handle to one B-tree: root pointer plus the cache its pages live in.
#[derive(Debug, Clone)]
pub struct Tree {
    meta: Arc<RwLock<TreeMeta>>,
    cache: Arc<Cache<Node>>,
}

impl Tree {
    /// Create a tree rooted at `root` (or empty) over `cache`.
    #[must_use]
    pub fn new(cache: Arc<Cache<Node>>, root: Option<PageId>) -> Self {
        Self {
            meta: Arc::new(RwLock::new(TreeMeta { root })),
            cache,
        }
    }

    /// The cache holding this tree's pages and value blocks.
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache<Node>> {
        &self.cache
    }
}

/// Whether a traversal releases the superblock once it holds the root
/// page, or keeps it until the traversal completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Drop the superblock as soon as the root page is locked.
    Release,
    /// Hold the superblock for the traversal's whole lifetime.
    Keep,
}

/// A read-guard pinning the tree's root.
#[derive(Debug)]
pub struct Superblock {
    cache: Arc<Cache<Node>>,
    root: Option<PageId>,
    guard: Option<OwnedRwLockReadGuard<TreeMeta>>,
}

impl Superblock {
    /// Acquire the superblock, suspending while a metadata writer is
    /// active.
    pub async fn acquire(tree: &Tree, cx: &Cx) -> Result<Self> {
        cx.checkpoint()?;
        let guard = tokio::select! {
            guard = Arc::clone(&tree.meta).read_owned() => guard,
            () = cx.cancelled() => return Err(BurlError::Interrupted),
        };
        Ok(Self {
            cache: Arc::clone(&tree.cache),
            root: guard.root,
            guard: Some(guard),
        })
    }

    /// The root page observed at acquisition time.
    #[must_use]
    pub fn root(&self) -> Option<PageId> {
        self.root
    }

    /// The cache holding the tree's pages.
    #[must_use]
    pub fn cache(&self) -> &Arc<Cache<Node>> {
        &self.cache
    }

    /// Drop the metadata guard, letting writers move the root. The
    /// observed root pointer stays readable. Idempotent.
    pub fn release(&mut self) {
        self.guard = None;
    }

    /// Whether the metadata guard is still held.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}
