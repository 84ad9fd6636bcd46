//! In-memory page and value-block cache.
//!
//! The cache hands out reference-counted read-locks on pages
//! ([`PageGuard`]) and serves out-of-line value blocks. It is the only
//! seam between the traversal layers and storage: everything above it
//! works in terms of guards and block refs, never raw maps.

mod cache;

pub use cache::{Cache, PageGuard};
