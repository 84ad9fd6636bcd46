//! B-tree traversal and replication backfill.
//!
//! This crate owns the read-side tree machinery of Burl: the in-memory
//! node model, the leaf reader, depth-first traversal under page
//! read-locks, and the backfill engine built on top of them. Backfill is
//! how a recovering replica catches up: the recipient streams pre-records
//! naming the ranges it may be stale on, and the sender answers with a
//! key-ordered stream of authoritative records and watermark milestones.
//!
//! Entry points live in [`backfill`]: [`backfill::pre_records`] for the
//! recipient-side pre phase and [`backfill::records`] for the sender-side
//! main phase.

pub mod backfill;
pub mod fixture;
pub mod leaf;
pub mod node;
pub mod traversal;
pub mod tree;

pub use node::{ChildRef, InternalNode, Node};
pub use tree::{ReleasePolicy, Superblock, Tree};
