use thiserror::Error;

/// Primary error type for Burl operations.
///
/// Structured variants for the common cases; interruption is an error kind
/// so it can propagate through `?` from any suspension point and be caught
/// at task boundaries.
#[derive(Error, Debug)]
pub enum BurlError {
    /// The operation was interrupted by a cancellation signal.
    ///
    /// Worker tasks catch this silently; it surfaces only at the API
    /// boundary as "incomplete due to interruption".
    #[error("operation interrupted")]
    Interrupted,

    /// A page referenced by the tree is not present in the cache.
    #[error("page {page} not found in cache")]
    PageMissing { page: u32 },

    /// A value block referenced by a leaf entry is not present in the cache.
    #[error("value block {block} not found in cache")]
    BlockMissing { block: u64 },

    /// On-page data violated a structural invariant.
    #[error("tree structure is malformed: {detail}")]
    Corrupt { detail: String },

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl BurlError {
    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Whether this error is the cancellation sentinel.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl From<burl_types::cx::Interrupted> for BurlError {
    fn from(_: burl_types::cx::Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Result type alias using `BurlError`.
pub type Result<T> = std::result::Result<T, BurlError>;
