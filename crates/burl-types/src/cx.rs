//! Cancellation plumbing: broadcast signals and the `Cx` context.
//!
//! Every operation that can suspend takes `&Cx` and either polls it with
//! [`Cx::checkpoint`] (synchronous code) or races against
//! [`Cx::cancelled`] (async suspension points). Interruption is raised as
//! the [`Interrupted`] sentinel and caught silently inside worker tasks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Error sentinel raised when a cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation interrupted")
    }
}

impl std::error::Error for Interrupted {}

#[derive(Debug, Default)]
struct SignalInner {
    pulsed: AtomicBool,
    notify: Notify,
}

/// A one-shot broadcast condition.
///
/// Once pulsed it stays pulsed; every current and future waiter observes
/// it. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal, waking all waiters. Idempotent.
    pub fn pulse(&self) {
        self.inner.pulsed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_pulsed(&self) -> bool {
        self.inner.pulsed.load(Ordering::Acquire)
    }

    /// Suspend until the signal fires. Returns immediately if it already
    /// has.
    pub async fn wait(&self) {
        loop {
            if self.is_pulsed() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a pulse between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.is_pulsed() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancellation context threaded through every blocking operation.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancel: Signal,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; observed by every clone.
    pub fn cancel(&self) {
        self.cancel.pulse();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_pulsed()
    }

    /// Poll for cancellation from synchronous code.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_cancel_requested() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Suspend until cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.wait().await;
    }
}
