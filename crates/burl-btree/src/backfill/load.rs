//! Ordered asynchronous record loader.
//!
//! The loader sits between the preparer and the record consumer. It
//! accepts records whose values are still unresolved block refs, loads
//! them through the consumer's `copy_value` under a concurrency bound,
//! and emits records and milestones downstream in exactly the order they
//! were submitted.
//!
//! The moving parts:
//!
//! - a counting semaphore caps outstanding pair loads; permits are taken
//!   on the submission path, so a saturated loader suspends the traversal
//!   itself (backpressure),
//! - a oneshot completion chain recovers submission order: each worker
//!   waits for its predecessor's sender before emitting, which also
//!   serializes every consumer call,
//! - a `JoinSet` drains workers in `finish`, so no worker (and no page
//!   guard a worker holds) outlives the loader,
//! - an abort [`Signal`] fans a consumer's `Abort` out to every worker
//!   still in flight.
//!
//! Interruption is caught silently inside workers: an interrupted worker
//! just never completes its turn, which cascades termination down the
//! chain.

use std::sync::Arc;

use burl_cache::PageGuard;
use burl_error::{BurlError, Result};
use burl_types::{BlockRef, Cx, PairValue, Record, RightBound, Signal};
use futures::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use super::RecordConsumer;
use crate::node::Node;

enum Emission {
    Record {
        record: Record,
        page: Option<PageGuard<Node>>,
    },
    EmptyRange(RightBound),
}

pub(crate) struct RecordLoader {
    consumer: Arc<dyn RecordConsumer>,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    abort: Signal,
    cx: Cx,
    tasks: JoinSet<()>,
    tail: Option<oneshot::Receiver<()>>,
    failure: Arc<Mutex<Option<BurlError>>>,
}

impl RecordLoader {
    pub(crate) fn new(
        consumer: Arc<dyn RecordConsumer>,
        capacity: usize,
        abort: Signal,
        cx: Cx,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            consumer,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            abort,
            cx,
            tasks: JoinSet::new(),
            tail: None,
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Submit a record for value resolution and ordered emission.
    ///
    /// Suspends while the semaphore is saturated; this is the
    /// backpressure coupling into the traversal. `page` pins the leaf the
    /// record's unresolved slots point into.
    pub(crate) async fn on_record(
        &mut self,
        record: Record,
        page: Option<PageGuard<Node>>,
    ) -> Result<()> {
        // A record wider than the whole semaphore still has to be
        // admissible, so its demand is clamped to the capacity.
        let permits = permit_count(record.pairs.len().clamp(1, self.capacity));
        self.submit(permits, Emission::Record { record, page }).await
    }

    /// Submit an empty-range milestone.
    pub(crate) async fn on_empty_range(&mut self, threshold: RightBound) -> Result<()> {
        self.submit(1, Emission::EmptyRange(threshold)).await
    }

    async fn submit(&mut self, permits: u32, emission: Emission) -> Result<()> {
        self.cx.checkpoint()?;
        let permit = tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_many_owned(permits) => {
                permit.map_err(|_| BurlError::internal("loader semaphore closed"))?
            }
            () = self.cx.cancelled() => return Err(BurlError::Interrupted),
        };

        let (done, turn_after) = oneshot::channel();
        let turn_before = self.tail.replace(turn_after);
        let worker = Worker {
            consumer: Arc::clone(&self.consumer),
            abort: self.abort.clone(),
            cx: self.cx.clone(),
            failure: Arc::clone(&self.failure),
        };
        self.tasks
            .spawn(worker.run(emission, permit, turn_before, done));
        Ok(())
    }

    /// Wait for every submitted worker to exit.
    ///
    /// On return no worker is alive and no page guard is held by the
    /// loader. Interruption makes workers wind down at their next
    /// suspension point and is surfaced here; the first non-interruption
    /// worker failure is surfaced too.
    pub(crate) async fn finish(&mut self) -> Result<()> {
        self.tail = None;
        while let Some(joined) = self.tasks.join_next().await {
            if joined.is_err() {
                let mut slot = self.failure.lock();
                if slot.is_none() {
                    *slot = Some(BurlError::internal("loader worker panicked"));
                }
            }
        }
        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        self.cx.checkpoint()?;
        Ok(())
    }
}

fn permit_count(demand: usize) -> u32 {
    u32::try_from(demand).unwrap_or(u32::MAX)
}

struct Worker {
    consumer: Arc<dyn RecordConsumer>,
    abort: Signal,
    cx: Cx,
    failure: Arc<Mutex<Option<BurlError>>>,
}

impl Worker {
    async fn run(
        self,
        emission: Emission,
        permit: OwnedSemaphorePermit,
        turn_before: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
    ) {
        let outcome = self.emit(emission, turn_before, done).await;
        drop(permit);
        if let Err(err) = outcome {
            if !err.is_interrupted() {
                debug!(error = %err, "loader worker failed");
                self.abort.pulse();
                let mut slot = self.failure.lock();
                if slot.is_none() {
                    *slot = Some(err);
                }
            }
        }
    }

    async fn emit(
        &self,
        emission: Emission,
        turn_before: Option<oneshot::Receiver<()>>,
        done: oneshot::Sender<()>,
    ) -> Result<()> {
        let emission = match emission {
            Emission::Record { record, page } => {
                let record = self.resolve(record, page.as_ref()).await?;
                // The leaf lock is only needed while slots resolve.
                drop(page);
                Emission::Record { record, page: None }
            }
            milestone @ Emission::EmptyRange(_) => milestone,
        };

        // Wait for the predecessor to clear. A dropped sender means the
        // pipeline is tearing down; terminate silently.
        if let Some(turn) = turn_before {
            tokio::select! {
                () = self.cx.cancelled() => return Err(BurlError::Interrupted),
                cleared = turn => {
                    if cleared.is_err() {
                        return Err(BurlError::Interrupted);
                    }
                }
            }
        }
        if self.cx.is_cancel_requested() {
            return Err(BurlError::Interrupted);
        }
        if self.abort.is_pulsed() {
            let _ = done.send(());
            return Ok(());
        }

        let flow = match emission {
            Emission::Record { record, .. } => {
                debug_assert!(record.is_fully_resolved());
                self.consumer.on_record(record).await
            }
            Emission::EmptyRange(threshold) => self.consumer.on_empty_range(threshold).await,
        };
        let flow = match flow {
            Ok(flow) => flow,
            Err(err) => {
                let _ = done.send(());
                return Err(err);
            }
        };
        if flow.is_abort() {
            self.abort.pulse();
        }
        let _ = done.send(());
        Ok(())
    }

    async fn resolve(&self, mut record: Record, page: Option<&PageGuard<Node>>) -> Result<Record> {
        let jobs: Vec<(usize, BlockRef)> = record
            .pairs
            .iter()
            .enumerate()
            .filter_map(|(idx, pair)| match pair.value {
                PairValue::Missing(slot) => Some((idx, slot)),
                _ => None,
            })
            .collect();
        if jobs.is_empty() {
            return Ok(record);
        }
        let Some(page) = page else {
            return Err(BurlError::internal(
                "record with unresolved values arrived without a page guard",
            ));
        };

        let loaded = try_join_all(jobs.into_iter().map(|(idx, slot)| {
            let consumer = Arc::clone(&self.consumer);
            let cx = self.cx.clone();
            let page = page.clone();
            async move {
                consumer
                    .copy_value(&page, slot, &cx)
                    .await
                    .map(|bytes| (idx, bytes))
            }
        }))
        .await?;
        for (idx, bytes) in loaded {
            record.pairs[idx].value = PairValue::Resolved(bytes);
        }
        Ok(record)
    }
}
