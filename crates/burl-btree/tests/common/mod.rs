//! Shared harness for the backfill integration suites: recording
//! consumers, a replica model, and helpers to run both phases end to end.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use burl_btree::backfill::{
    self, PreRecordConsumer, PreRecordQueue, RecordConsumer,
};
use burl_btree::fixture::{FixtureEntry, TreeBuilder};
use burl_btree::{Node, ReleasePolicy, Superblock, Tree};
use burl_cache::{Cache, PageGuard};
use burl_error::Result;
use burl_types::{
    BlockRef, Cx, Flow, Key, KeyRange, PairValue, PreRecord, Record, RightBound, Timestamp,
};
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Pre phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PreEvent {
    Pre(PreRecord),
    Empty(RightBound),
}

#[derive(Default)]
pub struct TestPreConsumer {
    pub events: Vec<PreEvent>,
    pub abort_after_pre_records: Option<usize>,
    pre_seen: usize,
}

#[async_trait]
impl PreRecordConsumer for TestPreConsumer {
    async fn on_pre_record(&mut self, pre: PreRecord) -> Result<Flow> {
        self.events.push(PreEvent::Pre(pre));
        self.pre_seen += 1;
        if self
            .abort_after_pre_records
            .is_some_and(|limit| self.pre_seen >= limit)
        {
            return Ok(Flow::Abort);
        }
        Ok(Flow::Continue)
    }

    async fn on_empty_range(&mut self, threshold: RightBound) -> Result<Flow> {
        self.events.push(PreEvent::Empty(threshold));
        Ok(Flow::Continue)
    }
}

/// Run the pre phase over `tree` and collect everything it emits.
pub async fn run_pre(
    tree: &Tree,
    range: &KeyRange,
    since_when: Timestamp,
) -> (Flow, Vec<PreEvent>) {
    let cx = Cx::new();
    let mut superblock = Superblock::acquire(tree, &cx).await.unwrap();
    let mut consumer = TestPreConsumer::default();
    let flow = backfill::pre_records(
        &mut superblock,
        ReleasePolicy::Release,
        range,
        since_when,
        &mut consumer,
        &cx,
    )
    .await
    .unwrap();
    (flow, consumer.events)
}

/// The pre-records of a pre-phase event stream.
pub fn pre_records_of(events: &[PreEvent]) -> Vec<PreRecord> {
    events
        .iter()
        .filter_map(|event| match event {
            PreEvent::Pre(pre) => Some(pre.clone()),
            PreEvent::Empty(_) => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Main phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    Record(Record),
    Empty(RightBound),
}

pub struct TestRecordConsumer {
    cache: Arc<Cache<Node>>,
    pub events: Mutex<Vec<RecordEvent>>,
    /// Return `Abort` from the nth record (1-based).
    pub abort_at_record: Option<usize>,
    records_seen: AtomicUsize,
    outstanding: AtomicUsize,
    pub max_outstanding: AtomicUsize,
}

impl TestRecordConsumer {
    pub fn new(cache: Arc<Cache<Node>>) -> Self {
        Self {
            cache,
            events: Mutex::new(Vec::new()),
            abort_at_record: None,
            records_seen: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
        }
    }

    pub fn events(&self) -> Vec<RecordEvent> {
        self.events.lock().clone()
    }

    pub fn record_count(&self) -> usize {
        self.records_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordConsumer for TestRecordConsumer {
    async fn on_record(&self, record: Record) -> Result<Flow> {
        assert!(
            record.is_fully_resolved(),
            "a record crossed the boundary with unresolved values"
        );
        let seen = self.records_seen.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.lock().push(RecordEvent::Record(record));
        if self.abort_at_record.is_some_and(|at| seen >= at) {
            return Ok(Flow::Abort);
        }
        Ok(Flow::Continue)
    }

    async fn on_empty_range(&self, threshold: RightBound) -> Result<Flow> {
        self.events.lock().push(RecordEvent::Empty(threshold));
        Ok(Flow::Continue)
    }

    async fn copy_value(
        &self,
        _page: &PageGuard<Node>,
        slot: BlockRef,
        cx: &Cx,
    ) -> Result<Vec<u8>> {
        let current = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let result = self.cache.read_block(cx, slot.block).await;
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Run the main phase over `tree`, feeding it `pres`, and collect
/// everything the consumer sees.
pub async fn run_main(
    tree: &Tree,
    range: &KeyRange,
    since_when: Timestamp,
    pres: Vec<PreRecord>,
    load_concurrency: usize,
) -> (Flow, Vec<RecordEvent>, Arc<TestRecordConsumer>) {
    run_main_with(
        tree,
        range,
        since_when,
        pres,
        load_concurrency,
        TestRecordConsumer::new(Arc::clone(tree.cache())),
    )
    .await
}

pub async fn run_main_with(
    tree: &Tree,
    range: &KeyRange,
    since_when: Timestamp,
    pres: Vec<PreRecord>,
    load_concurrency: usize,
    consumer: TestRecordConsumer,
) -> (Flow, Vec<RecordEvent>, Arc<TestRecordConsumer>) {
    let cx = Cx::new();
    let mut superblock = Superblock::acquire(tree, &cx).await.unwrap();
    let mut queue: PreRecordQueue = pres.into_iter().collect();
    let consumer = Arc::new(consumer);
    let flow = backfill::records(
        &mut superblock,
        ReleasePolicy::Release,
        range,
        since_when,
        &mut queue,
        Arc::<TestRecordConsumer>::clone(&consumer),
        load_concurrency,
        &cx,
    )
    .await
    .unwrap();
    let events = consumer.events();
    (flow, events, consumer)
}

// ---------------------------------------------------------------------------
// Replica model
// ---------------------------------------------------------------------------

/// Latest write per key: recency plus `Some(value)` or a tombstone.
pub type Model = BTreeMap<Key, (Timestamp, Option<Vec<u8>>)>;

/// One write in a replication history.
#[derive(Debug, Clone)]
pub struct Write {
    pub key: Key,
    pub ts: Timestamp,
    pub value: Option<Vec<u8>>,
}

/// Replica state after applying every write up to and including
/// `horizon`.
pub fn state_at(history: &[Write], horizon: Timestamp) -> Model {
    let mut model = Model::new();
    for write in history.iter().filter(|write| write.ts <= horizon) {
        model.insert(write.key.clone(), (write.ts, write.value.clone()));
    }
    model
}

/// Build a fixture tree holding `model` (tombstones included).
pub fn tree_from_model(
    model: &Model,
    leaf_capacity: usize,
    max_inline_value: usize,
    timestamp_floor: Timestamp,
    deletion_cutoff: Timestamp,
) -> Tree {
    TreeBuilder::new()
        .leaf_capacity(leaf_capacity)
        .fanout(3)
        .max_inline_value(max_inline_value)
        .timestamp_floor(timestamp_floor)
        .deletion_cutoff(deletion_cutoff)
        .entries(model.iter().map(|(key, (ts, value))| FixtureEntry {
            key: key.clone(),
            recency: *ts,
            value: value.clone(),
        }))
        .build()
}

/// Apply a main-phase event stream to a replica model, the way a
/// recipient would.
pub fn apply_records(model: &mut Model, events: &[RecordEvent]) {
    for event in events {
        let RecordEvent::Record(record) = event else {
            continue;
        };
        let listed: Vec<&[u8]> = record.pairs.iter().map(|pair| pair.key.as_slice()).collect();
        let doomed: Vec<Key> = model
            .iter()
            .filter(|(key, (recency, _))| {
                record.range.contains_key(key)
                    && !listed.contains(&key.as_slice())
                    && *recency < record.min_deletion_timestamp
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            model.remove(&key);
        }
        for pair in &record.pairs {
            let value = match &pair.value {
                PairValue::Resolved(bytes) => Some(bytes.clone()),
                PairValue::Tombstone => None,
                PairValue::Missing(_) => panic!("unresolved pair escaped the loader"),
            };
            model.insert(pair.key.clone(), (pair.recency, value));
        }
    }
}

/// The live (non-tombstone) subset of a model, restricted to `range`.
pub fn live_in_range(model: &Model, range: &KeyRange) -> BTreeMap<Key, (Timestamp, Vec<u8>)> {
    model
        .iter()
        .filter(|(key, _)| range.contains_key(key))
        .filter_map(|(key, (ts, value))| {
            value
                .as_ref()
                .map(|bytes| (key.clone(), (*ts, bytes.clone())))
        })
        .collect()
}
