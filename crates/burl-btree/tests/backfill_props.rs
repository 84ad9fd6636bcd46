//! Property tests over randomized replication histories.
//!
//! Each case builds a shared write history, derives the sender (full
//! history) and the recipient (a prefix), runs both backfill phases, and
//! checks the stream invariants plus round-trip convergence of the
//! recipient's replica state.

mod common;

use std::ops::Bound;
use std::sync::atomic::Ordering;

use burl_types::{Key, KeyRange, PreRecord, RightBound, Timestamp};
use proptest::prelude::*;

use common::{
    apply_records, live_in_range, pre_records_of, run_main, run_pre, state_at, tree_from_model,
    PreEvent, RecordEvent, Write,
};

const KEY_POOL: [&[u8]; 12] = [
    b"ant", b"bee", b"cat", b"dog", b"elk", b"fox", b"gnu", b"hen", b"ibis", b"jay", b"kite",
    b"lynx",
];

#[derive(Debug, Clone)]
struct Case {
    writes: Vec<(usize, Option<Vec<u8>>)>,
    since_raw: usize,
    horizon_extra: usize,
    prune_recipient: bool,
    leaf_capacity: usize,
    concurrency: usize,
    subrange: Option<(usize, usize)>,
}

fn case_strategy() -> impl Strategy<Value = Case> {
    (
        prop::collection::vec(
            (0..KEY_POOL.len(), prop::option::of(prop::collection::vec(any::<u8>(), 0..24))),
            0..36,
        ),
        0..40usize,
        0..40usize,
        any::<bool>(),
        1..5usize,
        1..6usize,
        prop::option::of((0..KEY_POOL.len(), 0..KEY_POOL.len())),
    )
        .prop_map(
            |(writes, since_raw, horizon_extra, prune_recipient, leaf_capacity, concurrency, subrange)| Case {
                writes,
                since_raw,
                horizon_extra,
                prune_recipient,
                leaf_capacity,
                concurrency,
                subrange,
            },
        )
}

struct Setup {
    history: Vec<Write>,
    since_when: Timestamp,
    horizon: Timestamp,
    range: KeyRange,
}

fn setup(case: &Case) -> Setup {
    let history: Vec<Write> = case
        .writes
        .iter()
        .enumerate()
        .map(|(i, (key_idx, value))| Write {
            key: KEY_POOL[*key_idx].to_vec(),
            ts: Timestamp::new(i as u64 + 1),
            value: value.clone(),
        })
        .collect();
    let n = history.len();
    let since = case.since_raw.min(n);
    let horizon = (since + case.horizon_extra).min(n);
    let range = match case.subrange {
        None => KeyRange::universe(),
        Some((a, b)) => {
            let (lo, hi) = if KEY_POOL[a] <= KEY_POOL[b] { (a, b) } else { (b, a) };
            KeyRange::from_bounds(Bound::Included(KEY_POOL[lo]), Bound::Included(KEY_POOL[hi]))
        }
    };
    Setup {
        history,
        since_when: Timestamp::new(since as u64),
        horizon: Timestamp::new(horizon as u64),
        range,
    }
}

fn check_pre_stream(events: &[PreEvent], range: &KeyRange) {
    let mut last_left: Option<Key> = None;
    let mut last_threshold: Option<RightBound> = None;
    for event in events {
        match event {
            PreEvent::Pre(pre) => {
                assert!(!pre.range.is_empty(), "pre-records never cover nothing");
                assert!(
                    pre.range.left.as_slice() >= range.left.as_slice()
                        && pre.range.right <= range.right,
                    "pre-record {} leaves the requested range {range}",
                    pre.range
                );
                if let Some(last) = &last_left {
                    assert!(
                        pre.range.left > *last,
                        "pre-record lefts must be strictly ascending"
                    );
                }
                last_left = Some(pre.range.left.clone());
            }
            PreEvent::Empty(threshold) => {
                if let Some(last) = &last_threshold {
                    assert!(
                        threshold >= last,
                        "pre-phase thresholds must be monotone"
                    );
                }
                last_threshold = Some(threshold.clone());
            }
        }
    }
}

fn check_record_stream(events: &[RecordEvent], range: &KeyRange, sender: &common::Model) {
    let mut last_left: Option<Key> = None;
    let mut last_right: Option<RightBound> = None;
    let mut last_threshold: Option<RightBound> = None;

    for (idx, event) in events.iter().enumerate() {
        match event {
            RecordEvent::Record(record) => {
                // Strictly ascending, disjoint ranges inside the request.
                if let Some(last) = &last_left {
                    assert!(
                        record.range.left > *last,
                        "record lefts must be strictly ascending"
                    );
                }
                if let Some(last) = &last_right {
                    assert!(
                        !last.covers(&record.range.left),
                        "records must not overlap"
                    );
                }
                assert!(
                    record.range.left.as_slice() >= range.left.as_slice()
                        && record.range.right <= range.right,
                    "record range {} leaves the requested range {range}",
                    record.range
                );
                last_left = Some(record.range.left.clone());
                last_right = Some(record.range.right.clone());

                // The next milestone must not fall behind this record.
                let next_threshold = events[idx + 1..].iter().find_map(|later| match later {
                    RecordEvent::Empty(threshold) => Some(threshold),
                    RecordEvent::Record(_) => None,
                });
                if let Some(threshold) = next_threshold {
                    assert!(
                        *threshold >= record.range.right,
                        "milestone {threshold} fell behind record range {}",
                        record.range
                    );
                }

                // Pair invariants plus soundness against the sender state.
                for pair in record.pairs.windows(2) {
                    assert!(pair[0].key < pair[1].key, "pairs must be sorted by key");
                }
                for pair in &record.pairs {
                    assert!(record.range.contains_key(&pair.key));
                    assert!(pair.recency >= record.min_deletion_timestamp);
                    let (recency, value) = sender
                        .get(&pair.key)
                        .unwrap_or_else(|| panic!("pair for unknown sender key"));
                    assert_eq!(*recency, pair.recency, "pair recency must match the sender");
                    match (&pair.value, value) {
                        (burl_types::PairValue::Resolved(got), Some(want)) => {
                            assert_eq!(got, want, "pair value must match the sender");
                        }
                        (burl_types::PairValue::Tombstone, None) => {}
                        (got, want) => panic!("pair {got:?} does not match sender value {want:?}"),
                    }
                }
            }
            RecordEvent::Empty(threshold) => {
                if let Some(last) = &last_threshold {
                    assert!(threshold >= last, "thresholds must be monotone");
                }
                last_threshold = Some(threshold.clone());
            }
        }
    }
}

fn run_case(case: &Case) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let Setup {
            history,
            since_when,
            horizon,
            range,
        } = setup(case);

        let sender_model = state_at(&history, Timestamp::new(history.len() as u64));
        let recipient_model = state_at(&history, horizon);

        // The recipient may have pruned tombstone history past the sync
        // point; the sender serves with full history.
        let recipient_floor = if case.prune_recipient {
            horizon
        } else {
            Timestamp::DISTANT_PAST
        };
        let recipient_tree = tree_from_model(
            &recipient_model,
            case.leaf_capacity,
            8,
            recipient_floor,
            recipient_floor,
        );
        let sender_tree = tree_from_model(
            &sender_model,
            case.leaf_capacity,
            8,
            Timestamp::DISTANT_PAST,
            Timestamp::DISTANT_PAST,
        );

        // Pre phase on the recipient.
        let (pre_flow, pre_events) = run_pre(&recipient_tree, &range, since_when).await;
        assert!(!pre_flow.is_abort());
        check_pre_stream(&pre_events, &range);
        let pres: Vec<PreRecord> = pre_records_of(&pre_events);

        // Main phase on the sender.
        let (flow, events, consumer) = run_main(
            &sender_tree,
            &range,
            since_when,
            pres.clone(),
            case.concurrency,
        )
        .await;
        assert!(!flow.is_abort());
        check_record_stream(&events, &range, &sender_model);
        assert!(
            consumer.max_outstanding.load(Ordering::SeqCst) <= case.concurrency,
            "outstanding value loads exceeded the configured bound"
        );

        // Round trip: applying the stream to the recipient's snapshot
        // converges its live state with the sender's over the range.
        let mut applied = recipient_model.clone();
        apply_records(&mut applied, &events);
        assert_eq!(
            live_in_range(&applied, &range),
            live_in_range(&sender_model, &range),
            "replica did not converge over {range}"
        );

        // Idempotence: the same inputs produce the same stream.
        let (again_flow, again_events, _) =
            run_main(&sender_tree, &range, since_when, pres, case.concurrency).await;
        assert!(!again_flow.is_abort());
        assert_eq!(events, again_events, "backfill must be deterministic");

        // And the pre phase is deterministic too.
        let (_, pre_again) = run_pre(&recipient_tree, &range, since_when).await;
        assert_eq!(pre_events, pre_again);
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_backfill_streams_are_ordered_sound_and_convergent(case in case_strategy()) {
        run_case(&case);
    }
}

#[test]
fn test_regression_whole_leaf_pre_records_still_converge() {
    // A hand-picked case: the recipient pruned history past the sync
    // point, so the pre phase asks for whole leaves.
    let case = Case {
        writes: vec![
            (0, Some(b"v0".to_vec())),
            (1, None),
            (2, Some(b"a-value-that-goes-to-a-block".to_vec())),
            (1, Some(b"v1".to_vec())),
            (3, None),
            (4, Some(b"v4".to_vec())),
        ],
        since_raw: 2,
        horizon_extra: 2,
        prune_recipient: true,
        leaf_capacity: 2,
        concurrency: 2,
        subrange: None,
    };
    run_case(&case);
}

#[test]
fn test_regression_subrange_with_deletions_converges() {
    let case = Case {
        writes: vec![
            (0, Some(b"x".to_vec())),
            (5, Some(b"y".to_vec())),
            (5, None),
            (9, Some(b"z".to_vec())),
            (0, None),
            (7, Some(b"w".to_vec())),
        ],
        since_raw: 1,
        horizon_extra: 0,
        prune_recipient: false,
        leaf_capacity: 1,
        concurrency: 1,
        subrange: Some((2, 9)),
    };
    run_case(&case);
}
