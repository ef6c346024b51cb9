//! Property-based tests for the ZSL buffer/frame ring.
//!
//! Focus: bounded depth, FIFO eviction, every buffer handed back exactly
//! once, and reprocess selection only ever picking settled exposure.

use proptest::prelude::*;
use std::collections::BTreeMap;

use bytes::Bytes;
use crabcapture::device::CameraBuffer;
use crabcapture::errors::CameraError;
use crabcapture::metadata::{AeState, CameraMetadata};
use crabcapture::processors::zsl::ring::ZslRing;

const TOLERANCE_NS: i64 = 1_000_000;

#[derive(Debug, Clone)]
enum Op {
    Buffer { timestamp: i64 },
    Frame { timestamp: i64, ae: AeState },
}

fn ae_strategy() -> impl Strategy<Value = AeState> {
    prop_oneof![
        Just(AeState::Inactive),
        Just(AeState::Searching),
        Just(AeState::Converged),
        Just(AeState::Locked),
        Just(AeState::FlashRequired),
        Just(AeState::Precapture),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // Timestamps on a coarse grid so that matches actually happen
    prop_oneof![
        (0i64..64).prop_map(|t| Op::Buffer { timestamp: t * 500_000 }),
        ((0i64..64), ae_strategy()).prop_map(|(t, ae)| Op::Frame {
            timestamp: t * 500_000,
            ae
        }),
    ]
}

fn buffer(id: u64, timestamp: i64) -> CameraBuffer {
    CameraBuffer {
        id,
        stream_id: 7,
        timestamp,
        data: Bytes::new(),
    }
}

fn frame(timestamp: i64, ae: AeState) -> CameraMetadata {
    CameraMetadata::new().with_timestamp(timestamp).with_ae_state(ae)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_ring_is_bounded_fifo(
        depth in 1usize..8,
        ops in proptest::collection::vec(op_strategy(), 0..80),
    ) {
        let mut ring = ZslRing::new(depth, 8, TOLERANCE_NS);
        let mut next_id = 0u64;
        let mut expected: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                Op::Buffer { timestamp } => {
                    next_id += 1;
                    let evicted = ring.push_buffer(buffer(next_id, timestamp));
                    expected.push(next_id);
                    if expected.len() > depth {
                        let oldest = expected.remove(0);
                        prop_assert_eq!(evicted.map(|b| b.id), Some(oldest));
                    } else {
                        prop_assert!(evicted.is_none());
                    }
                }
                Op::Frame { timestamp, ae } => ring.push_frame(frame(timestamp, ae)),
            }
            prop_assert!(ring.len() <= ring.depth());
            prop_assert!(ring.frame_count() <= 8);
            prop_assert_eq!(ring.buffer_ids(), expected.clone());
        }
    }

    #[test]
    fn prop_every_buffer_released_once(
        depth in 1usize..6,
        ops in proptest::collection::vec(op_strategy(), 0..60),
    ) {
        let mut ring = ZslRing::new(depth, 8, TOLERANCE_NS);
        let mut released: BTreeMap<u64, usize> = BTreeMap::new();
        let mut pushed = 0u64;

        for op in ops {
            match op {
                Op::Buffer { timestamp } => {
                    pushed += 1;
                    if let Some(evicted) = ring.push_buffer(buffer(pushed, timestamp)) {
                        *released.entry(evicted.id).or_default() += 1;
                    }
                }
                Op::Frame { timestamp, ae } => ring.push_frame(frame(timestamp, ae)),
            }
        }
        for drained in ring.drain() {
            *released.entry(drained.id).or_default() += 1;
        }

        prop_assert!(ring.is_empty());
        prop_assert_eq!(released.len() as u64, pushed);
        prop_assert!(released.values().all(|count| *count == 1));
    }

    #[test]
    fn prop_selection_is_settled_match(
        ops in proptest::collection::vec(op_strategy(), 0..60),
    ) {
        let mut ring = ZslRing::new(4, 8, TOLERANCE_NS);
        let mut next_id = 0u64;
        for op in ops {
            match op {
                Op::Buffer { timestamp } => {
                    next_id += 1;
                    ring.push_buffer(buffer(next_id, timestamp));
                }
                Op::Frame { timestamp, ae } => ring.push_frame(frame(timestamp, ae)),
            }
        }

        match ring.select_for_reprocess() {
            Ok(pair) => {
                let matched = pair.frame.as_ref().expect("selected pair has a frame");
                prop_assert!(matched.ae_state.is_some_and(|s| s.is_settled()));
                let delta = matched.sensor_timestamp.map(|t| (t - pair.buffer.timestamp).abs());
                prop_assert!(delta.is_some_and(|d| d <= TOLERANCE_NS));
                prop_assert!(ring.contains_buffer(pair.buffer.id));
            }
            Err(e) => prop_assert_eq!(e, CameraError::NotEnoughData),
        }
    }
}

#[test]
fn unmatched_ring_has_nothing_to_reprocess() {
    let mut ring = ZslRing::new(4, 8, TOLERANCE_NS);
    ring.push_buffer(buffer(1, 10_000_000));
    ring.push_buffer(buffer(2, 20_000_000));
    assert_eq!(ring.select_for_reprocess().unwrap_err(), CameraError::NotEnoughData);
}

#[test]
fn closest_frame_wins_within_tolerance() {
    let mut ring = ZslRing::new(4, 8, TOLERANCE_NS);
    ring.push_frame(frame(10_000_000, AeState::Searching));
    ring.push_frame(frame(10_400_000, AeState::Converged));
    ring.push_buffer(buffer(1, 10_300_000));
    let pair = ring.select_for_reprocess().unwrap();
    assert_eq!(pair.frame.as_ref().and_then(|f| f.sensor_timestamp), Some(10_400_000));
}

#[test]
fn tolerance_boundary_is_inclusive() {
    let mut ring = ZslRing::new(4, 8, TOLERANCE_NS);
    ring.push_buffer(buffer(1, 0));
    ring.push_frame(frame(TOLERANCE_NS, AeState::Locked));
    assert_eq!(ring.matched_count(), 1);
}
