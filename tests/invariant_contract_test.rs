//! Contract test: the ring and id paths really check their invariants.

use bytes::Bytes;
use crabcapture::device::CameraBuffer;
use crabcapture::invariant_ppt::{checked_invariants, clear_invariant_log, contract_test};
use crabcapture::metadata::{AeState, CameraMetadata};
use crabcapture::processors::zsl::ZslRing;
use crabcapture::request_ids::{RequestIdCounter, PREVIEW_REQUEST_IDS};

#[test]
fn capture_paths_check_their_invariants() {
    clear_invariant_log();

    let mut ring = ZslRing::new(2, 4, 1_000_000);
    for (id, ts) in [(1u64, 1_000_000i64), (2, 2_000_000), (3, 3_000_000)] {
        ring.push_buffer(CameraBuffer {
            id,
            stream_id: 1,
            timestamp: ts,
            data: Bytes::new(),
        });
        ring.push_frame(CameraMetadata::new().with_timestamp(ts).with_ae_state(AeState::Converged));
    }
    assert_eq!(ring.select_for_reprocess().unwrap().buffer.id, 3);

    let mut counter = RequestIdCounter::new(PREVIEW_REQUEST_IDS);
    counter.advance();

    contract_test(
        "capture paths",
        &[
            "ZSL ring never exceeds its depth",
            "ZSL reprocess only selects frames with settled exposure",
            "Request id stays inside its reserved range",
        ],
    );
    assert_eq!(checked_invariants().len(), 3);
}

#[test]
#[should_panic(expected = "CONTRACT FAILURE")]
fn unreached_invariant_fails_the_contract() {
    clear_invariant_log();
    contract_test("nothing ran", &["ZSL ring never exceeds its depth"]);
}
