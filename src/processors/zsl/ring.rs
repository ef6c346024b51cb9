//! Buffer/frame pairing for zero-shutter-lag capture
//!
//! Buffers and result frames arrive independently. Each buffer is parked in
//! a fixed-depth FIFO; each frame goes into a rolling list. Whenever either
//! side changes, unmatched buffers look for a frame with a close enough
//! sensor timestamp.

use crate::assert_invariant;
use crate::device::CameraBuffer;
use crate::errors::CameraError;
use crate::metadata::CameraMetadata;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct ZslPair {
    pub buffer: CameraBuffer,
    pub frame: Option<CameraMetadata>,
}

#[derive(Debug)]
pub struct ZslRing {
    depth: usize,
    frame_list_depth: usize,
    tolerance_ns: i64,
    queue: VecDeque<ZslPair>,
    frames: VecDeque<CameraMetadata>,
}

impl ZslRing {
    pub fn new(depth: usize, frame_list_depth: usize, tolerance_ns: i64) -> Self {
        Self {
            depth: depth.max(1),
            frame_list_depth: frame_list_depth.max(1),
            tolerance_ns,
            queue: VecDeque::with_capacity(depth),
            frames: VecDeque::with_capacity(frame_list_depth),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn matched_count(&self) -> usize {
        self.queue.iter().filter(|p| p.frame.is_some()).count()
    }

    pub fn contains_buffer(&self, buffer_id: u64) -> bool {
        self.queue.iter().any(|p| p.buffer.id == buffer_id)
    }

    /// Buffer ids from oldest to newest.
    pub fn buffer_ids(&self) -> Vec<u64> {
        self.queue.iter().map(|p| p.buffer.id).collect()
    }

    /// Admit a buffer. Returns the evicted oldest buffer when the ring was
    /// full; the caller owns releasing it.
    pub fn push_buffer(&mut self, buffer: CameraBuffer) -> Option<CameraBuffer> {
        let evicted = if self.queue.len() >= self.depth {
            self.queue.pop_front().map(|p| p.buffer)
        } else {
            None
        };

        self.queue.push_back(ZslPair { buffer, frame: None });
        assert_invariant!(
            self.queue.len() <= self.depth,
            "ZSL ring never exceeds its depth",
            "ZslRing::push_buffer"
        );

        self.find_matches();
        evicted
    }

    /// Record a result frame. Frames without a sensor timestamp cannot be
    /// matched and are dropped.
    pub fn push_frame(&mut self, frame: CameraMetadata) {
        if frame.sensor_timestamp.is_none() {
            log::error!("ZSL: result frame {:?} has no sensor timestamp", frame.frame_count);
            return;
        }
        if self.frames.len() >= self.frame_list_depth {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        self.find_matches();
    }

    fn find_matches(&mut self) {
        for pair in self.queue.iter_mut().filter(|p| p.frame.is_none()) {
            let ts = pair.buffer.timestamp;
            let closest = self
                .frames
                .iter()
                .filter_map(|f| f.sensor_timestamp.map(|t| ((t - ts).abs(), f)))
                .filter(|(delta, _)| *delta <= self.tolerance_ns)
                .min_by_key(|(delta, _)| *delta);
            if let Some((_, frame)) = closest {
                pair.frame = Some(frame.clone());
            }
        }
    }

    /// Newest buffered pair whose matched frame reports settled exposure.
    pub fn select_for_reprocess(&self) -> Result<&ZslPair, CameraError> {
        let found = self.queue.iter().rev().find(|pair| match &pair.frame {
            Some(frame) => match frame.ae_state {
                Some(state) => state.is_settled(),
                None => {
                    log::warn!("ZSL: matched frame {:?} has no AE state", frame.frame_count);
                    false
                }
            },
            None => false,
        });

        let result = found.ok_or(CameraError::NotEnoughData);
        assert_invariant!(
            result
                .as_ref()
                .map(|p| p.frame.as_ref().and_then(|f| f.ae_state).is_some_and(|s| s.is_settled()))
                .unwrap_or(true),
            "ZSL reprocess only selects frames with settled exposure",
            "ZslRing::select_for_reprocess"
        );
        result
    }

    /// Empty the ring, handing back every parked buffer for release.
    pub fn drain(&mut self) -> Vec<CameraBuffer> {
        self.frames.clear();
        self.queue.drain(..).map(|p| p.buffer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::AeState;
    use bytes::Bytes;

    fn buffer(id: u64, ts: i64) -> CameraBuffer {
        CameraBuffer {
            id,
            stream_id: 1,
            timestamp: ts,
            data: Bytes::new(),
        }
    }

    fn frame(ts: i64, ae: AeState) -> CameraMetadata {
        CameraMetadata::new().with_timestamp(ts).with_ae_state(ae)
    }

    #[test]
    fn test_fifo_eviction() {
        let mut ring = ZslRing::new(2, 8, 1_000_000);
        assert!(ring.push_buffer(buffer(1, 100)).is_none());
        assert!(ring.push_buffer(buffer(2, 200)).is_none());
        let evicted = ring.push_buffer(buffer(3, 300)).unwrap();
        assert_eq!(evicted.id, 1);
        assert_eq!(ring.buffer_ids(), vec![2, 3]);
    }

    #[test]
    fn test_frame_before_buffer_matches() {
        let mut ring = ZslRing::new(4, 8, 1_000_000);
        ring.push_frame(frame(5_000_000, AeState::Converged));
        ring.push_buffer(buffer(1, 5_000_500));
        assert_eq!(ring.matched_count(), 1);
    }

    #[test]
    fn test_outside_tolerance_does_not_match() {
        let mut ring = ZslRing::new(4, 8, 1_000_000);
        ring.push_buffer(buffer(1, 0));
        ring.push_frame(frame(2_000_000, AeState::Converged));
        assert_eq!(ring.matched_count(), 0);
        assert_eq!(ring.select_for_reprocess().unwrap_err(), CameraError::NotEnoughData);
    }

    #[test]
    fn test_select_prefers_newest_settled() {
        let mut ring = ZslRing::new(4, 8, 1_000_000);
        for (id, ts, ae) in [
            (1, 10_000_000, AeState::Converged),
            (2, 20_000_000, AeState::Locked),
            (3, 30_000_000, AeState::Searching),
        ] {
            ring.push_buffer(buffer(id, ts));
            ring.push_frame(frame(ts, ae));
        }
        assert_eq!(ring.select_for_reprocess().unwrap().buffer.id, 2);
    }

    #[test]
    fn test_frame_without_timestamp_is_dropped() {
        let mut ring = ZslRing::new(4, 8, 1_000_000);
        ring.push_frame(CameraMetadata::new().with_ae_state(AeState::Converged));
        assert_eq!(ring.frame_count(), 0);
    }

    #[test]
    fn test_drain_returns_all_buffers() {
        let mut ring = ZslRing::new(4, 8, 1_000_000);
        ring.push_buffer(buffer(1, 1));
        ring.push_buffer(buffer(2, 2));
        let drained: Vec<u64> = ring.drain().iter().map(|b| b.id).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(ring.is_empty());
    }
}
