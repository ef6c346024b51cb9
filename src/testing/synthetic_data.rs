//! Synthetic buffers and result frames
//!
//! Shapes follow what a real HAL hands back: compressed images padded out to
//! the stream's maximum size, result frames carrying the full 3A block, and
//! face arrays in active-array coordinates.

use crate::device::{CameraBuffer, StreamId};
use crate::metadata::{
    AeState, AfMode, AfState, AwbMode, AwbState, CameraMetadata, FaceDetectMode, PartialResult,
};
use bytes::{BufMut, Bytes, BytesMut};

/// 3A values stamped into synthetic result frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Synthetic3a {
    pub ae_state: AeState,
    pub af_state: AfState,
    pub awb_state: AwbState,
    pub af_mode: AfMode,
    pub awb_mode: AwbMode,
    pub af_trigger_id: i32,
    pub ae_precapture_id: i32,
}

impl Default for Synthetic3a {
    fn default() -> Self {
        Self {
            ae_state: AeState::Converged,
            af_state: AfState::Inactive,
            awb_state: AwbState::Converged,
            af_mode: AfMode::Auto,
            awb_mode: AwbMode::Auto,
            af_trigger_id: 0,
            ae_precapture_id: 0,
        }
    }
}

/// A baseline JPEG of `payload_len` scan bytes followed by `padding` zero
/// bytes, like a blob buffer larger than the image it holds.
pub fn synthetic_jpeg(seed: u8, payload_len: usize, padding: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(payload_len + padding + 24);
    out.put_slice(&[0xFF, 0xD8]);
    // APP0 "JFIF"
    out.put_slice(&[0xFF, 0xE0, 0x00, 0x07, b'J', b'F', b'I', b'F', 0x00]);
    out.put_slice(&[0xFF, 0xDA, 0x00, 0x02]);
    for i in 0..payload_len {
        // Entropy-coded data never contains a bare 0xFF
        out.put_u8(seed.wrapping_add(i as u8) & 0x7F);
    }
    out.put_slice(&[0xFF, 0xD9]);
    out.put_bytes(0, padding);
    out.freeze()
}

/// Size of the image [`synthetic_jpeg`] writes before its padding.
pub fn synthetic_jpeg_len(payload_len: usize) -> usize {
    2 + 9 + 4 + payload_len + 2
}

pub fn synthetic_buffer(id: u64, stream_id: StreamId, timestamp: i64, len: usize) -> CameraBuffer {
    CameraBuffer {
        id,
        stream_id,
        timestamp,
        data: Bytes::from(vec![(id % 251) as u8; len]),
    }
}

/// A complete result frame for `request_id`.
pub fn synthetic_result_frame(request_id: i32, frame_count: i32, timestamp: i64, alg: Synthetic3a) -> CameraMetadata {
    let mut frame = CameraMetadata::new()
        .with_request_id(request_id)
        .with_frame_count(frame_count)
        .with_timestamp(timestamp)
        .with_ae_state(alg.ae_state);
    frame.af_state = Some(alg.af_state);
    frame.awb_state = Some(alg.awb_state);
    frame.af_mode = Some(alg.af_mode);
    frame.awb_mode = Some(alg.awb_mode);
    frame.af_trigger_id = Some(alg.af_trigger_id);
    frame.ae_precapture_id = Some(alg.ae_precapture_id);
    frame.face_detect_mode = Some(FaceDetectMode::Off);
    frame.partial_result = Some(PartialResult::Final);
    frame
}

/// Add `count` faces to `frame`, laid out left to right across the array.
pub fn with_synthetic_faces(mut frame: CameraMetadata, count: usize, array_width: u32, array_height: u32) -> CameraMetadata {
    let w = array_width as i32;
    let h = array_height as i32;
    let step = w / (count as i32 + 1);
    let mut rects = Vec::with_capacity(count);
    let mut landmarks = Vec::with_capacity(count);
    for i in 0..count as i32 {
        let cx = step * (i + 1);
        let cy = h / 2;
        rects.push([cx - step / 4, cy - step / 4, cx + step / 4, cy + step / 4]);
        landmarks.push([cx - step / 8, cy - step / 8, cx + step / 8, cy - step / 8, cx, cy + step / 8]);
    }
    frame.face_detect_mode = Some(FaceDetectMode::Full);
    frame.face_scores = Some((0..count).map(|i| 50 + i as u8).collect());
    frame.face_ids = Some((0..count as i32).collect());
    frame.face_rectangles = Some(rects);
    frame.face_landmarks = Some(landmarks);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::jpeg::find_jpeg_size;

    #[test]
    fn test_jpeg_trims_to_image() {
        let data = synthetic_jpeg(3, 100, 64);
        assert_eq!(find_jpeg_size(&data), synthetic_jpeg_len(100));
        assert_eq!(data.len(), synthetic_jpeg_len(100) + 64);
    }

    #[test]
    fn test_result_frame_has_3a_block() {
        let frame = synthetic_result_frame(10_000_000, 4, 1_000, Synthetic3a::default());
        assert_eq!(frame.request_id, Some(10_000_000));
        assert_eq!(frame.ae_state, Some(AeState::Converged));
        assert!(frame.ae_precapture_id.is_some());
        assert!(!frame.is_partial());
    }

    #[test]
    fn test_faces_inside_array() {
        let frame = with_synthetic_faces(CameraMetadata::new(), 3, 4000, 3000);
        let rects = frame.face_rectangles.unwrap();
        assert_eq!(rects.len(), 3);
        assert!(rects.iter().all(|r| r[0] >= 0 && r[2] < 4000 && r[1] >= 0 && r[3] < 3000));
    }
}
