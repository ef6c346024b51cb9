//! Burst capture for light-effect stills
//!
//! Multi-frame low-light and HDR captures are not supported by this client.
//! The sequencer still routes light-effect requests here so that they end
//! cleanly instead of falling through to a single-frame capture.

use crate::errors::CameraError;
use crate::metadata::CameraMetadata;

#[derive(Debug)]
pub struct BurstCapture {
    camera_id: i32,
}

impl BurstCapture {
    pub fn new(camera_id: i32) -> Self {
        Self { camera_id }
    }

    /// Always fails with `InvalidOperation`.
    pub fn start(&self, requests: &[CameraMetadata], first_capture_id: i32) -> Result<(), CameraError> {
        log::error!(
            "Camera {}: burst of {} captures from id {} requested, burst capture is not implemented",
            self.camera_id,
            requests.len(),
            first_capture_id
        );
        Err(CameraError::invalid_operation("burst capture is not implemented"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_rejected() {
        let burst = BurstCapture::new(0);
        let err = burst.start(&[CameraMetadata::new()], 30_000_000).unwrap_err();
        assert!(matches!(err, CameraError::InvalidOperation(_)));
    }
}
