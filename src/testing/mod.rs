//! Testing utilities
//!
//! An in-memory capture device, a recording callback sink and synthetic
//! buffers and result frames, so the full client can be driven without
//! hardware.

pub mod mock_device;
pub mod recording_callbacks;
pub mod synthetic_data;

pub use mock_device::{MockCall, MockCameraDevice, MockOp};
pub use recording_callbacks::{CallbackEvent, RecordingCallbacks, TestPreviewWindow};
pub use synthetic_data::{
    synthetic_buffer, synthetic_jpeg, synthetic_jpeg_len, synthetic_result_frame, with_synthetic_faces,
    Synthetic3a,
};
