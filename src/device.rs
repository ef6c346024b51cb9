//! Capture device capability interface
//!
//! The processors never talk to camera hardware directly. Everything they
//! need from the device (streams, repeating and one-shot requests, 3A
//! triggers, result frames, buffer hand-back) goes through [`CameraDevice`].
//! Buffers flow back out through [`StreamConsumer`] and
//! [`BufferReleasedListener`], and asynchronous device events through
//! [`NotificationListener`].

use crate::errors::CameraError;
use crate::metadata::{AeState, AfState, AwbState, CameraMetadata, FaceDetectMode, RequestTemplate};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::Duration;

pub type StreamId = i32;

/// Device HAL generation, which decides the ZSL implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceVersion {
    V2,
    V3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Implementation-defined preview/video format
    Opaque,
    /// Compressed still images
    Blob,
    RawSensor,
    /// Vendor zero-shutter-lag format
    Zsl,
    Ycrcb420Sp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFacing {
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Static device characteristics used to build default parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub facing: CameraFacing,
    pub array_width: u32,
    pub array_height: u32,
    pub max_faces: usize,
    pub best_face_detect_mode: FaceDetectMode,
    pub fixed_focus: bool,
    pub has_flash: bool,
    pub max_jpeg_size: usize,
    pub preview_sizes: Vec<(u32, u32)>,
    pub picture_sizes: Vec<(u32, u32)>,
    pub partial_results: bool,
    pub trigger_af_with_auto: bool,
    pub use_zsl_format: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            facing: CameraFacing::Back,
            array_width: 4000,
            array_height: 3000,
            max_faces: 8,
            best_face_detect_mode: FaceDetectMode::Full,
            fixed_focus: false,
            has_flash: true,
            max_jpeg_size: 4 * 1024 * 1024,
            preview_sizes: vec![(1920, 1080), (1280, 720), (640, 480)],
            picture_sizes: vec![(4000, 3000), (1920, 1080), (640, 480)],
            partial_results: false,
            trigger_af_with_auto: false,
            use_zsl_format: false,
        }
    }
}

/// An image buffer filled by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraBuffer {
    pub id: u64,
    pub stream_id: StreamId,
    pub timestamp: i64,
    pub data: Bytes,
}

/// Receives buffers the device finished filling on an output stream.
pub trait StreamConsumer: Send + Sync {
    fn on_buffer_available(&self, buffer: CameraBuffer);
}

/// Told when the device is done reading a buffer pushed back for reprocessing.
pub trait BufferReleasedListener: Send + Sync {
    fn on_buffer_released(&self, buffer_id: u64);
}

/// Asynchronous device events.
pub trait NotificationListener: Send + Sync {
    fn notify_error(&self, error_code: i32, arg1: i32, arg2: i32);
    fn notify_shutter(&self, request_id: i32, timestamp: i64);
    fn notify_auto_focus(&self, new_state: AfState, trigger_id: i32);
    fn notify_auto_exposure(&self, new_state: AeState, trigger_id: i32);
    fn notify_auto_whitebalance(&self, new_state: AwbState, trigger_id: i32);
}

/// The capture device as seen by the client and its processors.
///
/// Implementations must be callable from any thread and must not call back
/// into a consumer or listener while holding a lock that the same call
/// path could need again.
pub trait CameraDevice: Send + Sync {
    fn id(&self) -> i32;

    fn version(&self) -> DeviceVersion;

    fn info(&self) -> DeviceInfo;

    /// Whether the device emits 3A notifications itself.
    fn will_notify_3a(&self) -> bool;

    fn set_notify_callback(&self, listener: Option<Weak<dyn NotificationListener>>);

    fn create_stream(
        &self,
        consumer: Weak<dyn StreamConsumer>,
        width: u32,
        height: u32,
        format: PixelFormat,
        size: usize,
    ) -> Result<StreamId, CameraError>;

    /// A stream the device both fills and later reads back for reprocessing.
    fn create_input_output_stream(
        &self,
        consumer: Weak<dyn StreamConsumer>,
        released: Weak<dyn BufferReleasedListener>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<StreamId, CameraError>;

    fn create_reprocess_stream_from_stream(&self, output_id: StreamId) -> Result<StreamId, CameraError>;

    fn get_stream_info(&self, id: StreamId) -> Result<StreamInfo, CameraError>;

    fn set_stream_transform(&self, id: StreamId, transform: i32) -> Result<(), CameraError>;

    /// May fail with [`CameraError::Busy`] while requests still target the stream.
    fn delete_stream(&self, id: StreamId) -> Result<(), CameraError>;

    fn delete_reprocess_stream(&self, id: StreamId) -> Result<(), CameraError>;

    fn create_default_request(&self, template: RequestTemplate) -> Result<CameraMetadata, CameraError>;

    fn set_streaming_request(&self, request: &CameraMetadata) -> Result<(), CameraError>;

    fn clear_streaming_request(&self) -> Result<(), CameraError>;

    fn capture(&self, request: CameraMetadata) -> Result<(), CameraError>;

    fn wait_until_request_received(&self, request_id: i32, timeout: Duration) -> Result<(), CameraError>;

    fn wait_until_drained(&self) -> Result<(), CameraError>;

    /// Block until a result frame is queued, or fail with `TimedOut`.
    fn wait_for_next_frame(&self, timeout: Duration) -> Result<(), CameraError>;

    /// Pop the next queued result frame, if any.
    fn get_next_frame(&self) -> Result<Option<CameraMetadata>, CameraError>;

    fn trigger_autofocus(&self, trigger_id: i32) -> Result<(), CameraError>;

    fn trigger_cancel_autofocus(&self, trigger_id: i32) -> Result<(), CameraError>;

    fn trigger_precapture_metering(&self, trigger_id: i32) -> Result<(), CameraError>;

    fn push_reprocess_buffer(
        &self,
        reprocess_stream_id: StreamId,
        buffer: &CameraBuffer,
        listener: Weak<dyn BufferReleasedListener>,
    ) -> Result<(), CameraError>;

    /// Give a consumed output buffer back to the device.
    fn release_buffer(&self, stream_id: StreamId, buffer_id: u64) -> Result<(), CameraError>;

    fn disconnect(&self);
}
