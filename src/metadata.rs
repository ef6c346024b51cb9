//! Request and result metadata
//!
//! A [`CameraMetadata`] doubles as a capture request (what the device should
//! do) and as a result frame (what the device did). Only the fields the
//! capture pipeline reads or writes are modelled; each is optional because
//! devices are free to omit entries.

use crate::device::StreamId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AeState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

impl AeState {
    /// Exposure is settled enough to reuse a frame without metering.
    pub fn is_settled(self) -> bool {
        matches!(self, AeState::Converged | AeState::Locked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfState {
    #[default]
    Inactive,
    PassiveScan,
    PassiveFocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
    PassiveUnfocused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AwbState {
    #[default]
    Inactive,
    Searching,
    Converged,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AeMode {
    Off,
    #[default]
    On,
    OnAutoFlash,
    OnAlwaysFlash,
    OnAutoFlashRedeye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AfMode {
    #[default]
    Off,
    Auto,
    Macro,
    ContinuousVideo,
    ContinuousPicture,
    Edof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AwbMode {
    #[default]
    Off,
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
    CloudyDaylight,
    Twilight,
    Shade,
}

/// Flash unit control as written into a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlashControl {
    #[default]
    Off,
    Single,
    Torch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FaceDetectMode {
    #[default]
    Off,
    Simple,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureIntent {
    Custom,
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Capture,
    Reprocess,
}

/// Default request templates a device can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTemplate {
    Preview,
    StillCapture,
    VideoRecord,
    VideoSnapshot,
    ZeroShutterLag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartialResult {
    Final,
    Partial,
}

/// JPEG encoder settings carried by still-capture requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JpegSettings {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub thumbnail_quality: u8,
    pub orientation: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraMetadata {
    pub request_id: Option<i32>,
    pub frame_count: Option<i32>,
    pub request_type: Option<RequestType>,
    pub template: Option<RequestTemplate>,
    pub output_streams: Vec<StreamId>,
    pub input_streams: Vec<StreamId>,
    /// Timestamp of the input buffer a reprocess request consumes.
    pub input_buffer_timestamp: Option<i64>,
    pub capture_intent: Option<CaptureIntent>,
    pub sensor_timestamp: Option<i64>,

    pub ae_mode: Option<AeMode>,
    pub af_mode: Option<AfMode>,
    pub awb_mode: Option<AwbMode>,
    pub ae_state: Option<AeState>,
    pub af_state: Option<AfState>,
    pub awb_state: Option<AwbState>,
    pub af_trigger_id: Option<i32>,
    pub ae_precapture_id: Option<i32>,
    pub flash: Option<FlashControl>,
    pub video_stabilization: Option<bool>,

    pub face_detect_mode: Option<FaceDetectMode>,
    pub face_rectangles: Option<Vec<[i32; 4]>>,
    pub face_scores: Option<Vec<u8>>,
    pub face_landmarks: Option<Vec<[i32; 6]>>,
    pub face_ids: Option<Vec<i32>>,

    pub partial_result: Option<PartialResult>,
    pub jpeg: Option<JpegSettings>,
}

impl CameraMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_template(template: RequestTemplate) -> Self {
        Self {
            template: Some(template),
            request_type: Some(RequestType::Capture),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn with_request_id(mut self, id: i32) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_frame_count(mut self, count: i32) -> Self {
        self.frame_count = Some(count);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.sensor_timestamp = Some(timestamp);
        self
    }

    pub fn with_ae_state(mut self, state: AeState) -> Self {
        self.ae_state = Some(state);
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial_result == Some(PartialResult::Partial)
    }
}
