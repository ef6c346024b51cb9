//! Camera parameters shared between the client and its processors
//!
//! [`Parameters`] is a plain value aggregate. It is only ever touched through
//! [`SharedParameters::lock`], and the guard must be dropped before any
//! client callback is invoked.

use crate::device::{CameraFacing, DeviceInfo};
use crate::errors::{recover, CameraError};
use crate::metadata::{
    AeMode, AfMode, AfState, AwbMode, CameraMetadata, FaceDetectMode, FlashControl, JpegSettings,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Client operating state. Ordering follows the declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CameraState {
    Disconnected,
    Stopped,
    WaitingForPreviewWindow,
    Preview,
    Record,
    StillCapture,
    VideoSnapshot,
}

impl fmt::Display for CameraState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CameraState::Disconnected => "DISCONNECTED",
            CameraState::Stopped => "STOPPED",
            CameraState::WaitingForPreviewWindow => "WAITING_FOR_PREVIEW_WINDOW",
            CameraState::Preview => "PREVIEW",
            CameraState::Record => "RECORD",
            CameraState::StillCapture => "STILL_CAPTURE",
            CameraState::VideoSnapshot => "VIDEO_SNAPSHOT",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusMode {
    Auto,
    Infinity,
    Macro,
    Fixed,
    Edof,
    ContinuousVideo,
    ContinuousPicture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashMode {
    Off,
    Auto,
    On,
    Torch,
    RedEye,
}

/// Vendor low-light / HDR still processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightFx {
    None,
    LowLight,
    Hdr,
}

/// Progress of an autofocus sweep as tracked for focus-move messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusState {
    Inactive,
    Scanning,
    Focused,
    Unfocused,
}

impl From<AfState> for FocusState {
    fn from(state: AfState) -> Self {
        match state {
            AfState::Inactive => FocusState::Inactive,
            AfState::PassiveScan | AfState::ActiveScan => FocusState::Scanning,
            AfState::PassiveFocused | AfState::FocusedLocked => FocusState::Focused,
            AfState::NotFocusedLocked | AfState::PassiveUnfocused => FocusState::Unfocused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Quirks {
    pub partial_results: bool,
    pub trigger_af_with_auto: bool,
    pub use_zsl_format: bool,
}

/// Static info read once at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastInfo {
    pub array_width: u32,
    pub array_height: u32,
    pub max_faces: usize,
    pub best_face_detect_mode: FaceDetectMode,
    pub max_jpeg_size: usize,
    pub facing: CameraFacing,
    pub fixed_focus: bool,
}

/// The client-settable subset of [`Parameters`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub preview_size: Size,
    pub video_size: Size,
    pub picture_size: Size,
    pub jpeg_quality: u8,
    pub jpeg_thumb_size: Size,
    pub jpeg_thumb_quality: u8,
    pub jpeg_rotation: i32,
    pub flash_mode: FlashMode,
    pub focus_mode: FocusMode,
    pub white_balance: AwbMode,
    pub zsl_mode: bool,
    pub recording_hint: bool,
    pub video_stabilization: bool,
    pub light_fx: LightFx,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub camera_id: i32,
    pub state: CameraState,

    pub preview_size: Size,
    pub video_size: Size,
    pub picture_size: Size,
    pub jpeg_quality: u8,
    pub jpeg_thumb_size: Size,
    pub jpeg_thumb_quality: u8,
    pub jpeg_rotation: i32,
    pub flash_mode: FlashMode,
    pub focus_mode: FocusMode,
    /// Focus mode the client asked for while a quirk forces another one.
    pub shadow_focus_mode: Option<FocusMode>,
    pub white_balance: AwbMode,
    pub zsl_mode: bool,
    pub recording_hint: bool,
    pub video_stabilization: bool,
    pub light_fx: LightFx,

    pub enable_face_detect: bool,
    pub enable_focus_move_messages: bool,
    pub af_in_motion: bool,
    pub focus_state: FocusState,
    pub play_shutter_sound: bool,
    pub store_metadata_in_buffers: bool,
    pub preview_callback_flags: u32,
    pub preview_transform: i32,

    pub af_trigger_counter: i32,
    pub current_af_trigger_id: i32,
    pub precapture_trigger_counter: i32,
    pub take_picture_counter: i32,

    pub quirks: Quirks,
    pub fast_info: FastInfo,
}

pub const HAL_TRANSFORM_FLIP_H: i32 = 0x01;
pub const HAL_TRANSFORM_FLIP_V: i32 = 0x02;
pub const HAL_TRANSFORM_ROT_90: i32 = 0x04;
pub const HAL_TRANSFORM_ROT_180: i32 = 0x03;
pub const HAL_TRANSFORM_ROT_270: i32 = 0x07;

impl Parameters {
    pub fn new(camera_id: i32) -> Self {
        Self {
            camera_id,
            state: CameraState::Disconnected,
            preview_size: Size::new(640, 480),
            video_size: Size::new(640, 480),
            picture_size: Size::new(640, 480),
            jpeg_quality: 90,
            jpeg_thumb_size: Size::new(160, 120),
            jpeg_thumb_quality: 90,
            jpeg_rotation: 0,
            flash_mode: FlashMode::Off,
            focus_mode: FocusMode::Auto,
            shadow_focus_mode: None,
            white_balance: AwbMode::Auto,
            zsl_mode: false,
            recording_hint: false,
            video_stabilization: false,
            light_fx: LightFx::None,
            enable_face_detect: false,
            enable_focus_move_messages: false,
            af_in_motion: false,
            focus_state: FocusState::Inactive,
            play_shutter_sound: true,
            store_metadata_in_buffers: true,
            preview_callback_flags: 0,
            preview_transform: 0,
            af_trigger_counter: 1,
            current_af_trigger_id: -1,
            precapture_trigger_counter: 1,
            take_picture_counter: 0,
            quirks: Quirks::default(),
            fast_info: FastInfo {
                array_width: 640,
                array_height: 480,
                max_faces: 0,
                best_face_detect_mode: FaceDetectMode::Off,
                max_jpeg_size: 0,
                facing: CameraFacing::Back,
                fixed_focus: false,
            },
        }
    }

    /// Build defaults from the device's static info and move to `Stopped`.
    pub fn initialize(&mut self, info: &DeviceInfo) -> Result<(), CameraError> {
        if info.array_width < 2 || info.array_height < 2 {
            return Err(CameraError::bad_value(format!(
                "Camera {}: invalid active array {}x{}",
                self.camera_id, info.array_width, info.array_height
            )));
        }
        let (pw, ph) = info.preview_sizes.first().copied().ok_or_else(|| {
            CameraError::bad_value(format!("Camera {}: no preview sizes", self.camera_id))
        })?;
        let (jw, jh) = info.picture_sizes.first().copied().ok_or_else(|| {
            CameraError::bad_value(format!("Camera {}: no picture sizes", self.camera_id))
        })?;

        self.preview_size = Size::new(pw, ph);
        self.video_size = Size::new(pw, ph);
        self.picture_size = Size::new(jw, jh);
        self.flash_mode = if info.has_flash { FlashMode::Auto } else { FlashMode::Off };
        self.focus_mode = if info.fixed_focus { FocusMode::Fixed } else { FocusMode::Auto };
        self.quirks = Quirks {
            partial_results: info.partial_results,
            trigger_af_with_auto: info.trigger_af_with_auto,
            use_zsl_format: info.use_zsl_format,
        };
        self.fast_info = FastInfo {
            array_width: info.array_width,
            array_height: info.array_height,
            max_faces: info.max_faces,
            best_face_detect_mode: info.best_face_detect_mode,
            max_jpeg_size: info.max_jpeg_size,
            facing: info.facing,
            fixed_focus: info.fixed_focus,
        };
        self.preview_transform = Self::deg_to_transform(0, info.facing == CameraFacing::Front).unwrap_or(0);

        self.state = CameraState::Stopped;
        Ok(())
    }

    pub fn settings(&self) -> CameraSettings {
        CameraSettings {
            preview_size: self.preview_size,
            video_size: self.video_size,
            picture_size: self.picture_size,
            jpeg_quality: self.jpeg_quality,
            jpeg_thumb_size: self.jpeg_thumb_size,
            jpeg_thumb_quality: self.jpeg_thumb_quality,
            jpeg_rotation: self.jpeg_rotation,
            flash_mode: self.flash_mode,
            focus_mode: self.shadow_focus_mode.unwrap_or(self.focus_mode),
            white_balance: self.white_balance,
            zsl_mode: self.zsl_mode,
            recording_hint: self.recording_hint,
            video_stabilization: self.video_stabilization,
            light_fx: self.light_fx,
        }
    }

    /// Validate and apply client settings.
    ///
    /// Nothing is applied if any value is rejected.
    pub fn set(&mut self, settings: CameraSettings) -> Result<(), CameraError> {
        let recording = matches!(self.state, CameraState::Record | CameraState::VideoSnapshot);
        if recording && settings.preview_size != self.preview_size {
            return Err(CameraError::invalid_operation(format!(
                "Camera {}: preview size cannot change while {}",
                self.camera_id, self.state
            )));
        }
        if recording && settings.video_size != self.video_size {
            return Err(CameraError::invalid_operation(format!(
                "Camera {}: video size cannot change while recording",
                self.camera_id
            )));
        }
        for (name, size) in [
            ("preview", settings.preview_size),
            ("video", settings.video_size),
            ("picture", settings.picture_size),
        ] {
            if size.width == 0 || size.height == 0 {
                return Err(CameraError::bad_value(format!(
                    "Camera {}: {} size {}x{} is empty",
                    self.camera_id, name, size.width, size.height
                )));
            }
        }
        if !(1..=100).contains(&settings.jpeg_quality) || !(1..=100).contains(&settings.jpeg_thumb_quality) {
            return Err(CameraError::bad_value(format!(
                "Camera {}: JPEG quality must be within 1..=100",
                self.camera_id
            )));
        }
        if Self::deg_to_transform(settings.jpeg_rotation, false).is_none() {
            return Err(CameraError::bad_value(format!(
                "Camera {}: invalid rotation {}",
                self.camera_id, settings.jpeg_rotation
            )));
        }
        if self.fast_info.fixed_focus && !matches!(settings.focus_mode, FocusMode::Fixed | FocusMode::Infinity) {
            return Err(CameraError::bad_value(format!(
                "Camera {}: fixed-focus camera cannot use {:?}",
                self.camera_id, settings.focus_mode
            )));
        }

        self.preview_size = settings.preview_size;
        self.video_size = settings.video_size;
        self.picture_size = settings.picture_size;
        self.jpeg_quality = settings.jpeg_quality;
        self.jpeg_thumb_size = settings.jpeg_thumb_size;
        self.jpeg_thumb_quality = settings.jpeg_thumb_quality;
        self.jpeg_rotation = settings.jpeg_rotation;
        self.flash_mode = settings.flash_mode;
        self.white_balance = settings.white_balance;
        self.zsl_mode = settings.zsl_mode;
        self.recording_hint = settings.recording_hint;
        self.video_stabilization = settings.video_stabilization;
        self.light_fx = settings.light_fx;

        if settings.focus_mode != self.focus_mode || self.shadow_focus_mode.is_some() {
            self.shadow_focus_mode = None;
            self.focus_mode = settings.focus_mode;
            self.current_af_trigger_id = -1;
            self.focus_state = FocusState::Inactive;
            self.af_in_motion = false;
        }
        Ok(())
    }

    /// Write control fields for the current settings into a request.
    pub fn update_request(&self, request: &mut CameraMetadata) -> Result<(), CameraError> {
        let (ae_mode, flash) = match self.flash_mode {
            FlashMode::Off => (AeMode::On, FlashControl::Off),
            FlashMode::Auto => (AeMode::OnAutoFlash, FlashControl::Off),
            FlashMode::On => (AeMode::OnAlwaysFlash, FlashControl::Off),
            FlashMode::Torch => (AeMode::On, FlashControl::Torch),
            FlashMode::RedEye => (AeMode::OnAutoFlashRedeye, FlashControl::Off),
        };
        request.ae_mode = Some(ae_mode);
        request.flash = Some(flash);
        request.af_mode = Some(match self.focus_mode {
            FocusMode::Auto => AfMode::Auto,
            FocusMode::Macro => AfMode::Macro,
            FocusMode::ContinuousVideo => AfMode::ContinuousVideo,
            FocusMode::ContinuousPicture => AfMode::ContinuousPicture,
            FocusMode::Edof => AfMode::Edof,
            FocusMode::Infinity | FocusMode::Fixed => AfMode::Off,
        });
        request.awb_mode = Some(self.white_balance);
        request.video_stabilization = Some(self.video_stabilization);
        request.face_detect_mode = Some(if self.enable_face_detect {
            self.fast_info.best_face_detect_mode
        } else {
            FaceDetectMode::Off
        });
        Ok(())
    }

    pub fn jpeg_settings(&self) -> JpegSettings {
        JpegSettings {
            width: self.picture_size.width,
            height: self.picture_size.height,
            quality: self.jpeg_quality,
            thumbnail_width: self.jpeg_thumb_size.width,
            thumbnail_height: self.jpeg_thumb_size.height,
            thumbnail_quality: self.jpeg_thumb_quality,
            orientation: self.jpeg_rotation,
        }
    }

    pub fn update_request_jpeg(&self, request: &mut CameraMetadata) -> Result<(), CameraError> {
        request.jpeg = Some(self.jpeg_settings());
        Ok(())
    }

    /// Map an active-array x coordinate into `[-1000, 1000]`.
    pub fn array_x_to_normalized(&self, x: i32) -> i32 {
        let span = i64::from(self.fast_info.array_width) - 1;
        (i64::from(x) * 2000 / span - 1000) as i32
    }

    pub fn array_y_to_normalized(&self, y: i32) -> i32 {
        let span = i64::from(self.fast_info.array_height) - 1;
        (i64::from(y) * 2000 / span - 1000) as i32
    }

    /// Display rotation in degrees to a stream transform, mirrored for
    /// front-facing cameras.
    pub fn deg_to_transform(degrees: i32, mirror: bool) -> Option<i32> {
        let transform = match (degrees, mirror) {
            (0, false) => 0,
            (90, false) => HAL_TRANSFORM_ROT_90,
            (180, false) => HAL_TRANSFORM_ROT_180,
            (270, false) => HAL_TRANSFORM_ROT_270,
            (0, true) => HAL_TRANSFORM_FLIP_H,
            (90, true) => HAL_TRANSFORM_FLIP_H | HAL_TRANSFORM_ROT_90,
            (180, true) => HAL_TRANSFORM_FLIP_V,
            (270, true) => HAL_TRANSFORM_FLIP_V | HAL_TRANSFORM_ROT_90,
            _ => return None,
        };
        Some(transform)
    }

    /// True when preview frames reach the client through the callback stream.
    pub fn preview_callbacks_enabled(&self) -> bool {
        self.preview_callback_flags & crate::callbacks::preview_flags::ENABLE_MASK != 0
    }
}

/// Mutex-guarded [`Parameters`].
pub struct SharedParameters {
    inner: Mutex<Parameters>,
}

impl SharedParameters {
    pub fn new(params: Parameters) -> Self {
        Self {
            inner: Mutex::new(params),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Parameters> {
        self.inner.lock().unwrap_or_else(recover)
    }

    /// Copy of the current state.
    pub fn state(&self) -> CameraState {
        self.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> Parameters {
        let mut params = Parameters::new(0);
        params.initialize(&DeviceInfo::default()).unwrap();
        params
    }

    #[test]
    fn test_initialize_moves_to_stopped() {
        let params = initialized();
        assert_eq!(params.state, CameraState::Stopped);
        assert_eq!(params.preview_size, Size::new(1920, 1080));
        assert_eq!(params.fast_info.array_width, 4000);
    }

    #[test]
    fn test_initialize_rejects_degenerate_array() {
        let mut params = Parameters::new(0);
        let info = DeviceInfo {
            array_width: 1,
            ..DeviceInfo::default()
        };
        assert!(matches!(params.initialize(&info), Err(CameraError::BadValue(_))));
        assert_eq!(params.state, CameraState::Disconnected);
    }

    #[test]
    fn test_normalized_coordinates_cover_range() {
        let params = initialized();
        assert_eq!(params.array_x_to_normalized(0), -1000);
        assert_eq!(params.array_x_to_normalized(3999), 1000);
        assert_eq!(params.array_y_to_normalized(0), -1000);
        assert_eq!(params.array_y_to_normalized(2999), 1000);
    }

    #[test]
    fn test_update_request_maps_flash_and_focus() {
        let mut params = initialized();
        params.flash_mode = FlashMode::On;
        params.focus_mode = FocusMode::ContinuousPicture;
        params.enable_face_detect = true;

        let mut request = CameraMetadata::new();
        params.update_request(&mut request).unwrap();
        assert_eq!(request.ae_mode, Some(AeMode::OnAlwaysFlash));
        assert_eq!(request.af_mode, Some(AfMode::ContinuousPicture));
        assert_eq!(request.face_detect_mode, Some(FaceDetectMode::Full));
    }

    #[test]
    fn test_set_rejects_bad_quality_without_applying() {
        let mut params = initialized();
        let mut settings = params.settings();
        settings.zsl_mode = true;
        settings.jpeg_quality = 0;
        assert!(params.set(settings).is_err());
        assert!(!params.zsl_mode);
    }

    #[test]
    fn test_set_focus_mode_resets_af_tracking() {
        let mut params = initialized();
        params.current_af_trigger_id = 7;
        let mut settings = params.settings();
        settings.focus_mode = FocusMode::ContinuousPicture;
        params.set(settings).unwrap();
        assert_eq!(params.focus_mode, FocusMode::ContinuousPicture);
        assert_eq!(params.current_af_trigger_id, -1);
    }

    #[test]
    fn test_deg_to_transform() {
        assert_eq!(Parameters::deg_to_transform(90, false), Some(HAL_TRANSFORM_ROT_90));
        assert_eq!(Parameters::deg_to_transform(180, true), Some(HAL_TRANSFORM_FLIP_V));
        assert_eq!(Parameters::deg_to_transform(45, false), None);
    }

    #[test]
    fn test_state_ordering() {
        assert!(CameraState::Stopped < CameraState::Preview);
        assert!(CameraState::WaitingForPreviewWindow < CameraState::Preview);
        assert_eq!(CameraState::VideoSnapshot.to_string(), "VIDEO_SNAPSHOT");
    }
}
