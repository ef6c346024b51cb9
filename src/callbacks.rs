//! Client-facing callbacks
//!
//! The application registers a [`CameraClientCallbacks`] sink; processors
//! reach it through [`SharedCameraCallbacks`]. Callbacks are always invoked
//! with the parameters lock released so a callback may call straight back
//! into the client.

use crate::errors::recover;
use crate::metadata::{AeState, AwbState};
use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Message flags a still capture was requested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MessageMask(pub u32);

impl MessageMask {
    pub const ERROR: MessageMask = MessageMask(0x0001);
    pub const SHUTTER: MessageMask = MessageMask(0x0002);
    pub const FOCUS: MessageMask = MessageMask(0x0004);
    pub const PREVIEW_FRAME: MessageMask = MessageMask(0x0010);
    pub const VIDEO_FRAME: MessageMask = MessageMask(0x0020);
    pub const RAW_IMAGE: MessageMask = MessageMask(0x0080);
    pub const COMPRESSED_IMAGE: MessageMask = MessageMask(0x0100);
    pub const RAW_IMAGE_NOTIFY: MessageMask = MessageMask(0x0200);
    pub const PREVIEW_METADATA: MessageMask = MessageMask(0x0400);
    pub const FOCUS_MOVE: MessageMask = MessageMask(0x0800);
    pub const ALL: MessageMask = MessageMask(0x0FFF);

    pub fn contains(self, other: MessageMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageMask {
    type Output = MessageMask;

    fn bitor(self, rhs: MessageMask) -> MessageMask {
        MessageMask(self.0 | rhs.0)
    }
}

/// Preview callback flag bits.
pub mod preview_flags {
    pub const ENABLE_MASK: u32 = 0x01;
    pub const ONE_SHOT_MASK: u32 = 0x02;
    pub const COPY_OUT_MASK: u32 = 0x04;
}

/// A detected face, in normalized `[-1000, 1000]` coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CameraFace {
    pub rect: [i32; 4],
    pub score: u8,
    pub id: i32,
    pub left_eye: [i32; 2],
    pub right_eye: [i32; 2],
    pub mouth: [i32; 2],
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameMetadata {
    pub faces: Vec<CameraFace>,
}

impl FrameMetadata {
    pub fn number_of_faces(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    Shutter,
    RawImageNotify,
    Focus { success: bool },
    FocusMove { moving: bool },
    AutoExposure { state: AeState, trigger_id: i32 },
    WhiteBalance { state: AwbState },
    Error { code: i32 },
}

/// A recording frame lent to the client until it is released.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingFrame {
    pub heap_id: u32,
    pub slot: usize,
    pub buffer_id: u64,
    pub timestamp: i64,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sound {
    Shutter,
    Recording,
}

pub trait CameraClientCallbacks: Send + Sync {
    fn notify(&self, notification: Notification);

    fn compressed_image(&self, image: Bytes);

    fn preview_metadata(&self, metadata: &FrameMetadata);

    fn preview_frame(&self, frame: Bytes);

    fn recording_frame(&self, timestamp: i64, frame: RecordingFrame);

    fn play_sound(&self, _sound: Sound) {}
}

/// The currently registered callback sink, if any.
#[derive(Default)]
pub struct SharedCameraCallbacks {
    remote: Mutex<Option<Arc<dyn CameraClientCallbacks>>>,
}

impl SharedCameraCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callbacks: Arc<dyn CameraClientCallbacks>) {
        *self.remote.lock().unwrap_or_else(recover) = Some(callbacks);
    }

    pub fn clear(&self) {
        *self.remote.lock().unwrap_or_else(recover) = None;
    }

    /// Snapshot of the sink; the slot lock is not held while calling into it.
    pub fn get(&self) -> Option<Arc<dyn CameraClientCallbacks>> {
        self.remote.lock().unwrap_or_else(recover).clone()
    }

    pub fn is_set(&self) -> bool {
        self.remote.lock().unwrap_or_else(recover).is_some()
    }
}
