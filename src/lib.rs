//! CrabCapture: still-capture sequencing for API1-style camera clients
//!
//! This crate drives a capture device through preview, recording and still
//! capture on behalf of a single application client. The capture device is
//! abstracted behind [`device::CameraDevice`]; the application receives
//! shutter, focus and image events through [`callbacks::CameraClientCallbacks`].
//!
//! # Features
//! - Capture sequencer: precapture metering, standard and zero-shutter-lag paths
//! - Streaming processor: repeating preview and recording requests
//! - ZSL ring buffer matched against result-frame timestamps
//! - Frame processor: result routing by request id, faces, 3A change synthesis
//! - Worker threads with cooperative exit and bounded joins
//!
//! # Usage
//! ```rust,ignore
//! use crabcapture::{Camera2Client, CrabCaptureConfig};
//!
//! let client = Camera2Client::open(device, CrabCaptureConfig::load_or_default())?;
//! client.connect(1, callbacks)?;
//! client.set_preview_target(Some(window))?;
//! client.start_preview()?;
//! client.take_picture(MessageMask::SHUTTER | MessageMask::COMPRESSED_IMAGE)?;
//! ```

pub mod invariant_ppt;

pub mod callbacks;
pub mod client;
pub mod config;
pub mod device;
pub mod errors;
pub mod metadata;
pub mod params;
pub mod processors;
pub mod request_ids;
pub mod timing;
pub mod worker;

// Testing utilities - mock device and synthetic frames for offline testing
pub mod testing;

// Re-exports for convenience
pub use callbacks::{CameraClientCallbacks, MessageMask, Notification, Sound};
pub use client::{Camera2Client, Command};
pub use config::CrabCaptureConfig;
pub use device::{CameraBuffer, CameraDevice, DeviceInfo, DeviceVersion, PixelFormat, StreamId};
pub use errors::CameraError;
pub use metadata::{AeState, AfState, CameraMetadata};
pub use params::{CameraSettings, CameraState, Parameters};
pub use processors::{CaptureSequencer, CaptureState, FrameProcessor, StreamingProcessor, ZslProcessorInterface};

/// Initialize logging for the capture client
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "crabcapture=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn test_crate_info() {
        let info = get_info();
        assert_eq!(info.name, "crabcapture");
        assert!(!info.version.is_empty());
        assert!(!info.description.is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
