//! Worker-backed processors owned by [`crate::client::Camera2Client`]
//!
//! Each processor runs on its own [`crate::worker::Worker`] and reaches the
//! client and device only through weak references.

pub mod burst;
pub mod callback;
pub mod capture_sequencer;
pub mod frame;
pub mod jpeg;
pub mod streaming;
pub mod zsl;

pub use capture_sequencer::{CaptureSequencer, CaptureState};
pub use frame::{AlgState, FilteredListener, FrameProcessor};
pub use streaming::{StreamType, StreamingProcessor};
pub use zsl::{ZslProcessorInterface, ZslState};
