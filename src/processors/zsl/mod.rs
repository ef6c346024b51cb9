//! Zero-shutter-lag capture
//!
//! While preview runs, full-resolution buffers are parked in a [`ZslRing`]
//! next to their result frames. A still capture can then reprocess one of
//! those buffers instead of exposing a new frame.
//!
//! Two device generations are supported behind [`ZslProcessorInterface`]:
//! [`ZslProcessor`] pushes the chosen buffer into a dedicated reprocess
//! stream, while [`ZslProcessor3`] uses one bidirectional stream and names
//! the input buffer in the reprocess request.

mod processor;
mod processor3;
pub mod ring;

pub use processor::ZslProcessor;
pub use processor3::ZslProcessor3;
pub use ring::{ZslPair, ZslRing};

use crate::client::Camera2Client;
use crate::config::ZslConfig;
use crate::device::{CameraBuffer, CameraDevice, StreamId};
use crate::errors::{recover, CameraError};
use crate::metadata::{CameraMetadata, RequestType};
use crate::params::Parameters;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Capabilities the capture sequencer and client need from a ZSL processor.
pub trait ZslProcessorInterface: Send + Sync {
    /// Create or resize the ZSL stream(s) for the current parameters.
    fn update_stream(&self, params: &Parameters) -> Result<(), CameraError>;

    fn delete_stream(&self) -> Result<(), CameraError>;

    /// Output stream that preview requests must include while ZSL is on.
    fn stream_id(&self) -> Option<StreamId>;

    /// Submit a reprocess request for the best buffered frame.
    ///
    /// Fails with `NotEnoughData` when no buffered frame has settled exposure.
    fn push_to_reprocess(&self, request_id: i32) -> Result<(), CameraError>;

    /// Release every parked buffer. A no-op while a reprocess is in flight.
    fn clear_zsl_queue(&self) -> Result<(), CameraError>;

    /// Give up on an in-flight reprocess: unlock and release every parked
    /// buffer without waiting for the device to return the input.
    fn abort_reprocess(&self) -> Result<(), CameraError>;

    fn state(&self) -> ZslState;

    fn queue_len(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ZslState {
    Running,
    /// A buffer is out for reprocessing; new buffers are not admitted.
    Locked,
}

pub(crate) struct ZslInner {
    pub state: ZslState,
    pub ring: ZslRing,
    pub pending: VecDeque<CameraBuffer>,
    pub stream_id: Option<StreamId>,
    pub reprocess_stream_id: Option<StreamId>,
}

/// Stream ids a reprocess submission may need.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZslStreams {
    pub output: Option<StreamId>,
    pub reprocess: Option<StreamId>,
}

/// Buffer bookkeeping shared by both processor generations.
pub(crate) struct ZslCore {
    pub camera_id: i32,
    pub client: Weak<Camera2Client>,
    pub device: Weak<dyn CameraDevice>,
    wait_duration: Duration,
    inner: Mutex<ZslInner>,
    buffer_available: Condvar,
}

impl ZslCore {
    pub fn new(
        camera_id: i32,
        client: Weak<Camera2Client>,
        device: Weak<dyn CameraDevice>,
        config: &ZslConfig,
    ) -> Self {
        Self {
            camera_id,
            client,
            device,
            wait_duration: config.wait_duration(),
            inner: Mutex::new(ZslInner {
                state: ZslState::Running,
                ring: ZslRing::new(config.buffer_depth, config.frame_list_depth, config.match_tolerance_ns),
                pending: VecDeque::new(),
                stream_id: None,
                reprocess_stream_id: None,
            }),
            buffer_available: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ZslInner> {
        self.inner.lock().unwrap_or_else(recover)
    }

    pub fn device(&self) -> Result<std::sync::Arc<dyn CameraDevice>, CameraError> {
        self.device.upgrade().ok_or(CameraError::DeadObject)
    }

    fn release(&self, buffers: impl IntoIterator<Item = CameraBuffer>) {
        let Some(device) = self.device.upgrade() else {
            return;
        };
        for buffer in buffers {
            if let Err(e) = device.release_buffer(buffer.stream_id, buffer.id) {
                log::warn!("Camera {}: releasing ZSL buffer {}: {}", self.camera_id, buffer.id, e);
            }
        }
    }

    pub fn enqueue(&self, buffer: CameraBuffer) {
        self.lock().pending.push_back(buffer);
        self.buffer_available.notify_one();
    }

    /// One worker iteration: admit whatever buffers arrived.
    pub fn process_pending(&self) -> bool {
        let (admitted, to_release) = {
            let inner = self.lock();
            let (mut inner, _) = self
                .buffer_available
                .wait_timeout_while(inner, self.wait_duration, |i| i.pending.is_empty())
                .unwrap_or_else(recover);

            let mut admitted = 0;
            let mut to_release = Vec::new();
            while let Some(buffer) = inner.pending.pop_front() {
                if inner.state == ZslState::Locked {
                    to_release.push(buffer);
                    continue;
                }
                if let Some(evicted) = inner.ring.push_buffer(buffer) {
                    to_release.push(evicted);
                }
                admitted += 1;
            }
            (admitted, to_release)
        };

        if admitted > 0 {
            log::trace!("Camera {}: {} ZSL buffers admitted", self.camera_id, admitted);
        }
        self.release(to_release);
        self.client.strong_count() > 0
    }

    pub fn on_frame(&self, frame: &CameraMetadata) {
        let mut inner = self.lock();
        if inner.state != ZslState::Running {
            return;
        }
        inner.ring.push_frame(frame.clone());
    }

    pub fn clear_queue(&self) -> Result<(), CameraError> {
        let drained = {
            let mut inner = self.lock();
            if inner.state == ZslState::Locked {
                return Ok(());
            }
            inner.ring.drain()
        };
        log::trace!("Camera {}: clearing {} ZSL buffers", self.camera_id, drained.len());
        self.release(drained);
        Ok(())
    }

    /// Drop every parked buffer regardless of state, used when the stream
    /// goes away or a reprocess is abandoned.
    pub fn flush(&self) {
        let drained = {
            let mut inner = self.lock();
            inner.state = ZslState::Running;
            let mut drained = inner.ring.drain();
            drained.extend(inner.pending.drain(..));
            drained
        };
        self.release(drained);
    }

    /// The device finished reading the reprocess input. Everything parked is
    /// flushed so the next capture never reuses stale data.
    pub fn on_buffer_released(&self, buffer_id: u64) {
        let drained = {
            let mut inner = self.lock();
            if !inner.ring.contains_buffer(buffer_id) {
                log::warn!(
                    "Camera {}: released buffer {} is not in the ZSL queue",
                    self.camera_id,
                    buffer_id
                );
            }
            let drained = inner.ring.drain();
            inner.state = ZslState::Running;
            drained
        };
        self.release(drained);
    }

    pub fn state(&self) -> ZslState {
        self.lock().state
    }

    pub fn queue_len(&self) -> usize {
        self.lock().ring.len()
    }

    /// Shared reprocess path. `submit` hands the chosen buffer and the
    /// prepared request to the device.
    pub fn push_to_reprocess<F>(&self, request_id: i32, submit: F) -> Result<(), CameraError>
    where
        F: FnOnce(&dyn CameraDevice, ZslStreams, &CameraBuffer, CameraMetadata) -> Result<(), CameraError>,
    {
        let client = self.client.upgrade().ok_or(CameraError::DeadObject)?;
        let device = self.device()?;

        let jpeg = client.parameters().lock().jpeg_settings();
        let capture_stream = client.capture_stream_id().ok_or_else(|| {
            CameraError::invalid_operation(format!("Camera {}: no capture stream", self.camera_id))
        })?;

        let (pair, streams) = {
            let mut inner = self.lock();
            if inner.state == ZslState::Locked {
                return Err(CameraError::invalid_operation(format!(
                    "Camera {}: a ZSL reprocess is already in flight",
                    self.camera_id
                )));
            }
            let pair = inner.ring.select_for_reprocess().map_err(|e| {
                log::debug!(
                    "Camera {}: no settled ZSL frame among {} buffers",
                    self.camera_id,
                    inner.ring.len()
                );
                e
            })?;
            let pair = pair.clone();
            inner.state = ZslState::Locked;
            let streams = ZslStreams {
                output: inner.stream_id,
                reprocess: inner.reprocess_stream_id,
            };
            (pair, streams)
        };

        let mut request = pair.frame.clone().unwrap_or_default();
        request.request_type = Some(RequestType::Reprocess);
        request.request_id = Some(request_id);
        request.output_streams = vec![capture_stream];
        request.jpeg = Some(jpeg);
        request.frame_count = None;

        log::debug!(
            "Camera {}: reprocessing ZSL buffer {} from {}",
            self.camera_id,
            pair.buffer.id,
            pair.buffer.timestamp
        );

        let result = client
            .stop_stream()
            .and_then(|()| submit(device.as_ref(), streams, &pair.buffer, request));
        if let Err(e) = result {
            log::error!("Camera {}: ZSL reprocess failed: {}", self.camera_id, e);
            self.lock().state = ZslState::Running;
            return Err(e);
        }
        Ok(())
    }
}
