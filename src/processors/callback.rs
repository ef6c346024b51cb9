//! Preview callback stream
//!
//! When the client asks for preview frames, a second, CPU-readable output
//! stream at preview size is attached to the preview request. Its buffers are
//! copied out and delivered to the client.

use crate::callbacks::preview_flags;
use crate::client::Camera2Client;
use crate::device::{CameraBuffer, CameraDevice, PixelFormat, StreamConsumer, StreamId};
use crate::errors::{recover, CameraError};
use crate::params::{CameraState, Parameters};
use crate::worker::ThreadLoop;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const MAX_PENDING_FRAMES: usize = 2;

pub struct CallbackProcessor {
    camera_id: i32,
    client: Weak<Camera2Client>,
    device: Weak<dyn CameraDevice>,
    self_ref: Weak<CallbackProcessor>,
    wait_duration: Duration,
    stream_id: Mutex<Option<StreamId>>,
    sender: Sender<CameraBuffer>,
    receiver: Receiver<CameraBuffer>,
}

impl CallbackProcessor {
    pub fn new(
        camera_id: i32,
        client: Weak<Camera2Client>,
        device: Weak<dyn CameraDevice>,
        wait_duration: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(MAX_PENDING_FRAMES);
        Arc::new_cyclic(|self_ref| Self {
            camera_id,
            client,
            device,
            self_ref: self_ref.clone(),
            wait_duration,
            stream_id: Mutex::new(None),
            sender,
            receiver,
        })
    }

    pub fn update_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let device = self.device.upgrade().ok_or(CameraError::DeadObject)?;
        let mut stream_id = self.stream_id.lock().unwrap_or_else(recover);

        if let Some(id) = *stream_id {
            let info = device.get_stream_info(id)?;
            if info.width != params.preview_size.width || info.height != params.preview_size.height {
                device.delete_stream(id)?;
                *stream_id = None;
            }
        }

        if stream_id.is_none() {
            let consumer: Weak<dyn StreamConsumer> = self.self_ref.clone();
            let id = device.create_stream(
                consumer,
                params.preview_size.width,
                params.preview_size.height,
                PixelFormat::Ycrcb420Sp,
                0,
            )?;
            *stream_id = Some(id);
        }
        Ok(())
    }

    pub fn delete_stream(&self) -> Result<(), CameraError> {
        let mut stream_id = self.stream_id.lock().unwrap_or_else(recover);
        if let Some(id) = *stream_id {
            let device = self.device.upgrade().ok_or(CameraError::DeadObject)?;
            device.delete_stream(id)?;
            *stream_id = None;
        }
        Ok(())
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        *self.stream_id.lock().unwrap_or_else(recover)
    }

    fn release(&self, buffer: &CameraBuffer) {
        if let Some(device) = self.device.upgrade() {
            if let Err(e) = device.release_buffer(buffer.stream_id, buffer.id) {
                log::warn!("Camera {}: releasing callback buffer: {}", self.camera_id, e);
            }
        }
    }

    fn process_new_callback(&self, buffer: CameraBuffer) {
        let Some(client) = self.client.upgrade() else {
            self.release(&buffer);
            return;
        };

        let deliver = {
            let mut params = client.parameters().lock();
            let active = matches!(
                params.state,
                CameraState::Preview | CameraState::Record | CameraState::VideoSnapshot
            );
            let enabled = params.preview_callbacks_enabled();
            if active && enabled && params.preview_callback_flags & preview_flags::ONE_SHOT_MASK != 0 {
                log::trace!("Camera {}: one-shot preview callback consumed", self.camera_id);
                params.preview_callback_flags = 0;
            }
            active && enabled
        };

        let frame = Bytes::copy_from_slice(&buffer.data);
        self.release(&buffer);

        if deliver {
            if let Some(callbacks) = client.callbacks().get() {
                callbacks.preview_frame(frame);
            }
        }
    }
}

impl StreamConsumer for CallbackProcessor {
    fn on_buffer_available(&self, buffer: CameraBuffer) {
        if let Err(e) = self.sender.try_send(buffer) {
            let buffer = e.into_inner();
            log::trace!("Camera {}: preview callback backlog, dropping frame", self.camera_id);
            self.release(&buffer);
        }
    }
}

impl ThreadLoop for CallbackProcessor {
    fn thread_loop(&self) -> bool {
        match self.receiver.recv_timeout(self.wait_duration) {
            Ok(buffer) => {
                self.process_new_callback(buffer);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
