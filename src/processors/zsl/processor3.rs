use super::{ZslCore, ZslProcessorInterface, ZslState};
use crate::client::Camera2Client;
use crate::config::ZslConfig;
use crate::device::{
    BufferReleasedListener, CameraBuffer, CameraDevice, PixelFormat, StreamConsumer, StreamId,
};
use crate::errors::CameraError;
use crate::metadata::CameraMetadata;
use crate::params::Parameters;
use crate::processors::frame::FilteredListener;
use crate::request_ids::PREVIEW_REQUEST_IDS;
use crate::worker::ThreadLoop;
use std::sync::{Arc, Weak};

/// ZSL for devices with bidirectional streams.
///
/// The same stream produces preview-time buffers and accepts one of them
/// back as reprocess input, identified in the request by its timestamp.
pub struct ZslProcessor3 {
    core: ZslCore,
    self_ref: Weak<ZslProcessor3>,
}

impl ZslProcessor3 {
    pub fn new(
        camera_id: i32,
        client: Weak<Camera2Client>,
        device: Weak<dyn CameraDevice>,
        config: &ZslConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            core: ZslCore::new(camera_id, client, device, config),
            self_ref: self_ref.clone(),
        })
    }
}

impl ZslProcessorInterface for ZslProcessor3 {
    fn update_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let client = self.core.client.upgrade().ok_or(CameraError::DeadObject)?;
        let device = self.core.device()?;
        let (width, height) = (params.fast_info.array_width, params.fast_info.array_height);

        {
            let mut inner = self.core.lock();
            if let Some(id) = inner.stream_id {
                let info = device.get_stream_info(id)?;
                if info.width != width || info.height != height {
                    device.delete_stream(id)?;
                    inner.stream_id = None;
                }
            }

            if inner.stream_id.is_none() {
                let consumer: Weak<dyn StreamConsumer> = self.self_ref.clone();
                let released: Weak<dyn BufferReleasedListener> = self.self_ref.clone();
                let id = device.create_input_output_stream(consumer, released, width, height, PixelFormat::Opaque)?;
                inner.stream_id = Some(id);
            }
        }

        let listener: Weak<dyn FilteredListener> = self.self_ref.clone();
        client.register_frame_listener(PREVIEW_REQUEST_IDS.start, PREVIEW_REQUEST_IDS.end, listener);
        Ok(())
    }

    fn delete_stream(&self) -> Result<(), CameraError> {
        self.core.flush();
        let device = self.core.device()?;
        let mut inner = self.core.lock();
        if let Some(id) = inner.stream_id {
            device.delete_stream(id)?;
            inner.stream_id = None;
        }
        Ok(())
    }

    fn stream_id(&self) -> Option<StreamId> {
        self.core.lock().stream_id
    }

    fn push_to_reprocess(&self, request_id: i32) -> Result<(), CameraError> {
        self.core
            .push_to_reprocess(request_id, |device, streams, buffer, mut request| {
                let input = streams
                    .output
                    .ok_or_else(|| CameraError::invalid_operation("no ZSL stream"))?;
                request.input_streams = vec![input];
                request.input_buffer_timestamp = Some(buffer.timestamp);
                device.capture(request)
            })
    }

    fn clear_zsl_queue(&self) -> Result<(), CameraError> {
        self.core.clear_queue()
    }

    fn abort_reprocess(&self) -> Result<(), CameraError> {
        self.core.flush();
        Ok(())
    }

    fn state(&self) -> ZslState {
        self.core.state()
    }

    fn queue_len(&self) -> usize {
        self.core.queue_len()
    }
}

impl StreamConsumer for ZslProcessor3 {
    fn on_buffer_available(&self, buffer: CameraBuffer) {
        self.core.enqueue(buffer);
    }
}

impl BufferReleasedListener for ZslProcessor3 {
    fn on_buffer_released(&self, buffer_id: u64) {
        self.core.on_buffer_released(buffer_id);
    }
}

impl FilteredListener for ZslProcessor3 {
    fn on_frame_available(&self, _request_id: i32, frame: &CameraMetadata) {
        self.core.on_frame(frame);
    }
}

impl ThreadLoop for ZslProcessor3 {
    fn thread_loop(&self) -> bool {
        self.core.process_pending()
    }
}
