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

/// ZSL for devices with a separate reprocess stream.
///
/// Buffers come from a full-array output stream; the chosen buffer is pushed
/// into a reprocess stream built on top of it.
pub struct ZslProcessor {
    core: ZslCore,
    self_ref: Weak<ZslProcessor>,
}

impl ZslProcessor {
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

    pub fn reprocess_stream_id(&self) -> Option<StreamId> {
        self.core.lock().reprocess_stream_id
    }
}

impl ZslProcessorInterface for ZslProcessor {
    fn update_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let client = self.core.client.upgrade().ok_or(CameraError::DeadObject)?;
        let device = self.core.device()?;
        let (width, height) = (params.fast_info.array_width, params.fast_info.array_height);

        {
            let mut inner = self.core.lock();
            if let Some(id) = inner.stream_id {
                let info = device.get_stream_info(id)?;
                if info.width != width || info.height != height {
                    log::debug!(
                        "Camera {}: ZSL stream {}x{} no longer matches the active array",
                        self.core.camera_id,
                        info.width,
                        info.height
                    );
                    if let Some(reprocess) = inner.reprocess_stream_id {
                        device.delete_reprocess_stream(reprocess)?;
                        inner.reprocess_stream_id = None;
                    }
                    device.delete_stream(id)?;
                    inner.stream_id = None;
                }
            }

            if inner.stream_id.is_none() {
                let format = if params.quirks.use_zsl_format {
                    PixelFormat::Zsl
                } else {
                    PixelFormat::Opaque
                };
                let consumer: Weak<dyn StreamConsumer> = self.self_ref.clone();
                let id = device.create_stream(consumer, width, height, format, 0)?;
                inner.stream_id = Some(id);
                let reprocess = device.create_reprocess_stream_from_stream(id)?;
                inner.reprocess_stream_id = Some(reprocess);
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
        if let Some(reprocess) = inner.reprocess_stream_id {
            device.delete_reprocess_stream(reprocess)?;
            inner.reprocess_stream_id = None;
        }
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
        let listener: Weak<dyn BufferReleasedListener> = self.self_ref.clone();
        self.core
            .push_to_reprocess(request_id, move |device, streams, buffer, mut request| {
                let reprocess = streams.reprocess.ok_or_else(|| {
                    CameraError::invalid_operation("no ZSL reprocess stream")
                })?;
                request.input_streams = vec![reprocess];
                device.push_reprocess_buffer(reprocess, buffer, listener)?;
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

impl StreamConsumer for ZslProcessor {
    fn on_buffer_available(&self, buffer: CameraBuffer) {
        self.core.enqueue(buffer);
    }
}

impl BufferReleasedListener for ZslProcessor {
    fn on_buffer_released(&self, buffer_id: u64) {
        self.core.on_buffer_released(buffer_id);
    }
}

impl FilteredListener for ZslProcessor {
    fn on_frame_available(&self, _request_id: i32, frame: &CameraMetadata) {
        self.core.on_frame(frame);
    }
}

impl ThreadLoop for ZslProcessor {
    fn thread_loop(&self) -> bool {
        self.core.process_pending()
    }
}
