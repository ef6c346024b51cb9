//! Still-capture output stream
//!
//! Owns the compressed-image stream. Filled buffers are handed to the worker
//! over a bounded channel; the worker trims each image to its end-of-image
//! marker, gives the buffer back to the device and passes the bytes to the
//! capture sequencer.

use crate::client::Camera2Client;
use crate::device::{CameraBuffer, CameraDevice, PixelFormat, StreamConsumer, StreamId};
use crate::errors::{recover, CameraError};
use crate::params::Parameters;
use crate::worker::ThreadLoop;
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const MAX_PENDING_CAPTURES: usize = 4;

const MARKER_SOI: u8 = 0xD8;
const MARKER_EOI: u8 = 0xD9;
const MARKER_SOS: u8 = 0xDA;

/// Length of the JPEG image in `data`, or the whole buffer when no valid
/// end-of-image marker can be found.
pub fn find_jpeg_size(data: &[u8]) -> usize {
    if data.len() < 4 || data[0] != 0xFF || data[1] != MARKER_SOI {
        return data.len();
    }

    // Skip header segments by length so thumbnails are not mistaken for the end
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            break;
        }
        let marker = data[pos + 1];
        if marker == MARKER_EOI {
            return pos + 2;
        }
        let length = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        pos += 2 + length;
        if marker == MARKER_SOS {
            break;
        }
    }

    while pos + 1 < data.len() {
        if data[pos] == 0xFF && data[pos + 1] == MARKER_EOI {
            return pos + 2;
        }
        pos += 1;
    }
    data.len()
}

pub struct JpegProcessor {
    camera_id: i32,
    client: Weak<Camera2Client>,
    device: Weak<dyn CameraDevice>,
    self_ref: Weak<JpegProcessor>,
    wait_duration: Duration,
    stream_id: Mutex<Option<StreamId>>,
    sender: Sender<CameraBuffer>,
    receiver: Receiver<CameraBuffer>,
}

impl JpegProcessor {
    pub fn new(
        camera_id: i32,
        client: Weak<Camera2Client>,
        device: Weak<dyn CameraDevice>,
        wait_duration: Duration,
    ) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::bounded(MAX_PENDING_CAPTURES);
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

    /// Create the capture stream, or recreate it if the picture size changed.
    pub fn update_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let device = self.device.upgrade().ok_or(CameraError::DeadObject)?;
        let mut stream_id = self.stream_id.lock().unwrap_or_else(recover);

        if let Some(id) = *stream_id {
            let info = device.get_stream_info(id)?;
            if info.width != params.picture_size.width || info.height != params.picture_size.height {
                log::debug!(
                    "Camera {}: capture size switch {}x{} -> {}x{}",
                    self.camera_id,
                    info.width,
                    info.height,
                    params.picture_size.width,
                    params.picture_size.height
                );
                // Busy is surfaced so the caller can pause streaming and retry
                device.delete_stream(id)?;
                *stream_id = None;
            }
        }

        if stream_id.is_none() {
            let consumer: Weak<dyn StreamConsumer> = self.self_ref.clone();
            let id = device.create_stream(
                consumer,
                params.picture_size.width,
                params.picture_size.height,
                PixelFormat::Blob,
                params.fast_info.max_jpeg_size,
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

    fn process_new_capture(&self, buffer: CameraBuffer) {
        let size = find_jpeg_size(&buffer.data);
        let image = Bytes::copy_from_slice(&buffer.data[..size]);

        if let Some(device) = self.device.upgrade() {
            if let Err(e) = device.release_buffer(buffer.stream_id, buffer.id) {
                log::warn!("Camera {}: releasing capture buffer: {}", self.camera_id, e);
            }
        }

        let Some(client) = self.client.upgrade() else {
            return;
        };
        log::trace!(
            "Camera {}: compressed image of {} bytes at {}",
            self.camera_id,
            size,
            buffer.timestamp
        );
        client.sequencer().on_capture_available(buffer.timestamp, image);
    }
}

impl StreamConsumer for JpegProcessor {
    fn on_buffer_available(&self, buffer: CameraBuffer) {
        match self.sender.try_send(buffer) {
            Ok(()) => {}
            Err(TrySendError::Full(buffer)) | Err(TrySendError::Disconnected(buffer)) => {
                log::error!("Camera {}: capture queue full, dropping image", self.camera_id);
                if let Some(device) = self.device.upgrade() {
                    let _ = device.release_buffer(buffer.stream_id, buffer.id);
                }
            }
        }
    }
}

impl ThreadLoop for JpegProcessor {
    fn thread_loop(&self) -> bool {
        match self.receiver.recv_timeout(self.wait_duration) {
            Ok(buffer) => {
                self.process_new_capture(buffer);
                true
            }
            Err(RecvTimeoutError::Timeout) => true,
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finds_end_of_image() {
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xD9];
        data.extend_from_slice(&[0u8; 16]);
        assert_eq!(find_jpeg_size(&data), 10);
    }

    #[test]
    fn test_skips_embedded_thumbnail_marker() {
        // APP1 segment containing a stray EOI, then the real scan and EOI
        let data = vec![
            0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x04, 0xFF, 0xD9, 0xFF, 0xDA, 0x00, 0x02, 0x42, 0xFF, 0xD9, 0, 0,
        ];
        assert_eq!(find_jpeg_size(&data), 15);
    }

    #[test]
    fn test_non_jpeg_uses_full_length() {
        assert_eq!(find_jpeg_size(b"not a jpeg"), 10);
        assert_eq!(find_jpeg_size(&[]), 0);
    }
}
