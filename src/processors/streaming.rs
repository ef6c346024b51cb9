//! Preview and recording streams
//!
//! The streaming processor owns the preview and recording output streams and
//! the one repeating request the device is running. It also lends recording
//! buffers to the client through a fixed heap of slots; when every slot is
//! out, new recording buffers are dropped.

use crate::callbacks::RecordingFrame;
use crate::client::Camera2Client;
use crate::config::StreamingConfig;
use crate::device::{CameraBuffer, CameraDevice, PixelFormat, StreamConsumer, StreamId};
use crate::errors::{recover, CameraError};
use crate::metadata::{CameraMetadata, RequestTemplate};
use crate::params::{CameraState, Parameters};
use crate::request_ids::{RequestIdCounter, PREVIEW_REQUEST_IDS, RECORDING_REQUEST_IDS};
use crate::worker::ThreadLoop;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamType {
    None,
    Preview,
    Record,
}

/// Fixed set of slots for recording frames lent to the client.
#[derive(Debug)]
pub struct RecordingHeap {
    heap_id: u32,
    slots: Vec<Option<CameraBuffer>>,
    head: usize,
    free: usize,
}

impl RecordingHeap {
    pub fn new(heap_id: u32, count: usize) -> Self {
        Self {
            heap_id,
            slots: vec![None; count],
            head: 0,
            free: count,
        }
    }

    pub fn heap_id(&self) -> u32 {
        self.heap_id
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free(&self) -> usize {
        self.free
    }

    /// Park a buffer in the next free slot. Gives the buffer back when the
    /// heap is exhausted.
    pub fn lend(&mut self, buffer: CameraBuffer) -> Result<RecordingFrame, CameraBuffer> {
        if self.free == 0 {
            return Err(buffer);
        }
        let count = self.slots.len();
        let slot = (0..count)
            .map(|i| (self.head + i) % count)
            .find(|&i| self.slots[i].is_none());
        let Some(slot) = slot else {
            return Err(buffer);
        };

        let frame = RecordingFrame {
            heap_id: self.heap_id,
            slot,
            buffer_id: buffer.id,
            timestamp: buffer.timestamp,
            data: buffer.data.clone(),
        };
        self.slots[slot] = Some(buffer);
        self.head = (slot + 1) % count;
        self.free -= 1;
        Ok(frame)
    }

    /// Take back the buffer lent out as `frame`.
    pub fn reclaim(&mut self, frame: &RecordingFrame) -> Option<CameraBuffer> {
        if frame.heap_id != self.heap_id {
            return None;
        }
        let entry = self.slots.get_mut(frame.slot)?;
        match entry {
            Some(buffer) if buffer.id == frame.buffer_id => {
                self.free += 1;
                entry.take()
            }
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<CameraBuffer> {
        self.free = self.slots.len();
        self.head = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

struct StreamingInner {
    preview_window: Option<Arc<dyn StreamConsumer>>,
    preview_request: CameraMetadata,
    preview_stream_id: Option<StreamId>,
    preview_request_ids: RequestIdCounter,

    recording_request: CameraMetadata,
    recording_stream_id: Option<StreamId>,
    recording_request_ids: RequestIdCounter,
    recording_heap: Option<RecordingHeap>,
    recording_heap_count: usize,
    next_heap_id: u32,
    recording_frame_count: u64,

    active_request: StreamType,
    paused: bool,
    active_stream_ids: Vec<StreamId>,
}

pub struct StreamingProcessor {
    camera_id: i32,
    client: Weak<Camera2Client>,
    device: Weak<dyn CameraDevice>,
    self_ref: Weak<StreamingProcessor>,
    config: StreamingConfig,
    inner: Mutex<StreamingInner>,
    pending: Mutex<VecDeque<CameraBuffer>>,
    recording_available: Condvar,
}

impl StreamingProcessor {
    pub fn new(
        camera_id: i32,
        client: Weak<Camera2Client>,
        device: Weak<dyn CameraDevice>,
        config: StreamingConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            camera_id,
            client,
            device,
            self_ref: self_ref.clone(),
            inner: Mutex::new(StreamingInner {
                preview_window: None,
                preview_request: CameraMetadata::new(),
                preview_stream_id: None,
                preview_request_ids: RequestIdCounter::new(PREVIEW_REQUEST_IDS),
                recording_request: CameraMetadata::new(),
                recording_stream_id: None,
                recording_request_ids: RequestIdCounter::new(RECORDING_REQUEST_IDS),
                recording_heap: None,
                recording_heap_count: config.recording_heap_count,
                next_heap_id: 1,
                recording_frame_count: 0,
                active_request: StreamType::None,
                paused: false,
                active_stream_ids: Vec::new(),
            }),
            config,
            pending: Mutex::new(VecDeque::new()),
            recording_available: Condvar::new(),
        })
    }

    fn device(&self) -> Result<Arc<dyn CameraDevice>, CameraError> {
        self.device.upgrade().ok_or(CameraError::DeadObject)
    }

    /// Swap the preview target. Any existing preview stream is deleted.
    pub fn set_preview_window(&self, window: Option<Arc<dyn StreamConsumer>>) -> Result<(), CameraError> {
        self.delete_preview_stream()?;
        self.inner.lock().unwrap_or_else(recover).preview_window = window;
        Ok(())
    }

    pub fn have_valid_preview_window(&self) -> bool {
        self.inner.lock().unwrap_or_else(recover).preview_window.is_some()
    }

    pub fn update_preview_request(&self, params: &Parameters) -> Result<(), CameraError> {
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        if inner.preview_request.is_empty() {
            inner.preview_request = self.device()?.create_default_request(RequestTemplate::Preview)?;
        }
        params.update_request(&mut inner.preview_request).map_err(|e| {
            log::error!("Camera {}: unable to update preview request: {}", self.camera_id, e);
            e
        })?;
        let id = inner.preview_request_ids.current();
        inner.preview_request.request_id = Some(id);
        Ok(())
    }

    pub fn update_preview_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let device = self.device()?;
        let mut inner = self.inner.lock().unwrap_or_else(recover);

        if let Some(id) = inner.preview_stream_id {
            let info = device.get_stream_info(id)?;
            if info.width != params.preview_size.width || info.height != params.preview_size.height {
                log::debug!(
                    "Camera {}: preview size switch {}x{} -> {}x{}",
                    self.camera_id,
                    info.width,
                    info.height,
                    params.preview_size.width,
                    params.preview_size.height
                );
                device.wait_until_drained()?;
                device.delete_stream(id)?;
                inner.preview_stream_id = None;
            }
        }

        if inner.preview_stream_id.is_none() {
            let window = inner.preview_window.as_ref().ok_or_else(|| {
                CameraError::invalid_operation(format!("Camera {}: no preview window", self.camera_id))
            })?;
            let id = device.create_stream(
                Arc::downgrade(window),
                params.preview_size.width,
                params.preview_size.height,
                PixelFormat::Opaque,
                0,
            )?;
            inner.preview_stream_id = Some(id);
        }

        if let Some(id) = inner.preview_stream_id {
            device.set_stream_transform(id, params.preview_transform)?;
        }
        Ok(())
    }

    pub fn delete_preview_stream(&self) -> Result<(), CameraError> {
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        if let Some(id) = inner.preview_stream_id {
            let device = self.device()?;
            device.wait_until_drained()?;
            device.delete_stream(id)?;
            inner.preview_stream_id = None;
        }
        Ok(())
    }

    pub fn preview_stream_id(&self) -> Option<StreamId> {
        self.inner.lock().unwrap_or_else(recover).preview_stream_id
    }

    /// Resize the recording heap. Only allowed while not recording.
    pub fn set_recording_buffer_count(&self, count: usize) -> Result<(), CameraError> {
        if count == 0 || count > self.config.max_recording_heap_count {
            return Err(CameraError::bad_value(format!(
                "Camera {}: recording buffer count {} outside 1..={}",
                self.camera_id, count, self.config.max_recording_heap_count
            )));
        }

        let mut inner = self.inner.lock().unwrap_or_else(recover);
        if inner.recording_heap_count != count {
            if inner.active_request == StreamType::Record {
                return Err(CameraError::invalid_operation(format!(
                    "Camera {}: cannot resize recording heap while recording",
                    self.camera_id
                )));
            }
            inner.recording_heap_count = count;
            // Reallocated lazily on the next recording frame
            let outstanding = inner
                .recording_heap
                .take()
                .map(|mut heap| heap.drain())
                .unwrap_or_default();
            drop(inner);
            self.release_buffers(outstanding);
        }
        Ok(())
    }

    pub fn recording_buffer_count(&self) -> usize {
        self.inner.lock().unwrap_or_else(recover).recording_heap_count
    }

    pub fn update_recording_request(&self, params: &Parameters) -> Result<(), CameraError> {
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        if inner.recording_request.is_empty() {
            inner.recording_request = self.device()?.create_default_request(RequestTemplate::VideoRecord)?;
        }
        params.update_request(&mut inner.recording_request)?;
        let id = inner.recording_request_ids.current();
        inner.recording_request.request_id = Some(id);
        Ok(())
    }

    pub fn update_recording_stream(&self, params: &Parameters) -> Result<(), CameraError> {
        let device = self.device()?;
        let mut inner = self.inner.lock().unwrap_or_else(recover);

        if let Some(id) = inner.recording_stream_id {
            let info = device.get_stream_info(id)?;
            if info.width != params.video_size.width || info.height != params.video_size.height {
                device.wait_until_drained()?;
                device.delete_stream(id)?;
                inner.recording_stream_id = None;
            }
        }

        if inner.recording_stream_id.is_none() {
            let consumer: Weak<dyn StreamConsumer> = self.self_ref.clone();
            let id = device.create_stream(
                consumer,
                params.video_size.width,
                params.video_size.height,
                PixelFormat::Opaque,
                0,
            )?;
            inner.recording_stream_id = Some(id);
        }
        Ok(())
    }

    pub fn delete_recording_stream(&self) -> Result<(), CameraError> {
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        if let Some(id) = inner.recording_stream_id {
            let device = self.device()?;
            device.wait_until_drained()?;
            device.delete_stream(id)?;
            inner.recording_stream_id = None;
        }
        Ok(())
    }

    pub fn recording_stream_id(&self) -> Option<StreamId> {
        self.inner.lock().unwrap_or_else(recover).recording_stream_id
    }

    /// Make `stream_ids` the target of the repeating request of `kind`.
    pub fn start_stream(&self, kind: StreamType, stream_ids: &[StreamId]) -> Result<(), CameraError> {
        if kind == StreamType::None {
            return Err(CameraError::invalid_operation(format!(
                "Camera {}: cannot start a stream of type None",
                self.camera_id
            )));
        }
        let device = self.device()?;
        let mut inner = self.inner.lock().unwrap_or_else(recover);

        let outstanding = match inner.recording_stream_id {
            Some(rec) if stream_ids.contains(&rec) => inner
                .recording_heap
                .as_mut()
                .map(RecordingHeap::drain)
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        let request = if kind == StreamType::Preview {
            &mut inner.preview_request
        } else {
            &mut inner.recording_request
        };
        request.output_streams = stream_ids.to_vec();
        device.set_streaming_request(request).map_err(|e| {
            log::error!("Camera {}: unable to set streaming request: {}", self.camera_id, e);
            e
        })?;

        inner.active_request = kind;
        inner.paused = false;
        inner.active_stream_ids = stream_ids.to_vec();
        drop(inner);

        if !outstanding.is_empty() {
            log::warn!(
                "Camera {}: reclaiming {} recording frames still held by the client",
                self.camera_id,
                outstanding.len()
            );
            self.release_buffers(outstanding);
        }
        Ok(())
    }

    /// Clear the repeating request without forgetting it, or restore it.
    pub fn toggle_pause_stream(&self, pause: bool) -> Result<(), CameraError> {
        let device = self.device()?;
        let mut inner = self.inner.lock().unwrap_or_else(recover);

        if inner.active_request == StreamType::None {
            return Err(CameraError::invalid_operation(format!(
                "Camera {}: no active stream to pause",
                self.camera_id
            )));
        }
        if inner.paused == pause {
            return Ok(());
        }

        if pause {
            device.clear_streaming_request()?;
        } else {
            let request = if inner.active_request == StreamType::Preview {
                &inner.preview_request
            } else {
                &inner.recording_request
            };
            device.set_streaming_request(request)?;
        }
        inner.paused = pause;
        Ok(())
    }

    pub fn stop_stream(&self) -> Result<(), CameraError> {
        let device = self.device()?;
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        device.clear_streaming_request()?;
        inner.active_request = StreamType::None;
        inner.active_stream_ids.clear();
        inner.paused = false;
        Ok(())
    }

    /// Request id of the running repeating request, if any.
    pub fn active_request_id(&self) -> Option<i32> {
        let inner = self.inner.lock().unwrap_or_else(recover);
        match inner.active_request {
            StreamType::None => None,
            StreamType::Preview => inner.preview_request.request_id,
            StreamType::Record => inner.recording_request.request_id,
        }
    }

    pub fn active_stream_type(&self) -> StreamType {
        self.inner.lock().unwrap_or_else(recover).active_request
    }

    pub fn active_stream_ids(&self) -> Vec<StreamId> {
        self.inner.lock().unwrap_or_else(recover).active_stream_ids.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap_or_else(recover).paused
    }

    pub fn preview_request_id(&self) -> i32 {
        self.inner.lock().unwrap_or_else(recover).preview_request_ids.current()
    }

    pub fn recording_request_id(&self) -> i32 {
        self.inner.lock().unwrap_or_else(recover).recording_request_ids.current()
    }

    /// Move preview and recording to fresh request ids so that results of
    /// already queued requests can be told apart.
    pub fn increment_streaming_ids(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(recover);
        inner.preview_request_ids.advance();
        inner.recording_request_ids.advance();
    }

    /// Hand a recording frame back from the client.
    pub fn release_recording_frame(&self, frame: &RecordingFrame) -> Result<(), CameraError> {
        let buffer = {
            let mut inner = self.inner.lock().unwrap_or_else(recover);
            let heap = inner.recording_heap.as_mut().ok_or_else(|| {
                CameraError::invalid_operation(format!("Camera {}: no recording heap", self.camera_id))
            })?;
            heap.reclaim(frame).ok_or_else(|| {
                log::error!(
                    "Camera {}: frame (heap {}, slot {}) does not belong to the recording heap",
                    self.camera_id,
                    frame.heap_id,
                    frame.slot
                );
                CameraError::bad_value("unknown recording frame")
            })?
        };
        self.release_buffers(vec![buffer]);
        Ok(())
    }

    /// Take back every frame still lent out, e.g. when a new recording
    /// starts and the client can no longer hold frames from the last one.
    pub fn release_all_recording_frames(&self) {
        let outstanding = {
            let mut inner = self.inner.lock().unwrap_or_else(recover);
            inner.recording_heap.as_mut().map(|heap| heap.drain()).unwrap_or_default()
        };
        if !outstanding.is_empty() {
            log::warn!(
                "Camera {}: releasing {} recording frames the client never returned",
                self.camera_id,
                outstanding.len()
            );
            self.release_buffers(outstanding);
        }
    }

    pub fn recording_frames_outstanding(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(recover);
        inner
            .recording_heap
            .as_ref()
            .map(|h| h.capacity() - h.free())
            .unwrap_or(0)
    }

    fn release_buffers(&self, buffers: Vec<CameraBuffer>) {
        let Ok(device) = self.device() else {
            return;
        };
        for buffer in buffers {
            if let Err(e) = device.release_buffer(buffer.stream_id, buffer.id) {
                log::warn!("Camera {}: releasing buffer {}: {}", self.camera_id, buffer.id, e);
            }
        }
    }

    fn process_recording_frame(&self, buffer: CameraBuffer) {
        let Some(client) = self.client.upgrade() else {
            self.release_buffers(vec![buffer]);
            return;
        };

        let recording = matches!(
            client.parameters().state(),
            CameraState::Record | CameraState::VideoSnapshot
        );
        if !recording {
            log::trace!("Camera {}: discarding recording buffer outside recording", self.camera_id);
            self.release_buffers(vec![buffer]);
            return;
        }

        let lent = {
            let mut inner = self.inner.lock().unwrap_or_else(recover);
            if inner.recording_heap.is_none() {
                let heap_id = inner.next_heap_id;
                inner.next_heap_id = inner.next_heap_id.wrapping_add(1);
                let count = inner.recording_heap_count;
                log::debug!("Camera {}: creating recording heap with {} slots", self.camera_id, count);
                inner.recording_heap = Some(RecordingHeap::new(heap_id, count));
            }
            inner.recording_frame_count += 1;
            match inner.recording_heap.as_mut() {
                Some(heap) => heap.lend(buffer),
                None => Err(buffer),
            }
        };

        match lent {
            Ok(frame) => {
                if let Some(callbacks) = client.callbacks().get() {
                    callbacks.recording_frame(frame.timestamp, frame);
                }
            }
            Err(buffer) => {
                log::error!(
                    "Camera {}: no free recording buffers, dropping frame {}",
                    self.camera_id,
                    buffer.id
                );
                self.release_buffers(vec![buffer]);
            }
        }
    }
}

impl StreamConsumer for StreamingProcessor {
    fn on_buffer_available(&self, buffer: CameraBuffer) {
        self.pending.lock().unwrap_or_else(recover).push_back(buffer);
        self.recording_available.notify_one();
    }
}

impl ThreadLoop for StreamingProcessor {
    fn thread_loop(&self) -> bool {
        let buffer = {
            let pending = self.pending.lock().unwrap_or_else(recover);
            let (mut pending, _) = self
                .recording_available
                .wait_timeout_while(pending, self.config.wait_duration(), |q| q.is_empty())
                .unwrap_or_else(recover);
            pending.pop_front()
        };

        if let Some(buffer) = buffer {
            self.process_recording_frame(buffer);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buffer(id: u64) -> CameraBuffer {
        CameraBuffer {
            id,
            stream_id: 3,
            timestamp: id as i64 * 1000,
            data: Bytes::from_static(b"frame"),
        }
    }

    #[test]
    fn test_heap_lends_until_full() {
        let mut heap = RecordingHeap::new(1, 2);
        let a = heap.lend(buffer(1)).unwrap();
        let b = heap.lend(buffer(2)).unwrap();
        assert_ne!(a.slot, b.slot);
        let rejected = heap.lend(buffer(3)).unwrap_err();
        assert_eq!(rejected.id, 3);
        assert_eq!(heap.free(), 0);
    }

    #[test]
    fn test_heap_reclaim_frees_slot() {
        let mut heap = RecordingHeap::new(1, 1);
        let frame = heap.lend(buffer(1)).unwrap();
        assert_eq!(heap.reclaim(&frame).unwrap().id, 1);
        assert!(heap.reclaim(&frame).is_none());
        assert!(heap.lend(buffer(2)).is_ok());
    }

    #[test]
    fn test_heap_rejects_foreign_frame() {
        let mut heap = RecordingHeap::new(1, 2);
        let mut frame = heap.lend(buffer(1)).unwrap();
        frame.heap_id = 9;
        assert!(heap.reclaim(&frame).is_none());
        assert_eq!(heap.free(), 1);
    }

    #[test]
    fn test_heap_drain_returns_everything() {
        let mut heap = RecordingHeap::new(1, 3);
        heap.lend(buffer(1)).unwrap();
        heap.lend(buffer(2)).unwrap();
        assert_eq!(heap.drain().len(), 2);
        assert_eq!(heap.free(), 3);
    }
}
