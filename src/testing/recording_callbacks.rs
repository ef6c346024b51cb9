//! Callback sinks that record what the client delivered

use crate::callbacks::{CameraClientCallbacks, FrameMetadata, Notification, RecordingFrame, Sound};
use crate::device::{CameraBuffer, StreamConsumer};
use crate::errors::recover;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Notify(Notification),
    CompressedImage(Bytes),
    PreviewMetadata(FrameMetadata),
    PreviewFrame(usize),
    RecordingFrame { timestamp: i64, frame: RecordingFrame },
    Sound(Sound),
}

/// Records every callback in arrival order.
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<CallbackEvent>>,
    arrived: Condvar,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: CallbackEvent) {
        self.events.lock().unwrap_or_else(recover).push(event);
        self.arrived.notify_all();
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().unwrap_or_else(recover).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(recover).clear();
    }

    /// Block until some recorded event satisfies `predicate`.
    pub fn wait_for(&self, predicate: impl Fn(&CallbackEvent) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap_or_else(recover);
        loop {
            if events.iter().any(&predicate) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .arrived
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(recover)
                .0;
        }
    }

    pub fn wait_for_image(&self, timeout: Duration) -> bool {
        self.wait_for(|e| matches!(e, CallbackEvent::CompressedImage(_)), timeout)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    pub fn images(&self) -> Vec<Bytes> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::CompressedImage(image) => Some(image),
                _ => None,
            })
            .collect()
    }

    pub fn sounds(&self) -> Vec<Sound> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::Sound(sound) => Some(sound),
                _ => None,
            })
            .collect()
    }

    pub fn recording_frames(&self) -> Vec<RecordingFrame> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CallbackEvent::RecordingFrame { frame, .. } => Some(frame),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&CallbackEvent) -> bool) -> usize {
        self.events.lock().unwrap_or_else(recover).iter().filter(|e| predicate(e)).count()
    }
}

impl CameraClientCallbacks for RecordingCallbacks {
    fn notify(&self, notification: Notification) {
        self.push(CallbackEvent::Notify(notification));
    }

    fn compressed_image(&self, image: Bytes) {
        self.push(CallbackEvent::CompressedImage(image));
    }

    fn preview_metadata(&self, metadata: &FrameMetadata) {
        self.push(CallbackEvent::PreviewMetadata(metadata.clone()));
    }

    fn preview_frame(&self, frame: Bytes) {
        self.push(CallbackEvent::PreviewFrame(frame.len()));
    }

    fn recording_frame(&self, timestamp: i64, frame: RecordingFrame) {
        self.push(CallbackEvent::RecordingFrame { timestamp, frame });
    }

    fn play_sound(&self, sound: Sound) {
        self.push(CallbackEvent::Sound(sound));
    }
}

/// A preview surface that only counts what it is handed.
#[derive(Default)]
pub struct TestPreviewWindow {
    buffers: AtomicUsize,
}

impl TestPreviewWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffers_received(&self) -> usize {
        self.buffers.load(Ordering::SeqCst)
    }
}

impl StreamConsumer for TestPreviewWindow {
    fn on_buffer_available(&self, _buffer: CameraBuffer) {
        self.buffers.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_for_sees_late_event() {
        let sink = Arc::new(RecordingCallbacks::new());
        let producer = sink.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.compressed_image(Bytes::from_static(b"jpeg"));
        });
        assert!(sink.wait_for_image(Duration::from_secs(2)));
        handle.join().unwrap();
        assert_eq!(sink.images(), vec![Bytes::from_static(b"jpeg")]);
    }

    #[test]
    fn test_wait_for_gives_up() {
        let sink = RecordingCallbacks::new();
        sink.notify(Notification::Shutter);
        assert!(!sink.wait_for_image(Duration::from_millis(5)));
        assert_eq!(sink.notifications(), vec![Notification::Shutter]);
    }
}
