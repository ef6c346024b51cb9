//! Shared harness for integration tests: a connected client on a mock device.

#![allow(dead_code)]

use crabcapture::device::{DeviceInfo, DeviceVersion, StreamConsumer};
use crabcapture::testing::{MockCameraDevice, RecordingCallbacks, TestPreviewWindow};
use crabcapture::{Camera2Client, CameraDevice, CameraSettings, CrabCaptureConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const OWNER: u64 = 1;
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Short waits so timeout paths finish quickly.
pub fn fast_config() -> CrabCaptureConfig {
    let mut config = CrabCaptureConfig::default();
    config.sequencer.wait_duration_ms = 20;
    config.sequencer.stop_capture_timeout_ms = 2000;
    config.zsl.wait_duration_ms = 5;
    config.streaming.wait_duration_ms = 10;
    config.frame.wait_duration_ms = 5;
    config.client.sync_timeout_ms = 50;
    config
}

pub struct Harness {
    pub device: Arc<MockCameraDevice>,
    pub client: Arc<Camera2Client>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub window: Arc<TestPreviewWindow>,
}

impl Harness {
    pub fn new(version: DeviceVersion) -> Self {
        Self::with_info(version, DeviceInfo::default(), true)
    }

    pub fn with_info(version: DeviceVersion, info: DeviceInfo, will_notify_3a: bool) -> Self {
        let device = MockCameraDevice::with_info(0, version, info, will_notify_3a);
        let shared: Arc<dyn CameraDevice> = device.clone();
        let client = Camera2Client::open(shared, fast_config()).expect("client opens");
        let callbacks = Arc::new(RecordingCallbacks::new());
        client.connect(OWNER, callbacks.clone()).expect("client connects");
        Self {
            device,
            client,
            callbacks,
            window: Arc::new(TestPreviewWindow::new()),
        }
    }

    pub fn attach_window(&self) {
        let window: Arc<dyn StreamConsumer> = self.window.clone();
        self.client.set_preview_target(Some(window)).expect("preview target accepted");
    }

    /// Window attached and preview running.
    pub fn previewing(version: DeviceVersion) -> Self {
        let harness = Self::new(version);
        harness.attach_window();
        harness.client.start_preview().expect("preview starts");
        harness
    }

    pub fn update_settings(&self, change: impl FnOnce(&mut CameraSettings)) {
        let mut settings = self.client.get_parameters();
        change(&mut settings);
        self.client.set_parameters(settings).expect("settings accepted");
    }

    pub fn emit_preview_frames(&self, count: usize) {
        for _ in 0..count {
            self.device.emit_preview_frame().expect("preview frame emitted");
            std::thread::sleep(Duration::from_millis(3));
        }
    }

    pub fn wait_idle(&self) {
        self.client
            .sequencer()
            .wait_until_idle(EVENT_TIMEOUT)
            .expect("sequencer returns to idle");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
