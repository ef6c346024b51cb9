//! Still-capture state machine
//!
//! A single worker walks each still capture from the client's request to the
//! delivered image. Inputs (start requests, AE notifications, result frames,
//! compressed images) arrive from other threads into a mutex-guarded mailbox
//! and are consumed by the state handlers with bounded waits.
//!
//! ```text
//! IDLE -> START -+-> ZSL_START ----------------------------+
//!                |      | (no settled frame)                |
//!                |      v                                   v
//!                +-> STANDARD_START -> [PRECAPTURE_WAIT] -> STANDARD_CAPTURE
//!                |                                          |
//!                +-> BURST_CAPTURE_START                    v
//!                        |               STANDARD_CAPTURE_WAIT -> DONE -> IDLE
//!                        +-> BURST_CAPTURE_WAIT -----------------^
//! ```
//!
//! Device errors end the attempt in DONE without an image. Timeouts are
//! soft: the machine moves on to the next state. ERROR is terminal.

use crate::callbacks::{MessageMask, Notification, Sound};
use crate::client::Camera2Client;
use crate::config::SequencerConfig;
use crate::errors::{recover, CameraError};
use crate::metadata::{AeState, CameraMetadata, CaptureIntent, RequestTemplate};
use crate::params::{CameraState, FlashMode, LightFx};
use crate::processors::burst::BurstCapture;
use crate::processors::frame::FilteredListener;
use crate::processors::zsl::ZslState;
use crate::request_ids::{RequestIdCounter, CAPTURE_REQUEST_IDS};
use crate::timing;
use crate::worker::ThreadLoop;
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

const STATE_HISTORY_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Idle,
    Start,
    ZslStart,
    ZslWaiting,
    ZslReprocessing,
    StandardStart,
    StandardPrecaptureWait,
    StandardCapture,
    StandardCaptureWait,
    BurstCaptureStart,
    BurstCaptureWait,
    Done,
    Error,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "IDLE",
            CaptureState::Start => "START",
            CaptureState::ZslStart => "ZSL_START",
            CaptureState::ZslWaiting => "ZSL_WAITING",
            CaptureState::ZslReprocessing => "ZSL_REPROCESSING",
            CaptureState::StandardStart => "STANDARD_START",
            CaptureState::StandardPrecaptureWait => "STANDARD_PRECAPTURE_WAIT",
            CaptureState::StandardCapture => "STANDARD_CAPTURE",
            CaptureState::StandardCaptureWait => "STANDARD_CAPTURE_WAIT",
            CaptureState::BurstCaptureStart => "BURST_CAPTURE_START",
            CaptureState::BurstCaptureWait => "BURST_CAPTURE_WAIT",
            CaptureState::Done => "DONE",
            CaptureState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Inputs written by other threads.
struct Mailbox {
    start_capture: bool,
    busy: bool,
    msg_type: MessageMask,

    new_ae_state: bool,
    ae_state: AeState,
    ae_trigger_id: i32,

    new_frame_received: bool,
    new_frame_id: i32,
    new_frame: CameraMetadata,

    new_capture_received: bool,
    capture_timestamp: i64,
    capture_buffer: Option<Bytes>,
}

struct StateRecord {
    current: CaptureState,
    history: VecDeque<CaptureState>,
}

/// Owned by the worker for the length of one capture.
struct Sequence {
    capture_ids: RequestIdCounter,
    capture_request: CameraMetadata,
    trigger_id: i32,
    timeout_count: i32,
    ae_in_precapture: bool,
    shutter_notified: bool,
    failed: bool,
}

pub struct CaptureSequencer {
    camera_id: i32,
    client: Weak<Camera2Client>,
    self_ref: Weak<CaptureSequencer>,
    config: SequencerConfig,
    burst: BurstCapture,

    input: Mutex<Mailbox>,
    start_signal: Condvar,
    new_notify_signal: Condvar,
    new_frame_signal: Condvar,
    new_capture_signal: Condvar,

    state: Mutex<StateRecord>,
    state_changed: Condvar,

    sequence: Mutex<Sequence>,
}

impl CaptureSequencer {
    pub fn new(camera_id: i32, client: Weak<Camera2Client>, config: SequencerConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            camera_id,
            client,
            self_ref: self_ref.clone(),
            config,
            burst: BurstCapture::new(camera_id),
            input: Mutex::new(Mailbox {
                start_capture: false,
                busy: false,
                msg_type: MessageMask::default(),
                new_ae_state: false,
                ae_state: AeState::Inactive,
                ae_trigger_id: 0,
                new_frame_received: false,
                new_frame_id: 0,
                new_frame: CameraMetadata::new(),
                new_capture_received: false,
                capture_timestamp: 0,
                capture_buffer: None,
            }),
            start_signal: Condvar::new(),
            new_notify_signal: Condvar::new(),
            new_frame_signal: Condvar::new(),
            new_capture_signal: Condvar::new(),
            state: Mutex::new(StateRecord {
                current: CaptureState::Idle,
                history: VecDeque::with_capacity(STATE_HISTORY_DEPTH),
            }),
            state_changed: Condvar::new(),
            sequence: Mutex::new(Sequence {
                capture_ids: RequestIdCounter::new(CAPTURE_REQUEST_IDS),
                capture_request: CameraMetadata::new(),
                trigger_id: 0,
                timeout_count: 0,
                ae_in_precapture: false,
                shutter_notified: false,
                failed: false,
            }),
        })
    }

    fn mailbox(&self) -> MutexGuard<'_, Mailbox> {
        self.input.lock().unwrap_or_else(recover)
    }

    /// Begin a capture. Non-blocking.
    pub fn start_capture(&self, msg_type: MessageMask) -> Result<(), CameraError> {
        if self.state() == CaptureState::Error {
            return Err(CameraError::invalid_operation(format!(
                "Camera {}: capture sequencer stopped after an error",
                self.camera_id
            )));
        }

        let mut input = self.mailbox();
        if input.busy {
            log::error!("Camera {}: already running a capture", self.camera_id);
            return Err(CameraError::AlreadyActive);
        }
        input.busy = true;
        input.msg_type = msg_type;
        input.start_capture = true;
        self.start_signal.notify_one();
        Ok(())
    }

    /// Block until no capture is pending or running.
    pub fn wait_until_idle(&self, timeout: Duration) -> Result<(), CameraError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(recover);
        loop {
            if state.current == CaptureState::Idle && !self.mailbox().busy {
                return Ok(());
            }
            let Some(remaining) = timing::remaining(deadline) else {
                log::debug!(
                    "Camera {}: still in {} after {:?}",
                    self.camera_id,
                    state.current,
                    timeout
                );
                return Err(CameraError::TimedOut);
            };
            let (guard, _) = self
                .state_changed
                .wait_timeout(state, remaining.min(self.config.wait_duration()))
                .unwrap_or_else(recover);
            state = guard;
        }
    }

    pub fn notify_auto_exposure(&self, new_state: AeState, trigger_id: i32) {
        let mut input = self.mailbox();
        input.ae_state = new_state;
        input.ae_trigger_id = trigger_id;
        if !input.new_ae_state {
            input.new_ae_state = true;
            self.new_notify_signal.notify_one();
        }
    }

    pub fn on_capture_available(&self, timestamp: i64, buffer: Bytes) {
        let mut input = self.mailbox();
        input.capture_timestamp = timestamp;
        input.capture_buffer = Some(buffer);
        if !input.new_capture_received {
            input.new_capture_received = true;
            self.new_capture_signal.notify_one();
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state.lock().unwrap_or_else(recover).current
    }

    pub fn is_busy(&self) -> bool {
        self.mailbox().busy
    }

    /// States entered so far, oldest first, bounded to the most recent ones.
    pub fn state_history(&self) -> Vec<CaptureState> {
        self.state.lock().unwrap_or_else(recover).history.iter().copied().collect()
    }

    /// Request id the next capture will use.
    pub fn capture_id(&self) -> i32 {
        self.sequence.lock().unwrap_or_else(recover).capture_ids.current()
    }

    fn set_state(&self, next: CaptureState) {
        let mut state = self.state.lock().unwrap_or_else(recover);
        log::trace!("Camera {}: capture state {} -> {}", self.camera_id, state.current, next);
        state.current = next;
        if state.history.len() >= STATE_HISTORY_DEPTH {
            state.history.pop_front();
        }
        state.history.push_back(next);
        self.state_changed.notify_all();
    }

    fn frame_listener(&self) -> Weak<dyn FilteredListener> {
        self.self_ref.clone()
    }

    fn wait_duration(&self) -> Duration {
        self.config.wait_duration()
    }

    fn fail(&self, seq: &mut Sequence, what: &str, err: &CameraError) -> CaptureState {
        log::error!("Camera {}: {}: {}", self.camera_id, what, err);
        seq.failed = true;
        CaptureState::Done
    }

    fn manage_idle(&self) -> CaptureState {
        let input = self.mailbox();
        let (mut input, _) = self
            .start_signal
            .wait_timeout_while(input, self.wait_duration(), |i| !i.start_capture)
            .unwrap_or_else(recover);
        if input.start_capture {
            input.start_capture = false;
            CaptureState::Start
        } else {
            CaptureState::Idle
        }
    }

    fn manage_start(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        seq.failed = false;
        seq.shutter_notified = false;
        seq.ae_in_precapture = false;
        {
            let mut input = self.mailbox();
            input.new_frame_received = false;
            input.new_capture_received = false;
            input.capture_buffer = None;
        }

        if let Err(e) = self.update_capture_request(client, seq) {
            return self.fail(seq, "unable to update capture request", &e);
        }

        let (state, light_fx, zsl_mode, flash_mode) = {
            let params = client.parameters().lock();
            (params.state, params.light_fx, params.zsl_mode, params.flash_mode)
        };

        if light_fx != LightFx::None && state == CameraState::StillCapture {
            CaptureState::BurstCaptureStart
        } else if zsl_mode && state == CameraState::StillCapture && flash_mode != FlashMode::On {
            CaptureState::ZslStart
        } else {
            CaptureState::StandardStart
        }
    }

    fn update_capture_request(&self, client: &Camera2Client, seq: &mut Sequence) -> Result<(), CameraError> {
        if seq.capture_request.is_empty() {
            let device = client.device().ok_or(CameraError::DeadObject)?;
            seq.capture_request = device.create_default_request(RequestTemplate::StillCapture)?;
        }
        let params = client.parameters().lock();
        params.update_request(&mut seq.capture_request)?;
        params.update_request_jpeg(&mut seq.capture_request)?;
        Ok(())
    }

    fn manage_zsl_start(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        let capture_id = seq.capture_ids.current();
        client.register_frame_listener(capture_id, capture_id + 1, self.frame_listener());

        match client.zsl_processor().push_to_reprocess(capture_id) {
            Ok(()) => {}
            Err(CameraError::NotEnoughData) => {
                log::debug!(
                    "Camera {}: no usable ZSL frame, falling back to a standard capture",
                    self.camera_id
                );
                return CaptureState::StandardStart;
            }
            Err(CameraError::DeadObject) => {
                return self.fail(seq, "unable to push ZSL frame for reprocessing", &CameraError::DeadObject)
            }
            Err(e) => {
                log::warn!(
                    "Camera {}: ZSL reprocess unavailable ({}), falling back to a standard capture",
                    self.camera_id,
                    e
                );
                return CaptureState::StandardStart;
            }
        }

        // Reprocessing has no separate exposure, so the shutter is now
        let msg_type = self.mailbox().msg_type;
        self.shutter_notify(client, msg_type);
        seq.shutter_notified = true;
        seq.timeout_count = self.config.max_timeouts_capture_end as i32;
        CaptureState::StandardCaptureWait
    }

    // Reprocessing is tracked by the standard capture wait; these states are
    // never entered, so reaching one just finishes the capture.
    fn manage_zsl_waiting(&self) -> CaptureState {
        CaptureState::Done
    }

    fn manage_zsl_reprocessing(&self) -> CaptureState {
        CaptureState::Done
    }

    fn manage_standard_start(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        let capture_id = seq.capture_ids.current();
        client.register_frame_listener(capture_id, capture_id + 1, self.frame_listener());

        let ae_converged = self.mailbox().ae_state == AeState::Converged;
        {
            let mut params = client.parameters().lock();
            if params.flash_mode != FlashMode::On && ae_converged {
                return CaptureState::StandardCapture;
            }
            seq.trigger_id = params.precapture_trigger_counter;
            params.precapture_trigger_counter += 1;
        }

        let Some(device) = client.device() else {
            return self.fail(seq, "device gone before precapture", &CameraError::DeadObject);
        };
        if let Err(e) = device.trigger_precapture_metering(seq.trigger_id) {
            return self.fail(seq, "unable to trigger precapture metering", &e);
        }

        seq.ae_in_precapture = false;
        seq.timeout_count = self.config.max_timeouts_precapture_start as i32;
        CaptureState::StandardPrecaptureWait
    }

    fn manage_standard_precapture_wait(&self, seq: &mut Sequence) -> CaptureState {
        let mut input = self.mailbox();
        while !input.new_ae_state {
            let (guard, result) = self
                .new_notify_signal
                .wait_timeout(input, self.wait_duration())
                .unwrap_or_else(recover);
            input = guard;
            if result.timed_out() {
                seq.timeout_count -= 1;
                break;
            }
        }

        if seq.timeout_count <= 0 {
            log::warn!(
                "Camera {}: timed out waiting for precapture {}",
                self.camera_id,
                if seq.ae_in_precapture { "end" } else { "start" }
            );
            return CaptureState::StandardCapture;
        }

        if input.new_ae_state {
            if !seq.ae_in_precapture {
                if input.ae_trigger_id == seq.trigger_id && input.ae_state == AeState::Precapture {
                    seq.ae_in_precapture = true;
                    seq.timeout_count = self.config.max_timeouts_precapture_end as i32;
                }
            } else if input.ae_trigger_id == seq.trigger_id && input.ae_state != AeState::Precapture {
                input.new_ae_state = false;
                return CaptureState::StandardCapture;
            }
            input.new_ae_state = false;
        }
        CaptureState::StandardPrecaptureWait
    }

    fn manage_standard_capture(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        let Some(device) = client.device() else {
            return self.fail(seq, "device gone before capture", &CameraError::DeadObject);
        };

        let (state, callbacks_enabled) = {
            let params = client.parameters().lock();
            (params.state, params.preview_callbacks_enabled())
        };

        let mut outputs = Vec::with_capacity(4);
        if let Some(preview) = client.preview_stream_id() {
            outputs.push(preview);
        }
        match client.capture_stream_id() {
            Some(capture) => outputs.push(capture),
            None => {
                return self.fail(seq, "no capture stream", &CameraError::invalid_operation("capture stream missing"));
            }
        }
        if callbacks_enabled {
            if let Some(callback) = client.callback_stream_id() {
                outputs.push(callback);
            }
        }
        if state == CameraState::VideoSnapshot {
            if let Some(recording) = client.recording_stream_id() {
                outputs.push(recording);
            }
        }

        let capture_id = seq.capture_ids.current();
        let mut request = seq.capture_request.clone();
        request.output_streams = outputs;
        request.request_id = Some(capture_id);
        request.capture_intent = Some(if state == CameraState::VideoSnapshot {
            CaptureIntent::VideoSnapshot
        } else {
            CaptureIntent::StillCapture
        });

        if state == CameraState::StillCapture {
            if let Err(e) = client.stop_stream() {
                return self.fail(seq, "unable to stop preview for still capture", &e);
            }
        }

        if let Err(e) = device.capture(request) {
            return self.fail(seq, "unable to submit still capture request", &e);
        }

        seq.timeout_count = self.config.max_timeouts_capture_end as i32;
        CaptureState::StandardCaptureWait
    }

    fn manage_standard_capture_wait(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        let (frame_arrived, msg_type) = {
            let mut input = self.mailbox();
            while !input.new_frame_received {
                let (guard, result) = self
                    .new_frame_signal
                    .wait_timeout(input, self.wait_duration())
                    .unwrap_or_else(recover);
                input = guard;
                if result.timed_out() {
                    seq.timeout_count -= 1;
                    break;
                }
            }
            (input.new_frame_received, input.msg_type)
        };

        // First result frame stands in for the shutter closing
        if frame_arrived && !seq.shutter_notified {
            self.shutter_notify(client, msg_type);
            seq.shutter_notified = true;
        }

        let mut input = self.mailbox();
        while input.new_frame_received && !input.new_capture_received {
            let (guard, result) = self
                .new_capture_signal
                .wait_timeout(input, self.wait_duration())
                .unwrap_or_else(recover);
            input = guard;
            if result.timed_out() {
                seq.timeout_count -= 1;
                break;
            }
        }

        if seq.timeout_count <= 0 {
            log::warn!("Camera {}: timed out waiting for capture to complete", self.camera_id);
            return CaptureState::Done;
        }

        if input.new_frame_received && input.new_capture_received {
            let capture_id = seq.capture_ids.current();
            if input.new_frame_id != capture_id {
                log::warn!(
                    "Camera {}: capture result id {} does not match request id {}",
                    self.camera_id,
                    input.new_frame_id,
                    capture_id
                );
            }
            match input.new_frame.sensor_timestamp {
                None => log::error!("Camera {}: no timestamp in capture frame", self.camera_id),
                Some(ts) if ts != input.capture_timestamp => log::warn!(
                    "Camera {}: capture image timestamp {} does not match frame timestamp {}",
                    self.camera_id,
                    input.capture_timestamp,
                    ts
                ),
                Some(_) => {}
            }
            input.new_frame_received = false;
            input.new_capture_received = false;
            return CaptureState::Done;
        }
        CaptureState::StandardCaptureWait
    }

    fn manage_burst_capture_start(&self, seq: &mut Sequence) -> CaptureState {
        let requests = vec![seq.capture_request.clone()];
        match self.burst.start(&requests, seq.capture_ids.current()) {
            Ok(()) => {
                seq.timeout_count = self.config.max_timeouts_capture_end as i32 * 10;
                CaptureState::BurstCaptureWait
            }
            Err(e) => self.fail(seq, "unable to start burst capture", &e),
        }
    }

    fn manage_burst_capture_wait(&self, seq: &mut Sequence) -> CaptureState {
        let mut input = self.mailbox();
        while !input.new_capture_received {
            let (guard, result) = self
                .new_capture_signal
                .wait_timeout(input, self.wait_duration())
                .unwrap_or_else(recover);
            input = guard;
            if result.timed_out() {
                seq.timeout_count -= 1;
                break;
            }
        }

        if seq.timeout_count <= 0 {
            log::warn!("Camera {}: timed out waiting for burst capture", self.camera_id);
            return CaptureState::Done;
        }
        if input.new_capture_received {
            input.new_capture_received = false;
            return CaptureState::Done;
        }
        CaptureState::BurstCaptureWait
    }

    fn manage_done(&self, client: &Camera2Client, seq: &mut Sequence) -> CaptureState {
        let capture_id = seq.capture_ids.current();
        client.remove_frame_listener(capture_id, capture_id + 1, &self.frame_listener());
        seq.capture_ids.advance();

        let buffer = {
            let mut input = self.mailbox();
            input.busy = false;
            input.new_frame_received = false;
            input.new_capture_received = false;
            input.capture_buffer.take()
        };

        let (restored, drain) = {
            let mut params = client.parameters().lock();
            match params.state {
                CameraState::Disconnected => {
                    log::warn!("Camera {}: capture finished after disconnect", self.camera_id);
                    return CaptureState::Idle;
                }
                CameraState::StillCapture => {
                    params.state = CameraState::Stopped;
                    (true, true)
                }
                CameraState::VideoSnapshot => {
                    params.state = CameraState::Record;
                    (true, false)
                }
                other => {
                    log::error!(
                        "Camera {}: still image produced unexpectedly in state {}",
                        self.camera_id,
                        other
                    );
                    (false, false)
                }
            }
        };

        if drain {
            if let Some(device) = client.device() {
                if let Err(e) = device.wait_until_drained() {
                    log::error!("Camera {}: can't idle after still capture: {}", self.camera_id, e);
                }
            }
        }

        let delivered = buffer.is_some() && restored && !seq.failed;
        let zsl = client.zsl_processor();
        // A reprocess that never produced an image will not release its input
        let cleared = if !delivered && zsl.state() == ZslState::Locked {
            log::warn!("Camera {}: abandoning stalled ZSL reprocess", self.camera_id);
            zsl.abort_reprocess()
        } else {
            zsl.clear_zsl_queue()
        };
        if let Err(e) = cleared {
            log::warn!("Camera {}: clearing ZSL queue: {}", self.camera_id, e);
        }

        match buffer {
            Some(image) if delivered => {
                if let Some(callbacks) = client.callbacks().get() {
                    callbacks.compressed_image(image);
                }
            }
            Some(_) => log::debug!("Camera {}: dropping image of failed capture", self.camera_id),
            None => log::debug!("Camera {}: capture ended without an image", self.camera_id),
        }
        CaptureState::Idle
    }

    fn manage_error(&self) -> CaptureState {
        log::error!(
            "Camera {}: capture sequencer in error state, no further captures",
            self.camera_id
        );
        CaptureState::Error
    }

    fn shutter_notify(&self, client: &Camera2Client, msg_type: MessageMask) {
        let play_sound = {
            let params = client.parameters().lock();
            params.state == CameraState::StillCapture && params.play_shutter_sound
        };

        let Some(callbacks) = client.callbacks().get() else {
            return;
        };
        if msg_type.contains(MessageMask::SHUTTER) {
            if play_sound {
                callbacks.play_sound(Sound::Shutter);
            }
            callbacks.notify(Notification::Shutter);
        }
        if msg_type.contains(MessageMask::RAW_IMAGE_NOTIFY) {
            callbacks.notify(Notification::RawImageNotify);
        }
    }
}

impl FilteredListener for CaptureSequencer {
    fn on_frame_available(&self, request_id: i32, frame: &CameraMetadata) {
        let mut input = self.mailbox();
        input.new_frame_id = request_id;
        input.new_frame = frame.clone();
        if !input.new_frame_received {
            input.new_frame_received = true;
            self.new_frame_signal.notify_one();
        }
    }
}

impl ThreadLoop for CaptureSequencer {
    fn thread_loop(&self) -> bool {
        let Some(client) = self.client.upgrade() else {
            return false;
        };

        let current = self.state();
        let next = {
            let mut guard = self.sequence.lock().unwrap_or_else(recover);
            let seq = &mut *guard;
            match current {
                CaptureState::Idle => self.manage_idle(),
                CaptureState::Start => self.manage_start(&client, seq),
                CaptureState::ZslStart => self.manage_zsl_start(&client, seq),
                CaptureState::ZslWaiting => self.manage_zsl_waiting(),
                CaptureState::ZslReprocessing => self.manage_zsl_reprocessing(),
                CaptureState::StandardStart => self.manage_standard_start(&client, seq),
                CaptureState::StandardPrecaptureWait => self.manage_standard_precapture_wait(seq),
                CaptureState::StandardCapture => self.manage_standard_capture(&client, seq),
                CaptureState::StandardCaptureWait => self.manage_standard_capture_wait(&client, seq),
                CaptureState::BurstCaptureStart => self.manage_burst_capture_start(seq),
                CaptureState::BurstCaptureWait => self.manage_burst_capture_wait(seq),
                CaptureState::Done => self.manage_done(&client, seq),
                CaptureState::Error => self.manage_error(),
            }
        };

        if next != current {
            self.set_state(next);
        }
        next != CaptureState::Error
    }
}
