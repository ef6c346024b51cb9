//! API1-style camera client
//!
//! [`Camera2Client`] owns the shared parameters, the callback slot and every
//! processor, and exposes the classic preview / record / take-picture entry
//! points. Client calls are serialized by a session mutex; below that, the
//! parameters lock is taken before any processor's own mutex and is never
//! held while a client callback runs.

use crate::callbacks::{
    CameraClientCallbacks, MessageMask, Notification, RecordingFrame, SharedCameraCallbacks, Sound,
};
use crate::config::CrabCaptureConfig;
use crate::device::{CameraDevice, CameraFacing, DeviceVersion, NotificationListener, StreamConsumer, StreamId};
use crate::errors::{recover, CameraError};
use crate::metadata::{AeState, AfState, AwbState, FaceDetectMode};
use crate::params::{CameraSettings, CameraState, FocusMode, FocusState, Parameters, SharedParameters};
use crate::processors::callback::CallbackProcessor;
use crate::processors::capture_sequencer::{CaptureSequencer, CaptureState};
use crate::processors::frame::{AlgState, FilteredListener, FrameProcessor, FrameProcessorInit};
use crate::processors::jpeg::JpegProcessor;
use crate::processors::streaming::{StreamType, StreamingProcessor};
use crate::processors::zsl::{ZslProcessor, ZslProcessor3, ZslProcessorInterface, ZslState};
use crate::worker::{ThreadLoop, Worker};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Commands accepted by [`Camera2Client::send_command`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetDisplayOrientation(i32),
    EnableShutterSound(bool),
    PlayRecordingSound,
    StartFaceDetection,
    StopFaceDetection,
    EnableFocusMoveMessages(bool),
    Ping,
    SetVideoBufferCount(usize),
}

struct Session {
    owner: Option<u64>,
}

#[derive(Serialize)]
struct ClientDump {
    camera_id: i32,
    state: String,
    owner: Option<u64>,
    parameters: Parameters,
    capture_state: String,
    capture_history: Vec<CaptureState>,
    stream_type: StreamType,
    active_stream_ids: Vec<StreamId>,
    paused: bool,
    preview_request_id: i32,
    recording_request_id: i32,
    recording_frames_outstanding: usize,
    zsl_state: ZslState,
    zsl_queue_len: usize,
    frame_listeners: usize,
    alg_state: AlgState,
}

pub struct Camera2Client {
    camera_id: i32,
    config: CrabCaptureConfig,
    device: Mutex<Option<Arc<dyn CameraDevice>>>,
    parameters: SharedParameters,
    callbacks: SharedCameraCallbacks,
    session: Mutex<Session>,

    streaming: Arc<StreamingProcessor>,
    frame: Arc<FrameProcessor>,
    sequencer: Arc<CaptureSequencer>,
    jpeg: Arc<JpegProcessor>,
    callback_processor: Arc<CallbackProcessor>,
    zsl: Arc<dyn ZslProcessorInterface>,
    zsl_loop: Arc<dyn ThreadLoop>,

    workers: Mutex<Vec<Worker>>,
}

impl Camera2Client {
    /// Build a client and its processors for `device`. Workers are not
    /// started until [`Camera2Client::initialize`].
    pub fn new(device: Arc<dyn CameraDevice>, config: CrabCaptureConfig) -> Result<Arc<Self>, CameraError> {
        config.validate().map_err(CameraError::Config)?;

        let camera_id = device.id();
        let info = device.info();
        let mut params = Parameters::new(camera_id);
        params.initialize(&info)?;

        let frame_init = FrameProcessorInit {
            camera_id,
            synthesize_3a: !device.will_notify_3a(),
            use_partial_quirk: params.quirks.partial_results,
            af_trigger_id: params.current_af_trigger_id,
            ae_trigger_id: params.precapture_trigger_counter,
            wait_duration: config.frame.wait_duration(),
        };
        let version = device.version();
        let weak_device = Arc::downgrade(&device);

        log::info!("Camera {}: opening {:?} device", camera_id, version);

        Ok(Arc::new_cyclic(|client: &Weak<Camera2Client>| {
            let (zsl, zsl_loop): (Arc<dyn ZslProcessorInterface>, Arc<dyn ThreadLoop>) = match version {
                DeviceVersion::V2 => {
                    let zsl = ZslProcessor::new(camera_id, client.clone(), weak_device.clone(), &config.zsl);
                    (zsl.clone() as Arc<dyn ZslProcessorInterface>, zsl as Arc<dyn ThreadLoop>)
                }
                DeviceVersion::V3 => {
                    let zsl = ZslProcessor3::new(camera_id, client.clone(), weak_device.clone(), &config.zsl);
                    (zsl.clone() as Arc<dyn ZslProcessorInterface>, zsl as Arc<dyn ThreadLoop>)
                }
            };

            Self {
                camera_id,
                streaming: StreamingProcessor::new(
                    camera_id,
                    client.clone(),
                    weak_device.clone(),
                    config.streaming.clone(),
                ),
                frame: Arc::new(FrameProcessor::new(client.clone(), weak_device.clone(), frame_init)),
                sequencer: CaptureSequencer::new(camera_id, client.clone(), config.sequencer.clone()),
                jpeg: JpegProcessor::new(
                    camera_id,
                    client.clone(),
                    weak_device.clone(),
                    config.frame.wait_duration(),
                ),
                callback_processor: CallbackProcessor::new(
                    camera_id,
                    client.clone(),
                    weak_device.clone(),
                    config.frame.wait_duration(),
                ),
                zsl,
                zsl_loop,
                device: Mutex::new(Some(device)),
                parameters: SharedParameters::new(params),
                callbacks: SharedCameraCallbacks::new(),
                session: Mutex::new(Session { owner: None }),
                workers: Mutex::new(Vec::new()),
                config,
            }
        }))
    }

    /// Build and initialize in one step.
    pub fn open(device: Arc<dyn CameraDevice>, config: CrabCaptureConfig) -> Result<Arc<Self>, CameraError> {
        let client = Self::new(device, config)?;
        client.initialize()?;
        Ok(client)
    }

    /// Start the processor workers and subscribe to device notifications.
    pub fn initialize(self: &Arc<Self>) -> Result<(), CameraError> {
        let _session = self.session();
        let device = self.device().ok_or(CameraError::DeadObject)?;

        let mut workers = self.workers.lock().unwrap_or_else(recover);
        if !workers.is_empty() {
            return Err(CameraError::AlreadyActive);
        }

        let id = self.camera_id;
        workers.push(Worker::spawn(format!("C2-{}-StreamProc", id), self.streaming.clone())?);
        workers.push(Worker::spawn(format!("C2-{}-FrameProc", id), self.frame.clone())?);
        workers.push(Worker::spawn(format!("C2-{}-CaptureSeq", id), self.sequencer.clone())?);
        workers.push(Worker::spawn(format!("C2-{}-JpegProc", id), self.jpeg.clone())?);
        workers.push(Worker::spawn(format!("C2-{}-CallbkProc", id), self.callback_processor.clone())?);
        workers.push(Worker::spawn(format!("C2-{}-ZslProc", id), self.zsl_loop.clone())?);
        drop(workers);

        let weak: Weak<Camera2Client> = Arc::downgrade(self);
        let listener: Weak<dyn NotificationListener> = weak;
        device.set_notify_callback(Some(listener));
        log::debug!("Camera {}: initialized", id);
        Ok(())
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(recover)
    }

    pub fn camera_id(&self) -> i32 {
        self.camera_id
    }

    pub fn config(&self) -> &CrabCaptureConfig {
        &self.config
    }

    pub fn parameters(&self) -> &SharedParameters {
        &self.parameters
    }

    pub fn callbacks(&self) -> &SharedCameraCallbacks {
        &self.callbacks
    }

    pub fn device(&self) -> Option<Arc<dyn CameraDevice>> {
        self.device.lock().unwrap_or_else(recover).clone()
    }

    pub fn sequencer(&self) -> &Arc<CaptureSequencer> {
        &self.sequencer
    }

    pub fn streaming_processor(&self) -> &Arc<StreamingProcessor> {
        &self.streaming
    }

    pub fn frame_processor(&self) -> &Arc<FrameProcessor> {
        &self.frame
    }

    pub fn zsl_processor(&self) -> &Arc<dyn ZslProcessorInterface> {
        &self.zsl
    }

    pub fn register_frame_listener(&self, min_id: i32, max_id: i32, listener: Weak<dyn FilteredListener>) {
        self.frame.register_listener(min_id, max_id, listener);
    }

    pub fn remove_frame_listener(&self, min_id: i32, max_id: i32, listener: &Weak<dyn FilteredListener>) {
        self.frame.remove_listener(min_id, max_id, listener);
    }

    pub fn preview_stream_id(&self) -> Option<StreamId> {
        self.streaming.preview_stream_id()
    }

    pub fn capture_stream_id(&self) -> Option<StreamId> {
        self.jpeg.stream_id()
    }

    pub fn callback_stream_id(&self) -> Option<StreamId> {
        self.callback_processor.stream_id()
    }

    pub fn recording_stream_id(&self) -> Option<StreamId> {
        self.streaming.recording_stream_id()
    }

    pub fn zsl_stream_id(&self) -> Option<StreamId> {
        self.zsl.stream_id()
    }

    /// Stop the repeating request. Used by the capture path.
    pub fn stop_stream(&self) -> Result<(), CameraError> {
        self.streaming.stop_stream()
    }

    fn check_connected(&self) -> Result<Arc<dyn CameraDevice>, CameraError> {
        if self.parameters.state() == CameraState::Disconnected {
            return Err(CameraError::DeadObject);
        }
        self.device().ok_or(CameraError::DeadObject)
    }

    // Session

    /// Attach the callback sink of `owner`. Fails with `Busy` while another
    /// owner holds the camera.
    pub fn connect(&self, owner: u64, callbacks: Arc<dyn CameraClientCallbacks>) -> Result<(), CameraError> {
        let mut session = self.session();
        self.check_connected()?;
        if let Some(current) = session.owner {
            if current != owner {
                log::error!(
                    "Camera {}: connect from {} while owned by {}",
                    self.camera_id,
                    owner,
                    current
                );
                return Err(CameraError::Busy);
            }
        }
        session.owner = Some(owner);
        self.callbacks.set(callbacks);
        Ok(())
    }

    pub fn lock(&self, owner: u64) -> Result<(), CameraError> {
        let mut session = self.session();
        match session.owner {
            None => {
                session.owner = Some(owner);
                Ok(())
            }
            Some(current) if current == owner => Ok(()),
            Some(_) => Err(CameraError::Busy),
        }
    }

    pub fn unlock(&self, owner: u64) -> Result<(), CameraError> {
        let mut session = self.session();
        if session.owner != Some(owner) {
            return Err(CameraError::Busy);
        }
        if matches!(self.parameters.state(), CameraState::Record | CameraState::VideoSnapshot) {
            log::info!("Camera {}: not allowed to unlock while recording", self.camera_id);
            return Err(CameraError::invalid_operation("cannot unlock while recording"));
        }
        session.owner = None;
        self.callbacks.clear();
        Ok(())
    }

    /// Tear down streams and workers and release the device. Idempotent.
    pub fn disconnect(&self) {
        let mut session = self.session();
        self.disconnect_locked(&mut session);
    }

    fn disconnect_locked(&self, session: &mut Session) {
        if self.parameters.state() == CameraState::Disconnected {
            return;
        }
        log::info!("Camera {}: disconnecting", self.camera_id);

        self.stop_preview_locked();
        self.parameters.lock().state = CameraState::Disconnected;

        let teardown: [(&str, Result<(), CameraError>); 5] = [
            ("preview stream", self.streaming.delete_preview_stream()),
            ("recording stream", self.streaming.delete_recording_stream()),
            ("capture stream", self.jpeg.delete_stream()),
            ("callback stream", self.callback_processor.delete_stream()),
            ("ZSL stream", self.zsl.delete_stream()),
        ];
        for (what, result) in teardown {
            if let Err(e) = result {
                log::warn!("Camera {}: deleting {}: {}", self.camera_id, what, e);
            }
        }

        let workers: Vec<Worker> = self.workers.lock().unwrap_or_else(recover).drain(..).collect();
        for worker in &workers {
            worker.request_exit();
        }
        for worker in &workers {
            if let Err(e) = worker.join(self.config.client.join_timeout()) {
                log::warn!("Camera {}: {} did not stop: {}", self.camera_id, worker.name(), e);
            }
        }

        if let Some(device) = self.device.lock().unwrap_or_else(recover).take() {
            device.set_notify_callback(None);
            device.disconnect();
        }
        self.callbacks.clear();
        session.owner = None;
    }

    // Preview

    pub fn set_preview_target(&self, window: Option<Arc<dyn StreamConsumer>>) -> Result<(), CameraError> {
        let _session = self.session();
        let device = self.check_connected()?;

        let state = self.parameters.state();
        match state {
            CameraState::Disconnected
            | CameraState::Record
            | CameraState::StillCapture
            | CameraState::VideoSnapshot => {
                log::error!(
                    "Camera {}: cannot change preview target in state {}",
                    self.camera_id,
                    state
                );
                return Err(CameraError::invalid_operation(format!(
                    "preview target cannot change in state {}",
                    state
                )));
            }
            CameraState::Stopped | CameraState::WaitingForPreviewWindow => {}
            CameraState::Preview => {
                self.streaming.stop_stream()?;
                device.wait_until_drained()?;
                self.parameters.lock().state = CameraState::WaitingForPreviewWindow;
            }
        }

        self.streaming.set_preview_window(window)?;

        let mut params = self.parameters.lock();
        if params.state == CameraState::WaitingForPreviewWindow {
            return self.start_preview_locked(&mut params, false);
        }
        Ok(())
    }

    pub fn set_preview_callback_flag(&self, flags: u32) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;

        let mut params = self.parameters.lock();
        let previous = params.preview_callback_flags;
        params.preview_callback_flags = flags;
        if flags == previous {
            return Ok(());
        }
        match params.state {
            CameraState::Preview => self.start_preview_locked(&mut params, true),
            CameraState::Record | CameraState::VideoSnapshot => {
                self.start_recording_locked(&mut params, true).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    pub fn start_preview(&self) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;
        let mut params = self.parameters.lock();
        self.start_preview_locked(&mut params, false)
    }

    fn start_preview_locked(&self, params: &mut Parameters, restart: bool) -> Result<(), CameraError> {
        if params.state == CameraState::Preview && !restart {
            log::trace!("Camera {}: preview already running", self.camera_id);
            return Ok(());
        }
        if params.state > CameraState::Preview && !restart {
            log::error!("Camera {}: can't start preview in state {}", self.camera_id, params.state);
            return Err(CameraError::invalid_operation(format!(
                "cannot start preview in state {}",
                params.state
            )));
        }

        if !self.streaming.have_valid_preview_window() {
            params.state = CameraState::WaitingForPreviewWindow;
            return Ok(());
        }
        params.state = CameraState::Stopped;

        self.streaming.update_preview_stream(params).map_err(|e| {
            log::error!("Camera {}: unable to update preview stream: {}", self.camera_id, e);
            e
        })?;

        let mut outputs = Vec::with_capacity(3);
        if params.preview_callbacks_enabled() {
            self.callback_processor.update_stream(params)?;
            if let Some(id) = self.callback_processor.stream_id() {
                outputs.push(id);
            }
        }

        if params.zsl_mode && !params.recording_hint {
            self.zsl.update_stream(params)?;
            if let Some(id) = self.zsl.stream_id() {
                outputs.push(id);
            }
        } else if let Err(e) = self.zsl.delete_stream() {
            log::warn!("Camera {}: deleting unused ZSL stream: {}", self.camera_id, e);
        }

        self.streaming.update_preview_request(params)?;
        if let Some(id) = self.streaming.preview_stream_id() {
            outputs.push(id);
        }

        self.streaming.start_stream(StreamType::Preview, &outputs).map_err(|e| {
            log::error!("Camera {}: unable to start preview: {}", self.camera_id, e);
            e
        })?;
        params.state = CameraState::Preview;
        Ok(())
    }

    pub fn stop_preview(&self) {
        let _session = self.session();
        if self.check_connected().is_err() {
            return;
        }
        self.stop_preview_locked();
    }

    fn stop_preview_locked(&self) {
        let state = self.parameters.state();
        match state {
            CameraState::Disconnected => return,
            CameraState::Stopped | CameraState::StillCapture | CameraState::VideoSnapshot => {
                if let Err(e) = self
                    .sequencer
                    .wait_until_idle(self.config.sequencer.stop_capture_timeout())
                {
                    log::warn!("Camera {}: capture still running while stopping preview: {}", self.camera_id, e);
                }
                self.halt_streaming();
            }
            CameraState::Record | CameraState::Preview => self.halt_streaming(),
            CameraState::WaitingForPreviewWindow => {}
        }

        let mut params = self.parameters.lock();
        params.state = CameraState::Stopped;
        if let Err(e) = self.stop_face_detection_locked(&mut params) {
            log::warn!("Camera {}: stopping face detection: {}", self.camera_id, e);
        }
    }

    fn halt_streaming(&self) {
        if let Err(e) = self.sync_with_device() {
            log::debug!("Camera {}: sync before stop: {}", self.camera_id, e);
        }
        if let Err(e) = self.streaming.stop_stream() {
            log::error!("Camera {}: can't stop streaming: {}", self.camera_id, e);
        }
        if let Some(device) = self.device() {
            if let Err(e) = device.wait_until_drained() {
                log::error!("Camera {}: waiting to drain: {}", self.camera_id, e);
            }
        }
    }

    pub fn preview_enabled(&self) -> bool {
        matches!(
            self.parameters.state(),
            CameraState::Preview | CameraState::Record | CameraState::VideoSnapshot
        )
    }

    // Recording

    pub fn store_meta_data_in_buffers(&self, enabled: bool) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;

        let mut params = self.parameters.lock();
        if matches!(params.state, CameraState::Record | CameraState::VideoSnapshot) {
            log::error!("Camera {}: can't change metadata mode while recording", self.camera_id);
            return Err(CameraError::invalid_operation("metadata mode cannot change while recording"));
        }
        params.store_metadata_in_buffers = enabled;
        Ok(())
    }

    pub fn start_recording(&self) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;

        let play_sound = {
            let mut params = self.parameters.lock();
            self.start_recording_locked(&mut params, false)?
        };
        if play_sound {
            if let Some(callbacks) = self.callbacks.get() {
                callbacks.play_sound(Sound::Recording);
            }
        }
        Ok(())
    }

    /// Returns whether the recording sound should be played.
    fn start_recording_locked(&self, params: &mut Parameters, restart: bool) -> Result<bool, CameraError> {
        match params.state {
            CameraState::Stopped => self.start_preview_locked(params, false)?,
            CameraState::Preview => {}
            CameraState::Record | CameraState::VideoSnapshot => {
                if !restart {
                    log::error!("Camera {}: already recording", self.camera_id);
                    return Err(CameraError::invalid_operation("already recording"));
                }
            }
            other => {
                log::error!("Camera {}: can't start recording in state {}", self.camera_id, other);
                return Err(CameraError::invalid_operation(format!(
                    "cannot start recording in state {}",
                    other
                )));
            }
        }

        if !params.store_metadata_in_buffers {
            log::error!(
                "Camera {}: recording only supported in metadata mode, but mode is disabled",
                self.camera_id
            );
            return Err(CameraError::invalid_operation("recording requires metadata mode"));
        }

        if !restart {
            self.streaming.update_recording_request(params)?;
            self.streaming.release_all_recording_frames();
        }

        // Preview callbacks and recording never run together
        if self.callback_processor.stream_id().is_some() {
            self.streaming.stop_stream()?;
            if let Some(device) = self.device() {
                device.wait_until_drained()?;
            }
            self.callback_processor.delete_stream()?;
        }
        params.preview_callback_flags = 0;

        let streaming = Arc::clone(&self.streaming);
        let params_ref: &Parameters = params;
        self.update_processor_stream(|| streaming.update_recording_stream(params_ref))?;

        let mut outputs = Vec::with_capacity(2);
        if let Some(id) = self.streaming.preview_stream_id() {
            outputs.push(id);
        }
        if let Some(id) = self.streaming.recording_stream_id() {
            outputs.push(id);
        }
        self.streaming.start_stream(StreamType::Record, &outputs).map_err(|e| {
            log::error!("Camera {}: unable to start recording stream: {}", self.camera_id, e);
            e
        })?;

        if params.state < CameraState::Record {
            params.state = CameraState::Record;
        }
        Ok(!restart)
    }

    pub fn stop_recording(&self) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;

        let mut params = self.parameters.lock();
        if params.state != CameraState::Record {
            log::error!("Camera {}: can't stop recording in state {}", self.camera_id, params.state);
            return Err(CameraError::invalid_operation(format!(
                "cannot stop recording in state {}",
                params.state
            )));
        }
        let result = self.start_preview_locked(&mut params, true);
        drop(params);

        if let Some(callbacks) = self.callbacks.get() {
            callbacks.play_sound(Sound::Recording);
        }
        result.map_err(|e| {
            log::error!("Camera {}: unable to return to preview: {}", self.camera_id, e);
            e
        })
    }

    pub fn recording_enabled(&self) -> bool {
        matches!(
            self.parameters.state(),
            CameraState::Record | CameraState::VideoSnapshot
        )
    }

    pub fn release_recording_frame(&self, frame: &RecordingFrame) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;
        self.streaming.release_recording_frame(frame)
    }

    // Focus

    pub fn auto_focus(&self) -> Result<(), CameraError> {
        let _session = self.session();
        let device = self.check_connected()?;

        let trigger_id = {
            let mut params = self.parameters.lock();
            if params.state < CameraState::Preview {
                return Err(CameraError::invalid_operation("auto focus needs preview"));
            }

            let fixed = matches!(params.focus_mode, FocusMode::Fixed | FocusMode::Infinity);
            let continuous_locked = matches!(
                params.focus_mode,
                FocusMode::ContinuousPicture | FocusMode::ContinuousVideo
            ) && params.focus_state == FocusState::Focused
                && !params.af_in_motion;
            if fixed || continuous_locked {
                drop(params);
                if let Some(callbacks) = self.callbacks.get() {
                    callbacks.notify(Notification::Focus { success: true });
                }
                return Ok(());
            }

            if params.quirks.trigger_af_with_auto && params.focus_mode != FocusMode::Auto {
                log::debug!(
                    "Camera {}: switching focus mode {:?} to Auto for the trigger",
                    self.camera_id,
                    params.focus_mode
                );
                params.shadow_focus_mode = Some(params.focus_mode);
                params.focus_mode = FocusMode::Auto;
                self.update_requests_locked(&mut params)?;
            }

            params.af_trigger_counter += 1;
            params.current_af_trigger_id = params.af_trigger_counter;
            params.current_af_trigger_id
        };

        if let Err(e) = self.sync_with_device() {
            log::debug!("Camera {}: sync before autofocus: {}", self.camera_id, e);
        }
        device.trigger_autofocus(trigger_id)
    }

    pub fn cancel_auto_focus(&self) -> Result<(), CameraError> {
        let _session = self.session();
        let device = self.check_connected()?;

        let trigger_id = {
            let mut params = self.parameters.lock();
            if matches!(params.focus_mode, FocusMode::Fixed | FocusMode::Infinity) {
                return Ok(());
            }
            params.af_trigger_counter += 1;
            let trigger_id = params.af_trigger_counter;

            // Restoring the real mode cancels the forced Auto sweep
            if let Some(mode) = params.shadow_focus_mode.take() {
                params.focus_mode = mode;
                return self.update_requests_locked(&mut params);
            }
            trigger_id
        };

        if let Err(e) = self.sync_with_device() {
            log::debug!("Camera {}: sync before autofocus cancel: {}", self.camera_id, e);
        }
        device.trigger_cancel_autofocus(trigger_id)
    }

    // Still capture

    pub fn take_picture(&self, msg_type: MessageMask) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;

        let previous = {
            let mut params = self.parameters.lock();
            let previous = params.state;
            match previous {
                CameraState::Disconnected | CameraState::Stopped | CameraState::WaitingForPreviewWindow => {
                    log::error!("Camera {}: cannot take picture without preview enabled", self.camera_id);
                    return Err(CameraError::invalid_operation("take picture needs preview"));
                }
                CameraState::Preview => {
                    self.stop_face_detection_locked(&mut params)?;
                    params.state = CameraState::StillCapture;
                }
                CameraState::Record => params.state = CameraState::VideoSnapshot,
                CameraState::StillCapture | CameraState::VideoSnapshot => {
                    log::error!("Camera {}: already taking a picture", self.camera_id);
                    return Err(CameraError::invalid_operation("already taking a picture"));
                }
            }

            let jpeg = Arc::clone(&self.jpeg);
            let params_ref: &Parameters = &params;
            if let Err(e) = self.update_processor_stream(|| jpeg.update_stream(params_ref)) {
                log::error!("Camera {}: can't set up still image stream: {}", self.camera_id, e);
                params.state = previous;
                return Err(e);
            }
            params.take_picture_counter += 1;
            previous
        };

        if let Err(e) = self.sync_with_device() {
            log::debug!("Camera {}: sync before capture: {}", self.camera_id, e);
        }

        if let Err(e) = self.sequencer.start_capture(msg_type) {
            log::error!("Camera {}: unable to start capture: {}", self.camera_id, e);
            let mut params = self.parameters.lock();
            if matches!(params.state, CameraState::StillCapture | CameraState::VideoSnapshot) {
                params.state = previous;
            }
            return Err(e);
        }
        Ok(())
    }

    // Parameters

    pub fn set_parameters(&self, settings: CameraSettings) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;
        let mut params = self.parameters.lock();
        params.set(settings)?;
        self.update_requests_locked(&mut params)
    }

    pub fn get_parameters(&self) -> CameraSettings {
        self.parameters.lock().settings()
    }

    pub fn send_command(&self, command: Command) -> Result<(), CameraError> {
        let _session = self.session();
        let device = self.check_connected()?;

        match command {
            Command::SetDisplayOrientation(degrees) => {
                let mut params = self.parameters.lock();
                let mirror = params.fast_info.facing == CameraFacing::Front;
                let transform = Parameters::deg_to_transform(degrees, mirror).ok_or_else(|| {
                    CameraError::bad_value(format!("invalid display orientation {}", degrees))
                })?;
                if transform != params.preview_transform {
                    if let Some(id) = self.streaming.preview_stream_id() {
                        device.set_stream_transform(id, transform)?;
                    }
                }
                params.preview_transform = transform;
                Ok(())
            }
            Command::EnableShutterSound(enabled) => {
                self.parameters.lock().play_shutter_sound = enabled;
                Ok(())
            }
            Command::PlayRecordingSound => {
                if let Some(callbacks) = self.callbacks.get() {
                    callbacks.play_sound(Sound::Recording);
                }
                Ok(())
            }
            Command::StartFaceDetection => {
                let mut params = self.parameters.lock();
                if params.state < CameraState::Preview {
                    return Err(CameraError::invalid_operation("face detection needs preview"));
                }
                if params.fast_info.max_faces == 0
                    || params.fast_info.best_face_detect_mode == FaceDetectMode::Off
                {
                    return Err(CameraError::bad_value("face detection not supported"));
                }
                if params.enable_face_detect {
                    return Ok(());
                }
                params.enable_face_detect = true;
                self.update_requests_locked(&mut params)
            }
            Command::StopFaceDetection => {
                let mut params = self.parameters.lock();
                self.stop_face_detection_locked(&mut params)
            }
            Command::EnableFocusMoveMessages(enabled) => {
                self.parameters.lock().enable_focus_move_messages = enabled;
                Ok(())
            }
            Command::Ping => Ok(()),
            Command::SetVideoBufferCount(count) => {
                if self.recording_enabled() {
                    return Err(CameraError::invalid_operation("video buffer count cannot change while recording"));
                }
                self.streaming.set_recording_buffer_count(count)
            }
        }
    }

    fn stop_face_detection_locked(&self, params: &mut Parameters) -> Result<(), CameraError> {
        if !params.enable_face_detect {
            return Ok(());
        }
        params.enable_face_detect = false;
        if matches!(
            params.state,
            CameraState::Preview | CameraState::Record | CameraState::VideoSnapshot
        ) {
            return self.update_requests_locked(params);
        }
        Ok(())
    }

    // Request plumbing

    /// Push the current parameters into the streaming requests, restarting
    /// whatever is streaming.
    pub fn update_requests(&self) -> Result<(), CameraError> {
        let _session = self.session();
        self.check_connected()?;
        let mut params = self.parameters.lock();
        self.update_requests_locked(&mut params)
    }

    fn update_requests_locked(&self, params: &mut Parameters) -> Result<(), CameraError> {
        self.streaming.increment_streaming_ids();
        self.streaming.update_preview_request(params).map_err(|e| {
            log::error!("Camera {}: unable to update preview request: {}", self.camera_id, e);
            e
        })?;
        self.streaming.update_recording_request(params).map_err(|e| {
            log::error!("Camera {}: unable to update recording request: {}", self.camera_id, e);
            e
        })?;

        match params.state {
            CameraState::Preview => self.start_preview_locked(params, true),
            CameraState::Record | CameraState::VideoSnapshot => {
                self.start_recording_locked(params, true).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Wait until the device has picked up the active streaming request.
    pub fn sync_with_device(&self) -> Result<(), CameraError> {
        let Some(active) = self.streaming.active_request_id() else {
            return Ok(());
        };
        let device = self.device().ok_or(CameraError::DeadObject)?;
        device
            .wait_until_request_received(active, self.config.client.sync_timeout())
            .map_err(|e| {
                if e.is_timeout() {
                    log::error!(
                        "Camera {}: timed out waiting for request {} to be received",
                        self.camera_id,
                        active
                    );
                } else {
                    log::error!("Camera {}: error waiting for request {}: {}", self.camera_id, active, e);
                }
                e
            })
    }

    /// Run a processor stream update; if the device reports the old stream
    /// as busy, pause streaming, drain and retry once.
    pub fn update_processor_stream<F>(&self, update: F) -> Result<(), CameraError>
    where
        F: Fn() -> Result<(), CameraError>,
    {
        match update() {
            Err(CameraError::Busy) => {
                log::debug!("Camera {}: stream busy, pausing to reconfigure", self.camera_id);
                let paused = self.streaming.toggle_pause_stream(true).is_ok();
                if let Some(device) = self.device() {
                    device.wait_until_drained()?;
                }
                let result = update();
                if paused {
                    if let Err(e) = self.streaming.toggle_pause_stream(false) {
                        log::error!("Camera {}: unable to resume streaming: {}", self.camera_id, e);
                    }
                }
                result
            }
            other => other,
        }
    }

    /// JSON snapshot of client and processor state.
    pub fn dump(&self) -> Result<String, CameraError> {
        let owner = self.session().owner;
        let parameters = self.parameters.lock().clone();
        let dump = ClientDump {
            camera_id: self.camera_id,
            state: parameters.state.to_string(),
            owner,
            capture_state: self.sequencer.state().to_string(),
            capture_history: self.sequencer.state_history(),
            stream_type: self.streaming.active_stream_type(),
            active_stream_ids: self.streaming.active_stream_ids(),
            paused: self.streaming.is_paused(),
            preview_request_id: self.streaming.preview_request_id(),
            recording_request_id: self.streaming.recording_request_id(),
            recording_frames_outstanding: self.streaming.recording_frames_outstanding(),
            zsl_state: self.zsl.state(),
            zsl_queue_len: self.zsl.queue_len(),
            frame_listeners: self.frame.listener_count(),
            alg_state: self.frame.alg_state(),
            parameters,
        };
        serde_json::to_string_pretty(&dump)
            .map_err(|e| CameraError::invalid_operation(format!("unable to serialize dump: {}", e)))
    }
}

impl NotificationListener for Camera2Client {
    fn notify_error(&self, error_code: i32, arg1: i32, arg2: i32) {
        log::error!(
            "Camera {}: error condition {} reported by device, arguments {}, {}",
            self.camera_id,
            error_code,
            arg1,
            arg2
        );
        if let Some(callbacks) = self.callbacks.get() {
            callbacks.notify(Notification::Error { code: error_code });
        }
    }

    fn notify_shutter(&self, request_id: i32, timestamp: i64) {
        log::trace!(
            "Camera {}: shutter for request {} at {}",
            self.camera_id,
            request_id,
            timestamp
        );
    }

    fn notify_auto_focus(&self, new_state: AfState, trigger_id: i32) {
        let mut send_completed = false;
        let mut send_moving = false;
        let mut success = false;
        let mut af_in_motion = false;
        {
            let mut params = self.parameters.lock();
            params.focus_state = FocusState::from(new_state);

            match params.focus_mode {
                FocusMode::Auto | FocusMode::Macro => {
                    // Stale triggers (cancelled, or already answered) are ignored
                    if trigger_id == params.current_af_trigger_id {
                        match new_state {
                            AfState::FocusedLocked | AfState::NotFocusedLocked => {
                                success = new_state == AfState::FocusedLocked;
                                send_completed = true;
                                params.current_af_trigger_id = -1;
                            }
                            AfState::ActiveScan => {}
                            other => log::error!(
                                "Camera {}: unexpected AF state {:?} in {:?} mode",
                                self.camera_id,
                                other,
                                params.focus_mode
                            ),
                        }
                    }
                }
                FocusMode::ContinuousPicture | FocusMode::ContinuousVideo => {
                    match new_state {
                        AfState::FocusedLocked | AfState::NotFocusedLocked => {
                            if trigger_id == params.current_af_trigger_id {
                                success = new_state == AfState::FocusedLocked;
                                send_completed = true;
                                send_moving = params.enable_focus_move_messages && params.af_in_motion;
                                params.current_af_trigger_id = -1;
                            } else {
                                af_in_motion = params.af_in_motion;
                            }
                        }
                        AfState::Inactive => {
                            send_moving = params.enable_focus_move_messages && params.af_in_motion;
                        }
                        AfState::PassiveScan => {
                            af_in_motion = true;
                            send_moving = params.enable_focus_move_messages;
                        }
                        AfState::PassiveFocused | AfState::PassiveUnfocused => {
                            send_moving = params.enable_focus_move_messages;
                        }
                        AfState::ActiveScan => af_in_motion = params.af_in_motion,
                    }
                    params.af_in_motion = af_in_motion;
                }
                FocusMode::Edof | FocusMode::Infinity | FocusMode::Fixed => {
                    if new_state != AfState::Inactive {
                        log::error!(
                            "Camera {}: unexpected AF state {:?} (id {}) in {:?} mode",
                            self.camera_id,
                            new_state,
                            trigger_id,
                            params.focus_mode
                        );
                    }
                }
            }
        }

        if !(send_moving || send_completed) {
            return;
        }
        let Some(callbacks) = self.callbacks.get() else {
            return;
        };
        if send_moving {
            callbacks.notify(Notification::FocusMove { moving: af_in_motion });
        }
        if send_completed {
            callbacks.notify(Notification::Focus { success });
        }
    }

    fn notify_auto_exposure(&self, new_state: AeState, trigger_id: i32) {
        log::trace!(
            "Camera {}: AE state {:?} for trigger {}",
            self.camera_id,
            new_state,
            trigger_id
        );
        self.sequencer.notify_auto_exposure(new_state, trigger_id);
        if let Some(callbacks) = self.callbacks.get() {
            callbacks.notify(Notification::AutoExposure {
                state: new_state,
                trigger_id,
            });
        }
    }

    fn notify_auto_whitebalance(&self, new_state: AwbState, trigger_id: i32) {
        log::trace!(
            "Camera {}: AWB state {:?} for trigger {}",
            self.camera_id,
            new_state,
            trigger_id
        );
        if let Some(callbacks) = self.callbacks.get() {
            callbacks.notify(Notification::WhiteBalance { state: new_state });
        }
    }
}

impl Drop for Camera2Client {
    fn drop(&mut self) {
        let mut session = self.session.lock().unwrap_or_else(recover);
        self.disconnect_locked(&mut session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCameraDevice, RecordingCallbacks, TestPreviewWindow};
    use std::time::Duration;

    fn previewing_client() -> (Arc<MockCameraDevice>, Arc<Camera2Client>) {
        let mut config = CrabCaptureConfig::default();
        config.sequencer.wait_duration_ms = 20;
        let device = MockCameraDevice::new(0, DeviceVersion::V2);
        let shared: Arc<dyn CameraDevice> = device.clone();
        let client = Camera2Client::open(shared, config).unwrap();
        client.connect(1, Arc::new(RecordingCallbacks::new())).unwrap();
        let window: Arc<dyn StreamConsumer> = Arc::new(TestPreviewWindow::new());
        client.set_preview_target(Some(window)).unwrap();
        client.start_preview().unwrap();
        (device, client)
    }

    #[test]
    fn test_capture_finishes_when_device_goes_away() {
        let (device, client) = previewing_client();
        device.set_precapture_response(false);

        client.take_picture(MessageMask::COMPRESSED_IMAGE).unwrap();
        client.device.lock().unwrap().take();

        assert_eq!(client.sequencer().wait_until_idle(Duration::from_secs(3)), Ok(()));
        assert!(!client.sequencer().is_busy());
        assert!(!client.sequencer().state_history().contains(&CaptureState::Error));
        assert_eq!(client.parameters().state(), CameraState::Stopped);
    }
}
