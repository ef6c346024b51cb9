//! Result frame processing
//!
//! One worker pulls completed result frames off the device. Each frame is
//! checked for faces, diffed against the last seen 3A state when the device
//! does not report 3A changes itself, and finally routed by request id to
//! whichever listeners registered for that id range.

use crate::callbacks::{CameraFace, FrameMetadata};
use crate::client::Camera2Client;
use crate::device::{CameraDevice, NotificationListener};
use crate::errors::{recover, CameraError};
use crate::metadata::{AeState, AfMode, AfState, AwbMode, AwbState, CameraMetadata, FaceDetectMode};
use crate::worker::ThreadLoop;
use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Receives result frames whose request id falls into a registered range.
pub trait FilteredListener: Send + Sync {
    fn on_frame_available(&self, request_id: i32, frame: &CameraMetadata);
}

struct RangeListener {
    min_id: i32,
    max_id: i32,
    listener: Weak<dyn FilteredListener>,
}

/// Last observed 3A modes, states and trigger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlgState {
    pub af_mode: AfMode,
    pub awb_mode: AwbMode,
    pub ae_state: AeState,
    pub af_state: AfState,
    pub awb_state: AwbState,
    pub af_trigger_id: i32,
    pub ae_trigger_id: i32,
}

impl AlgState {
    fn from_frame(frame: &CameraMetadata) -> Option<Self> {
        Some(Self {
            af_mode: frame.af_mode?,
            awb_mode: frame.awb_mode?,
            ae_state: frame.ae_state?,
            af_state: frame.af_state?,
            awb_state: frame.awb_state?,
            af_trigger_id: frame.af_trigger_id?,
            ae_trigger_id: frame.ae_precapture_id?,
        })
    }
}

struct FrameState {
    last_face_count: usize,
    last_3a_frame_number: i32,
    alg: AlgState,
}

pub struct FrameProcessor {
    camera_id: i32,
    client: Weak<Camera2Client>,
    device: Weak<dyn CameraDevice>,
    wait_duration: Duration,
    synthesize_3a: bool,
    use_partial_quirk: bool,
    listeners: Mutex<Vec<RangeListener>>,
    last_frame: Mutex<Option<CameraMetadata>>,
    state: Mutex<FrameState>,
}

/// Startup values read from the parameters before the worker runs.
pub struct FrameProcessorInit {
    pub camera_id: i32,
    pub synthesize_3a: bool,
    pub use_partial_quirk: bool,
    pub af_trigger_id: i32,
    pub ae_trigger_id: i32,
    pub wait_duration: Duration,
}

impl FrameProcessor {
    pub fn new(client: Weak<Camera2Client>, device: Weak<dyn CameraDevice>, init: FrameProcessorInit) -> Self {
        Self {
            camera_id: init.camera_id,
            client,
            device,
            wait_duration: init.wait_duration,
            synthesize_3a: init.synthesize_3a,
            use_partial_quirk: init.use_partial_quirk,
            listeners: Mutex::new(Vec::new()),
            last_frame: Mutex::new(None),
            state: Mutex::new(FrameState {
                last_face_count: 0,
                last_3a_frame_number: -1,
                alg: AlgState {
                    af_mode: AfMode::Off,
                    awb_mode: AwbMode::Off,
                    ae_state: AeState::Inactive,
                    af_state: AfState::Inactive,
                    awb_state: AwbState::Inactive,
                    af_trigger_id: init.af_trigger_id,
                    ae_trigger_id: init.ae_trigger_id,
                },
            }),
        }
    }

    /// Route frames with `min_id <= request_id < max_id` to `listener`.
    ///
    /// Registering the same listener for the same range twice is a no-op.
    pub fn register_listener(&self, min_id: i32, max_id: i32, listener: Weak<dyn FilteredListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(recover);
        let duplicate = listeners
            .iter()
            .any(|l| l.min_id == min_id && l.max_id == max_id && Weak::ptr_eq(&l.listener, &listener));
        if duplicate {
            return;
        }
        log::trace!("Camera {}: frame listener added for [{}, {})", self.camera_id, min_id, max_id);
        listeners.push(RangeListener {
            min_id,
            max_id,
            listener,
        });
    }

    pub fn remove_listener(&self, min_id: i32, max_id: i32, listener: &Weak<dyn FilteredListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(recover);
        listeners.retain(|l| !(l.min_id == min_id && l.max_id == max_id && Weak::ptr_eq(&l.listener, listener)));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(recover).len()
    }

    pub fn last_frame(&self) -> Option<CameraMetadata> {
        self.last_frame.lock().unwrap_or_else(recover).clone()
    }

    pub fn alg_state(&self) -> AlgState {
        self.state.lock().unwrap_or_else(recover).alg
    }

    fn process_new_frames(&self, device: &dyn CameraDevice) {
        loop {
            let frame = match device.get_next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    log::error!("Camera {}: error getting next frame: {}", self.camera_id, e);
                    break;
                }
            };
            if frame.frame_count.is_none() {
                log::error!("Camera {}: result frame has no frame count", self.camera_id);
                break;
            }
            if !self.process_single_frame(&frame) {
                break;
            }
            *self.last_frame.lock().unwrap_or_else(recover) = Some(frame);
        }
    }

    /// Handle one frame. Returns `false` once the owning client is gone.
    pub fn process_single_frame(&self, frame: &CameraMetadata) -> bool {
        let Some(client) = self.client.upgrade() else {
            return false;
        };

        let partial = self.use_partial_quirk && frame.is_partial();
        if !partial {
            if let Err(e) = self.process_face_detect(frame, &client) {
                log::error!("Camera {}: face detection metadata: {}", self.camera_id, e);
                return false;
            }
        }

        if self.synthesize_3a {
            if let Err(e) = self.process_3a_state(frame, &client) {
                log::error!("Camera {}: 3A state: {}", self.camera_id, e);
            }
        }

        self.process_listeners(frame);
        true
    }

    fn process_listeners(&self, frame: &CameraMetadata) {
        let Some(request_id) = frame.request_id else {
            log::error!("Camera {}: result frame has no request id", self.camera_id);
            return;
        };

        let targets: Vec<Arc<dyn FilteredListener>> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(recover);
            listeners.retain(|l| l.listener.strong_count() > 0);
            listeners
                .iter()
                .filter(|l| request_id >= l.min_id && request_id < l.max_id)
                .filter_map(|l| l.listener.upgrade())
                .collect()
        };

        log::trace!(
            "Camera {}: frame {:?} (request {}) to {} listeners",
            self.camera_id,
            frame.frame_count,
            request_id,
            targets.len()
        );
        for listener in targets {
            listener.on_frame_available(request_id, frame);
        }
    }

    fn process_face_detect(&self, frame: &CameraMetadata, client: &Camera2Client) -> Result<(), CameraError> {
        let mut metadata = FrameMetadata::default();
        {
            let params = client.parameters().lock();
            let mode = frame.face_detect_mode.unwrap_or(FaceDetectMode::Off);

            if params.enable_face_detect && mode != FaceDetectMode::Off {
                let rects = frame
                    .face_rectangles
                    .as_ref()
                    .ok_or_else(|| CameraError::bad_value("no face rectangles"))?;
                let scores = frame
                    .face_scores
                    .as_ref()
                    .ok_or_else(|| CameraError::bad_value("no face scores"))?;
                if scores.len() < rects.len() {
                    return Err(CameraError::bad_value(format!(
                        "{} face rectangles but {} scores",
                        rects.len(),
                        scores.len()
                    )));
                }

                let (landmarks, ids) = if mode == FaceDetectMode::Full {
                    let landmarks = frame
                        .face_landmarks
                        .as_ref()
                        .ok_or_else(|| CameraError::bad_value("no face landmarks"))?;
                    let ids = frame
                        .face_ids
                        .as_ref()
                        .ok_or_else(|| CameraError::bad_value("no face ids"))?;
                    (Some(landmarks), Some(ids))
                } else {
                    (None, None)
                };

                let max_faces = rects.len().min(params.fast_info.max_faces);
                for i in 0..max_faces {
                    if scores[i] == 0 {
                        continue;
                    }
                    let r = rects[i];
                    let mut face = CameraFace {
                        rect: [
                            params.array_x_to_normalized(r[0]),
                            params.array_y_to_normalized(r[1]),
                            params.array_x_to_normalized(r[2]),
                            params.array_y_to_normalized(r[3]),
                        ],
                        score: scores[i],
                        id: -1,
                        left_eye: [-2000, -2000],
                        right_eye: [-2000, -2000],
                        mouth: [-2000, -2000],
                    };
                    if let (Some(landmarks), Some(ids)) = (landmarks, ids) {
                        if let (Some(l), Some(id)) = (landmarks.get(i), ids.get(i)) {
                            face.id = *id;
                            face.left_eye = [params.array_x_to_normalized(l[0]), params.array_y_to_normalized(l[1])];
                            face.right_eye = [params.array_x_to_normalized(l[2]), params.array_y_to_normalized(l[3])];
                            face.mouth = [params.array_x_to_normalized(l[4]), params.array_y_to_normalized(l[5])];
                        }
                    }
                    metadata.faces.push(face);
                }
            }
        }

        self.callback_face_detection(client, &metadata);
        Ok(())
    }

    fn callback_face_detection(&self, client: &Camera2Client, metadata: &FrameMetadata) {
        let count = metadata.number_of_faces();
        let notify = {
            let mut state = self.state.lock().unwrap_or_else(recover);
            // Repeated empty results are only reported once
            let notify = count != 0 || state.last_face_count != count;
            state.last_face_count = count;
            notify
        };
        if notify {
            if let Some(callbacks) = client.callbacks().get() {
                callbacks.preview_metadata(metadata);
            }
        }
    }

    fn process_3a_state(&self, frame: &CameraMetadata, client: &Camera2Client) -> Result<(), CameraError> {
        let frame_number = frame
            .frame_count
            .ok_or_else(|| CameraError::bad_value("no frame count"))?;

        let (previous, next) = {
            let mut state = self.state.lock().unwrap_or_else(recover);
            if frame_number <= state.last_3a_frame_number {
                log::trace!(
                    "Camera {}: already handled 3A for frame {}, skipping",
                    self.camera_id,
                    frame_number
                );
                return Ok(());
            }
            state.last_3a_frame_number = frame_number;

            let next = AlgState::from_frame(frame).ok_or_else(|| {
                CameraError::bad_value(format!("frame {} is missing 3A entries", frame_number))
            })?;
            let previous = state.alg;
            state.alg = next;
            (previous, next)
        };

        if next.ae_state != previous.ae_state {
            log::trace!(
                "Camera {}: AE state {:?} -> {:?}",
                self.camera_id,
                previous.ae_state,
                next.ae_state
            );
            client.notify_auto_exposure(next.ae_state, next.ae_trigger_id);
        }
        if next.af_state != previous.af_state
            || next.af_mode != previous.af_mode
            || next.af_trigger_id != previous.af_trigger_id
        {
            client.notify_auto_focus(next.af_state, next.af_trigger_id);
        }
        if next.awb_state != previous.awb_state || next.awb_mode != previous.awb_mode {
            client.notify_auto_whitebalance(next.awb_state, next.ae_trigger_id);
        }
        Ok(())
    }
}

impl ThreadLoop for FrameProcessor {
    fn thread_loop(&self) -> bool {
        let Some(device) = self.device.upgrade() else {
            return false;
        };

        match device.wait_for_next_frame(self.wait_duration) {
            Ok(()) => self.process_new_frames(device.as_ref()),
            Err(CameraError::TimedOut) => {}
            Err(e) => {
                log::error!("Camera {}: error waiting for new frames: {}", self.camera_id, e);
            }
        }
        true
    }
}
